use std::time::Duration;

use const_format::concatcp;

pub mod database;
pub mod keyed_store;
pub mod memory_store;
pub mod push_key;
pub mod record_codec;
mod history_store;

pub use history_store::*;

pub const DATA_DIR: &str = "data/";
pub const DATABASE_PATH: &str = concatcp!(DATA_DIR, "history.db");

/// Namespace all calculation records are written under.
pub const HISTORY_NAMESPACE: &str = "history";

/// Change notifications buffered per subscriber before it starts lagging.
pub const FEED_CAPACITY: usize = 64;

/// How often a SQLite change feed looks for rows written by other connections.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// First wait before reopening a change feed that ended. Doubles per failed
/// attempt, up to `FEED_RETRY_MAX_DELAY`.
pub const FEED_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const FEED_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Failure reported by a keyed store when a write is not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The write may succeed if retried.
    #[error("transient write failure: {0}")]
    Transient(String),
    /// The write will not succeed as issued.
    #[error("permanent write failure: {0}")]
    Permanent(String),
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("change feed unavailable: {0}")]
    Feed(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("history store has been shut down")]
    ShutDown,
    #[error(transparent)]
    Write(#[from] WriteError),
}
