use std::{path::{Path, PathBuf}, str::FromStr, time::Duration};

use async_trait::async_trait;
use const_format::concatcp;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::{query, query_as, sqlite::{SqliteConnectOptions, SqlitePoolOptions}, Executor, Pool, Sqlite};
use tokio::{sync::broadcast::{self, error::RecvError}, time::{Interval, MissedTickBehavior}};

use crate::{keyed_store::{ChangeFeed, Children, KeyedStore}, record_codec::FieldMap, HistoryError, WriteError, DATABASE_PATH, FEED_CAPACITY, POLL_INTERVAL};

use super::constants::*;

// SQLITE_BUSY and SQLITE_LOCKED clear up on their own.
const RETRYABLE_SQLITE_CODES: [i32; 2] = [5, 6];

/// Keyed store backed by a local SQLite database.
///
/// Entries are append-only: one row per child, the field map kept as JSON text.
/// Writes through this store wake its change feeds at once. Rows written by
/// other connections, including other processes, are picked up by polling.
#[derive(Clone)]
pub struct SqliteKeyedStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<String>,
    poll_interval: Duration,
}

impl SqliteKeyedStore {
    /// Opens the database at the default location under the project root.
    pub async fn connect() -> Result<Self, HistoryError> {
        let root: PathBuf = project_root::get_project_root()
            .map_err(|err| HistoryError::Database(format!("Failed to locate project root: {}", err)))?;
        Self::open(root.join(DATABASE_PATH)).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await
                .map_err(|_| HistoryError::Database(format!("Failed to create data directory: {:?}", dir)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options).await
            .map_err(|err| HistoryError::Database(format!("Failed to connect to database {:?}: {}", path, err)))?;

        Self::with_pool(pool).await
    }

    /// A private database that lives as long as the store.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|err| HistoryError::Database(err.to_string()))?;

        // Every connection to :memory: is its own database, so keep exactly one open.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options).await
            .map_err(|err| HistoryError::Database(format!("Failed to open in-memory database: {}", err)))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, HistoryError> {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let store = Self { pool, changes, poll_interval: POLL_INTERVAL };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), HistoryError> {
        self.pool.execute(concatcp!("
            CREATE TABLE IF NOT EXISTS ", HISTORY_TABLE_NAME, "(",
                NAMESPACE, " TEXT NOT NULL,",
                ENTRY_KEY, " TEXT NOT NULL,",
                FIELDS,    " TEXT NOT NULL,
                PRIMARY KEY(", NAMESPACE, ", ", ENTRY_KEY, ")
            )")).await
            .map_err(|err| HistoryError::Database(format!("Failed to create history table: {}", err)))?;
        Ok(())
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn children(&self, namespace: &str) -> Result<Children, HistoryError> {
        load_children(&self.pool, namespace).await
            .map_err(|err| HistoryError::Database(format!("Failed to read {}: {}", namespace, err)))
    }
}

async fn load_children(pool: &Pool<Sqlite>, namespace: &str) -> Result<Children, sqlx::Error> {
    let rows = query_as::<_, (String, String)>(concatcp!(
        "SELECT ", ENTRY_KEY, ", ", FIELDS, " FROM ", HISTORY_TABLE_NAME,
        " WHERE ", NAMESPACE, " = ?1 ORDER BY ", ENTRY_KEY))
            .bind(namespace)
            .fetch_all(pool).await?;

    Ok(rows.into_iter()
        .map(|(key, fields)| {
            // Unreadable rows become null children and are dropped by the decoder.
            let value = serde_json::from_str(&fields).unwrap_or_else(|err| {
                tracing::debug!("Row {} in {} is not valid JSON: {}", key, namespace, err);
                Value::Null
            });
            (key, value)
        })
        .collect())
}

/// Row count and highest key. The table is append-only, so this changes
/// exactly when a row is added.
type NamespaceVersion = (i64, Option<String>);

async fn namespace_version(pool: &Pool<Sqlite>, namespace: &str) -> Result<NamespaceVersion, sqlx::Error> {
    query_as::<_, NamespaceVersion>(concatcp!(
        "SELECT COUNT(*), MAX(", ENTRY_KEY, ") FROM ", HISTORY_TABLE_NAME,
        " WHERE ", NAMESPACE, " = ?1"))
            .bind(namespace)
            .fetch_one(pool).await
}

fn version_of(children: &Children) -> NamespaceVersion {
    (children.len() as i64, children.last().map(|(key, _)| key.clone()))
}

struct Watch {
    pool: Pool<Sqlite>,
    namespace: String,
    changes: broadcast::Receiver<String>,
    ticks: Interval,
    seen: Option<NamespaceVersion>,
}

impl Watch {
    /// Waits until the namespace may have changed, either through a local
    /// write or a new version found by polling. `None` once the store is gone.
    async fn changed(&mut self) -> Option<()> {
        loop {
            tokio::select! {
                changed = self.changes.recv() => match changed {
                    Ok(changed) if changed != self.namespace => continue,
                    Ok(_) => return Some(()),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Change feed for {} lagged by {} notifications", self.namespace, skipped);
                        return Some(());
                    },
                    Err(RecvError::Closed) => return None,
                },
                _ = self.ticks.tick() => match namespace_version(&self.pool, &self.namespace).await {
                    Ok(version) if self.seen.as_ref() == Some(&version) => continue,
                    Ok(_) => return Some(()),
                    Err(err) => tracing::warn!("Failed to poll {}: {}", self.namespace, err),
                },
            }
        }
    }

    async fn load(&mut self) -> Result<Children, sqlx::Error> {
        let children = load_children(&self.pool, &self.namespace).await?;
        self.seen = Some(version_of(&children));
        Ok(children)
    }
}

/// Change feed over one namespace. The first load must succeed, later failed
/// reloads are logged and retried on the next change.
fn watch_namespace(pool: Pool<Sqlite>, namespace: String, changes: broadcast::Receiver<String>, poll_interval: Duration) -> ChangeFeed {
    let mut ticks = tokio::time::interval(poll_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let watch = Watch { pool, namespace, changes, ticks, seen: None };

    stream::unfold((watch, true), |(mut watch, initial)| async move {
        if initial {
            return match watch.load().await {
                Ok(children) => Some((children, (watch, false))),
                Err(err) => {
                    tracing::error!("Failed to load {}: {}", watch.namespace, err);
                    None
                },
            };
        }

        loop {
            watch.changed().await?;
            match watch.load().await {
                Ok(children) => return Some((children, (watch, false))),
                Err(err) => tracing::error!("Failed to reload {}, waiting for the next change: {}", watch.namespace, err),
            }
        }
    })
    .boxed()
}

/// SQLite reports extended result codes, whose low byte is the primary code.
fn is_retryable_code(code: &str) -> bool {
    code.parse::<i32>().is_ok_and(|code| RETRYABLE_SQLITE_CODES.contains(&(code & 0xff)))
}

fn classify_write_error(err: sqlx::Error) -> WriteError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            WriteError::Permanent(format!("Key already exists: {}", db_err))
        },
        sqlx::Error::Database(db_err) if db_err.code().is_some_and(|code| is_retryable_code(&code)) => {
            WriteError::Transient(err.to_string())
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => WriteError::Transient(err.to_string()),
        _ => WriteError::Permanent(err.to_string()),
    }
}

#[async_trait]
impl KeyedStore for SqliteKeyedStore {
    async fn write(&self, namespace: &str, key: &str, fields: FieldMap) -> Result<(), WriteError> {
        let fields = serde_json::to_string(&fields)
            .map_err(|err| WriteError::Permanent(format!("Failed to serialize fields: {}", err)))?;

        query(concatcp!("
            INSERT INTO ", HISTORY_TABLE_NAME, "(", NAMESPACE, ", ", ENTRY_KEY, ", ", FIELDS, ")
            VALUES (?1, ?2, ?3)"))
                .bind(namespace)
                .bind(key)
                .bind(fields)
                .execute(&self.pool).await
                .map_err(classify_write_error)?;

        let _ = self.changes.send(namespace.to_string());
        Ok(())
    }

    async fn subscribe_to_changes(&self, namespace: &str) -> Result<ChangeFeed, HistoryError> {
        Ok(watch_namespace(self.pool.clone(), namespace.to_string(), self.changes.subscribe(), self.poll_interval))
    }
}
