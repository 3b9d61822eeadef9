use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{record_codec::FieldMap, HistoryError, WriteError};

/// Every child of a namespace as `(key, value)`, in key order.
pub type Children = Vec<(String, Value)>;

/// Full child sets of one namespace. The first item is the current content,
/// then one item follows each change.
pub type ChangeFeed = BoxStream<'static, Children>;

/// A remote keyed store with change notifications.
#[async_trait]
pub trait KeyedStore: Send + Sync + 'static {
    /// Writes `fields` as the child `key` of `namespace`.
    async fn write(&self, namespace: &str, key: &str, fields: FieldMap) -> Result<(), WriteError>;

    async fn subscribe_to_changes(&self, namespace: &str) -> Result<ChangeFeed, HistoryError>;
}

/// Builds a change feed from a channel of changed namespace names.
///
/// `load` re-reads the whole namespace. Notifications for other namespaces are
/// ignored, and a lagging receiver simply reloads since every item is a full
/// replacement anyway. A failed reload is skipped and the feed waits for the
/// next change. The feed ends when the sender side is dropped or the first
/// load fails.
pub(crate) fn change_feed<L, F>(namespace: String, changes: broadcast::Receiver<String>, load: L) -> ChangeFeed
where
    L: Fn(String) -> F + Send + Sync + 'static,
    F: Future<Output = Option<Children>> + Send + 'static,
{
    stream::unfold((changes, load, true), move |(mut changes, load, initial)| {
        let namespace = namespace.clone();
        async move {
            if initial {
                let children = load(namespace).await?;
                return Some((children, (changes, load, false)));
            }

            loop {
                match changes.recv().await {
                    Ok(changed) if changed != namespace => continue,
                    Ok(_) => {},
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Change feed for {} lagged by {} notifications", namespace, skipped);
                    },
                    Err(RecvError::Closed) => return None,
                }

                match load(namespace.clone()).await {
                    Some(children) => return Some((children, (changes, load, false))),
                    None => tracing::warn!("Reload of {} failed, waiting for the next change", namespace),
                }
            }
        }
    })
    .boxed()
}
