use std::{collections::{BTreeMap, HashMap}, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::{keyed_store::{change_feed, ChangeFeed, Children, KeyedStore}, record_codec::FieldMap, HistoryError, WriteError, FEED_CAPACITY};

/// In-process keyed store. Every clone shares the same data, so clones stand
/// in for separate clients connected to one backend.
#[derive(Clone)]
pub struct MemoryKeyedStore {
    namespaces: Arc<Mutex<HashMap<String, BTreeMap<String, Value>>>>,
    pending_failure: Arc<Mutex<Option<WriteError>>>,
    changes: broadcast::Sender<String>,
}

impl MemoryKeyedStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            namespaces: Arc::new(Mutex::new(HashMap::new())),
            pending_failure: Arc::new(Mutex::new(None)),
            changes,
        }
    }

    /// Stores an arbitrary value, bypassing the record encoding. Used to put
    /// entries written by other clients (or corrupted ones) into the store.
    pub async fn put_raw(&self, namespace: &str, key: &str, value: Value) {
        self.namespaces.lock().await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.notify(namespace);
    }

    /// Makes the next write fail with `error` instead of being stored.
    pub async fn fail_next_write(&self, error: WriteError) {
        *self.pending_failure.lock().await = Some(error);
    }

    pub async fn children(&self, namespace: &str) -> Children {
        read_children(&self.namespaces, namespace).await
    }

    fn notify(&self, namespace: &str) {
        // No receivers just means nobody is subscribed yet.
        let _ = self.changes.send(namespace.to_string());
    }
}

impl Default for MemoryKeyedStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_children(namespaces: &Mutex<HashMap<String, BTreeMap<String, Value>>>, namespace: &str) -> Children {
    namespaces.lock().await
        .get(namespace)
        .map(|children| children.iter().map(|(key, value)| (key.clone(), value.clone())).collect())
        .unwrap_or_default()
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn write(&self, namespace: &str, key: &str, fields: FieldMap) -> Result<(), WriteError> {
        if let Some(error) = self.pending_failure.lock().await.take() {
            return Err(error);
        }

        {
            let mut namespaces = self.namespaces.lock().await;
            let children = namespaces.entry(namespace.to_string()).or_default();
            if children.contains_key(key) {
                return Err(WriteError::Permanent(format!("Key {} already exists in {}", key, namespace)));
            }
            children.insert(key.to_string(), Value::Object(fields));
        }

        self.notify(namespace);
        Ok(())
    }

    async fn subscribe_to_changes(&self, namespace: &str) -> Result<ChangeFeed, HistoryError> {
        let namespaces = self.namespaces.clone();
        Ok(change_feed(namespace.to_string(), self.changes.subscribe(), move |namespace| {
            let namespaces = namespaces.clone();
            async move { Some(read_children(&namespaces, &namespace).await) }
        }))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn feed_starts_with_current_children() {
        let store = MemoryKeyedStore::new();
        store.put_raw("history", "b", json!(2)).await;
        store.put_raw("history", "a", json!(1)).await;

        let mut feed = store.subscribe_to_changes("history").await.unwrap();
        let children = feed.next().await.unwrap();
        assert_eq!(children, vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn feed_follows_writes_to_its_namespace_only() {
        let store = MemoryKeyedStore::new();
        let mut feed = store.subscribe_to_changes("history").await.unwrap();
        assert!(feed.next().await.unwrap().is_empty());

        store.put_raw("settings", "x", json!(true)).await;
        let mut fields = FieldMap::new();
        fields.insert("origLat".into(), json!(1.0));
        store.write("history", "k1", fields).await.unwrap();

        let children = feed.next().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, "k1");
    }

    #[tokio::test]
    async fn duplicate_keys_are_permanent_failures() {
        let store = MemoryKeyedStore::new();
        store.write("history", "k", FieldMap::new()).await.unwrap();
        let err = store.write("history", "k", FieldMap::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let store = MemoryKeyedStore::new();
        store.fail_next_write(WriteError::Transient("offline".into())).await;

        let err = store.write("history", "k", FieldMap::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.children("history").await.is_empty());

        store.write("history", "k", FieldMap::new()).await.unwrap();
        assert_eq!(store.children("history").await.len(), 1);
    }
}
