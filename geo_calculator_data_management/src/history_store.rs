use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use chrono::{DateTime, SubsecRound, Utc};
use futures::StreamExt;
use geo_calculator_lib::{CalculationRecord, Coordinate};
use tokio::{sync::{Mutex, RwLock}, task::JoinHandle};

use crate::{keyed_store::{ChangeFeed, Children, KeyedStore}, push_key::PushKeyGenerator, record_codec::{decode_record, encode_record}, HistoryError, WriteError, FEED_RETRY_DELAY, FEED_RETRY_MAX_DELAY, HISTORY_NAMESPACE};

/// The full history as last delivered by the change feed.
///
/// Snapshots are never modified. A new one replaces the old one wholesale,
/// and cloning only bumps a reference count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    records: Arc<Vec<CalculationRecord>>,
}

impl HistorySnapshot {
    pub fn new(records: Vec<CalculationRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn records(&self) -> &[CalculationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CalculationRecord> {
        self.records.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Subscribed,
    ShutDown,
}

type Observer = Box<dyn Fn(HistorySnapshot) + Send + Sync>;

enum Feed {
    Uninitialized,
    Subscribed(JoinHandle<()>),
    ShutDown,
}

/// State shared with the feed delivery task.
struct Shared {
    snapshot: RwLock<HistorySnapshot>,
    // Held for the whole of every delivery, which keeps deliveries ordered and
    // lets unsubscribe wait out one that is in flight.
    observers: Mutex<Vec<(ObserverId, Observer)>>,
}

impl Shared {
    async fn publish(&self, snapshot: HistorySnapshot) {
        let observers = self.observers.lock().await;
        *self.snapshot.write().await = snapshot.clone();
        for (_, observer) in observers.iter() {
            observer(snapshot.clone());
        }
    }
}

struct Writer {
    keys: PushKeyGenerator,
    last_stamp: DateTime<Utc>,
}

/// Append-only calculation history kept in sync with a [`KeyedStore`].
///
/// Writes go straight to the store. Reads come from one long-lived change feed
/// that is opened by the first [`subscribe`](Self::subscribe) and republishes
/// the whole history to every observer whenever anything changes. A feed that
/// ends is reopened until the store is shut down.
pub struct HistoryStore<S: KeyedStore> {
    store: Arc<S>,
    namespace: String,
    shared: Arc<Shared>,
    feed: Mutex<Feed>,
    writer: Mutex<Writer>,
    next_observer_id: AtomicU64,
}

impl<S: KeyedStore> HistoryStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_namespace(store, HISTORY_NAMESPACE)
    }

    pub fn with_namespace(store: S, namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::new(store),
            namespace: namespace.into(),
            shared: Arc::new(Shared {
                snapshot: RwLock::new(HistorySnapshot::default()),
                observers: Mutex::new(Vec::new()),
            }),
            feed: Mutex::new(Feed::Uninitialized),
            writer: Mutex::new(Writer {
                keys: PushKeyGenerator::new(),
                last_stamp: DateTime::<Utc>::MIN_UTC,
            }),
            next_observer_id: AtomicU64::new(0),
        }
    }

    pub fn keyed_store(&self) -> &S {
        &self.store
    }

    pub async fn state(&self) -> StoreState {
        match *self.feed.lock().await {
            Feed::Uninitialized => StoreState::Uninitialized,
            Feed::Subscribed(_) => StoreState::Subscribed,
            Feed::ShutDown => StoreState::ShutDown,
        }
    }

    /// Creates a record stamped with this store's clock, which never runs
    /// backwards even if the system clock does.
    pub async fn stamp(&self, origin: Coordinate, destination: Coordinate) -> CalculationRecord {
        let mut writer = self.writer.lock().await;
        // The wire format keeps milliseconds.
        let timestamp = Utc::now().trunc_subsecs(3).max(writer.last_stamp);
        writer.last_stamp = timestamp;
        CalculationRecord::new(origin, destination, timestamp)
    }

    /// Writes the record under a fresh key and waits for the store to
    /// acknowledge it. The record shows up in a later snapshot once the change
    /// feed catches up.
    ///
    /// Keys are derived from the record's timestamp, so snapshots list this
    /// writer's records in timestamp order even when appends race.
    pub async fn append(&self, record: CalculationRecord) -> Result<(), WriteError> {
        let key = self.writer.lock().await.keys.key_for(record.timestamp());

        match self.store.write(&self.namespace, &key, encode_record(&record)).await {
            Ok(()) => {
                tracing::debug!("Appended {} to {}", key, self.namespace);
                Ok(())
            },
            Err(err) => {
                tracing::error!("Failed to append {} to {}: {}", key, self.namespace, err);
                Err(err)
            },
        }
    }

    /// Registers `observer`, calls it right away with the current snapshot and
    /// again for every snapshot the change feed produces.
    ///
    /// Observers run on the feed task. They must return quickly and must not
    /// call back into the store.
    pub async fn subscribe<F>(&self, observer: F) -> Result<ObserverId, HistoryError>
    where
        F: Fn(HistorySnapshot) + Send + Sync + 'static,
    {
        let mut feed = self.feed.lock().await;
        // The feed task only stops on its own if an observer panicked.
        let open_feed = match &*feed {
            Feed::ShutDown => return Err(HistoryError::ShutDown),
            Feed::Subscribed(handle) => handle.is_finished(),
            Feed::Uninitialized => true,
        };
        if open_feed {
            let changes = self.store.subscribe_to_changes(&self.namespace).await?;
            let handle = tokio::spawn(run_feed(self.store.clone(), changes, self.shared.clone(), self.namespace.clone()));
            *feed = Feed::Subscribed(handle);
            tracing::info!("Subscribed to changes in {}", self.namespace);
        }

        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.shared.observers.lock().await;
        let current = self.shared.snapshot.read().await.clone();
        observer(current);
        observers.push((id, Box::new(observer)));

        Ok(id)
    }

    /// Removes the observer. Once this returns it is never called again.
    pub async fn unsubscribe(&self, id: ObserverId) {
        self.shared.observers.lock().await.retain(|(observer_id, _)| *observer_id != id);
    }

    pub async fn snapshot(&self) -> HistorySnapshot {
        self.shared.snapshot.read().await.clone()
    }

    /// Reads the history once through a fresh feed, without touching the
    /// cached snapshot or the long-lived subscription.
    pub async fn load(&self) -> Result<HistorySnapshot, HistoryError> {
        let mut changes = self.store.subscribe_to_changes(&self.namespace).await?;
        let children = changes.next().await
            .ok_or_else(|| HistoryError::Feed(format!("Change feed for {} closed before delivering", self.namespace)))?;
        Ok(decode_snapshot(&self.namespace, children))
    }

    /// Tears down the change feed and drops every observer.
    pub async fn shutdown(&self) {
        let mut feed = self.feed.lock().await;
        if let Feed::Subscribed(handle) = std::mem::replace(&mut *feed, Feed::ShutDown) {
            handle.abort();
        }
        self.shared.observers.lock().await.clear();
        tracing::info!("History store for {} shut down", self.namespace);
    }
}

impl<S: KeyedStore> Drop for HistoryStore<S> {
    fn drop(&mut self) {
        if let Feed::Subscribed(handle) = self.feed.get_mut() {
            handle.abort();
        }
    }
}

/// Delivers every snapshot of the feed, and reopens the feed with growing
/// delays whenever it ends. Runs until aborted.
async fn run_feed<S: KeyedStore>(store: Arc<S>, mut changes: ChangeFeed, shared: Arc<Shared>, namespace: String) {
    let mut retry_delay = FEED_RETRY_DELAY;
    loop {
        while let Some(children) = changes.next().await {
            retry_delay = FEED_RETRY_DELAY;
            let snapshot = decode_snapshot(&namespace, children);
            tracing::debug!("Delivering snapshot of {} with {} records", namespace, snapshot.len());
            shared.publish(snapshot).await;
        }

        tracing::warn!("Change feed for {} ended, reopening in {:?}", namespace, retry_delay);
        changes = loop {
            tokio::time::sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(FEED_RETRY_MAX_DELAY);
            match store.subscribe_to_changes(&namespace).await {
                Ok(changes) => break changes,
                Err(err) => tracing::warn!("Failed to reopen change feed for {}: {}", namespace, err),
            }
        };
        tracing::info!("Reopened change feed for {}", namespace);
    }
}

/// Decodes every child on its own. One broken entry only costs that entry.
fn decode_snapshot(namespace: &str, children: Children) -> HistorySnapshot {
    let records = children.into_iter()
        .filter_map(|(key, value)| match decode_record(&value) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!("Dropping entry {} in {}: {}", key, namespace, err);
                None
            },
        })
        .collect();

    HistorySnapshot::new(records)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::{json, Value};
    use tokio::{sync::mpsc::{self, UnboundedReceiver}, time::timeout};

    use crate::{memory_store::MemoryKeyedStore, record_codec::{encode_timestamp, FieldMap}};

    use super::*;

    fn coord(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate::new(latitude, longitude).unwrap()
    }

    async fn observe<S: KeyedStore>(store: &HistoryStore<S>) -> (ObserverId, UnboundedReceiver<HistorySnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = store.subscribe(move |snapshot| {
            let _ = tx.send(snapshot);
        }).await.unwrap();
        (id, rx)
    }

    async fn next_matching(rx: &mut UnboundedReceiver<HistorySnapshot>, predicate: impl Fn(&HistorySnapshot) -> bool) -> HistorySnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.recv().await.expect("observer was dropped");
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
        })
        .await
        .expect("no matching snapshot arrived")
    }

    #[tokio::test]
    async fn subscribe_delivers_empty_snapshot_immediately() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        assert_eq!(store.state().await, StoreState::Uninitialized);

        let (_, mut rx) = observe(&store).await;
        assert!(rx.try_recv().unwrap().is_empty());
        assert_eq!(store.state().await, StoreState::Subscribed);
    }

    #[tokio::test]
    async fn appended_record_comes_back_through_the_feed() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (_, mut rx) = observe(&store).await;

        let record = store.stamp(coord(42.96, -85.67), coord(41.88, -87.63)).await;
        store.append(record).await.unwrap();

        let snapshot = next_matching(&mut rx, |snapshot| !snapshot.is_empty()).await;
        let stored = snapshot.records()[0];
        assert_eq!(stored.origin(), record.origin());
        assert_eq!(stored.destination(), record.destination());
        assert!((stored.timestamp() - record.timestamp()).num_milliseconds().abs() < 1000);
        assert_eq!(store.snapshot().await, snapshot);
    }

    #[tokio::test]
    async fn corrupt_entry_does_not_hide_the_rest() {
        let keyed_store = MemoryKeyedStore::new();
        keyed_store.put_raw(HISTORY_NAMESPACE, "a", json!({
            "timestamp": "2017-01-23T18:04:05.000Z",
            "origLng": 0.0, "destLat": 1.0, "destLng": 1.0,
        })).await;
        keyed_store.put_raw(HISTORY_NAMESPACE, "b", json!({
            "timestamp": "2017-01-23T18:04:06.000Z",
            "origLat": 10.0, "origLng": 0.0, "destLat": 1.0, "destLng": 1.0,
        })).await;

        let store = HistoryStore::new(keyed_store);
        let (_, mut rx) = observe(&store).await;

        let snapshot = next_matching(&mut rx, |snapshot| !snapshot.is_empty()).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.records()[0].origin(), coord(10.0, 0.0));
    }

    #[tokio::test]
    async fn late_subscriber_gets_last_known_snapshot() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (_, mut first) = observe(&store).await;

        store.append(store.stamp(coord(1.0, 1.0), coord(2.0, 2.0)).await).await.unwrap();
        next_matching(&mut first, |snapshot| snapshot.len() == 1).await;

        let (_, mut second) = observe(&store).await;
        assert_eq!(second.try_recv().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_observer_gets_every_snapshot() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (_, mut first) = observe(&store).await;
        let (_, mut second) = observe(&store).await;

        for i in 0..3 {
            store.append(store.stamp(coord(i as f64, 0.0), coord(0.0, i as f64)).await).await.unwrap();
        }

        let a = next_matching(&mut first, |snapshot| snapshot.len() == 3).await;
        let b = next_matching(&mut second, |snapshot| snapshot.len() == 3).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn snapshots_follow_key_order() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (_, mut rx) = observe(&store).await;

        let first = store.stamp(coord(1.0, 0.0), coord(0.0, 0.0)).await;
        let second = store.stamp(coord(2.0, 0.0), coord(0.0, 0.0)).await;
        store.append(first).await.unwrap();
        store.append(second).await.unwrap();

        let snapshot = next_matching(&mut rx, |snapshot| snapshot.len() == 2).await;
        assert_eq!(snapshot.records()[0].origin(), first.origin());
        assert_eq!(snapshot.records()[1].origin(), second.origin());
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (gone, mut gone_rx) = observe(&store).await;
        let (_, mut kept_rx) = observe(&store).await;
        assert!(gone_rx.try_recv().is_ok());

        store.unsubscribe(gone).await;
        store.unsubscribe(gone).await;

        store.append(store.stamp(coord(1.0, 1.0), coord(2.0, 2.0)).await).await.unwrap();
        next_matching(&mut kept_rx, |snapshot| snapshot.len() == 1).await;

        // Only deliveries from before the unsubscribe may still be queued.
        while let Ok(snapshot) = gone_rx.try_recv() {
            assert!(snapshot.is_empty());
        }
    }

    #[tokio::test]
    async fn writes_from_other_clients_show_up() {
        let shared = MemoryKeyedStore::new();
        let local = HistoryStore::new(shared.clone());
        let remote = HistoryStore::new(shared);
        let (_, mut rx) = observe(&local).await;

        remote.append(remote.stamp(coord(-33.86, 151.2), coord(51.5, -0.12)).await).await.unwrap();

        let snapshot = next_matching(&mut rx, |snapshot| !snapshot.is_empty()).await;
        assert_eq!(snapshot.records()[0].origin(), coord(-33.86, 151.2));
    }

    #[tokio::test]
    async fn write_failures_reach_the_caller() {
        let keyed_store = MemoryKeyedStore::new();
        keyed_store.fail_next_write(WriteError::Transient("offline".into())).await;
        let store = HistoryStore::new(keyed_store);

        let err = store.append(store.stamp(coord(0.0, 0.0), coord(1.0, 1.0)).await).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.keyed_store().children(HISTORY_NAMESPACE).await.is_empty());
    }

    #[tokio::test]
    async fn append_does_not_need_a_subscription() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        store.append(store.stamp(coord(0.0, 0.0), coord(1.0, 1.0)).await).await.unwrap();

        assert_eq!(store.state().await, StoreState::Uninitialized);
        assert_eq!(store.load().await.unwrap().len(), 1);
        assert_eq!(store.state().await, StoreState::Uninitialized);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn load_round_trips_timestamps() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let record = store.stamp(coord(90.0, 0.0), coord(-90.0, 0.0)).await;
        store.append(record).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(encode_timestamp(loaded.records()[0].timestamp()), encode_timestamp(record.timestamp()));
        assert_eq!(loaded.records()[0], record);
    }

    #[tokio::test]
    async fn shutdown_ends_subscriptions() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let (_, mut rx) = observe(&store).await;
        assert!(rx.try_recv().is_ok());

        store.shutdown().await;
        assert_eq!(store.state().await, StoreState::ShutDown);
        assert!(matches!(store.subscribe(|_| {}).await, Err(HistoryError::ShutDown)));

        store.append(store.stamp(coord(0.0, 0.0), coord(1.0, 1.0)).await).await.unwrap();
        tokio::task::yield_now().await;
        while let Ok(snapshot) = rx.try_recv() {
            assert!(snapshot.is_empty());
        }
    }

    #[tokio::test]
    async fn stamps_never_go_backwards() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let mut previous = store.stamp(coord(0.0, 0.0), coord(0.0, 0.0)).await.timestamp();
        for _ in 0..100 {
            let next = store.stamp(coord(0.0, 0.0), coord(0.0, 0.0)).await.timestamp();
            assert!(next >= previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn snapshot_order_follows_timestamps_when_appends_race() {
        let store = HistoryStore::new(MemoryKeyedStore::new());
        let now = Utc::now().trunc_subsecs(3);
        let earlier = CalculationRecord::new(coord(1.0, 0.0), coord(0.0, 0.0), now - chrono::Duration::seconds(1));
        let later = CalculationRecord::new(coord(2.0, 0.0), coord(0.0, 0.0), now);

        store.append(later).await.unwrap();
        store.append(earlier).await.unwrap();

        assert_eq!(store.load().await.unwrap().records(), [earlier, later]);
    }

    /// Its first feed delivers an empty history and ends. Every later feed
    /// delivers one record and stays open.
    struct EndingFeedStore {
        opened: AtomicUsize,
        record: FieldMap,
    }

    #[async_trait]
    impl KeyedStore for EndingFeedStore {
        async fn write(&self, _: &str, _: &str, _: FieldMap) -> Result<(), WriteError> {
            Err(WriteError::Permanent("read only".into()))
        }

        async fn subscribe_to_changes(&self, _: &str) -> Result<ChangeFeed, HistoryError> {
            if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(stream::iter([Children::new()]).boxed());
            }
            let children = vec![("k".to_string(), Value::Object(self.record.clone()))];
            Ok(stream::iter([children]).chain(stream::pending()).boxed())
        }
    }

    #[tokio::test]
    async fn ended_feed_is_reopened() {
        let record = CalculationRecord::new(coord(1.0, 2.0), coord(3.0, 4.0), "2024-05-01T12:00:00.000Z".parse().unwrap());
        let store = HistoryStore::new(EndingFeedStore {
            opened: AtomicUsize::new(0),
            record: encode_record(&record),
        });
        let (_, mut rx) = observe(&store).await;

        let snapshot = next_matching(&mut rx, |snapshot| !snapshot.is_empty()).await;
        assert_eq!(snapshot.records(), [record]);
        assert_eq!(store.keyed_store().opened.load(Ordering::SeqCst), 2);
        assert_eq!(store.state().await, StoreState::Subscribed);
    }
}
