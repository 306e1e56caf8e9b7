//! The upstream key/value store contract and an in-memory, deterministic
//! implementation used for tests and for driving the watcher in isolation
//! from a real store client (§6).
//!
//! Grounded the same way the actor fabric ships
//! [`crate::mailbox::unbounded`] alongside its `traits` module: one trait
//! describing the capability, one concrete implementation good enough to
//! exercise every caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store read of '{key}' timed out")]
    Timeout { key: String },
    #[error("store connection error: {reason}")]
    Connection { reason: String },
}

/// What happened to a single key, as observed by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    Set,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub action: StoreAction,
    pub key: String,
    pub value: Option<String>,
    pub index: u64,
}

/// A consistent read of the whole tree at one logical index.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub index: u64,
    pub cluster_id: String,
    pub entries: BTreeMap<String, String>,
}

/// Result of a long-poll: either new events, or a benign timeout with no
/// events (the watcher treats this as "nothing happened, poll again").
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Events(Vec<StoreEvent>),
    TimedOut,
}

/// Capability the watcher needs from the upstream store: point reads,
/// a consistent recursive snapshot, and an incremental long-poll from a
/// given index.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Long-poll for events with index strictly greater than `after_index`.
    /// Returns `PollOutcome::TimedOut` if nothing new arrives within
    /// `timeout` rather than an error: read timeouts during POLL are
    /// benign (§4.9).
    async fn poll(&self, after_index: u64, timeout: Duration) -> Result<PollOutcome, StoreError>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Opaque id that changes whenever the store cluster is rebuilt; a
    /// change invalidates any in-flight poll's index space (§4.9, §7).
    async fn cluster_id(&self) -> Result<String, StoreError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

struct Inner {
    entries: Mutex<BTreeMap<String, Entry>>,
    log: Mutex<Vec<StoreEvent>>,
    index: AtomicU64,
    cluster_id: Mutex<String>,
    notify: Notify,
}

/// Deterministic in-memory store. Every write advances a monotonic index
/// and appends to an event log that `poll` replays to callers.
#[derive(Clone)]
pub struct InMemoryKvStore {
    inner: Arc<Inner>,
}

impl InMemoryKvStore {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                log: Mutex::new(Vec::new()),
                index: AtomicU64::new(0),
                cluster_id: Mutex::new(cluster_id.into()),
            notify: Notify::new(),
            }),
        }
    }

    /// Directly set a value without going through TTL accounting, for test
    /// setup convenience. Advances the index and wakes any pollers.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let index = self.inner.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.entries.lock().insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expires_at: None,
            },
        );
        self.inner.log.lock().push(StoreEvent {
            action: StoreAction::Set,
            key,
            value: Some(value),
            index,
        });
        self.inner.notify.notify_waiters();
    }

    /// Remove a key and its whole subtree (directory-level delete).
    pub fn delete_prefix(&self, prefix: &str) {
        let index = self.inner.index.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.inner.entries.lock();
        let removed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &removed {
            entries.remove(key);
        }
        drop(entries);
        let mut log = self.inner.log.lock();
        for key in removed {
            log.push(StoreEvent {
                action: StoreAction::Delete,
                key,
                value: None,
                index,
            });
        }
        drop(log);
        self.inner.notify.notify_waiters();
    }

    /// Force a new cluster id, simulating a store rebuild; the watcher
    /// must treat the next poll's index space as invalid.
    pub fn rotate_cluster_id(&self, new_id: impl Into<String>) {
        *self.inner.cluster_id.lock() = new_id.into();
    }

    fn current_index(&self) -> u64 {
        self.inner.index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str, _timeout: Duration) -> Result<Option<String>, StoreError> {
        let entries = self.inner.entries.lock();
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let entries = self.inner.entries.lock();
        let snapshot_entries = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Ok(Snapshot {
            index: self.current_index(),
            cluster_id: self.inner.cluster_id.lock().clone(),
            entries: snapshot_entries,
        })
    }

    async fn poll(&self, after_index: u64, timeout: Duration) -> Result<PollOutcome, StoreError> {
        loop {
            {
                let log = self.inner.log.lock();
                let pending: Vec<StoreEvent> = log
                    .iter()
                    .filter(|e| e.index > after_index)
                    .cloned()
                    .collect();
                if !pending.is_empty() {
                    return Ok(PollOutcome::Events(pending));
                }
            }
            let notified = self.inner.notify.notified();
            match tokio_timeout(timeout, notified).await {
                Ok(()) => continue,
                Err(_) => return Ok(PollOutcome::TimedOut),
            }
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let index = self.inner.index.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        self.inner.log.lock().push(StoreEvent {
            action: StoreAction::Set,
            key: key.to_string(),
            value: Some(value.to_string()),
            index,
        });
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn cluster_id(&self) -> Result<String, StoreError> {
        Ok(self.inner.cluster_id.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/calico/v1/Ready", "true");
        let value = store.get("/calico/v1/Ready", Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, Some("true".to_string()));
    }

    #[tokio::test]
    async fn snapshot_only_contains_matching_prefix() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/calico/v1/policy/profile/p/tags", "[]");
        store.set("/calico/v1/host/h/workload/k8s/w/endpoint/e", "{}");
        let snap = store.snapshot("/calico/v1/policy/").await.unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert!(snap.entries.contains_key("/calico/v1/policy/profile/p/tags"));
    }

    #[tokio::test]
    async fn poll_returns_events_after_given_index() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/k1", "v1");
        let snap = store.snapshot("/").await.unwrap();
        store.set("/k2", "v2");

        let outcome = store.poll(snap.index, Duration::from_secs(1)).await.unwrap();
        match outcome {
            PollOutcome::Events(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].key, "/k2");
            }
            PollOutcome::TimedOut => panic!("expected events"),
        }
    }

    #[tokio::test]
    async fn poll_times_out_benignly_when_nothing_new() {
        let store = InMemoryKvStore::new("cluster-a");
        let index = store.current_index();
        let outcome = store.poll(index, Duration::from_millis(20)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::TimedOut));
    }

    #[tokio::test]
    async fn directory_delete_removes_every_key_under_prefix() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/calico/v1/host/h/workload/k8s/w/endpoint/e1", "{}");
        store.set("/calico/v1/host/h/workload/k8s/w/endpoint/e2", "{}");
        store.delete_prefix("/calico/v1/host/h/workload/k8s/w/endpoint/");

        let snap = store.snapshot("/calico/v1/host/h/workload/").await.unwrap();
        assert!(snap.entries.is_empty());
    }

    #[tokio::test]
    async fn cluster_id_rotation_is_observable() {
        let store = InMemoryKvStore::new("cluster-a");
        assert_eq!(store.cluster_id().await.unwrap(), "cluster-a");
        store.rotate_cluster_id("cluster-b");
        assert_eq!(store.cluster_id().await.unwrap(), "cluster-b");
    }
}
