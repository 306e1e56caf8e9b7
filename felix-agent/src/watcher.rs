//! Watcher state machine (§4.9): drives the upstream store connection
//! from cold start through steady-state polling, re-entering SNAPSHOT
//! whenever the poll stream becomes unreliable.
//!
//! ```text
//! INIT -> WAIT_CONFIG -> WAIT_READY -> LOAD_CONFIG -> CONFIGURED
//!       -> WAIT_BEGIN -> SNAPSHOT -> POLL -+
//!                            ^--------------+  (resync tick / data inconsistency)
//! ```
//!
//! Grounded on the same state-machine-as-loop shape as
//! `felix_rt::RefCountManager`'s `Starting`/`Running`/`Stopping` entries,
//! but linear rather than per-key.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

use felix_rt::JitteredInterval;

use crate::config::AgentConfig;
use crate::dispatch::{DispatchAction, PathDispatcher};
use crate::error::{AgentError, AgentResult};
use crate::store::{KvStore, PollOutcome, StoreAction};

const READY_KEY: &str = "/calico/v1/Ready";
const GLOBAL_CONFIG_PREFIX: &str = "/calico/v1/config/";
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    Init,
    WaitConfig,
    WaitReady,
    LoadConfig,
    Configured,
    WaitBegin,
    Snapshot,
    Poll,
}

/// Drives one upstream store through the full watcher state machine,
/// dispatching every observed key through a [`PathDispatcher`].
pub struct Watcher<S: KvStore> {
    store: S,
    dispatcher: PathDispatcher,
    hostname: String,
    config: Option<AgentConfig>,
    resync: Option<JitteredInterval>,
    last_index: u64,
    last_cluster_id: String,
}

impl<S: KvStore> Watcher<S> {
    pub fn new(store: S, dispatcher: PathDispatcher, hostname: impl Into<String>) -> Self {
        Self {
            store,
            dispatcher,
            hostname: hostname.into(),
            config: None,
            resync: None,
            last_index: 0,
            last_cluster_id: String::new(),
        }
    }

    /// Drive the state machine forever. Returns only on a fatal error
    /// (configuration drift, or a data-inconsistency loop that keeps
    /// failing) — the caller (the process supervisor) treats any return
    /// here as cause for a supervised exit.
    pub async fn run(mut self) -> AgentResult<()> {
        let mut state = WatcherState::Init;
        loop {
            state = match state {
                WatcherState::Init => {
                    info!("watcher starting");
                    WatcherState::WaitConfig
                }
                WatcherState::WaitConfig => self.wait_config().await?,
                WatcherState::WaitReady => self.wait_ready().await?,
                WatcherState::LoadConfig => self.load_config().await?,
                WatcherState::Configured => {
                    if let Some(interval) = self.config.as_ref().and_then(|c| c.resync_interval) {
                        self.resync = Some(JitteredInterval::new(interval));
                    } else {
                        self.resync = None;
                    }
                    WatcherState::WaitBegin
                }
                WatcherState::WaitBegin => self.wait_begin().await?,
                WatcherState::Snapshot => self.snapshot().await?,
                WatcherState::Poll => self.poll_loop().await?,
            };
        }
    }

    /// Block until at least one global config key exists upstream.
    async fn wait_config(&mut self) -> AgentResult<WatcherState> {
        loop {
            let snapshot = self.store.snapshot(GLOBAL_CONFIG_PREFIX).await.map_err(|e| {
                AgentError::store_transient("wait_config snapshot", e.to_string())
            })?;
            if !snapshot.entries.is_empty() {
                return Ok(WatcherState::WaitReady);
            }
            tokio::time::sleep(WAIT_RETRY_DELAY).await;
        }
    }

    /// Block until the datastore reports itself ready for reads.
    async fn wait_ready(&mut self) -> AgentResult<WatcherState> {
        loop {
            let ready = self
                .store
                .get(READY_KEY, READ_TIMEOUT)
                .await
                .map_err(|e| AgentError::store_transient("wait_ready get", e.to_string()))?;
            if ready.as_deref() == Some("true") {
                return Ok(WatcherState::LoadConfig);
            }
            tokio::time::sleep(WAIT_RETRY_DELAY).await;
        }
    }

    /// Read and merge global-then-per-host config keys, rejecting any
    /// drift from a previously loaded config (§7: configuration drift
    /// forces a supervised process exit rather than a live reload).
    async fn load_config(&mut self) -> AgentResult<WatcherState> {
        let global = self
            .store
            .snapshot(GLOBAL_CONFIG_PREFIX)
            .await
            .map_err(|e| AgentError::store_transient("load_config global", e.to_string()))?;
        let host_prefix = format!("/calico/v1/host/{}/config/", self.hostname);
        let host = self
            .store
            .snapshot(&host_prefix)
            .await
            .map_err(|e| AgentError::store_transient("load_config host", e.to_string()))?;

        let mut keys: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in global.entries {
            if let Some(name) = key.strip_prefix(GLOBAL_CONFIG_PREFIX) {
                keys.insert(name.to_string(), value);
            }
        }
        for (key, value) in host.entries {
            if let Some(name) = key.strip_prefix(&host_prefix) {
                keys.insert(name.to_string(), value);
            }
        }

        let resolved = AgentConfig::from_keys(&keys, &self.hostname)?;
        if let Some(existing) = &self.config {
            if existing != &resolved {
                return Err(AgentError::config_drift(
                    "configuration changed after initial load",
                ));
            }
        } else {
            self.config = Some(resolved);
        }
        Ok(WatcherState::Configured)
    }

    async fn wait_begin(&mut self) -> AgentResult<WatcherState> {
        let ready = self
            .store
            .get(READY_KEY, READ_TIMEOUT)
            .await
            .map_err(|e| AgentError::store_transient("wait_begin get", e.to_string()))?;
        if ready.as_deref() == Some("true") {
            Ok(WatcherState::Snapshot)
        } else {
            tokio::time::sleep(WAIT_RETRY_DELAY).await;
            Ok(WatcherState::WaitBegin)
        }
    }

    /// Consistent full read of the whole tree, dispatched key by key as
    /// if every key had just been set.
    async fn snapshot(&mut self) -> AgentResult<WatcherState> {
        let snapshot = self
            .store
            .snapshot("/calico/v1/")
            .await
            .map_err(|e| AgentError::store_transient("snapshot", e.to_string()))?;

        self.last_index = snapshot.index;
        self.last_cluster_id = snapshot.cluster_id;
        for (key, value) in snapshot.entries {
            self.dispatcher
                .dispatch(DispatchAction::Set, &key, Some(&value))
                .await;
        }
        info!(index = self.last_index, "snapshot complete, entering poll");
        Ok(WatcherState::Poll)
    }

    /// Long-poll for incremental events, re-entering SNAPSHOT on data
    /// inconsistency (cluster rebuild) or on the resync timer firing,
    /// retrying in place on benign transient errors.
    async fn poll_loop(&mut self) -> AgentResult<WatcherState> {
        loop {
            if let Some(resync) = &mut self.resync {
                tokio::select! {
                    outcome = self.store.poll(self.last_index, POLL_TIMEOUT) => {
                        match self.handle_poll_outcome(outcome).await? {
                            Some(next) => return Ok(next),
                            None => continue,
                        }
                    }
                    _ = resync.tick() => {
                        info!("resync timer fired, re-entering snapshot");
                        return Ok(WatcherState::Snapshot);
                    }
                }
            } else {
                let outcome = self.store.poll(self.last_index, POLL_TIMEOUT).await;
                if let Some(next) = self.handle_poll_outcome(outcome).await? {
                    return Ok(next);
                }
            }
        }
    }

    async fn handle_poll_outcome(
        &mut self,
        outcome: Result<PollOutcome, crate::store::StoreError>,
    ) -> AgentResult<Option<WatcherState>> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "poll failed transiently, retrying in place");
                return Ok(None);
            }
        };

        match outcome {
            PollOutcome::TimedOut => Ok(None),
            PollOutcome::Events(events) => {
                let current_cluster_id = self
                    .store
                    .cluster_id()
                    .await
                    .map_err(|e| AgentError::store_transient("cluster_id", e.to_string()))?;
                if current_cluster_id != self.last_cluster_id {
                    warn!("cluster id changed mid-poll, re-entering snapshot");
                    return Ok(Some(WatcherState::Snapshot));
                }

                for event in events {
                    self.last_index = self.last_index.max(event.index);
                    match event.action {
                        StoreAction::Set => {
                            self.dispatcher
                                .dispatch(DispatchAction::Set, &event.key, event.value.as_deref())
                                .await;
                        }
                        StoreAction::Delete => {
                            self.dispatcher
                                .dispatch(DispatchAction::Delete, &event.key, None)
                                .await;
                        }
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Standalone bootstrap: block until the store reports a usable config,
/// without constructing a full [`Watcher`]. The process supervisor uses
/// this to learn `interface_prefix` and friends before it can build the
/// dataplane managers the watcher's own dispatcher handlers need; the
/// watcher then repeats the same read once it starts (see
/// [`Watcher::with_bootstrapped_config`]) purely to confirm no drift
/// happened between the two reads.
pub async fn bootstrap_config<S: KvStore>(store: &S, hostname: &str) -> AgentResult<AgentConfig> {
    loop {
        let global = store
            .snapshot(GLOBAL_CONFIG_PREFIX)
            .await
            .map_err(|e| AgentError::store_transient("bootstrap snapshot", e.to_string()))?;
        if global.entries.is_empty() {
            tokio::time::sleep(WAIT_RETRY_DELAY).await;
            continue;
        }

        let ready = store
            .get(READY_KEY, READ_TIMEOUT)
            .await
            .map_err(|e| AgentError::store_transient("bootstrap ready", e.to_string()))?;
        if ready.as_deref() != Some("true") {
            tokio::time::sleep(WAIT_RETRY_DELAY).await;
            continue;
        }

        let host_prefix = format!("/calico/v1/host/{hostname}/config/");
        let host = store
            .snapshot(&host_prefix)
            .await
            .map_err(|e| AgentError::store_transient("bootstrap host config", e.to_string()))?;

        let mut keys: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in global.entries {
            if let Some(name) = key.strip_prefix(GLOBAL_CONFIG_PREFIX) {
                keys.insert(name.to_string(), value);
            }
        }
        for (key, value) in host.entries {
            if let Some(name) = key.strip_prefix(&host_prefix) {
                keys.insert(name.to_string(), value);
            }
        }
        return AgentConfig::from_keys(&keys, hostname);
    }
}

impl<S: KvStore> Watcher<S> {
    /// Seed the watcher with a config already loaded by
    /// [`bootstrap_config`], so its own LOAD_CONFIG pass only has to
    /// confirm agreement rather than block the rest of the process on a
    /// second independent wait.
    pub fn with_bootstrapped_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKvStore;

    #[tokio::test]
    async fn wait_config_blocks_until_a_global_key_exists() {
        let store = InMemoryKvStore::new("cluster-a");
        let dispatcher = PathDispatcher::new();
        let mut watcher = Watcher::new(store.clone(), dispatcher, "host-a");

        let handle = tokio::spawn(async move { watcher.wait_config().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set("/calico/v1/config/InterfacePrefix", "cali");

        let state = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(state, WatcherState::WaitReady);
    }

    #[tokio::test]
    async fn load_config_rejects_drift_from_first_load() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/calico/v1/config/InterfacePrefix", "cali");
        let dispatcher = PathDispatcher::new();
        let mut watcher = Watcher::new(store.clone(), dispatcher, "host-a");

        watcher.load_config().await.unwrap();
        store.set("/calico/v1/config/InterfacePrefix", "other");
        let result = watcher.load_config().await;
        assert!(matches!(result, Err(AgentError::ConfigDrift { .. })));
    }

    #[tokio::test]
    async fn snapshot_dispatches_every_key_and_advances_to_poll() {
        let store = InMemoryKvStore::new("cluster-a");
        store.set("/calico/v1/Ready", "true");
        let mut dispatcher = PathDispatcher::new();

        struct Recorder(std::sync::Mutex<Vec<String>>);
        #[async_trait::async_trait]
        impl crate::dispatch::SetHandler for Recorder {
            async fn on_set(&self, _captures: &crate::dispatch::Captures, value: &str) {
                self.0.lock().unwrap().push(value.to_string());
            }
        }
        let recorder = std::sync::Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        dispatcher.register_set("/calico/v1/Ready", recorder.clone());

        let mut watcher = Watcher::new(store, dispatcher, "host-a");
        let next = watcher.snapshot().await.unwrap();
        assert_eq!(next, WatcherState::Poll);
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["true"]);
    }
}
