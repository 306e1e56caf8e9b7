//! Status-reporting task: periodically republishes this agent's liveness
//! to the upstream store so other components (and operators) can tell a
//! host's agent is still alive without watching the store's own
//! lease/heartbeat mechanism directly. Two keys are written on every
//! tick: a JSON status record with no TTL of its own (so the last known
//! status survives even if this agent stops reporting), and a
//! TTL-bearing plain-text uptime key that a reader can use to detect a
//! stalled agent by its key simply expiring.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::KvStore;

/// The `status` key's JSON payload.
#[derive(Debug, Clone, Serialize)]
struct StatusReport {
    time: String,
    uptime: u64,
}

fn status_key(hostname: &str) -> String {
    format!("/calico/v1/host/{hostname}/status")
}

fn uptime_key(hostname: &str) -> String {
    format!("/calico/v1/host/{hostname}/status/uptime")
}

/// Runs forever, writing the status keys every `interval`. The
/// started-at instant is captured once at construction so uptime is
/// monotonic across reports even if the system clock is adjusted.
pub struct StatusReporter<S: KvStore> {
    store: S,
    hostname: String,
    interval: Duration,
    ttl: Duration,
    started_at: tokio::time::Instant,
}

impl<S: KvStore> StatusReporter<S> {
    pub fn new(store: S, hostname: impl Into<String>, interval: Duration, ttl: Duration) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            interval,
            ttl,
            started_at: tokio::time::Instant::now(),
        }
    }

    /// Report once immediately, then every `interval` thereafter. Never
    /// returns; a failed report is logged and retried on the next tick
    /// rather than treated as fatal (losing one status report is not
    /// worth tearing down the process over).
    pub async fn run(mut self) -> ! {
        loop {
            self.report_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn report_once(&mut self) {
        let uptime = self.started_at.elapsed().as_secs();
        let report = StatusReport {
            time: Utc::now().to_rfc3339(),
            uptime,
        };
        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to serialise status report");
                return;
            }
        };

        let key = status_key(&self.hostname);
        match self.store.put(&key, &payload, None).await {
            Ok(()) => debug!(key = %key, "status report published"),
            Err(err) => warn!(key = %key, error = %err, "status report failed"),
        }

        let uptime_key = uptime_key(&self.hostname);
        let uptime_value = uptime.to_string();
        match self.store.put(&uptime_key, &uptime_value, Some(self.ttl)).await {
            Ok(()) => debug!(key = %uptime_key, "uptime heartbeat published"),
            Err(err) => warn!(key = %uptime_key, error = %err, "uptime heartbeat failed"),
        }
    }
}
