//! Process-wide supervisor (§5, §2 component #10): wires the dataplane
//! managers, the path dispatcher and the watcher together and runs them
//! to completion. Any one of the watcher or the status reporter exiting
//! — success or failure — is treated as fatal for the whole process:
//! there is no in-place restart here, because a partially-reconciled
//! dataplane is worse than a clean process restart under a real init
//! system.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use felix_rt::JitteredInterval;

use crate::dataplane::exec::{CommandRunner, ProcessCommandRunner};
use crate::dataplane::iptables::RuleChainProgrammer;
use crate::dispatch::{Captures, DelHandler, PathDispatcher, SetHandler};
use crate::endpoint::{EndpointManager, LoggingInterfaceConfigurer};
use crate::error::AgentResult;
use crate::model::{IpFamily, Rule};
use crate::profiles::ProfileManager;
use crate::status::StatusReporter;
use crate::store::KvStore;
use crate::tags::TagIndexManager;
use crate::watcher::{bootstrap_config, Watcher};

const TAGS_PATTERN: &str = "/calico/v1/policy/profile/<profile_id>/tags";
const RULES_PATTERN: &str = "/calico/v1/policy/profile/<profile_id>/rules";
const PROFILE_DIR_PATTERN: &str = "/calico/v1/policy/profile/<profile_id>";
const ENDPOINT_DIR_PATTERN: &str = "/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint";
const ENDPOINT_PATTERN: &str =
    "/calico/v1/host/<host>/workload/<orch>/<wl>/endpoint/<ep>";
const RESWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize, Default)]
struct RulesWire {
    #[serde(default)]
    inbound_rules: Vec<Rule>,
    #[serde(default)]
    outbound_rules: Vec<Rule>,
}

struct ProfileRulesHandler(Arc<AsyncMutex<ProfileManager>>);

#[async_trait]
impl SetHandler for ProfileRulesHandler {
    async fn on_set(&self, captures: &Captures, value: &str) {
        let Some(id) = captures.get("profile_id") else { return };
        let wire: RulesWire = match serde_json::from_str(value) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(profile = %id, error = %err, "invalid rules record, treating as empty");
                RulesWire::default()
            }
        };
        let mut manager = self.0.lock().await;
        match manager.apply_rules(id.clone(), wire.inbound_rules, wire.outbound_rules).await {
            Ok(errors) => {
                for err in errors {
                    warn!(profile = %id, error = %err, "a rule in this profile failed to compile");
                }
            }
            Err(err) => error!(profile = %id, error = %err, "failed to apply profile rules"),
        }
    }
}

#[async_trait]
impl DelHandler for ProfileRulesHandler {
    async fn on_del(&self, captures: &Captures) {
        let Some(id) = captures.get("profile_id") else { return };
        let mut manager = self.0.lock().await;
        let _ = manager.apply_rules(id.clone(), Vec::new(), Vec::new()).await;
    }
}

struct ProfileTagsHandler(Arc<AsyncMutex<ProfileManager>>);

#[async_trait]
impl SetHandler for ProfileTagsHandler {
    async fn on_set(&self, captures: &Captures, value: &str) {
        let Some(id) = captures.get("profile_id") else { return };
        let tags: std::collections::BTreeSet<String> = match serde_json::from_str(value) {
            Ok(tags) => tags,
            Err(err) => {
                warn!(profile = %id, error = %err, "invalid tags record, treating as empty");
                std::collections::BTreeSet::new()
            }
        };
        let mut manager = self.0.lock().await;
        if let Err(err) = manager.apply_tags(id.clone(), tags).await {
            error!(profile = %id, error = %err, "failed to apply profile tags");
        }
    }
}

#[async_trait]
impl DelHandler for ProfileTagsHandler {
    async fn on_del(&self, captures: &Captures) {
        let Some(id) = captures.get("profile_id") else { return };
        let mut manager = self.0.lock().await;
        let _ = manager.apply_tags(id.clone(), std::collections::BTreeSet::new()).await;
    }
}

struct ProfileDeleteHandler(Arc<AsyncMutex<ProfileManager>>);

#[async_trait]
impl DelHandler for ProfileDeleteHandler {
    async fn on_del(&self, captures: &Captures) {
        let Some(id) = captures.get("profile_id") else { return };
        let mut manager = self.0.lock().await;
        if let Err(err) = manager.remove_profile(id).await {
            error!(profile = %id, error = %err, "failed to tear down deleted profile");
        }
    }
}

/// Handles a whole-workload delete landing on the endpoint directory key
/// (one `Del` event on `.../endpoint` itself, rather than on one leaf
/// `.../endpoint/<ep>` key) by tearing down every endpoint currently
/// known under that workload.
struct EndpointWorkloadDeleteHandler(Arc<EndpointManager>);

#[async_trait]
impl DelHandler for EndpointWorkloadDeleteHandler {
    async fn on_del(&self, captures: &Captures) {
        let (Some(host), Some(orch), Some(wl)) =
            (captures.get("host"), captures.get("orch"), captures.get("wl"))
        else {
            return;
        };
        self.0.remove_workload(host, orch, wl).await;
    }
}

/// Builds every dataplane manager, wires the dispatcher, and runs the
/// watcher and status reporter for the lifetime of the process.
pub struct Supervisor<S: KvStore> {
    store: S,
    hostname: String,
}

impl<S: KvStore + Clone + 'static> Supervisor<S> {
    pub fn new(store: S, hostname: impl Into<String>) -> Self {
        Self {
            store,
            hostname: hostname.into(),
        }
    }

    /// Block until configuration is available, wire everything up, then
    /// run forever. Returns only when a task has exited, at which point
    /// the caller should terminate the process with a non-zero status
    /// (§6 exit codes) rather than attempt recovery in place.
    pub async fn run(self) -> AgentResult<()> {
        info!("waiting for initial configuration from the datastore");
        let config = bootstrap_config(&self.store, &self.hostname).await?;
        info!(interface_prefix = %config.interface_prefix, "configuration loaded, starting dataplane managers");

        if !config.startup_cleanup_delay.is_zero() {
            tokio::time::sleep(config.startup_cleanup_delay).await;
        }

        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner::new());
        let programmer = Arc::new(RuleChainProgrammer::new(runner.clone()));
        let tags = Arc::new(AsyncMutex::new(TagIndexManager::new(
            config.interface_prefix.clone(),
            runner.clone(),
        )));

        // Startup reconciliation (§4.4, §6): a felix-prefixed chain or
        // ipset left behind by a previous process lifetime is not yet
        // wanted by anything this process has built, so it is swept now,
        // before the watcher's snapshot rebuilds whatever the current
        // model actually needs.
        let no_wanted_chains = HashSet::new();
        for family in [IpFamily::V4, IpFamily::V6] {
            if let Err(err) = programmer
                .sweep_stale_chains(family, "filter", &config.interface_prefix, &no_wanted_chains)
                .await
            {
                warn!(family = %family.as_str(), error = %err, "startup chain sweep failed");
            }
        }
        if let Err(err) = tags.lock().await.cleanup().await {
            warn!(error = %err, "startup ipset sweep failed");
        }

        let profiles = Arc::new(AsyncMutex::new(ProfileManager::new(
            config.interface_prefix.clone(),
            tags.clone(),
            programmer.clone(),
        )));
        let endpoints = Arc::new(EndpointManager::new(
            config.interface_prefix.clone(),
            self.hostname.clone(),
            tags.clone(),
            programmer.clone(),
            Arc::new(LoggingInterfaceConfigurer),
        ));

        let mut dispatcher = PathDispatcher::new();
        dispatcher.register(RULES_PATTERN, Arc::new(ProfileRulesHandler(profiles.clone())));
        dispatcher.register(TAGS_PATTERN, Arc::new(ProfileTagsHandler(profiles.clone())));
        dispatcher.register_del(PROFILE_DIR_PATTERN, Arc::new(ProfileDeleteHandler(profiles.clone())));
        dispatcher.register_del(ENDPOINT_DIR_PATTERN, Arc::new(EndpointWorkloadDeleteHandler(endpoints.clone())));
        dispatcher.register(ENDPOINT_PATTERN, endpoints.clone());

        let watcher = Watcher::new(self.store.clone(), dispatcher, self.hostname.clone())
            .with_bootstrapped_config(config.clone());
        let reporter = StatusReporter::new(
            self.store.clone(),
            self.hostname.clone(),
            config.reporting_interval,
            config.reporting_ttl,
        );

        let resweep_loop = async {
            let mut interval = JitteredInterval::new(RESWEEP_INTERVAL);
            loop {
                interval.tick().await;
                endpoints.resweep().await;
            }
        };

        tokio::select! {
            result = watcher.run() => {
                error!("watcher task exited, terminating process");
                result
            }
            _ = reporter.run() => {
                error!("status reporter task exited unexpectedly, terminating process");
                Ok(())
            }
            _ = resweep_loop => {
                error!("resweep loop exited unexpectedly, terminating process");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Captures, DispatchAction};

    fn captures(pairs: &[(&str, &str)]) -> Captures {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn profile_rules_handler_applies_valid_rules() {
        let tags = Arc::new(AsyncMutex::new(TagIndexManager::new(
            "felix",
            Arc::new(crate::dataplane::exec::ProcessCommandRunner::new()) as Arc<dyn CommandRunner>,
        )));
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::dataplane::exec::ProcessCommandRunner::new());
        let programmer = Arc::new(RuleChainProgrammer::new(runner));
        let profiles = Arc::new(AsyncMutex::new(ProfileManager::new("felix", tags, programmer)));
        let handler = ProfileRulesHandler(profiles.clone());

        handler
            .on_set(&captures(&[("profile_id", "p1")]), r#"{"inbound_rules":[],"outbound_rules":[]}"#)
            .await;

        assert!(profiles.lock().await.profile("p1").is_some());
    }

    #[tokio::test]
    async fn dispatch_routes_rules_and_tags_to_the_same_profile() {
        let tags = Arc::new(AsyncMutex::new(TagIndexManager::new(
            "felix",
            Arc::new(crate::dataplane::exec::ProcessCommandRunner::new()) as Arc<dyn CommandRunner>,
        )));
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::dataplane::exec::ProcessCommandRunner::new());
        let programmer = Arc::new(RuleChainProgrammer::new(runner));
        let profiles = Arc::new(AsyncMutex::new(ProfileManager::new("felix", tags, programmer)));

        let mut dispatcher = PathDispatcher::new();
        dispatcher.register(RULES_PATTERN, Arc::new(ProfileRulesHandler(profiles.clone())));
        dispatcher.register(TAGS_PATTERN, Arc::new(ProfileTagsHandler(profiles.clone())));

        dispatcher
            .dispatch(
                DispatchAction::Set,
                "/calico/v1/policy/profile/p1/rules",
                Some(r#"{"inbound_rules":[],"outbound_rules":[]}"#),
            )
            .await;
        dispatcher
            .dispatch(
                DispatchAction::Set,
                "/calico/v1/policy/profile/p1/tags",
                Some(r#"["web"]"#),
            )
            .await;

        let profiles = profiles.lock().await;
        let profile = profiles.profile("p1").unwrap();
        assert!(profile.tags.contains("web"));
    }
}
