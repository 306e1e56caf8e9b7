//! Endpoint manager and the per-endpoint `LocalEndpoint` state machine
//! (§4.7).
//!
//! Registered into the [`crate::dispatch::PathDispatcher`] as the
//! handler for endpoint keys, and also fed interface events. Each local
//! endpoint transitions `NotReady -> Ready` as its record, profile and
//! bound interface all become present and healthy, and tears down in the
//! reverse order on delete or on becoming not-ready again. Profile
//! changes incref the new profile's tag memberships before decrefing the
//! old one's, so there is never a window where traffic is denied by both
//! the new and old policy at once (§4.7, I3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use felix_rt::RetryOnce;

use crate::dataplane::iptables::{ChainDependencies, ChainUpdates, RuleChainProgrammer, RuleSpec};
use crate::dataplane::ipset::truncate_with_hash;
use crate::dispatch::{Captures, DelHandler, SetHandler};
use crate::error::AgentResult;
use crate::model::{Endpoint, EndpointId, InterfaceState, IpFamily};
use crate::profiles::{Direction, ProfileManager};
use crate::tags::{EndpointTagInput, TagIndexManager};

const MAX_CHAIN_NAME_LEN: usize = 28;
const DATAPLANE_RETRY_DELAY: Duration = Duration::from_secs(5);
const FILTER_TABLE: &str = "filter";

/// Lifecycle phase of one locally-hosted endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhase {
    NotReady,
    Ready,
}

/// Pluggable OS-interface configuration step (sysctls, routes). The
/// interface-watching subsystem itself is out of scope; this exists so
/// the endpoint manager has somewhere to call into once the OS mechanics
/// are known, without blocking on them meanwhile.
#[async_trait]
pub trait InterfaceConfigurer: Send + Sync {
    async fn configure(&self, interface_name: &str) -> AgentResult<()>;
    async fn deconfigure(&self, interface_name: &str) -> AgentResult<()>;
}

/// Default implementation that only logs; real sysctl/route programming
/// is intentionally not part of this agent's scope.
#[derive(Debug, Default)]
pub struct LoggingInterfaceConfigurer;

#[async_trait]
impl InterfaceConfigurer for LoggingInterfaceConfigurer {
    async fn configure(&self, interface_name: &str) -> AgentResult<()> {
        info!(interface = interface_name, "interface configuration step (logging only)");
        Ok(())
    }

    async fn deconfigure(&self, interface_name: &str) -> AgentResult<()> {
        info!(interface = interface_name, "interface deconfiguration step (logging only)");
        Ok(())
    }
}

struct LocalEndpoint {
    record: Endpoint,
    phase: EndpointPhase,
    profile_ids: Vec<String>,
    /// Set when the last reconciliation attempt (including its single
    /// retry) still failed, so a later periodic resweep knows to try
    /// this endpoint again instead of leaving it stuck forever (§4.7).
    failed: bool,
}

fn endpoint_tag_input(record: &Endpoint, profile_ids: &[String]) -> EndpointTagInput {
    EndpointTagInput {
        profile_ids: profile_ids.to_vec(),
        ipv4_nets: record.ipv4_nets.clone(),
        ipv6_nets: record.ipv6_nets.clone(),
    }
}

/// `ready = endpoint present ∧ state==active ∧ iface present ∧ iface up
/// ∧ profile present` (§4.7). `iface` is looked up by the endpoint's
/// `name` in the manager's interface cache; an endpoint whose interface
/// hasn't been observed yet, or is observed but down, is never ready.
fn is_ready(record: &Endpoint, iface: Option<&InterfaceState>) -> bool {
    record.is_active()
        && !record.normalised_profile_ids().is_empty()
        && (!record.ipv4_nets.is_empty() || !record.ipv6_nets.is_empty())
        && iface.is_some_and(|iface| iface.up)
}

fn from_chain_name(prefix: &str, id: &EndpointId) -> String {
    truncate_with_hash(&format!("{prefix}-from-{}", id.endpoint), MAX_CHAIN_NAME_LEN)
}

fn to_chain_name(prefix: &str, id: &EndpointId) -> String {
    truncate_with_hash(&format!("{prefix}-to-{}", id.endpoint), MAX_CHAIN_NAME_LEN)
}

/// The two dispatch-rule specs that route traffic in/out of `iface` to
/// this endpoint's from/to chains: `INPUT`/`FORWARD --in-interface`
/// into the from-chain, `FORWARD --out-interface` into the to-chain.
/// Grounded on `frules.py`'s `install_global_rules` per-interface jump
/// pattern, collapsed from a shared dispatch chain plus leaf rules into
/// one rule per built-in chain since this agent owns no intermediate
/// dispatch chain of its own.
fn dispatch_rules(family: IpFamily, iface: &str, from_chain: &str, to_chain: &str) -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            family,
            table: FILTER_TABLE.to_string(),
            chain: "INPUT".to_string(),
            rule: format!("-i {iface} -j {from_chain}"),
        },
        RuleSpec {
            family,
            table: FILTER_TABLE.to_string(),
            chain: "FORWARD".to_string(),
            rule: format!("-i {iface} -j {from_chain}"),
        },
        RuleSpec {
            family,
            table: FILTER_TABLE.to_string(),
            chain: "FORWARD".to_string(),
            rule: format!("-o {iface} -j {to_chain}"),
        },
    ]
}

/// IPv6 NDP/ICMPv6 types that must be let through before the
/// conntrack/profile checks on both chains: router/neighbour
/// solicitation and advertisement, redirect, and the two multicast
/// listener types (`endpoint.py::get_endpoint_rules`).
const IPV6_PRE_ACCEPT_ICMP_TYPES: [u16; 6] = [130, 131, 132, 134, 135, 136];

/// Build the to-endpoint chain's rule lines: drop conntrack-INVALID,
/// accept RELATED/ESTABLISHED, pre-accept IPv6 NDP, then one `--goto`
/// per profile's inbound chain in order. Unlike the original's
/// single-`profile_id` chain, this emits one goto line per entry of
/// `profile_ids` — the plural form this implementation treats as
/// canonical (design decision, open question 1).
fn to_chain_lines(prefix: &str, family: IpFamily, profile_ids: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    if family == IpFamily::V6 {
        for icmp_type in IPV6_PRE_ACCEPT_ICMP_TYPES {
            lines.push(format!(
                "--protocol ipv6-icmp --icmpv6-type {icmp_type} --jump RETURN"
            ));
        }
    }
    lines.push("--match conntrack --ctstate INVALID --jump DROP".to_string());
    lines.push("--match conntrack --ctstate RELATED,ESTABLISHED --jump RETURN".to_string());
    for profile_id in profile_ids {
        let target = ProfileManager::chain_name(prefix, profile_id, Direction::Inbound);
        lines.push(format!("--goto {target}"));
    }
    lines
}

/// Build the from-endpoint chain's rule lines: the to-chain's
/// conntrack/NDP preamble, a DHCP client/server allowance, then for
/// each (ip, mac) pair declared on the endpoint and each profile, a
/// source-ip-and-mac match gotoing to the profile's outbound chain, and
/// finally an unconditional drop (`endpoint.py::get_endpoint_rules`).
fn from_chain_lines(prefix: &str, family: IpFamily, record: &Endpoint, profile_ids: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    if family == IpFamily::V6 {
        for icmp_type in IPV6_PRE_ACCEPT_ICMP_TYPES {
            lines.push(format!(
                "--protocol ipv6-icmp --icmpv6-type {icmp_type} --jump RETURN"
            ));
        }
    }
    lines.push("--match conntrack --ctstate INVALID --jump DROP".to_string());
    lines.push("--match conntrack --ctstate RELATED,ESTABLISHED --jump RETURN".to_string());

    let (client_port, server_port) = match family {
        IpFamily::V4 => (68, 67),
        IpFamily::V6 => (546, 547),
    };
    lines.push(format!(
        "--protocol udp --sport {client_port} --dport {server_port} --jump RETURN"
    ));

    for pair in record.ip_mac_pairs(family) {
        for profile_id in profile_ids {
            let target = ProfileManager::chain_name(prefix, profile_id, Direction::Outbound);
            lines.push(format!(
                "--source {} --match mac --mac-source {} --goto {target}",
                pair.ip,
                pair.mac.to_uppercase()
            ));
        }
    }
    lines.push("--jump DROP".to_string());
    lines
}

/// Owns every locally-hosted endpoint's state and drives its dataplane
/// wiring: the tag memberships it contributes, the `from`/`to` chains
/// that enforce its profiles, and the built-in-chain dispatch rules
/// that route its interface's traffic into them.
pub struct EndpointManager {
    prefix: String,
    hostname: String,
    tags: Arc<AsyncMutex<TagIndexManager>>,
    programmer: Arc<RuleChainProgrammer>,
    interface_configurer: Arc<dyn InterfaceConfigurer>,
    retry: RetryOnce,
    endpoints: AsyncMutex<HashMap<EndpointId, LocalEndpoint>>,
    interfaces: AsyncMutex<HashMap<String, InterfaceState>>,
    endpoints_by_iface_name: AsyncMutex<HashMap<String, EndpointId>>,
}

impl EndpointManager {
    pub fn new(
        prefix: impl Into<String>,
        hostname: impl Into<String>,
        tags: Arc<AsyncMutex<TagIndexManager>>,
        programmer: Arc<RuleChainProgrammer>,
        interface_configurer: Arc<dyn InterfaceConfigurer>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            hostname: hostname.into(),
            tags,
            programmer,
            interface_configurer,
            retry: RetryOnce::new(DATAPLANE_RETRY_DELAY),
            endpoints: AsyncMutex::new(HashMap::new()),
            interfaces: AsyncMutex::new(HashMap::new()),
            endpoints_by_iface_name: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Apply a set/update of one endpoint record. Ignores records for
    /// other hosts (a watcher scoped to this host should never deliver
    /// one, but this keeps the manager safe if it's ever shared).
    pub async fn apply(&self, id: EndpointId, record: Endpoint) {
        if !id.is_local(&self.hostname) {
            return;
        }

        self.endpoints_by_iface_name
            .lock()
            .await
            .insert(record.name.clone(), id.clone());

        let iface = self.interfaces.lock().await.get(&record.name).cloned();
        let new_ready = is_ready(&record, iface.as_ref());
        let new_profile_ids = record.normalised_profile_ids();

        let old_ready = {
            let endpoints = self.endpoints.lock().await;
            endpoints.get(&id).map(|ep| ep.phase == EndpointPhase::Ready).unwrap_or(false)
        };

        let failed = self
            .retry
            .run(|| self.reconcile(&id, &record, &new_profile_ids, old_ready, new_ready))
            .await
            .is_err();
        if failed {
            error!(endpoint = %id, "endpoint reconciliation failed after retry, will retry on next resweep");
        }

        let mut endpoints = self.endpoints.lock().await;
        endpoints.insert(
            id,
            LocalEndpoint {
                record,
                phase: if new_ready { EndpointPhase::Ready } else { EndpointPhase::NotReady },
                profile_ids: new_profile_ids,
                failed,
            },
        );
    }

    /// Retry every endpoint whose last reconciliation attempt failed.
    /// Driven by a periodic timer rather than `RetryOnce` alone, since
    /// `RetryOnce` only covers one retry within a single `apply` call
    /// and gives up for good after that (§4.7).
    pub async fn resweep(&self) {
        let stuck: Vec<(EndpointId, Endpoint)> = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .iter()
                .filter(|(_, ep)| ep.failed)
                .map(|(id, ep)| (id.clone(), ep.record.clone()))
                .collect()
        };
        for (id, record) in stuck {
            self.apply(id, record).await;
        }
    }

    /// Tear down every locally-hosted endpoint under one workload, for a
    /// whole-workload delete landing on the endpoint directory key
    /// rather than on one leaf endpoint key.
    pub async fn remove_workload(&self, host: &str, orchestrator: &str, workload: &str) {
        let ids: Vec<EndpointId> = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .keys()
                .filter(|id| id.host == host && id.orchestrator == orchestrator && id.workload == workload)
                .cloned()
                .collect()
        };
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Forward an observed interface change to whichever endpoint is
    /// currently bound to that name, recomputing readiness and
    /// re-running the same set-up/tear-down transition `apply` would
    /// (§4.7, `on_interface_update`).
    pub async fn on_interface_update(&self, name: &str, state: Option<InterfaceState>) {
        match &state {
            Some(state) => {
                self.interfaces.lock().await.insert(name.to_string(), state.clone());
            }
            None => {
                self.interfaces.lock().await.remove(name);
            }
        }

        let Some(id) = self.endpoints_by_iface_name.lock().await.get(name).cloned() else {
            return;
        };
        let record = {
            let endpoints = self.endpoints.lock().await;
            endpoints.get(&id).map(|ep| ep.record.clone())
        };
        if let Some(record) = record {
            self.apply(id, record).await;
        }
    }

    /// Remove an endpoint entirely: best-effort teardown with the
    /// dispatch rules removed before the chains they target are
    /// deleted, then release every tag membership it contributed.
    pub async fn remove(&self, id: &EndpointId) {
        let mut endpoints = self.endpoints.lock().await;
        let Some(local) = endpoints.remove(id) else { return };
        drop(endpoints);

        self.endpoints_by_iface_name.lock().await.remove(&local.record.name);

        if local.phase == EndpointPhase::Ready {
            self.teardown_dispatch_rules(id, &local.record).await;
        }

        let from_chain = from_chain_name(&self.prefix, id);
        let to_chain = to_chain_name(&self.prefix, id);
        for family in [IpFamily::V4, IpFamily::V6] {
            let mut updates = ChainUpdates::new(family, FILTER_TABLE);
            updates.delete(from_chain.clone());
            updates.delete(to_chain.clone());
            if let Err(err) = self.programmer.commit(&updates).await {
                warn!(endpoint = %id, family = %family, error = %err, "best-effort chain teardown failed");
            }
        }

        if let Err(err) = self.interface_configurer.deconfigure(&local.record.name).await {
            warn!(endpoint = %id, error = %err, "interface deconfiguration failed");
        }

        let mut tags = self.tags.lock().await;
        tags.on_endpoint_update(id.clone(), None);
        if let Err(err) = tags.finish_batch().await {
            error!(endpoint = %id, error = %err, "failed to release tag memberships on teardown");
        }
    }

    async fn reconcile(
        &self,
        id: &EndpointId,
        record: &Endpoint,
        new_profile_ids: &[String],
        old_ready: bool,
        new_ready: bool,
    ) -> AgentResult<()> {
        {
            let mut tags = self.tags.lock().await;
            tags.on_endpoint_update(id.clone(), Some(endpoint_tag_input(record, new_profile_ids)));
            tags.finish_batch().await?;
        }

        if new_ready {
            self.program_dispatch_chains(id, record, new_profile_ids).await?;
            self.install_dispatch_rules(id, record).await?;
            self.interface_configurer.configure(&record.name).await?;
        } else if old_ready {
            self.teardown_dispatch_rules(id, record).await;
        }

        Ok(())
    }

    /// Program this endpoint's `from`/`to` chains with their full
    /// conntrack/NDP/DHCP preamble plus one `--goto` per profile, per
    /// family (§4.7). Each chain declares a dependency on the profile
    /// chains it gotos into, so a profile chain that hasn't arrived yet
    /// is committed as an empty stub rather than left dangling.
    async fn program_dispatch_chains(
        &self,
        id: &EndpointId,
        record: &Endpoint,
        profile_ids: &[String],
    ) -> AgentResult<()> {
        let from_chain = from_chain_name(&self.prefix, id);
        let to_chain = to_chain_name(&self.prefix, id);
        for family in [IpFamily::V4, IpFamily::V6] {
            let mut updates = ChainUpdates::new(family, FILTER_TABLE);
            updates.upsert(from_chain.clone(), from_chain_lines(&self.prefix, family, record, profile_ids));
            updates.upsert(to_chain.clone(), to_chain_lines(&self.prefix, family, profile_ids));

            let mut deps = ChainDependencies::new();
            let inbound: std::collections::HashSet<String> = profile_ids
                .iter()
                .map(|p| ProfileManager::chain_name(&self.prefix, p, Direction::Inbound))
                .collect();
            let outbound: std::collections::HashSet<String> = profile_ids
                .iter()
                .map(|p| ProfileManager::chain_name(&self.prefix, p, Direction::Outbound))
                .collect();
            deps.set_deps(to_chain.clone(), inbound);
            deps.set_deps(from_chain.clone(), outbound);

            self.programmer.commit_with_deps(&updates, &deps).await?;
        }
        Ok(())
    }

    /// Insert the built-in-chain dispatch rules that route `record`'s
    /// interface into its from/to chains, for both IP families.
    async fn install_dispatch_rules(&self, id: &EndpointId, record: &Endpoint) -> AgentResult<()> {
        let from_chain = from_chain_name(&self.prefix, id);
        let to_chain = to_chain_name(&self.prefix, id);
        for family in [IpFamily::V4, IpFamily::V6] {
            for spec in dispatch_rules(family, &record.name, &from_chain, &to_chain) {
                self.programmer.ensure_rule_inserted(&spec).await?;
            }
        }
        Ok(())
    }

    /// Remove the dispatch rules first, so the from/to chains become
    /// unreferenced before a later step deletes them (§4.7 ordering
    /// requirement). Best-effort: a failure here is logged, not
    /// propagated, since a stuck dispatch rule is preferable to leaving
    /// the endpoint stranded mid-teardown.
    async fn teardown_dispatch_rules(&self, id: &EndpointId, record: &Endpoint) {
        let from_chain = from_chain_name(&self.prefix, id);
        let to_chain = to_chain_name(&self.prefix, id);
        for family in [IpFamily::V4, IpFamily::V6] {
            for spec in dispatch_rules(family, &record.name, &from_chain, &to_chain) {
                if let Err(err) = self.programmer.ensure_rule_removed(&spec).await {
                    warn!(endpoint = %id, family = %family, error = %err, "failed to remove dispatch rule");
                }
            }
        }
    }
}

#[async_trait]
impl SetHandler for EndpointManager {
    async fn on_set(&self, captures: &Captures, value: &str) {
        let (Some(host), Some(orchestrator), Some(workload), Some(endpoint)) = (
            captures.get("host"),
            captures.get("orch"),
            captures.get("wl"),
            captures.get("ep"),
        ) else {
            warn!("endpoint key matched without expected captures");
            return;
        };
        let id = EndpointId::new(host, orchestrator, workload, endpoint);
        match serde_json::from_str::<Endpoint>(value) {
            Ok(record) => self.apply(id, record).await,
            Err(err) => warn!(endpoint = %id, error = %err, "invalid endpoint record, treating as deleted"),
        }
    }
}

#[async_trait]
impl DelHandler for EndpointManager {
    async fn on_del(&self, captures: &Captures) {
        let (Some(host), Some(orchestrator), Some(workload), Some(endpoint)) = (
            captures.get("host"),
            captures.get("orch"),
            captures.get("wl"),
            captures.get("ep"),
        ) else {
            return;
        };
        let id = EndpointId::new(host, orchestrator, workload, endpoint);
        self.remove(&id).await;
    }
}
