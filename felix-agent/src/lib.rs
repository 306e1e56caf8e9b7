//! felix-agent — a per-host Layer-3 dataplane reconciliation agent.
//!
//! Watches a distributed key/value store for endpoint, profile and IP-pool
//! records and reconciles them into kernel `ipset`/`iptables` state: address
//! sets for tag membership, per-profile rule chains, and per-endpoint
//! dispatch chains wired into the host's built-in `INPUT`/`FORWARD` chains.
//!
//! # Module Organization
//!
//! - [`config`] - typed, env-overridable agent configuration
//! - [`error`] - the domain error type and its retry/resync classification
//! - [`model`] - wire/domain types: endpoints, profiles, rules, IP pools
//! - [`store`] - the key/value store abstraction the watcher polls
//! - [`dispatch`] - path-pattern trie routing store keys to handlers
//! - [`watcher`] - the store-watching state machine
//! - [`tags`] - tag membership index and address-set lifecycle
//! - [`profiles`] - rule compiler and per-profile chain manager
//! - [`dataplane`] - `ipset`/`iptables` programmers and the subprocess runner
//! - [`endpoint`] - per-endpoint readiness and dispatch-chain reconciliation
//! - [`status`] - periodic liveness reporting back to the store
//! - [`supervisor`] - wires every manager together and runs the process

pub mod config;
pub mod dataplane;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod profiles;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod tags;
pub mod watcher;

pub use config::AgentConfig;
pub use dataplane::{AddressSetProgrammer, ChainDependencies, ChainUpdates, RuleChainProgrammer, RuleSpec};
pub use dispatch::{Captures, DelHandler, DispatchAction, PathDispatcher, SetHandler};
pub use endpoint::EndpointManager;
pub use error::{AgentError, AgentResult};
pub use model::{
    Endpoint, EndpointId, EndpointState, IpFamily, IpMacPair, IpamPool, InterfaceState, Profile,
    PortSpec, Rule, RuleAction,
};
pub use profiles::ProfileManager;
pub use status::StatusReporter;
pub use store::{InMemoryKvStore, KvStore, PollOutcome, Snapshot, StoreAction, StoreError, StoreEvent};
pub use supervisor::Supervisor;
pub use tags::{EndpointTagInput, TagIndexManager};
pub use watcher::{bootstrap_config, Watcher};
