//! Dataplane programmers: the address-set programmer (§4.3) and the
//! rule-chain programmer (§4.4), plus the shared subprocess invocation
//! path they both commit through.
//!
//! This module contains only declarations and re-exports; implementation
//! lives in the submodules.

pub mod exec;
pub mod ipset;
pub mod iptables;

pub use exec::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ipset::AddressSetProgrammer;
pub use iptables::{ChainDependencies, ChainUpdates, RuleChainProgrammer, RuleSpec};
