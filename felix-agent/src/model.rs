//! Core data types shared by every manager: endpoints, profiles, rules,
//! tags, interface state and IPAM pools (see §3 of the design).
//!
//! These are plain data, deliberately free of any actor or dataplane
//! dependency so that `tags`, `profiles`, `endpoint` and `watcher` can all
//! share one vocabulary without circular module dependencies.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// IP family a rule, tag or address set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural identity of an endpoint: `(host, orchestrator, workload,
/// endpoint)`. Immutable and comparable by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub host: String,
    pub orchestrator: String,
    pub workload: String,
    pub endpoint: String,
}

impl EndpointId {
    pub fn new(
        host: impl Into<String>,
        orchestrator: impl Into<String>,
        workload: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            orchestrator: orchestrator.into(),
            workload: workload.into(),
            endpoint: endpoint.into(),
        }
    }

    /// True when this endpoint lives on the given local hostname.
    pub fn is_local(&self, hostname: &str) -> bool {
        self.host == hostname
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.host, self.orchestrator, self.workload, self.endpoint
        )
    }
}

/// Operational state of an endpoint as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Active,
    Inactive,
}

/// A workload's network interface as seen by this agent.
///
/// `profile_id` (singular) is accepted at the deserialization boundary for
/// backwards compatibility; `profile_ids` (plural) is canonical once
/// normalised (see Open Question 1 in the design notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub state: EndpointState,
    pub name: String,
    pub mac: Option<String>,
    #[serde(default)]
    pub profile_ids: Vec<String>,
    #[serde(default, rename = "profile_id")]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub ipv4_nets: BTreeSet<String>,
    #[serde(default)]
    pub ipv6_nets: BTreeSet<String>,
    pub ipv4_gateway: Option<String>,
    pub ipv6_gateway: Option<String>,
}

impl Endpoint {
    /// The deduplicated, ordered profile id list, folding the legacy
    /// singular `profile_id` field in ahead of anything already present in
    /// `profile_ids` (so the normalised list is stable across re-reads of
    /// the same record).
    pub fn normalised_profile_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for id in self.profile_id.iter().chain(self.profile_ids.iter()) {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        out
    }

    pub fn is_active(&self) -> bool {
        self.state == EndpointState::Active
    }

    /// Addresses for one family, as plain host addresses (CIDR host part),
    /// used when computing tag address-set membership.
    pub fn nets(&self, family: IpFamily) -> &BTreeSet<String> {
        match family {
            IpFamily::V4 => &self.ipv4_nets,
            IpFamily::V6 => &self.ipv6_nets,
        }
    }

    /// The (ip, mac) pairs this endpoint declares for `family`: every net
    /// in that family paired with the endpoint's single MAC, or none if
    /// the endpoint has no MAC (source-mac matching can't be built
    /// without one).
    pub fn ip_mac_pairs(&self, family: IpFamily) -> Vec<IpMacPair> {
        let Some(mac) = &self.mac else { return Vec::new() };
        self.nets(family)
            .iter()
            .map(|ip| IpMacPair {
                ip: ip.clone(),
                mac: mac.clone(),
            })
            .collect()
    }
}

/// A single (ip, mac) pair declared on an endpoint, used when building the
/// from-endpoint chain's per-source-match rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpMacPair {
    pub ip: String,
    pub mac: String,
}

/// Action a rule takes when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// A single firewall rule. Every matcher field is optional; an absent
/// field means "do not match on this dimension".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rule {
    pub protocol: Option<String>,
    pub ip_version: Option<u8>,
    pub src_net: Option<String>,
    pub dst_net: Option<String>,
    pub src_tag: Option<String>,
    pub dst_tag: Option<String>,
    #[serde(default)]
    pub src_ports: Vec<PortSpec>,
    #[serde(default)]
    pub dst_ports: Vec<PortSpec>,
    pub icmp_type: Option<u16>,
    pub icmp_code: Option<u16>,
    pub action: Option<RuleAction>,
}

/// One entry of a port list: a bare port or a `lo:hi` range. Deserializes
/// from either a JSON integer or a JSON string (`"2:3"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// Number of "entries" this spec counts as for chunking purposes: a
    /// range counts as 2, a single port as 1 (§4.6).
    pub fn entry_count(self) -> usize {
        match self {
            PortSpec::Single(_) => 1,
            PortSpec::Range(_, _) => 2,
        }
    }

    pub fn contains_zero(self) -> bool {
        matches!(self, PortSpec::Single(0) | PortSpec::Range(0, _) | PortSpec::Range(_, 0))
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range(lo, hi) => write!(f, "{lo}:{hi}"),
        }
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(u16),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Int(p) => Ok(PortSpec::Single(p)),
            Repr::Str(s) => parse_port_spec_str(&s).map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for PortSpec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PortSpec::Single(p) => serializer.serialize_u16(*p),
            PortSpec::Range(lo, hi) => serializer.serialize_str(&format!("{lo}:{hi}")),
        }
    }
}

fn parse_port_spec_str(s: &str) -> Result<PortSpec, String> {
    if let Some((lo, hi)) = s.split_once(':') {
        let lo: u16 = lo.parse().map_err(|_| format!("invalid port range '{s}'"))?;
        let hi: u16 = hi.parse().map_err(|_| format!("invalid port range '{s}'"))?;
        Ok(PortSpec::Range(lo, hi))
    } else {
        let p: u16 = s.parse().map_err(|_| format!("invalid port '{s}'"))?;
        Ok(PortSpec::Single(p))
    }
}

/// Bundle of firewall rules plus tags, independently versioned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    pub tags: BTreeSet<String>,
}

/// Observed OS-level interface state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    pub name: String,
    pub up: bool,
    pub addresses: BTreeSet<String>,
}

/// CIDR-keyed IPAM pool descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IpamPool {
    pub cidr: String,
    #[serde(default)]
    pub masquerade: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalised_profile_ids_prefers_singular_first_and_dedupes() {
        let ep = Endpoint {
            state: EndpointState::Active,
            name: "cali1234".into(),
            mac: None,
            profile_ids: vec!["b".into(), "a".into()],
            profile_id: Some("a".into()),
            ipv4_nets: BTreeSet::new(),
            ipv6_nets: BTreeSet::new(),
            ipv4_gateway: None,
            ipv6_gateway: None,
        };
        assert_eq!(ep.normalised_profile_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn port_spec_parses_single_and_range_strings() {
        assert_eq!(parse_port_spec_str("80").unwrap(), PortSpec::Single(80));
        assert_eq!(parse_port_spec_str("2:3").unwrap(), PortSpec::Range(2, 3));
        assert!(parse_port_spec_str("nope").is_err());
    }

    #[test]
    fn port_spec_entry_counts_match_chunking_rule() {
        assert_eq!(PortSpec::Single(80).entry_count(), 1);
        assert_eq!(PortSpec::Range(1, 10).entry_count(), 2);
    }

    #[test]
    fn port_spec_detects_zero() {
        assert!(PortSpec::Single(0).contains_zero());
        assert!(PortSpec::Range(0, 10).contains_zero());
        assert!(PortSpec::Range(10, 0).contains_zero());
        assert!(!PortSpec::Range(1, 10).contains_zero());
    }

    #[test]
    fn ip_mac_pairs_is_empty_without_a_mac() {
        let mut ep = Endpoint {
            state: EndpointState::Active,
            name: "cali1234".into(),
            mac: None,
            profile_ids: vec!["p1".into()],
            profile_id: None,
            ipv4_nets: BTreeSet::new(),
            ipv6_nets: BTreeSet::new(),
            ipv4_gateway: None,
            ipv6_gateway: None,
        };
        ep.ipv4_nets.insert("10.0.0.1/32".into());
        assert!(ep.ip_mac_pairs(IpFamily::V4).is_empty());

        ep.mac = Some("ee:ee:ee:ee:ee:ee".into());
        let pairs = ep.ip_mac_pairs(IpFamily::V4);
        assert_eq!(pairs, vec![IpMacPair { ip: "10.0.0.1/32".into(), mac: "ee:ee:ee:ee:ee:ee".into() }]);
    }

    #[test]
    fn endpoint_id_is_local_matches_hostname() {
        let id = EndpointId::new("host-a", "k8s", "wl", "eth0");
        assert!(id.is_local("host-a"));
        assert!(!id.is_local("host-b"));
    }
}
