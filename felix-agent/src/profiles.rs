//! Rule compiler and profile/rules manager (§4.6).
//!
//! Turns a [`Profile`]'s inbound/outbound [`Rule`] lists into compiled
//! iptables fragments and commits one pair of chains (`felix-p-<id>-i`,
//! `felix-p-<id>-o`) per IP family through [`RuleChainProgrammer`].
//! Independent of which endpoints reference a profile: a profile's
//! chains exist as soon as the profile record is known, so endpoint
//! wiring never has to wait on rule compilation (Open Question 3).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::dataplane::ipset::truncate_with_hash;
use crate::dataplane::iptables::{ChainUpdates, RuleChainProgrammer};
use crate::error::{AgentError, AgentResult};
use crate::model::{IpFamily, PortSpec, Profile, Rule, RuleAction};
use crate::tags::TagIndexManager;

const MAX_CHAIN_NAME_LEN: usize = 28;
const MAX_PORT_CHUNK_ENTRIES: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn suffix(self) -> &'static str {
        match self {
            Direction::Inbound => "i",
            Direction::Outbound => "o",
        }
    }
}

/// Split a port list into has-zero plus the normalised non-zero list
/// (§4.6): a bare `0` or `0:0` becomes a standalone "port unspecified"
/// marker; `0:hi`/`lo:0` loses its zero end (clamped to `1`) and keeps
/// the rest of the range.
fn normalize_ports(ports: &[PortSpec]) -> (Vec<PortSpec>, bool) {
    let mut has_zero = false;
    let mut normal = Vec::with_capacity(ports.len());
    for port in ports {
        match *port {
            PortSpec::Single(0) => has_zero = true,
            PortSpec::Range(0, 0) => has_zero = true,
            PortSpec::Range(0, hi) => {
                has_zero = true;
                normal.push(if hi == 1 {
                    PortSpec::Single(1)
                } else {
                    PortSpec::Range(1, hi)
                });
            }
            PortSpec::Range(lo, 0) => {
                has_zero = true;
                normal.push(if lo == 1 {
                    PortSpec::Single(1)
                } else {
                    PortSpec::Range(lo, 1)
                });
            }
            other => normal.push(other),
        }
    }
    (normal, has_zero)
}

/// Greedily pack normalised port entries into multiport-sized chunks: at
/// most 15 "entries" per chunk, where a range counts as 2 (§4.6, P5).
fn chunk_ports(normal: &[PortSpec]) -> Vec<Vec<PortSpec>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut count = 0usize;
    for port in normal {
        let entries = port.entry_count();
        if count + entries > MAX_PORT_CHUNK_ENTRIES && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(*port);
        count += entries;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Full chunking pipeline: a leading single-entry chunk for "port
/// unspecified" if any zero was present, followed by the packed chunks
/// of the normalised non-zero ports. Empty input yields no chunks at
/// all (the caller treats that as "no port constraint").
fn port_chunks(ports: &[PortSpec]) -> Vec<Vec<PortSpec>> {
    let (normal, has_zero) = normalize_ports(ports);
    let mut chunks = Vec::new();
    if has_zero {
        chunks.push(vec![PortSpec::Single(0)]);
    }
    chunks.extend(chunk_ports(&normal));
    chunks
}

fn render_port_chunk(chunk: &[PortSpec]) -> String {
    chunk
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// A port dimension's chunk sequence, or `None` meaning the rule places
/// no constraint on that dimension at all.
fn dimension_chunks(ports: &[PortSpec]) -> Vec<Option<Vec<PortSpec>>> {
    if ports.is_empty() {
        vec![None]
    } else {
        port_chunks(ports).into_iter().map(Some).collect()
    }
}

fn ip_version_matches(rule: &Rule, family: IpFamily) -> bool {
    match rule.ip_version {
        None => true,
        Some(4) => family == IpFamily::V4,
        Some(6) => family == IpFamily::V6,
        Some(_) => false,
    }
}

/// Compile one [`Rule`] into zero or more fully-rendered iptables rule
/// fragments for one family (one fragment per `(src port chunk, dst port
/// chunk)` pair, §4.6). Returns an empty list if the rule's
/// `ip_version` excludes this family. Fails the whole rule if
/// `icmp_type` is the unsupported sentinel `255`, isolating the failure
/// to this one rule.
fn compile_rule(
    rule: &Rule,
    family: IpFamily,
    tag_set_name: &dyn Fn(&str, IpFamily) -> String,
) -> AgentResult<Vec<String>> {
    if !ip_version_matches(rule, family) {
        return Ok(Vec::new());
    }
    if rule.icmp_type == Some(255) {
        return Err(AgentError::rule_compilation(
            "icmp_type 255 is not a representable ICMP type",
        ));
    }

    let mut prefix = Vec::new();
    if let Some(protocol) = &rule.protocol {
        prefix.push(format!("-p {protocol}"));
    }
    if let Some(src_net) = &rule.src_net {
        prefix.push(format!("-s {src_net}"));
    }
    if let Some(dst_net) = &rule.dst_net {
        prefix.push(format!("-d {dst_net}"));
    }
    if let Some(src_tag) = &rule.src_tag {
        prefix.push(format!(
            "-m set --match-set {} src",
            tag_set_name(src_tag, family)
        ));
    }
    if let Some(dst_tag) = &rule.dst_tag {
        prefix.push(format!(
            "-m set --match-set {} dst",
            tag_set_name(dst_tag, family)
        ));
    }

    let icmp_fragment = rule.icmp_type.map(|icmp_type| match rule.icmp_code {
        Some(code) => format!("-m icmp --icmp-type {icmp_type}/{code}"),
        None => format!("-m icmp --icmp-type {icmp_type}"),
    });

    let terminal = match rule.action {
        Some(RuleAction::Deny) => "-j DROP",
        Some(RuleAction::Allow) | None => "-j ACCEPT",
    };

    let src_chunks = dimension_chunks(&rule.src_ports);
    let dst_chunks = dimension_chunks(&rule.dst_ports);

    let mut lines = Vec::with_capacity(src_chunks.len() * dst_chunks.len());
    for src_chunk in &src_chunks {
        for dst_chunk in &dst_chunks {
            let mut fragments = prefix.clone();
            if let Some(chunk) = src_chunk {
                fragments.push(format!("-m multiport --sports {}", render_port_chunk(chunk)));
            }
            if let Some(chunk) = dst_chunk {
                fragments.push(format!("-m multiport --dports {}", render_port_chunk(chunk)));
            }
            if let Some(icmp) = &icmp_fragment {
                fragments.push(icmp.clone());
            }
            fragments.push(terminal.to_string());
            lines.push(fragments.join(" "));
        }
    }
    Ok(lines)
}

/// Compile a whole rule list into chain lines. A rule that fails to
/// compile is replaced by a commented drop fragment rather than aborting
/// the chain (§7: "a single rule failed to compile"). After the last
/// rule, append a fragment that marks the packet to signal to the
/// dispatch chain that nothing in this profile matched it.
fn compile_chain(
    rules: &[Rule],
    family: IpFamily,
    tag_set_name: &dyn Fn(&str, IpFamily) -> String,
) -> (Vec<String>, Vec<AgentError>) {
    let mut lines = Vec::new();
    let mut errors = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        match compile_rule(rule, family, tag_set_name) {
            Ok(rule_lines) => lines.extend(rule_lines),
            Err(err) => {
                lines.push(format!(
                    "-m comment --comment \"rule {index} failed to compile\" -j DROP"
                ));
                errors.push(err);
            }
        }
    }
    lines.push(NO_MATCH_MARK_FRAGMENT.to_string());
    (lines, errors)
}

/// Appended after every compiled rule chain: if a packet reaches this
/// point, nothing in the chain matched it.
const NO_MATCH_MARK_FRAGMENT: &str =
    "-m comment --comment \"Mark as not matched\" -j MARK --set-mark 1";

/// Every tag name a profile's rules reference as a `src_tag`/`dst_tag`
/// match target, across both directions.
fn referenced_tags(profile: &Profile) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for rule in profile.inbound_rules.iter().chain(profile.outbound_rules.iter()) {
        if let Some(tag) = &rule.src_tag {
            tags.insert(tag.clone());
        }
        if let Some(tag) = &rule.dst_tag {
            tags.insert(tag.clone());
        }
    }
    tags
}

/// Maintains compiled per-profile chains and the rule-reference refcount
/// on the tag index, independent of any endpoint wiring.
pub struct ProfileManager {
    prefix: String,
    tags: Arc<AsyncMutex<TagIndexManager>>,
    programmer: Arc<RuleChainProgrammer>,
    profiles: HashMap<String, Profile>,
    tag_refs: HashMap<String, BTreeSet<String>>,
}

impl ProfileManager {
    pub fn new(
        prefix: impl Into<String>,
        tags: Arc<AsyncMutex<TagIndexManager>>,
        programmer: Arc<RuleChainProgrammer>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            tags,
            programmer,
            profiles: HashMap::new(),
            tag_refs: HashMap::new(),
        }
    }

    /// Deterministic chain name for a profile's inbound or outbound
    /// chain, shared by the endpoint manager when it wires jumps to it.
    pub fn chain_name(prefix: &str, id: &str, direction: Direction) -> String {
        let natural = format!("{prefix}-p-{id}-{}", direction.suffix());
        truncate_with_hash(&natural, MAX_CHAIN_NAME_LEN)
    }

    fn tag_set_name(&self, tag: &str, family: IpFamily) -> String {
        crate::dataplane::ipset::tag_set_name(&self.prefix, tag, family)
    }

    /// Install or replace a profile's compiled chains in both families,
    /// adjusting the tag index's rule-reference refcounts for tags this
    /// profile newly references or no longer references.
    pub async fn upsert_profile(&mut self, id: impl Into<String>, profile: Profile) -> AgentResult<Vec<AgentError>> {
        let id = id.into();
        let new_refs = referenced_tags(&profile);
        let old_refs = self.tag_refs.remove(&id).unwrap_or_default();
        self.adjust_tag_refs(&old_refs, &new_refs).await?;
        self.tag_refs.insert(id.clone(), new_refs);

        let mut compile_errors = Vec::new();
        for family in [IpFamily::V4, IpFamily::V6] {
            let tag_fn = |tag: &str, fam: IpFamily| self.tag_set_name(tag, fam);
            let (inbound_lines, inbound_errors) =
                compile_chain(&profile.inbound_rules, family, &tag_fn);
            let (outbound_lines, outbound_errors) =
                compile_chain(&profile.outbound_rules, family, &tag_fn);
            compile_errors.extend(inbound_errors);
            compile_errors.extend(outbound_errors);

            let mut updates = ChainUpdates::new(family, "filter");
            updates.upsert(Self::chain_name(&self.prefix, &id, Direction::Inbound), inbound_lines);
            updates.upsert(Self::chain_name(&self.prefix, &id, Direction::Outbound), outbound_lines);
            self.programmer.commit(&updates).await?;
        }

        {
            let mut tags = self.tags.lock().await;
            tags.on_tags_update(&id, Some(profile.tags.clone()));
            tags.finish_batch().await?;
        }

        self.profiles.insert(id, profile);
        Ok(compile_errors)
    }

    /// Tear down a profile's chains and release its tag rule references.
    pub async fn remove_profile(&mut self, id: &str) -> AgentResult<()> {
        if let Some(old_refs) = self.tag_refs.remove(id) {
            self.adjust_tag_refs(&old_refs, &BTreeSet::new()).await?;
        }
        for family in [IpFamily::V4, IpFamily::V6] {
            let mut updates = ChainUpdates::new(family, "filter");
            updates.delete(Self::chain_name(&self.prefix, id, Direction::Inbound));
            updates.delete(Self::chain_name(&self.prefix, id, Direction::Outbound));
            self.programmer.commit(&updates).await?;
        }

        {
            let mut tags = self.tags.lock().await;
            tags.on_tags_update(id, None);
            tags.finish_batch().await?;
        }

        self.profiles.remove(id);
        Ok(())
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    /// Merge a new `rules` key's content into the profile's existing
    /// tags (rules and tags are independent keys in the store, §6), then
    /// recompile and recommit.
    pub async fn apply_rules(
        &mut self,
        id: impl Into<String>,
        inbound_rules: Vec<Rule>,
        outbound_rules: Vec<Rule>,
    ) -> AgentResult<Vec<AgentError>> {
        let id = id.into();
        let mut profile = self.profiles.get(&id).cloned().unwrap_or_default();
        profile.inbound_rules = inbound_rules;
        profile.outbound_rules = outbound_rules;
        self.upsert_profile(id, profile).await
    }

    /// Merge a new `tags` key's content into the profile's existing
    /// rules.
    pub async fn apply_tags(&mut self, id: impl Into<String>, tags: BTreeSet<String>) -> AgentResult<Vec<AgentError>> {
        let id = id.into();
        let mut profile = self.profiles.get(&id).cloned().unwrap_or_default();
        profile.tags = tags;
        self.upsert_profile(id, profile).await
    }

    async fn adjust_tag_refs(&self, old: &BTreeSet<String>, new: &BTreeSet<String>) -> AgentResult<()> {
        let mut tags = self.tags.lock().await;
        for tag in new.difference(old) {
            for family in [IpFamily::V4, IpFamily::V6] {
                tags.incref_rule(tag, family);
            }
        }
        for tag in old.difference(new) {
            for family in [IpFamily::V4, IpFamily::V6] {
                tags.decref_rule(tag, family);
            }
        }
        tags.finish_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_tag_name(tag: &str, family: IpFamily) -> String {
        format!("felix-{}-{tag}", family.as_str())
    }

    fn tcp_rule(src_ports: Vec<PortSpec>) -> Rule {
        Rule {
            protocol: Some("tcp".to_string()),
            src_ports,
            action: Some(RuleAction::Allow),
            ..Rule::default()
        }
    }

    #[test]
    fn port_chunks_splits_at_fifteen_entries_counting_ranges_as_two() {
        let ports = vec![
            PortSpec::Single(1),
            PortSpec::Range(2, 3),
            PortSpec::Single(4),
            PortSpec::Single(5),
            PortSpec::Single(6),
            PortSpec::Single(7),
            PortSpec::Single(8),
            PortSpec::Single(9),
            PortSpec::Single(10),
            PortSpec::Single(11),
            PortSpec::Single(12),
            PortSpec::Single(13),
            PortSpec::Single(14),
            PortSpec::Single(15),
            PortSpec::Single(16),
            PortSpec::Single(17),
        ];
        let chunks = port_chunks(&ports);
        assert_eq!(chunks.len(), 2);
        assert_eq!(render_port_chunk(&chunks[0]), "1,2:3,4,5,6,7,8,9,10,11,12,13,14,15");
        assert_eq!(render_port_chunk(&chunks[1]), "16,17");
    }

    #[test]
    fn port_chunks_isolates_zero_into_its_own_leading_chunk() {
        let ports = vec![
            PortSpec::Single(0),
            PortSpec::Single(1),
            PortSpec::Range(0, 10),
        ];
        let chunks = port_chunks(&ports);
        assert_eq!(chunks.len(), 2);
        assert_eq!(render_port_chunk(&chunks[0]), "0");
        assert_eq!(render_port_chunk(&chunks[1]), "1,1:10");
    }

    #[test]
    fn compile_rule_emits_one_line_per_port_chunk_pair() {
        let rule = tcp_rule(vec![PortSpec::Single(0), PortSpec::Single(1), PortSpec::Range(0, 10)]);
        let lines = compile_rule(&rule, IpFamily::V4, &identity_tag_name).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("--sports 0"));
        assert!(lines[1].contains("--sports 1,1:10"));
        assert!(lines[0].ends_with("-j ACCEPT"));
    }

    #[test]
    fn compile_rule_rejects_icmp_type_255() {
        let rule = Rule {
            icmp_type: Some(255),
            ..Rule::default()
        };
        let err = compile_rule(&rule, IpFamily::V4, &identity_tag_name).unwrap_err();
        assert!(matches!(err, AgentError::RuleCompilation { .. }));
    }

    #[test]
    fn compile_rule_drops_silently_on_family_mismatch() {
        let rule = Rule {
            ip_version: Some(6),
            ..Rule::default()
        };
        let lines = compile_rule(&rule, IpFamily::V4, &identity_tag_name).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn compile_chain_isolates_a_single_rule_failure_as_a_commented_drop() {
        let rules = vec![
            tcp_rule(vec![PortSpec::Single(80)]),
            Rule {
                icmp_type: Some(255),
                ..Rule::default()
            },
        ];
        let (lines, errors) = compile_chain(&rules, IpFamily::V4, &identity_tag_name);
        assert_eq!(lines.len(), 3);
        assert_eq!(errors.len(), 1);
        assert!(lines[1].contains("failed to compile"));
        assert!(lines[2].contains("Mark as not matched"));
    }

    #[test]
    fn compile_chain_appends_the_no_match_mark_fragment() {
        let rules = vec![Rule {
            src_net: Some("10.0.0.0/8".to_string()),
            action: Some(RuleAction::Allow),
            ..Rule::default()
        }];
        let (lines, errors) = compile_chain(&rules, IpFamily::V4, &identity_tag_name);
        assert!(errors.is_empty());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("-s 10.0.0.0/8"));
        assert!(lines[0].ends_with("-j ACCEPT"));
        assert_eq!(lines[1], NO_MATCH_MARK_FRAGMENT);
    }

    #[test]
    fn referenced_tags_collects_both_directions() {
        let profile = Profile {
            inbound_rules: vec![Rule {
                src_tag: Some("web".to_string()),
                ..Rule::default()
            }],
            outbound_rules: vec![Rule {
                dst_tag: Some("db".to_string()),
                ..Rule::default()
            }],
            tags: BTreeSet::new(),
        };
        let tags = referenced_tags(&profile);
        assert!(tags.contains("web"));
        assert!(tags.contains("db"));
    }

    #[test]
    fn chain_name_is_stable_for_the_same_inputs() {
        let a = ProfileManager::chain_name("felix", "profile-1", Direction::Inbound);
        let b = ProfileManager::chain_name("felix", "profile-1", Direction::Inbound);
        assert_eq!(a, b);
        assert!(a.len() <= MAX_CHAIN_NAME_LEN);
    }
}
