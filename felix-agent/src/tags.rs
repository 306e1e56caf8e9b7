//! Tag index and address-set manager (§4.5).
//!
//! Owns the profile -> declared-tags map (`tags_by_profile`), the
//! endpoint -> (profiles, addresses) map (`endpoints_by_id`) and its
//! inverse (`endpoints_by_profile`), and the reverse index from tag to
//! the IPs that currently carry it per contributing profile (`owners`).
//! Message handlers (`on_tags_update`, `on_endpoint_update`) only ever
//! mutate this in-memory state and mark affected tags dirty;
//! `finish_batch` is the single place a kernel address set is actually
//! rewritten, so many handler calls between two `finish_batch`s coalesce
//! into at most one `replace_members` per tag (§4.1's batching
//! contract, applied here without a dedicated actor task since this
//! manager is driven synchronously from the endpoint/profile managers
//! rather than through its own mailbox).
//!
//! Because `endpoints_by_profile` is populated from `on_endpoint_update`
//! independently of whether `tags_by_profile` has an entry for that
//! profile yet, an endpoint that references a profile which hasn't
//! arrived from the store is never silently dropped: once the profile's
//! tags do arrive, `on_tags_update` walks `endpoints_by_profile[p]` and
//! picks up every endpoint already bound to it, in either arrival order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::dataplane::exec::CommandRunner;
use crate::dataplane::ipset::{tag_set_name, AddressSetProgrammer};
use crate::error::{AgentError, AgentResult};
use crate::model::{EndpointId, IpFamily};

/// The slice of an endpoint's record this manager needs: which profiles
/// it carries and which addresses it contributes per family. Deliberately
/// narrower than [`crate::model::Endpoint`] so this module stays free of
/// endpoint lifecycle concerns (readiness, interface state) that belong
/// to the endpoint manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointTagInput {
    pub profile_ids: Vec<String>,
    pub ipv4_nets: BTreeSet<String>,
    pub ipv6_nets: BTreeSet<String>,
}

impl EndpointTagInput {
    fn nets(&self, family: IpFamily) -> &BTreeSet<String> {
        match family {
            IpFamily::V4 => &self.ipv4_nets,
            IpFamily::V6 => &self.ipv6_nets,
        }
    }
}

/// `owners[tag][family][ip][profile] -> set of endpoints` currently
/// contributing that ip to the tag under that family, via that profile.
/// The profile dimension exists so the same ip contributed through two
/// different profiles that both reference the tag is tracked
/// independently, and so the tag's membership can be recomputed for one
/// profile without disturbing another's contribution.
type Owners = HashMap<String, HashMap<IpFamily, BTreeMap<String, BTreeMap<String, BTreeSet<EndpointId>>>>>;

/// Tracks the tag index and lazily creates/destroys the backing kernel
/// address sets as membership and rule references come and go.
pub struct TagIndexManager {
    prefix: String,
    runner: Arc<dyn CommandRunner>,
    tags_by_profile: HashMap<String, BTreeSet<String>>,
    endpoints_by_id: HashMap<EndpointId, EndpointTagInput>,
    endpoints_by_profile: HashMap<String, BTreeSet<EndpointId>>,
    owners: Owners,
    rule_refs: HashMap<String, usize>,
    dirty_tags: HashSet<(String, IpFamily)>,
    sets: HashMap<(String, IpFamily), AddressSetProgrammer>,
}

impl TagIndexManager {
    pub fn new(prefix: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            prefix: prefix.into(),
            runner,
            tags_by_profile: HashMap::new(),
            endpoints_by_id: HashMap::new(),
            endpoints_by_profile: HashMap::new(),
            owners: HashMap::new(),
            rule_refs: HashMap::new(),
            dirty_tags: HashSet::new(),
            sets: HashMap::new(),
        }
    }

    /// Deterministic kernel set name for a tag, so profile rule
    /// compilation (§4.6) can reference a tag's set by name without a
    /// round trip through this manager.
    pub fn set_name_for(&self, tag: &str, family: IpFamily) -> String {
        tag_set_name(&self.prefix, tag, family)
    }

    /// A profile's declared tag set changed, or the profile was removed
    /// (`tags = None`). Recomputes membership for every endpoint
    /// currently bound to this profile, whether or not the profile's
    /// tags were known before this call.
    pub fn on_tags_update(&mut self, profile_id: &str, tags: Option<BTreeSet<String>>) {
        let new_tags = tags.unwrap_or_default();
        let old_tags = self.tags_by_profile.remove(profile_id).unwrap_or_default();
        let removed: Vec<String> = old_tags.difference(&new_tags).cloned().collect();
        let added: Vec<String> = new_tags.difference(&old_tags).cloned().collect();

        if !new_tags.is_empty() {
            self.tags_by_profile.insert(profile_id.to_string(), new_tags);
        }

        let members = self
            .endpoints_by_profile
            .get(profile_id)
            .cloned()
            .unwrap_or_default();
        for ep_id in &members {
            let Some(ep) = self.endpoints_by_id.get(ep_id).cloned() else {
                continue;
            };
            for tag in &removed {
                for family in [IpFamily::V4, IpFamily::V6] {
                    for ip in ep.nets(family).clone() {
                        self.remove_owner(tag, family, &ip, profile_id, ep_id);
                    }
                }
            }
            for tag in &added {
                for family in [IpFamily::V4, IpFamily::V6] {
                    for ip in ep.nets(family).clone() {
                        self.add_owner(tag, family, &ip, profile_id, ep_id.clone());
                    }
                }
            }
        }
    }

    /// An endpoint's profile membership and/or addresses changed, or the
    /// endpoint was removed (`endpoint = None`). Decomposed into
    /// removed-profile, added-profile and kept-profile-address-delta
    /// cases, each of which only touches the tags that profile declares.
    pub fn on_endpoint_update(&mut self, id: EndpointId, endpoint: Option<EndpointTagInput>) {
        let old = self.endpoints_by_id.remove(&id);
        let old_profiles: Vec<String> = old.as_ref().map(|e| e.profile_ids.clone()).unwrap_or_default();
        let new_profiles: Vec<String> = endpoint.as_ref().map(|e| e.profile_ids.clone()).unwrap_or_default();

        for profile_id in &old_profiles {
            if !new_profiles.contains(profile_id) {
                if let Some(set) = self.endpoints_by_profile.get_mut(profile_id) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.endpoints_by_profile.remove(profile_id);
                    }
                }
            }
        }
        for profile_id in &new_profiles {
            self.endpoints_by_profile
                .entry(profile_id.clone())
                .or_default()
                .insert(id.clone());
        }

        let removed_profiles: Vec<&String> = old_profiles.iter().filter(|p| !new_profiles.contains(p)).collect();
        let added_profiles: Vec<&String> = new_profiles.iter().filter(|p| !old_profiles.contains(p)).collect();
        let kept_profiles: Vec<&String> = new_profiles.iter().filter(|p| old_profiles.contains(p)).collect();

        if let Some(old_ep) = &old {
            for profile_id in &removed_profiles {
                let Some(tags) = self.tags_by_profile.get(profile_id.as_str()).cloned() else {
                    continue;
                };
                for tag in &tags {
                    for family in [IpFamily::V4, IpFamily::V6] {
                        for ip in old_ep.nets(family).clone() {
                            self.remove_owner(tag, family, &ip, profile_id, &id);
                        }
                    }
                }
            }
        }

        if let Some(new_ep) = &endpoint {
            for profile_id in &added_profiles {
                let Some(tags) = self.tags_by_profile.get(profile_id.as_str()).cloned() else {
                    continue;
                };
                for tag in &tags {
                    for family in [IpFamily::V4, IpFamily::V6] {
                        for ip in new_ep.nets(family).clone() {
                            self.add_owner(tag, family, &ip, profile_id, id.clone());
                        }
                    }
                }
            }
        }

        for profile_id in &kept_profiles {
            let Some(tags) = self.tags_by_profile.get(profile_id.as_str()).cloned() else {
                continue;
            };
            for tag in &tags {
                for family in [IpFamily::V4, IpFamily::V6] {
                    let empty = BTreeSet::new();
                    let old_ips = old.as_ref().map(|e| e.nets(family)).unwrap_or(&empty).clone();
                    let new_ips = endpoint.as_ref().map(|e| e.nets(family)).unwrap_or(&empty).clone();
                    for ip in old_ips.difference(&new_ips) {
                        self.remove_owner(tag, family, ip, profile_id, &id);
                    }
                    for ip in new_ips.difference(&old_ips) {
                        self.add_owner(tag, family, ip, profile_id, id.clone());
                    }
                }
            }
        }

        if let Some(endpoint) = endpoint {
            self.endpoints_by_id.insert(id, endpoint);
        }
    }

    /// Drive both handlers for a full snapshot read (startup or resync):
    /// every given entry is applied, then every previously-known key
    /// absent from the snapshot is applied as a null update so it tears
    /// down cleanly.
    pub fn apply_snapshot(
        &mut self,
        tags_by_profile: BTreeMap<String, BTreeSet<String>>,
        endpoints: BTreeMap<EndpointId, EndpointTagInput>,
    ) {
        let previously_known_profiles: Vec<String> = self.tags_by_profile.keys().cloned().collect();
        for (profile_id, tags) in &tags_by_profile {
            self.on_tags_update(profile_id, Some(tags.clone()));
        }
        for profile_id in previously_known_profiles {
            if !tags_by_profile.contains_key(&profile_id) {
                self.on_tags_update(&profile_id, None);
            }
        }

        let previously_known_endpoints: Vec<EndpointId> = self.endpoints_by_id.keys().cloned().collect();
        for (id, endpoint) in endpoints.iter() {
            self.on_endpoint_update(id.clone(), Some(endpoint.clone()));
        }
        for id in previously_known_endpoints {
            if !endpoints.contains_key(&id) {
                self.on_endpoint_update(id, None);
            }
        }
    }

    /// A profile's rules now reference `tag` as a match target; ensures
    /// the set exists even with zero members so the chain compiles.
    /// Marks the tag dirty rather than syncing immediately — the caller
    /// commits once via [`Self::finish_batch`] after every reference
    /// change in the same update has been applied.
    pub fn incref_rule(&mut self, tag: &str, family: IpFamily) {
        *self.rule_refs.entry(tag.to_string()).or_insert(0) += 1;
        self.dirty_tags.insert((tag.to_string(), family));
    }

    /// A profile no longer references `tag`; the set is torn down once
    /// both this and membership refcounts are zero.
    pub fn decref_rule(&mut self, tag: &str, family: IpFamily) {
        if let Some(count) = self.rule_refs.get_mut(tag) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.rule_refs.remove(tag);
            }
        }
        self.dirty_tags.insert((tag.to_string(), family));
    }

    fn add_owner(&mut self, tag: &str, family: IpFamily, ip: &str, profile_id: &str, endpoint: EndpointId) {
        self.owners
            .entry(tag.to_string())
            .or_default()
            .entry(family)
            .or_default()
            .entry(ip.to_string())
            .or_default()
            .entry(profile_id.to_string())
            .or_default()
            .insert(endpoint);
        self.dirty_tags.insert((tag.to_string(), family));
    }

    fn remove_owner(&mut self, tag: &str, family: IpFamily, ip: &str, profile_id: &str, endpoint: &EndpointId) {
        if let Some(by_family) = self.owners.get_mut(tag) {
            if let Some(by_ip) = by_family.get_mut(&family) {
                if let Some(by_profile) = by_ip.get_mut(ip) {
                    if let Some(endpoints) = by_profile.get_mut(profile_id) {
                        endpoints.remove(endpoint);
                        if endpoints.is_empty() {
                            by_profile.remove(profile_id);
                        }
                    }
                    if by_profile.is_empty() {
                        by_ip.remove(ip);
                    }
                }
                if by_ip.is_empty() {
                    by_family.remove(&family);
                }
            }
            if by_family.is_empty() {
                self.owners.remove(tag);
            }
        }
        self.dirty_tags.insert((tag.to_string(), family));
    }

    fn has_any_reference(&self, tag: &str, family: IpFamily) -> bool {
        let has_members = self
            .owners
            .get(tag)
            .and_then(|by_family| by_family.get(&family))
            .map(|by_ip| !by_ip.is_empty())
            .unwrap_or(false);
        let has_rule_ref = self.rule_refs.get(tag).copied().unwrap_or(0) > 0;
        has_members || has_rule_ref
    }

    fn members_of(&self, tag: &str, family: IpFamily) -> BTreeSet<String> {
        self.owners
            .get(tag)
            .and_then(|by_family| by_family.get(&family))
            .map(|by_ip| by_ip.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Commit every tag marked dirty since the last call: create or tear
    /// down its kernel set and, if it still has any reference, rewrite
    /// its membership. A tag is only dropped from the dirty set once its
    /// own sync succeeds, so a failure partway through a batch leaves the
    /// remaining dirty tags for the next call to retry, instead of
    /// silently losing them.
    pub async fn finish_batch(&mut self) -> AgentResult<()> {
        let pending: Vec<(String, IpFamily)> = self.dirty_tags.iter().cloned().collect();
        for (tag, family) in pending {
            self.sync_tag(&tag, family).await?;
            self.dirty_tags.remove(&(tag.clone(), family));
        }
        Ok(())
    }

    /// Reconcile one `(tag, family)` pair's kernel set against current
    /// owners and rule references: create-and-populate if referenced,
    /// tear down if not.
    async fn sync_tag(&mut self, tag: &str, family: IpFamily) -> AgentResult<()> {
        let key = (tag.to_string(), family);
        if self.has_any_reference(tag, family) {
            let members = self.members_of(tag, family);
            let set_name = self.set_name_for(tag, family);
            let programmer = self
                .sets
                .entry(key)
                .or_insert_with(|| AddressSetProgrammer::new(set_name, family, self.runner.clone()));
            programmer.ensure_exists().await?;
            programmer.replace_members(&members).await?;
        } else if let Some(programmer) = self.sets.remove(&key) {
            programmer.delete().await?;
        }
        Ok(())
    }

    /// Enumerate kernel address sets carrying this agent's prefix and
    /// destroy whichever ones are not currently backing a live tag set
    /// (§6, the ipset-side mirror of the rule-chain programmer's startup
    /// chain sweep): a set left behind by a prior process lifetime that
    /// this run never re-references is never picked up by
    /// [`Self::finish_batch`], since that only visits tags marked dirty.
    pub async fn cleanup(&mut self) -> AgentResult<()> {
        let output = self
            .runner
            .run("ipset", &["list".to_string(), "-name".to_string()], None)
            .await?;
        if !output.success() {
            return Err(AgentError::dataplane_commit(
                "ipset",
                "n/a",
                format!("exit {}: {}", output.status, output.stderr),
            ));
        }

        let wanted: HashSet<&str> = self.sets.values().map(|p| p.set_name()).collect();
        for name in output.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
            if name.starts_with(&self.prefix) && !wanted.contains(name) {
                let _ = self
                    .runner
                    .run("ipset", &["destroy".to_string(), name.to_string(), "-exist".to_string()], None)
                    .await;
            }
        }
        Ok(())
    }
}
