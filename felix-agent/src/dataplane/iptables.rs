//! Rule-chain programmer (§4.4): atomic multi-chain commit via the
//! `iptables-restore`/`ip6tables-restore` dialect.
//!
//! One commit can create, flush and repopulate several chains and delete
//! others, all in a single script so the kernel applies the whole update
//! or none of it. Grounded on the same [`super::exec::CommandRunner`]
//! plumbing as [`super::ipset::AddressSetProgrammer`]; the two dataplane
//! programmers share the subprocess path but never the atomic unit (one
//! ipset swap, one iptables-restore script).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::error::{AgentError, AgentResult};
use crate::model::IpFamily;

use super::exec::CommandRunner;

/// One chain's desired final content: fully rendered rule fragments in
/// the order they should appear, most-specific first (§4.6).
#[derive(Debug, Clone)]
pub struct ChainUpdate {
    pub name: String,
    pub rules: Vec<String>,
}

/// A single atomic dataplane update: chains to create-or-replace, and
/// chains to tear down, all for one table and IP family.
#[derive(Debug, Clone)]
pub struct ChainUpdates {
    pub family: IpFamily,
    pub table: String,
    pub upserts: Vec<ChainUpdate>,
    pub deletes: Vec<String>,
    /// Chains declared empty-if-missing but never flushed or populated:
    /// a chain referenced by a jump target in this same commit that has
    /// no content of its own yet (§4.4 — guaranteed to exist).
    pub stubs: Vec<String>,
}

impl ChainUpdates {
    pub fn new(family: IpFamily, table: impl Into<String>) -> Self {
        Self {
            family,
            table: table.into(),
            upserts: Vec::new(),
            deletes: Vec::new(),
            stubs: Vec::new(),
        }
    }

    pub fn upsert(&mut self, name: impl Into<String>, rules: Vec<String>) {
        self.upserts.push(ChainUpdate {
            name: name.into(),
            rules,
        });
    }

    pub fn delete(&mut self, name: impl Into<String>) {
        self.deletes.push(name.into());
    }

    pub fn stub(&mut self, name: impl Into<String>) {
        self.stubs.push(name.into());
    }
}

/// Tracks which chains a given chain's rules jump to, so a caller can ask
/// whether a chain is still referenced before asking for its deletion
/// (deleting a chain that's still a jump target leaves a dangling
/// reference the kernel will refuse).
#[derive(Debug, Clone, Default)]
pub struct ChainDependencies {
    /// chain -> set of chains it jumps to.
    deps: HashMap<String, HashSet<String>>,
}

impl ChainDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deps(&mut self, chain: impl Into<String>, targets: impl IntoIterator<Item = String>) {
        self.deps.insert(chain.into(), targets.into_iter().collect());
    }

    pub fn remove_chain(&mut self, chain: &str) {
        self.deps.remove(chain);
    }

    /// Whether any other tracked chain still jumps to `chain`.
    pub fn is_referenced(&self, chain: &str) -> bool {
        self.deps
            .iter()
            .any(|(owner, targets)| owner != chain && targets.contains(chain))
    }

    /// Every chain named as a jump target by any tracked chain, used to
    /// decide which ones need a stub declaration if they have no content
    /// of their own in this commit (§4.4).
    pub fn all_targets(&self) -> HashSet<String> {
        self.deps.values().flat_map(|targets| targets.iter().cloned()).collect()
    }
}

/// A single built-in-chain rule this agent must be the first jump in,
/// e.g. routing `INPUT` traffic into the felix dispatch chain.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub family: IpFamily,
    pub table: String,
    pub chain: String,
    pub rule: String,
}

/// Commits chain updates through `iptables-restore --noflush` (v4) or
/// `ip6tables-restore --noflush` (v6), leaving every chain this agent
/// doesn't mention untouched.
pub struct RuleChainProgrammer {
    runner: Arc<dyn CommandRunner>,
}

impl RuleChainProgrammer {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn restore_binary(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables-restore",
            IpFamily::V6 => "ip6tables-restore",
        }
    }

    fn direct_binary(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn render(updates: &ChainUpdates) -> String {
        let mut script = format!("*{}\n", updates.table);
        for chain in &updates.upserts {
            script.push_str(&format!(":{} - [0:0]\n", chain.name));
        }
        for name in &updates.stubs {
            script.push_str(&format!(":{name} - [0:0]\n"));
        }
        for chain in &updates.upserts {
            script.push_str(&format!("-F {}\n", chain.name));
            for rule in &chain.rules {
                script.push_str(&format!("-A {} {}\n", chain.name, rule));
            }
        }
        for name in &updates.deletes {
            script.push_str(&format!("-F {name}\n"));
            script.push_str(&format!("-X {name}\n"));
        }
        script.push_str("COMMIT\n");
        script
    }

    async fn commit_once(&self, updates: &ChainUpdates) -> AgentResult<()> {
        let script = Self::render(updates);
        let binary = Self::restore_binary(updates.family);
        let output = self
            .runner
            .run(binary, &["--noflush".to_string()], Some(&script))
            .await?;
        if !output.success() {
            return Err(AgentError::dataplane_commit(
                binary,
                updates.family.as_str(),
                format!("exit {}: {}", output.status, output.stderr),
            ));
        }
        Ok(())
    }

    /// Render and commit one atomic script. Chains named in `upserts` are
    /// flushed (or created) and repopulated; chains named in `deletes`
    /// are flushed then destroyed. Order within the script always places
    /// upserts before deletes so a rename (delete old name, upsert new
    /// name referencing it) never races a dangling jump. On failure, the
    /// commit is retried exactly once before the error is surfaced to the
    /// caller, since a transient lock contention with another process
    /// holding the kernel's iptables lock is the most common cause.
    pub async fn commit(&self, updates: &ChainUpdates) -> AgentResult<()> {
        match self.commit_once(updates).await {
            Ok(()) => Ok(()),
            Err(_) => self.commit_once(updates).await,
        }
    }

    /// Like [`Self::commit`], but every chain `deps` names as a jump
    /// target and that isn't itself among `updates.upserts` is added as
    /// a stub declaration, so a chain goto'd into by this commit but not
    /// yet programmed is guaranteed to exist rather than left dangling
    /// (§4.4).
    pub async fn commit_with_deps(&self, updates: &ChainUpdates, deps: &ChainDependencies) -> AgentResult<()> {
        let declared: HashSet<&str> = updates.upserts.iter().map(|c| c.name.as_str()).collect();
        let mut updates = updates.clone();
        for target in deps.all_targets() {
            if !declared.contains(target.as_str()) {
                updates.stub(target);
            }
        }
        self.commit(&updates).await
    }

    /// Delete a leaf chain. Fails without touching the dataplane if
    /// `deps` still shows another chain jumping to it.
    pub async fn delete_chain(
        &self,
        family: IpFamily,
        table: impl Into<String>,
        name: impl Into<String>,
        deps: &ChainDependencies,
    ) -> AgentResult<()> {
        let name = name.into();
        if deps.is_referenced(&name) {
            return Err(AgentError::dataplane_commit(
                Self::restore_binary(family),
                family.as_str(),
                format!("chain {name} is still referenced and cannot be deleted"),
            ));
        }
        let mut updates = ChainUpdates::new(family, table);
        updates.delete(name);
        self.commit(&updates).await
    }

    /// Idempotently insert `spec.rule` at position 1 of `spec.chain`,
    /// deduping against an identical rule already present. Built-in
    /// chains like `INPUT`/`FORWARD` are never flushed by this agent, so
    /// the restore-script dialect can't be used here: a plain `-C` check
    /// followed by `-I ... 1` on miss is the only way to insert into a
    /// chain this agent doesn't own without disturbing unrelated rules.
    pub async fn ensure_rule_inserted(&self, spec: &RuleSpec) -> AgentResult<()> {
        let binary = Self::direct_binary(spec.family);
        let rule_args: Vec<String> = spec.rule.split_whitespace().map(String::from).collect();

        let mut check_args = vec!["-t".to_string(), spec.table.clone(), "-C".to_string(), spec.chain.clone()];
        check_args.extend(rule_args.clone());
        let check = self.runner.run(binary, &check_args, None).await?;
        if check.success() {
            return Ok(());
        }

        let mut insert_args = vec![
            "-t".to_string(),
            spec.table.clone(),
            "-I".to_string(),
            spec.chain.clone(),
            "1".to_string(),
        ];
        insert_args.extend(rule_args);
        let insert = self.runner.run(binary, &insert_args, None).await?;
        if !insert.success() {
            return Err(AgentError::dataplane_commit(
                binary,
                spec.family.as_str(),
                format!("exit {}: {}", insert.status, insert.stderr),
            ));
        }
        Ok(())
    }

    /// The inverse of [`Self::ensure_rule_inserted`]: a `-C` check
    /// followed by `-D` on hit, so removing a rule that was already
    /// absent (e.g. a retried teardown) is a no-op rather than an error.
    pub async fn ensure_rule_removed(&self, spec: &RuleSpec) -> AgentResult<()> {
        let binary = Self::direct_binary(spec.family);
        let rule_args: Vec<String> = spec.rule.split_whitespace().map(String::from).collect();

        let mut check_args = vec!["-t".to_string(), spec.table.clone(), "-C".to_string(), spec.chain.clone()];
        check_args.extend(rule_args.clone());
        let check = self.runner.run(binary, &check_args, None).await?;
        if !check.success() {
            return Ok(());
        }

        let mut delete_args = vec!["-t".to_string(), spec.table.clone(), "-D".to_string(), spec.chain.clone()];
        delete_args.extend(rule_args);
        let delete = self.runner.run(binary, &delete_args, None).await?;
        if !delete.success() {
            return Err(AgentError::dataplane_commit(
                binary,
                spec.family.as_str(),
                format!("exit {}: {}", delete.status, delete.stderr),
            ));
        }
        Ok(())
    }

    /// Parse `iptables-save`/`ip6tables-save`-style output: `*table`
    /// headers and `:chain` declaration lines. Rule bodies are not
    /// parsed, only chain membership per table, which is all the startup
    /// reconciliation needs to learn which felix-prefixed chains already
    /// exist in the kernel.
    pub fn parse_save_output(output: &str) -> HashMap<String, HashSet<String>> {
        let mut tables: HashMap<String, HashSet<String>> = HashMap::new();
        let mut current_table: Option<String> = None;
        for line in output.lines() {
            let line = line.trim();
            if let Some(table) = line.strip_prefix('*') {
                current_table = Some(table.to_string());
                tables.entry(table.to_string()).or_default();
            } else if let Some(rest) = line.strip_prefix(':') {
                if let Some(table) = &current_table {
                    if let Some(name) = rest.split_whitespace().next() {
                        tables.entry(table.clone()).or_default().insert(name.to_string());
                    }
                }
            }
        }
        tables
    }

    /// Every felix-prefixed chain name the kernel currently has in
    /// `table` that this agent's in-memory model no longer wants to
    /// keep — candidates for deletion on the next batch.
    pub fn stale_felix_chains<'a>(
        kernel_chains: &'a HashSet<String>,
        felix_prefix: &str,
        wanted: &HashSet<String>,
    ) -> Vec<&'a str> {
        kernel_chains
            .iter()
            .filter(|name| name.starts_with(felix_prefix) && !wanted.contains(*name))
            .map(|name| name.as_str())
            .collect()
    }

    /// Startup reconciliation (§4.4, §6): run the save-style tool for
    /// `family`, learn which felix-prefixed chains already exist in
    /// `table`, and delete whichever of them `wanted` no longer asks
    /// for. Best-effort per chain — one stuck chain is logged and
    /// skipped rather than aborting the rest of the sweep.
    pub async fn sweep_stale_chains(
        &self,
        family: IpFamily,
        table: &str,
        felix_prefix: &str,
        wanted: &HashSet<String>,
    ) -> AgentResult<Vec<String>> {
        let binary = match family {
            IpFamily::V4 => "iptables-save",
            IpFamily::V6 => "ip6tables-save",
        };
        let output = self.runner.run(binary, &[], None).await?;
        if !output.success() {
            return Err(AgentError::dataplane_commit(
                binary,
                family.as_str(),
                format!("exit {}: {}", output.status, output.stderr),
            ));
        }

        let tables = Self::parse_save_output(&output.stdout);
        let kernel_chains = tables.get(table).cloned().unwrap_or_default();
        let stale: Vec<String> = Self::stale_felix_chains(&kernel_chains, felix_prefix, wanted)
            .into_iter()
            .map(str::to_string)
            .collect();

        let deps = ChainDependencies::new();
        for name in &stale {
            if let Err(err) = self.delete_chain(family, table, name.clone(), &deps).await {
                warn!(chain = %name, family = %family.as_str(), error = %err, "failed to sweep stale chain at startup");
            }
        }
        Ok(stale)
    }
}
