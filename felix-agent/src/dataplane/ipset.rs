//! Address-set programmer (§4.3): atomic rewrite of one kernel IP set.
//!
//! Grounded on [`super::exec::ProcessCommandRunner`] for the actual commit
//! and on the temp-set-swap contract: ensure both names exist, flush the
//! temp set, populate it with the new members, atomically swap temp and
//! live, destroy temp. All of it goes to the tool as a single `ipset
//! restore` script, so the swap is atomic with respect to any concurrent
//! reader (I5/P7).

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AgentError, AgentResult};
use crate::model::IpFamily;

use super::exec::CommandRunner;

const MAX_IPSET_NAME_LEN: usize = 31;

/// Derive a kernel-legal ipset name for a tag, truncated-and-hashed to the
/// kernel's name-length limit the same way profile chain names are
/// (§4.6): `felix-{family}-{tag}`, truncated with a hash suffix if the
/// natural name would overflow.
pub fn tag_set_name(prefix: &str, tag: &str, family: IpFamily) -> String {
    let natural = format!("{prefix}-{}-{tag}", family.as_str());
    truncate_with_hash(&natural, MAX_IPSET_NAME_LEN)
}

pub(crate) fn truncate_with_hash(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let hash = short_hash(name);
    let suffix = format!("-{hash}");
    let keep = max_len.saturating_sub(suffix.len());
    format!("{}{}", &name[..keep.min(name.len())], suffix)
}

fn short_hash(input: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Wraps one named kernel IP set plus its parallel "temp" set name for one
/// IP family. v4 and v6 are independent instances (§4.3).
pub struct AddressSetProgrammer {
    family: IpFamily,
    set_name: String,
    temp_name: String,
    runner: Arc<dyn CommandRunner>,
    last_members: Mutex<Option<BTreeSet<String>>>,
}

impl AddressSetProgrammer {
    pub fn new(set_name: impl Into<String>, family: IpFamily, runner: Arc<dyn CommandRunner>) -> Self {
        let set_name = set_name.into();
        let temp_name = truncate_with_hash(&format!("{set_name}-tmp"), MAX_IPSET_NAME_LEN);
        Self {
            family,
            set_name,
            temp_name,
            runner,
            last_members: Mutex::new(None),
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    fn hash_family(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "inet",
            IpFamily::V6 => "inet6",
        }
    }

    /// Idempotent create of both the live and temp sets.
    pub async fn ensure_exists(&self) -> AgentResult<()> {
        let script = format!(
            "create {live} hash:ip family {fam} -exist\ncreate {temp} hash:ip family {fam} -exist\nCOMMIT\n",
            live = self.set_name,
            temp = self.temp_name,
            fam = self.hash_family(),
        );
        self.commit(&script).await
    }

    /// Replace the live set's members with exactly `members`. A no-op if
    /// the set already holds exactly this membership (P4 idempotence).
    pub async fn replace_members(&self, members: &BTreeSet<String>) -> AgentResult<()> {
        {
            let last = self.last_members.lock();
            if last.as_ref() == Some(members) {
                return Ok(());
            }
        }

        let mut script = format!(
            "create {live} hash:ip family {fam} -exist\ncreate {temp} hash:ip family {fam} -exist\nflush {temp}\n",
            live = self.set_name,
            temp = self.temp_name,
            fam = self.hash_family(),
        );
        for member in members {
            script.push_str(&format!("add {} {}\n", self.temp_name, member));
        }
        script.push_str(&format!("swap {} {}\n", self.set_name, self.temp_name));
        script.push_str(&format!("destroy {}\n", self.temp_name));
        script.push_str("COMMIT\n");

        self.commit(&script).await?;
        *self.last_members.lock() = Some(members.clone());
        Ok(())
    }

    /// Best-effort destroy of both the live and temp set names.
    pub async fn delete(&self) -> AgentResult<()> {
        let script = format!(
            "destroy {live} -exist\ndestroy {temp} -exist\nCOMMIT\n",
            live = self.set_name,
            temp = self.temp_name,
        );
        *self.last_members.lock() = None;
        // Best-effort: swallow failures (set may already be gone).
        let _ = self.commit(&script).await;
        Ok(())
    }

    async fn commit(&self, script: &str) -> AgentResult<()> {
        let output = self
            .runner
            .run("ipset", &["restore".to_string()], Some(script))
            .await?;
        if !output.success() {
            return Err(AgentError::dataplane_commit(
                "ipset",
                self.family.as_str(),
                format!("exit {}: {}", output.status, output.stderr),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        scripts: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            _program: &str,
            _args: &[String],
            stdin: Option<&str>,
        ) -> AgentResult<super::super::exec::CommandOutput> {
            self.scripts.lock().unwrap().push(stdin.unwrap_or_default().to_string());
            Ok(super::super::exec::CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                status: 0,
            })
        }
    }

    #[tokio::test]
    async fn replace_members_emits_create_flush_swap_destroy() {
        let runner = Arc::new(RecordingRunner {
            scripts: StdMutex::new(Vec::new()),
        });
        let programmer = AddressSetProgrammer::new("felix-v4-t1", IpFamily::V4, runner.clone());

        let mut members = BTreeSet::new();
        members.insert("10.1.1.1".to_string());
        programmer.replace_members(&members).await.unwrap();

        let scripts = runner.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        let script = &scripts[0];
        assert!(script.contains("flush felix-v4-t1-tmp"));
        assert!(script.contains("add felix-v4-t1-tmp 10.1.1.1"));
        assert!(script.contains("swap felix-v4-t1 felix-v4-t1-tmp"));
        assert!(script.contains("destroy felix-v4-t1-tmp"));
    }

    #[tokio::test]
    async fn replace_members_is_idempotent() {
        let runner = Arc::new(RecordingRunner {
            scripts: StdMutex::new(Vec::new()),
        });
        let programmer = AddressSetProgrammer::new("felix-v4-t1", IpFamily::V4, runner.clone());

        let mut members = BTreeSet::new();
        members.insert("10.1.1.1".to_string());
        programmer.replace_members(&members).await.unwrap();
        programmer.replace_members(&members).await.unwrap();

        assert_eq!(runner.scripts.lock().unwrap().len(), 1);
    }

    #[test]
    fn tag_set_name_truncates_long_tags_with_a_hash_suffix() {
        let long_tag = "a".repeat(60);
        let name = tag_set_name("felix", &long_tag, IpFamily::V4);
        assert!(name.len() <= MAX_IPSET_NAME_LEN);
    }
}
