//! Subprocess invocation wrapper: the single path every dataplane commit
//! (ipset restore, iptables-restore, save-output reads) uses to talk to an
//! external tool. Every dataplane tool here is invoked in its "restore"
//! dialect, so the runner needs to pipe a script to stdin and collect
//! stdout rather than merely spawn-and-forget.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{AgentError, AgentResult};

/// Captured result of running an external tool to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs an external program, optionally feeding it a script on stdin and
/// collecting its stdout/stderr, without blocking the async reactor.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> AgentResult<CommandOutput>;
}

/// Concrete runner backed by `tokio::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> AgentResult<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            AgentError::dataplane_commit(program, "n/a", format!("spawn failed: {e}"))
        })?;

        if let Some(script) = stdin {
            let mut stdin_handle = child
                .stdin
                .take()
                .ok_or_else(|| AgentError::dataplane_commit(program, "n/a", "no stdin handle"))?;
            stdin_handle
                .write_all(script.as_bytes())
                .await
                .map_err(|e| {
                    AgentError::dataplane_commit(program, "n/a", format!("stdin write failed: {e}"))
                })?;
            drop(stdin_handle);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            AgentError::dataplane_commit(program, "n/a", format!("wait failed: {e}"))
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_program_and_captures_stdout() {
        let runner = ProcessCommandRunner::new();
        let output = runner
            .run("echo", &["hello".to_string()], None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn feeds_stdin_script_to_child() {
        let runner = ProcessCommandRunner::new();
        let output = runner.run("cat", &[], Some("line one\n")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "line one\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_without_erroring() {
        let runner = ProcessCommandRunner::new();
        let output = runner
            .run("sh", &["-c".to_string(), "exit 3".to_string()], None)
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.status, 3);
    }
}
