//! Host process execution through `tokio::process`.

use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Spawns real processes on the host
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> BackendResult<CommandOutput> {
        debug!(program, ?args, "running");
        let spawn_error = |e: std::io::Error| BackendError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await.map_err(spawn_error)?;
            // Closing stdin signals EOF to tools that read manifests from `-`
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(program, exit_code = result.exit_code, "finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = TokioCommandRunner::new();
        let out = runner
            .run("sh", &["-c".into(), "echo hi; echo err >&2; exit 3".into()], None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
        assert!(out.into_stdout().is_err());
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let runner = TokioCommandRunner::new();
        let out = runner
            .run("cat", &[], Some(b"manifest".to_vec()))
            .await
            .unwrap();
        assert_eq!(out.stdout, "manifest");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = TokioCommandRunner::new();
        let err = runner
            .run("definitely-not-a-real-binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }
}
