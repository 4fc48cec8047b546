//! Shell command runner.

use async_trait::async_trait;
use relay_core::job::JobContext;
use relay_core::runner::{PipelineOutcome, PipelineRunner};
use relay_core::{Error, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `EX_TEMPFAIL` from sysexits.h.
pub const EX_TEMPFAIL: i32 = 75;

/// Runs a pipeline's `run` command through a shell.
///
/// Exit status 0 is success, exit codes in the transient set are retryable
/// failures and anything else is fatal. The child is killed when the run is
/// cancelled.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    transient_exit_codes: BTreeSet<i32>,
    working_dir: Option<PathBuf>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            transient_exit_codes: BTreeSet::from([EX_TEMPFAIL]),
            working_dir: None,
        }
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Replace the set of exit codes treated as transient failures.
    pub fn with_transient_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.transient_exit_codes = codes.into_iter().collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn(&self, job: &JobContext, command: &str) -> Result<Child> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .envs(&job.spec.env)
            .env("RELAY_RUN_ID", job.run_id.to_string())
            .env("RELAY_PIPELINE", &job.pipeline)
            .env("RELAY_ATTEMPT", job.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| {
            Error::ExecutionFailed(format!("failed to spawn '{}': {}", self.shell, e))
        })
    }

    /// Map an exit status to an outcome.
    pub fn classify(&self, status: ExitStatus) -> PipelineOutcome {
        if status.success() {
            return PipelineOutcome::Success;
        }
        match status.code() {
            Some(code) if self.transient_exit_codes.contains(&code) => {
                PipelineOutcome::TransientFailure(format!("command exited with status {code}"))
            }
            Some(code) => PipelineOutcome::FatalFailure(format!("command exited with status {code}")),
            None => PipelineOutcome::FatalFailure("command terminated by signal".to_string()),
        }
    }

    async fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
        tokio::select! {
            status = child.wait() => status.map_err(|e| Error::ExecutionFailed(e.to_string())),
            _ = cancel.cancelled() => {
                debug!("killing command");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill command");
                }
                Err(Error::Cancelled)
            }
        }
    }
}

fn forward_output<R>(stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(stream, "{}", line);
        }
    });
}

#[async_trait]
impl PipelineRunner for ShellRunner {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn run(&self, job: &JobContext, cancel: CancellationToken) -> PipelineOutcome {
        let Some(command) = job.spec.command.as_deref() else {
            return PipelineOutcome::FatalFailure(format!(
                "pipeline '{}' has no run command",
                job.pipeline
            ));
        };

        let mut child = match self.spawn(job, command) {
            Ok(child) => child,
            Err(e) => return PipelineOutcome::FatalFailure(e.to_string()),
        };
        if let Some(stdout) = child.stdout.take() {
            forward_output("stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output("stderr", stderr);
        }

        match self.wait(&mut child, &cancel).await {
            Ok(status) => self.classify(status),
            Err(e) => PipelineOutcome::FatalFailure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::job::TriggerKind;
    use relay_core::pipeline::PipelineConfig;
    use std::time::Duration;

    fn job(command: &str) -> JobContext {
        let mut config = PipelineConfig::new("demo", 1);
        config.command = Some(command.to_string());
        config.env.insert("TARGET".into(), "warehouse".into());
        JobContext::new(&config, None, TriggerKind::Manual, Utc::now())
    }

    #[tokio::test]
    async fn test_exit_codes_are_classified() {
        let runner = ShellRunner::new();
        let token = CancellationToken::new();

        assert_eq!(runner.run(&job("exit 0"), token.clone()).await, PipelineOutcome::Success);
        assert!(matches!(
            runner.run(&job("exit 75"), token.clone()).await,
            PipelineOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            runner.run(&job("exit 3"), token.clone()).await,
            PipelineOutcome::FatalFailure(_)
        ));

        let custom = ShellRunner::new().with_transient_exit_codes([3]);
        assert!(matches!(
            custom.run(&job("exit 3"), token).await,
            PipelineOutcome::TransientFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let runner = ShellRunner::new();
        let script = r#"test "$RELAY_PIPELINE" = demo && test "$RELAY_ATTEMPT" = 1 && test -n "$RELAY_RUN_ID" && test "$TARGET" = warehouse"#;
        assert_eq!(
            runner.run(&job(script), CancellationToken::new()).await,
            PipelineOutcome::Success
        );
    }

    #[tokio::test]
    async fn test_cancel_kills_command() {
        let runner = ShellRunner::new();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), runner.run(&job("sleep 30"), token))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::FatalFailure(_)));
    }

    #[tokio::test]
    async fn test_missing_command_and_bad_shell_are_fatal() {
        let mut no_command = job("true");
        no_command.spec.command = None;
        assert!(matches!(
            ShellRunner::new().run(&no_command, CancellationToken::new()).await,
            PipelineOutcome::FatalFailure(_)
        ));

        let runner = ShellRunner::new().with_shell("/nonexistent/shell");
        assert!(matches!(
            runner.run(&job("true"), CancellationToken::new()).await,
            PipelineOutcome::FatalFailure(_)
        ));
    }
}
