//! Local process executor.
//!
//! Runs each step as `sh -c <command>` in its own process group, inside the
//! run's workspace, with a cleared environment. The whole group is killed
//! once the step ends, however it ends, so background children cannot
//! outlive the step.

use async_trait::async_trait;
use chrono::Utc;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use conveyor_core::executor::{
    ExecutionEnvironment, LogLine, LogStream, StepExecutor, StepSpec,
};
use conveyor_core::run::{StepOutcome, StepResult};
use conveyor_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output::OutputBuffer;

/// Lines longer than this are cut before they reach the output buffer.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const LINE_TRUNCATED: &str = "... [line truncated]";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const SHELL: &str = "/bin/sh";

/// Executes steps as local shell processes.
#[derive(Debug, Clone)]
pub struct LocalProcessExecutor {
    kill_grace: Duration,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }

    /// How long to wait for a killed process group to exit and for its
    /// output pipes to close.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn build_command(&self, spec: &StepSpec, env: &ExecutionEnvironment) -> Command {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&env.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        cmd.env(
            "PATH",
            std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into()),
        );
        cmd.env("HOME", &env.working_dir);
        for (key, value) in &env.vars {
            cmd.env(key, value);
        }
        for (key, value) in &env.secrets {
            cmd.env(key, value.expose());
        }
        cmd
    }

    /// Kill the process group and reap it, bounded by the grace period.
    async fn terminate(&self, child: &mut AsyncGroupChild, spec: &StepSpec) {
        if let Err(e) = child.start_kill() {
            debug!(step = %spec.step, error = %e, "kill failed; process group already gone");
        }
        if tokio::time::timeout(self.kill_grace, child.wait())
            .await
            .is_err()
        {
            warn!(step = %spec.step, "process group did not exit within grace period");
        }
    }
}

impl Default for LocalProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

enum ExitReason {
    Completed(ExitStatus),
    WaitError(std::io::Error),
    Timeout,
    Cancelled,
}

#[async_trait]
impl StepExecutor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, spec: &StepSpec, env: &ExecutionEnvironment) -> Result<StepResult> {
        info!(
            run_id = %spec.run_id,
            step = %spec.step,
            working_dir = %env.working_dir.display(),
            timeout_secs = spec.timeout.as_secs(),
            "executing step"
        );

        let started_at = Utc::now();
        let mut child = self
            .build_command(spec, env)
            .group_spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn step '{}': {}", spec.step, e)))?;

        let stdout = child.inner().stdout.take().ok_or_else(|| {
            Error::ExecutionFailed(format!("stdout pipe not available for step '{}'", spec.step))
        })?;
        let stderr = child.inner().stderr.take().ok_or_else(|| {
            Error::ExecutionFailed(format!("stderr pipe not available for step '{}'", spec.step))
        })?;

        let (line_tx, line_rx) = mpsc::channel(256);
        let readers = vec![
            tokio::spawn(read_lines(BufReader::new(stdout), LogStream::Stdout, line_tx.clone())),
            tokio::spawn(read_lines(BufReader::new(stderr), LogStream::Stderr, line_tx.clone())),
        ];

        let masks = env.secrets.values().map(|s| s.expose().to_string());
        let buffer = OutputBuffer::new(env.max_output_bytes, masks);
        let collector = tokio::spawn(collect(line_rx, buffer, env.log_tx.clone()));

        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => ExitReason::WaitError(e),
            },
            _ = tokio::time::sleep(spec.timeout) => ExitReason::Timeout,
            _ = env.cancel.cancelled() => ExitReason::Cancelled,
        };

        let (outcome, exit_code, notice) = match exit_reason {
            ExitReason::Completed(status) => {
                // The leader is reaped; whatever it left running in the group goes too.
                if child.start_kill().is_ok() {
                    debug!(step = %spec.step, "killed leftover processes in step group");
                }
                let code = status.code();
                if status.success() {
                    (StepOutcome::Succeeded, code, None)
                } else {
                    (StepOutcome::Failed, code, None)
                }
            }
            ExitReason::WaitError(e) => {
                warn!(step = %spec.step, error = %e, "waiting for step process failed");
                self.terminate(&mut child, spec).await;
                let notice = format!("waiting for step process failed: {}", e);
                (StepOutcome::Failed, None, Some(notice))
            }
            ExitReason::Timeout => {
                warn!(
                    run_id = %spec.run_id,
                    step = %spec.step,
                    timeout_secs = spec.timeout.as_secs(),
                    "step timed out"
                );
                self.terminate(&mut child, spec).await;
                let notice = format!("step timed out after {:?}; process group killed", spec.timeout);
                (StepOutcome::TimedOut, None, Some(notice))
            }
            ExitReason::Cancelled => {
                info!(run_id = %spec.run_id, step = %spec.step, "step cancelled");
                self.terminate(&mut child, spec).await;
                let notice = "step cancelled; process group killed".to_string();
                (StepOutcome::Cancelled, None, Some(notice))
            }
        };

        // A background process that escaped the group can hold the pipes open.
        for mut reader in readers {
            if tokio::time::timeout(self.kill_grace, &mut reader).await.is_err() {
                debug!(step = %spec.step, "output still open after step exit; detaching");
                reader.abort();
            }
        }

        if let Some(notice) = notice {
            let _ = line_tx.send((LogStream::System, notice)).await;
        }
        drop(line_tx);

        let output = collector
            .await
            .map_err(|e| Error::Internal(format!("output collector failed: {}", e)))?
            .finish();
        let finished_at = Utc::now();

        info!(
            run_id = %spec.run_id,
            step = %spec.step,
            outcome = ?outcome,
            exit_code = ?exit_code,
            "step finished"
        );

        Ok(StepResult {
            step: spec.step.clone(),
            index: spec.index,
            outcome,
            exit_code,
            output,
            started_at,
            finished_at,
        })
    }
}

/// Forward complete lines from `reader`, holding at most [`MAX_LINE_LENGTH`]
/// bytes of any one line. The rest of an over-long line is discarded up to
/// its newline.
async fn read_lines<R>(mut reader: R, stream: LogStream, tx: mpsc::Sender<(LogStream, String)>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut line = Vec::new();
    let mut overlong = false;

    loop {
        let (consumed, complete) = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => {
                let (consumed, content, complete) = match chunk.iter().position(|&b| b == b'\n') {
                    Some(pos) => (pos + 1, &chunk[..pos], true),
                    None => (chunk.len(), chunk, false),
                };
                let room = MAX_LINE_LENGTH - line.len();
                if content.len() > room {
                    overlong = true;
                }
                line.extend_from_slice(&content[..content.len().min(room)]);
                (consumed, complete)
            }
            Err(e) => {
                warn!(stream = ?stream, error = %e, "error reading step output");
                break;
            }
        };
        reader.consume(consumed);

        if complete {
            let text = take_line(&mut line, overlong);
            overlong = false;
            if tx.send((stream, text)).await.is_err() {
                return;
            }
        }
    }

    if !line.is_empty() || overlong {
        let _ = tx.send((stream, take_line(&mut line, overlong))).await;
    }
}

fn take_line(buf: &mut Vec<u8>, overlong: bool) -> String {
    while buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let mut line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    if overlong {
        line.push_str(LINE_TRUNCATED);
    }
    line
}

async fn collect(
    mut rx: mpsc::Receiver<(LogStream, String)>,
    mut buffer: OutputBuffer,
    log_tx: Option<mpsc::Sender<LogLine>>,
) -> OutputBuffer {
    while let Some((stream, line)) = rx.recv().await {
        let line = buffer.mask(&line);
        if let Some(tx) = &log_tx {
            // Streaming is best-effort; the captured output is authoritative.
            let _ = tx.try_send(LogLine::new(stream, line.clone()));
        }
        buffer.push_line(&line);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::RunId;
    use conveyor_core::secret::SecretValue;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn spec(command: &str) -> StepSpec {
        StepSpec {
            run_id: RunId::new(),
            step: "test".to_string(),
            index: 0,
            command: command.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    fn executor() -> LocalProcessExecutor {
        LocalProcessExecutor::new().with_kill_grace(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_successful_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path());

        let result = executor()
            .execute(&spec("echo hello && echo world"), &env)
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output.text, "hello\nworld\n");
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path());

        let result = executor()
            .execute(&spec("echo building; exit 3"), &env)
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.text.contains("building"));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path());

        let result = executor()
            .execute(&spec("echo oops >&2"), &env)
            .await
            .unwrap();
        assert_eq!(result.output.text, "oops\n");
    }

    #[tokio::test]
    async fn test_runs_in_working_dir_with_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path()).with_var("GREETING", "hi");

        let result = executor()
            .execute(&spec("echo \"$GREETING\" > out.txt && test \"$HOME\" = \"$(pwd)\""), &env)
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hi\n"
        );
    }

    #[tokio::test]
    async fn test_secrets_are_injected_and_masked() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path())
            .with_secret("DEPLOY_TOKEN", SecretValue::new("tok-123456"));

        let result = executor()
            .execute(
                &spec("test \"$DEPLOY_TOKEN\" = tok-123456 && echo \"token is $DEPLOY_TOKEN\""),
                &env,
            )
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert_eq!(result.output.text, "token is ***\n");
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path()).with_max_output_bytes(64);

        let result = executor()
            .execute(&spec("i=0; while [ $i -lt 1000 ]; do echo line $i; i=$((i+1)); done"), &env)
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert!(result.output.is_truncated());
        assert!(result.output.text.contains("output truncated"));
        assert!(result.output.text.len() < 200);
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path());
        let mut spec = spec("echo started; sleep 30 & sleep 30");
        spec.timeout = Duration::from_millis(300);

        let start = Instant::now();
        let result = executor().execute(&spec, &env).await.unwrap();

        assert_eq!(result.outcome, StepOutcome::TimedOut);
        assert_eq!(result.exit_code, None);
        assert!(result.output.text.contains("started"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let env = ExecutionEnvironment::new(dir.path()).with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = executor().execute(&spec("sleep 30"), &env).await.unwrap();

        assert_eq!(result.outcome, StepOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_streams_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let env = ExecutionEnvironment::new(dir.path()).with_log_channel(tx);

        executor()
            .execute(&spec("echo one; echo two >&2"), &env)
            .await
            .unwrap();
        drop(env);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push((line.stream, line.content));
        }
        assert!(lines.contains(&(LogStream::Stdout, "one".to_string())));
        assert!(lines.contains(&(LogStream::Stderr, "two".to_string())));
    }

    #[tokio::test]
    async fn test_unterminated_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path()).with_max_output_bytes(64);

        let result = executor()
            .execute(&spec("head -c 20000000 /dev/zero | tr '\\0' a"), &env)
            .await
            .unwrap();

        assert_eq!(result.outcome, StepOutcome::Succeeded);
        assert!(result.output.is_truncated());
        assert!(result.output.text.len() < 200);
        assert!(result.output.truncated_bytes <= (MAX_LINE_LENGTH + LINE_TRUNCATED.len()) as u64);
    }

    #[tokio::test]
    async fn test_overlong_line_is_cut_and_rest_discarded() {
        let mut input = vec![b'x'; 4 * MAX_LINE_LENGTH];
        input.extend_from_slice(b"\r\nnext line\npartial");
        let reader = BufReader::with_capacity(4096, std::io::Cursor::new(input));

        let (tx, mut rx) = mpsc::channel(8);
        read_lines(reader, LogStream::Stdout, tx).await;

        let (_, first) = rx.recv().await.unwrap();
        assert_eq!(first.len(), MAX_LINE_LENGTH + LINE_TRUNCATED.len());
        assert!(first.ends_with(LINE_TRUNCATED));
        assert_eq!(rx.recv().await.unwrap().1, "next line");
        assert_eq!(rx.recv().await.unwrap().1, "partial");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_background_processes_do_not_outlive_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = ExecutionEnvironment::new(dir.path());

        let result = executor()
            .execute(&spec("sleep 120 >/dev/null 2>&1 & echo $! > bg.pid"), &env)
            .await
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::Succeeded);

        let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            // Gone, or a zombie waiting for its new parent to reap it.
            let alive = match std::fs::read_to_string(&stat) {
                Ok(content) => !content.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            assert!(Instant::now() < deadline, "background process {} still running", pid.trim());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_timeout_notice_is_streamed_as_system_line() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let env = ExecutionEnvironment::new(dir.path()).with_log_channel(tx);
        let mut spec = spec("sleep 30");
        spec.timeout = Duration::from_millis(200);

        let result = executor().execute(&spec, &env).await.unwrap();
        drop(env);

        assert_eq!(result.outcome, StepOutcome::TimedOut);
        assert!(result.output.text.contains("timed out"));
        let mut system = Vec::new();
        while let Some(line) = rx.recv().await {
            if line.stream == LogStream::System {
                system.push(line.content);
            }
        }
        assert_eq!(system.len(), 1);
        assert!(system[0].contains("process group killed"));
    }

    #[tokio::test]
    async fn test_missing_working_dir_fails_to_spawn() {
        let env = ExecutionEnvironment::new("/nonexistent/conveyor/workspace");
        let err = executor().execute(&spec("true"), &env).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }
}
