//! Bounded subprocess execution with captured streams.

use async_trait::async_trait;
use std::{io, path::Path, path::PathBuf, process::Stdio, time::Duration};
use tokio::{
    io::AsyncReadExt,
    io::AsyncWriteExt,
    process::{ChildStderr, ChildStdout, Command},
    time,
};
use tracing::{debug, warn};

/// What to feed the child's stdin.
#[derive(Clone, Debug, Default)]
pub enum CommandInput {
    #[default]
    None,

    Bytes(Vec<u8>),

    /// Streamed from disk, so only the invoking user needs read access to
    /// the source file.
    File(PathBuf),
}

/// Captured streams of a finished (or killed) subprocess, line endings
/// normalized to `\n`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("command timed out after {timeout:?}")]
    TimedOut { timeout: Duration, output: CmdOutput },

    #[error("command exited with code {code}: {detail}")]
    Failed { code: i32, detail: String, output: CmdOutput },

    #[error("failed to run command: {0}")]
    Io(#[from] io::Error),
}

impl CmdError {
    /// Streams captured up to the failure point, when any were.
    pub fn output(&self) -> Option<&CmdOutput> {
        match self {
            Self::TimedOut { output, .. } | Self::Failed { output, .. } => Some(output),
            Self::Io(_) => None,
        }
    }

    fn with_output(self, output: CmdOutput) -> Self {
        match self {
            Self::TimedOut { timeout, .. } => Self::TimedOut { timeout, output },
            Self::Failed { code, detail, .. } => Self::Failed { code, detail, output },
            other => other,
        }
    }
}

/// The single seam between drivers and the host: every tool invocation a
/// driver performs goes through this trait so the whole driver can dry-run
/// against a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `path` with `args` to completion, feeding `input` to stdin and
    /// enforcing `timeout`. A timeout kills the child and still returns the
    /// partial streams inside the error.
    async fn run(
        &self,
        timeout: Duration,
        input: CommandInput,
        path: &Path,
        args: &[String],
    ) -> Result<CmdOutput, CmdError>;

    /// Launches a long-lived process and detaches from it. Returns an error
    /// when the process terminates within the probe window, which catches
    /// entry scripts that die right away.
    async fn start(&self, probe: Duration, path: &Path, args: &[String]) -> Result<(), CmdError>;
}

/// Runs a command up to `1 + retries` times, sleeping `attempt * 1s` between
/// attempts. Per-attempt streams are accumulated into the returned output,
/// delimited by `--- attempt N ---` markers.
pub async fn run_retry(
    runner: &dyn CommandRunner,
    retries: u32,
    timeout: Duration,
    input: CommandInput,
    path: &Path,
    args: &[String],
) -> Result<CmdOutput, CmdError> {
    let mut combined = CmdOutput::default();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let marker = format!("--- attempt {attempt} ---\n");
        combined.stdout.push_str(&marker);
        combined.stderr.push_str(&marker);
        match runner.run(timeout, input.clone(), path, args).await {
            Ok(output) => {
                combined.stdout.push_str(&output.stdout);
                combined.stderr.push_str(&output.stderr);
                return Ok(combined);
            }
            Err(e) => {
                if let Some(output) = e.output() {
                    combined.stdout.push_str(&output.stdout);
                    combined.stderr.push_str(&output.stderr);
                }
                if attempt > retries {
                    return Err(e.with_output(combined));
                }
                warn!("Command {} failed on attempt {attempt}, retrying: {e}", path.display());
                time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }
}

/// The production runner on top of `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        timeout: Duration,
        input: CommandInput,
        path: &Path,
        args: &[String],
    ) -> Result<CmdOutput, CmdError> {
        debug!("Running {} {args:?} with timeout {timeout:?}", path.display());
        let stdin = match input {
            CommandInput::None => Stdio::null(),
            _ => Stdio::piped(),
        };
        let mut child = Command::new(path)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            match input {
                CommandInput::Bytes(bytes) => {
                    tokio::spawn(async move {
                        if let Err(e) = stdin.write_all(&bytes).await {
                            debug!("Failed to write child stdin: {e}");
                        }
                    });
                }
                CommandInput::File(source) => {
                    tokio::spawn(async move {
                        match tokio::fs::File::open(&source).await {
                            Ok(mut file) => {
                                if let Err(e) = tokio::io::copy(&mut file, &mut stdin).await {
                                    debug!("Failed to stream {} to child stdin: {e}", source.display());
                                }
                            }
                            Err(e) => warn!("Failed to open stdin source {}: {e}", source.display()),
                        }
                    });
                }
                CommandInput::None => {}
            }
        }

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain_err(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = time::sleep(timeout) => {
                warn!("Command {} did not finish within {timeout:?}, killing it", path.display());
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        let output = CmdOutput {
            stdout: normalize(stdout_task.await.unwrap_or_default()),
            stderr: normalize(stderr_task.await.unwrap_or_default()),
        };
        match status {
            None => Err(CmdError::TimedOut { timeout, output }),
            Some(status) if status.success() => Ok(output),
            Some(status) => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim()
                } else {
                    output.stderr.trim()
                }
                .to_string();
                Err(CmdError::Failed { code: status.code().unwrap_or(-1), detail, output })
            }
        }
    }

    async fn start(&self, probe: Duration, path: &Path, args: &[String]) -> Result<(), CmdError> {
        debug!("Starting {} {args:?}", path.display());
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;
        let stderr_task = drain_err(child.stderr.take());

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let stderr = normalize(stderr_task.await.unwrap_or_default());
                let detail = stderr.trim().to_string();
                Err(CmdError::Failed {
                    code: status.code().unwrap_or(-1),
                    detail,
                    output: CmdOutput { stdout: String::new(), stderr },
                })
            }
            _ = time::sleep(probe) => Ok(()),
        }
    }
}

fn drain(pipe: Option<ChildStdout>) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn drain_err(pipe: Option<ChildStderr>) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

fn normalize(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn run_captures_both_streams() {
        let output = TokioCommandRunner
            .run(Duration::from_secs(5), CommandInput::None, &sh(), &args("echo out; echo err >&2"))
            .await
            .expect("run failed");
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_normalizes_line_endings() {
        let output = TokioCommandRunner
            .run(Duration::from_secs(5), CommandInput::None, &sh(), &args(r"printf 'a\r\nb\r\n'"))
            .await
            .expect("run failed");
        assert_eq!(output.stdout, "a\nb\n");
    }

    #[tokio::test]
    async fn run_feeds_stdin_bytes() {
        let output = TokioCommandRunner
            .run(Duration::from_secs(5), CommandInput::Bytes(b"ping\n".to_vec()), &sh(), &args("cat"))
            .await
            .expect("run failed");
        assert_eq!(output.stdout, "ping\n");
    }

    #[tokio::test]
    async fn run_embeds_stderr_in_failure() {
        let err = TokioCommandRunner
            .run(Duration::from_secs(5), CommandInput::None, &sh(), &args("echo broken >&2; exit 3"))
            .await
            .expect_err("run succeeded");
        match err {
            CmdError::Failed { code, detail, .. } => {
                assert_eq!(code, 3);
                assert_eq!(detail, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_falls_back_to_stdout_detail() {
        let err = TokioCommandRunner
            .run(Duration::from_secs(5), CommandInput::None, &sh(), &args("echo only-stdout; exit 1"))
            .await
            .expect_err("run succeeded");
        match err {
            CmdError::Failed { detail, .. } => assert_eq!(detail, "only-stdout"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_times_out_and_keeps_partial_output() {
        let err = TokioCommandRunner
            .run(Duration::from_millis(300), CommandInput::None, &sh(), &args("echo early; sleep 5"))
            .await
            .expect_err("run succeeded");
        match err {
            CmdError::TimedOut { output, .. } => assert_eq!(output.stdout, "early\n"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_accepts_long_lived_process() {
        TokioCommandRunner
            .start(Duration::from_millis(200), &sh(), &args("sleep 2"))
            .await
            .expect("start failed");
    }

    #[tokio::test]
    async fn start_rejects_immediate_exit() {
        let err = TokioCommandRunner
            .start(Duration::from_secs(1), &sh(), &args("echo dead >&2; exit 7"))
            .await
            .expect_err("start succeeded");
        match err {
            CmdError::Failed { code, detail, .. } => {
                assert_eq!(code, 7);
                assert_eq!(detail, "dead");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_retry_accumulates_attempt_markers() {
        let mut runner = MockCommandRunner::new();
        let mut calls = 0u32;
        runner.expect_run().times(2).returning(move |_, _, _, _| {
            calls += 1;
            if calls == 1 {
                Err(CmdError::Failed {
                    code: 1,
                    detail: "first".into(),
                    output: CmdOutput { stdout: "one\n".into(), stderr: String::new() },
                })
            } else {
                Ok(CmdOutput { stdout: "two\n".into(), stderr: String::new() })
            }
        });

        let output = run_retry(
            &runner,
            2,
            Duration::from_secs(1),
            CommandInput::None,
            Path::new("/usr/bin/true"),
            &[],
        )
        .await
        .expect("retry failed");
        assert_eq!(output.stdout, "--- attempt 1 ---\none\n--- attempt 2 ---\ntwo\n");
        assert_eq!(output.stderr, "--- attempt 1 ---\n--- attempt 2 ---\n");
    }

    #[tokio::test]
    async fn run_retry_returns_last_error_with_combined_output() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(2).returning(|_, _, _, _| {
            Err(CmdError::Failed {
                code: 1,
                detail: "nope".into(),
                output: CmdOutput { stdout: "x\n".into(), stderr: String::new() },
            })
        });

        let err = run_retry(
            &runner,
            1,
            Duration::from_secs(1),
            CommandInput::None,
            Path::new("/usr/bin/true"),
            &[],
        )
        .await
        .expect_err("retry succeeded");
        let output = err.output().expect("no output attached");
        assert_eq!(output.stdout, "--- attempt 1 ---\nx\n--- attempt 2 ---\nx\n");
    }
}
