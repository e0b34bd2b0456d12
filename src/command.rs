use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::errors::*;

/// One bounded invocation of an external program.
///
/// Every path out of `exec` is bounded: normal exit, timeout expiry, or
/// caller cancellation followed by a reap window of the same duration.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub current_dir: Option<String>,
}

enum ExitReason {
    Exited(std::process::ExitStatus),
    Timeout,
    Cancelled,
}

impl CommandRunner {
    pub fn new<S: Into<String>>(command: S, args: Vec<String>, timeout: Duration) -> Self {
        CommandRunner {
            command: command.into(),
            args,
            timeout,
            current_dir: None,
        }
    }

    pub fn in_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Rendered command line, for logging only.
    pub fn rendered(&self) -> String {
        format!("{} {}", self.command, self.args.join(" "))
    }

    pub async fn exec(&self) -> Result<(String, String)> {
        self.exec_with_cancel(None).await
    }

    /// Runs the process to completion or kills it.
    ///
    /// On timeout the process is killed and a timeout error is returned. On
    /// cancellation the process is killed, then its exit is awaited for at
    /// most another timeout window before giving up, so a cancelled call
    /// never leaks a running child.
    pub async fn exec_with_cancel(
        &self,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<(String, String)> {
        let cmd_str = self.rendered();
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .chain_err(|| format!("failed to start command {}", cmd_str))?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| Error::from("stdout pipe not available"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::from("stderr pipe not available"))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let reason = match cancel {
            Some(mut rx) => tokio::select! {
                status = child.wait() => ExitReason::Exited(status?),
                _ = tokio::time::sleep(self.timeout) => ExitReason::Timeout,
                _ = &mut rx => ExitReason::Cancelled,
            },
            None => tokio::select! {
                status = child.wait() => ExitReason::Exited(status?),
                _ = tokio::time::sleep(self.timeout) => ExitReason::Timeout,
            },
        };

        match reason {
            ExitReason::Exited(status) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                if !status.success() {
                    error!(
                        "exec command {} failed, stdout: {}, stderr: {}",
                        cmd_str, stdout, stderr
                    );
                    return Err(ErrorKind::CommandFailed(stdout, stderr).into());
                }
                // these two queries flood the log
                if !cmd_str.contains("list-targets") && !cmd_str.contains("list-chains") {
                    info!("output of {}: {}", cmd_str, stdout);
                }
                Ok((stdout, String::new()))
            }
            ExitReason::Timeout => {
                if let Err(e) = child.kill().await {
                    error!("failed to kill command: {}", e);
                    return Err(e.into());
                }
                error!("exec command {} timed out after {:?}", cmd_str, self.timeout);
                Err(ErrorKind::CommandTimeout(self.timeout).into())
            }
            ExitReason::Cancelled => self.reap_cancelled(&mut child, &cmd_str, start).await,
        }
    }

    // Kill on cancellation, then bound the wait for the exit to be observed.
    async fn reap_cancelled(
        &self,
        child: &mut Child,
        cmd_str: &str,
        start: Instant,
    ) -> Result<(String, String)> {
        if let Err(e) = child.start_kill() {
            error!("failed to kill command: {}", e);
            return Err(e.into());
        }
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(_) => {
                warn!(
                    "process was killed after {:?}: {}",
                    start.elapsed(),
                    cmd_str
                );
                Err(ErrorKind::Cancelled.into())
            }
            Err(_) => {
                warn!("wait for command to exit timeout: {:?}", self.timeout);
                Err(ErrorKind::CommandTimeout(self.timeout).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_captures_stdout() {
        let runner = CommandRunner::new(
            "echo",
            vec!["hello".to_string()],
            Duration::from_secs(5),
        );
        let (stdout, stderr) = runner.exec().await.unwrap();
        assert!(stdout.contains("hello"));
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_times_out_and_kills() {
        let runner = CommandRunner::new(
            "sleep",
            vec!["5".to_string()],
            Duration::from_millis(100),
        );
        let start = Instant::now();
        let err = runner.exec().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CommandTimeout(_)));
        // bounded well below the sleep duration
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exec_cancelled_returns_within_a_timeout_window() {
        let runner = CommandRunner::new(
            "sleep",
            vec!["5".to_string()],
            Duration::from_secs(1),
        );
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(());
        });
        let start = Instant::now();
        let err = runner.exec_with_cancel(Some(rx)).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exec_nonzero_exit_carries_output() {
        let runner = CommandRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo out; echo err >&2; exit 3".to_string(),
            ],
            Duration::from_secs(5),
        );
        let err = runner.exec().await.unwrap_err();
        match err.kind() {
            ErrorKind::CommandFailed(stdout, stderr) => {
                assert!(stdout.contains("out"));
                assert!(stderr.contains("err"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn exec_missing_binary_fails_to_start() {
        let runner = CommandRunner::new(
            "/nonexistent-binary-for-tests",
            vec![],
            Duration::from_secs(1),
        );
        assert!(runner.exec().await.is_err());
    }

    #[test]
    fn rendered_joins_args() {
        let runner = CommandRunner::new(
            "/admin_cli",
            vec!["--".to_string(), "list-nodes".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(runner.rendered(), "/admin_cli -- list-nodes");
    }
}
