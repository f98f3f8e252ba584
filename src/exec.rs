//! External command execution
//!
//! Every shell-out (kubectl, velero, in-pod scripts) goes through [`Cmd`].
//! Arguments are plain strings and stdout/stderr are captured; an optional
//! timeout kills the child when it elapses.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn kubectl() -> Self {
        Self::new("kubectl")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Runs the command to completion. A non-zero exit becomes
    /// [`Error::CommandFailed`], an elapsed timeout [`Error::Timeout`].
    pub async fn run(&self) -> Result<CmdOutput> {
        debug!(command = %self, "running command");
        let fut = self.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout {
                    what: format!("command `{self}`"),
                    after: limit,
                })??,
            None => fut.await?,
        };

        let out = CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: self.to_string(),
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    async fn output(&self) -> std::io::Result<std::process::Output> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// True when `binary --version` can be spawned.
pub async fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { stderr, command, .. } => {
                assert_eq!(stderr.trim(), "broken");
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_fails_instead_of_hanging() {
        let start = Instant::now();
        let err = Cmd::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .run()
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = Cmd::kubectl().args(["exec", "-n", "ns", "--", "/bin/sh", "-c", "echo a > b"]);
        assert_eq!(
            cmd.to_string(),
            r#"kubectl exec -n ns -- /bin/sh -c "echo a > b""#
        );
    }
}
