// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::pipe::{drain_lines, Stream};
use crate::Error;

/// A single external program invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
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

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Captured result of a successful invocation, every line ends in `\n`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a program to completion, capturing both output streams.
///
/// A non-zero exit is reported as [`ErrorKind::CommandFailed`].
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, Error>;
}

/// Runs commands as real child processes
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, Error> {
        debug!(
            "running: {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );

        // dropping the future (shutdown) must not leave the child behind
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (stdout, stderr, status) = tokio::join!(
            capture(child.stdout.take(), Stream::Stdout),
            capture(child.stderr.take(), Stream::Stderr),
            child.wait(),
        );
        let status = status?;

        if !status.success() {
            return Err(ErrorKind::CommandFailed {
                exit_code: status.code(),
                stderr,
            }
            .into());
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Logs every line as the child prints it, and keeps the whole stream for the caller.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, stream: Stream) -> String {
    let mut captured = String::new();

    if let Some(reader) = reader {
        drain_lines(reader, |line| {
            info!(target: "hogrc::command", "{}: {}", stream.display(), line);
            captured.push_str(line);
            captured.push('\n');
        })
        .await;
    }

    captured
}

/// Fixed attempts with a fixed pause in between
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// One attempt, no retry
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_secs(0),
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// With a single attempt the original error is returned as is, otherwise the last error is
    /// wrapped in [`ErrorKind::RetriesExhausted`].
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(t) => return Ok(t),
                Err(e) if attempts == 1 => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(ErrorKind::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    }
                    .into())
                }
                Err(e) => {
                    warn!("attempt {}/{} failed, retrying: {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh", std::env::temp_dir()).args(vec!["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = SystemRunner.run(&sh("echo migrated")).await.expect("run");

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "migrated\n");
    }

    #[tokio::test]
    async fn exports_invocation_env() {
        let mut env = BTreeMap::new();
        env.insert("SITE_URL".to_string(), "http://localhost:8000".to_string());

        let output = SystemRunner
            .run(&sh("echo \"$SITE_URL\"").envs(&env))
            .await
            .expect("run");

        assert_eq!(output.stdout, "http://localhost:8000\n");
    }

    #[tokio::test]
    async fn captures_every_line_around_invalid_utf8() {
        let output = SystemRunner
            .run(&sh(
                "echo first; printf '\\377\\n'; \
                 i=1; while [ $i -le 500 ]; do echo $i; i=$((i+1)); done",
            ))
            .await
            .expect("run");

        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines.len(), 502);
        assert_eq!(lines[0], "first");
        assert_eq!(lines[1], "\u{fffd}");
        assert_eq!(lines[501], "500");
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let err = SystemRunner
            .run(&sh("echo 'no such table' >&2; exit 3"))
            .await
            .expect_err("should fail");

        match err.kind() {
            ErrorKind::CommandFailed { exit_code, stderr } => {
                assert_eq!(*exit_code, Some(3));
                assert_eq!(stderr, "no such table\n");
            }
            kind => panic!("unexpected error: {:?}", kind),
        }
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let invocation = Invocation::new("/nonexistent/python3", std::env::temp_dir());
        let err = SystemRunner.run(&invocation).await.expect_err("should fail");

        assert!(matches!(err.kind(), ErrorKind::IoError(_)));
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };

        let value = policy
            .retry(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::from("database is locked"))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("retry");

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_is_distinct() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };

        let err = policy
            .retry(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::from("database is locked"))
            })
            .await
            .expect_err("should fail");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            err.kind(),
            ErrorKind::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn single_attempt_returns_the_original_error() {
        let err = RetryPolicy::once()
            .retry(|| async { Err::<(), _>(Error::from("boom")) })
            .await
            .expect_err("should fail");

        assert!(matches!(err.kind(), ErrorKind::ErrorStr("boom")));
    }
}
