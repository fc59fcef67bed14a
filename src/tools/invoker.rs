//! External process execution with output capture and a hard timeout.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ToolError, ToolResult};
use crate::config::Secret;

/// Keep error messages readable when a tool dumps a stack trace.
const MAX_ERROR_OUTPUT: usize = 4096;

/// A single tool run: program, arguments, secret environment and optional stdin.
pub struct Invocation<'a> {
    program: &'a Path,
    args: Vec<OsString>,
    env: Vec<(&'static str, &'a Secret)>,
    stdin: Option<&'a [u8]>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a Path) -> Self {
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Pass a secret through the environment so it never shows up in `ps`.
    #[must_use]
    pub fn secret_env(mut self, key: &'static str, value: &'a Secret) -> Self {
        self.env.push((key, value));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    fn tool_name(&self) -> String {
        self.program.file_name().map_or_else(
            || self.program.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        )
    }
}

/// Runs external tools, mapping failures to [`ToolError`].
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the invocation to completion and return its combined output.
    ///
    /// A non-zero exit yields [`ToolError::Failed`]; exceeding the timeout kills
    /// the child and yields [`ToolError::TimedOut`].
    pub async fn invoke(&self, invocation: Invocation<'_>) -> ToolResult<String> {
        let tool = invocation.tool_name();
        tracing::debug!(tool = %tool, args = ?invocation.args, "Running external tool");

        let mut cmd = Command::new(invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            cmd.env(key, value.expose());
        }

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        // Feeding stdin runs alongside the wait, both under the timeout, so a
        // child that never reads its input cannot stall the call.
        let stdin_pipe = child.stdin.take();
        let feed = async {
            if let (Some(input), Some(mut pipe)) = (invocation.stdin, stdin_pipe) {
                // A tool that exits without reading stdin closes the pipe; its
                // exit status decides the outcome.
                if let Err(e) = pipe.write_all(input).await {
                    tracing::debug!(tool = %tool, error = %e, "Tool closed stdin early");
                }
            }
        };
        let run = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // Dropping the run future on timeout drops the child, which kills it.
        let result = timeout(self.timeout, run).await;
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ToolError::Spawn { tool, source }),
            Err(_) => {
                tracing::warn!(tool = %tool, timeout_ms = self.timeout.as_millis(), "Tool timed out");
                return Err(ToolError::TimedOut {
                    tool,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.trim().is_empty() {
            stdout.into_owned()
        } else {
            format!("{stdout}{stderr}")
        };

        if output.status.success() {
            Ok(combined)
        } else {
            let code = output.status.code();
            tracing::error!(tool = %tool, exit_code = ?code, "Tool exited with failure");
            Err(ToolError::Failed {
                tool,
                code,
                output: tail(&combined, MAX_ERROR_OUTPUT),
            })
        }
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    #[tokio::test]
    async fn test_invoke_captures_stdout() {
        let invoker = ToolInvoker::new(Duration::from_secs(5));
        let out = invoker
            .invoke(Invocation::new(sh()).args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_invoke_feeds_stdin() {
        let invoker = ToolInvoker::new(Duration::from_secs(5));
        let out = invoker
            .invoke(Invocation::new(sh()).args(["-c", "cat"]).stdin(b"piped"))
            .await
            .unwrap();
        assert_eq!(out, "piped");
    }

    #[tokio::test]
    async fn test_invoke_passes_secret_env() {
        let invoker = ToolInvoker::new(Duration::from_secs(5));
        let secret = Secret::new("s3cret");
        let out = invoker
            .invoke(
                Invocation::new(sh())
                    .args(["-c", "printf %s \"$TOOL_SECRET\""])
                    .secret_env("TOOL_SECRET", &secret),
            )
            .await
            .unwrap();
        assert_eq!(out, "s3cret");
    }

    #[tokio::test]
    async fn test_invoke_non_zero_exit() {
        let invoker = ToolInvoker::new(Duration::from_secs(5));
        let err = invoker
            .invoke(Invocation::new(sh()).args(["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();

        match err {
            ToolError::Failed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let invoker = ToolInvoker::new(Duration::from_millis(100));
        let err = invoker
            .invoke(Invocation::new(sh()).args(["-c", "sleep 5"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(err.is_execution_error());
    }

    #[tokio::test]
    async fn test_invoke_timeout_with_unread_stdin() {
        let invoker = ToolInvoker::new(Duration::from_millis(200));
        let input = vec![b'x'; 4 * 1024 * 1024];
        let started = std::time::Instant::now();
        let err = invoker
            .invoke(Invocation::new(sh()).args(["-c", "sleep 5"]).stdin(&input))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invoke_large_stdin_round_trip() {
        let invoker = ToolInvoker::new(Duration::from_secs(10));
        let input = vec![b'y'; 1024 * 1024];
        let out = invoker
            .invoke(Invocation::new(sh()).args(["-c", "cat"]).stdin(&input))
            .await
            .unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[tokio::test]
    async fn test_invoke_missing_program() {
        let invoker = ToolInvoker::new(Duration::from_secs(1));
        let err = invoker
            .invoke(Invocation::new(Path::new("/nonexistent/tool")))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_tail_truncates_on_char_boundary() {
        let text = "ééééé";
        let cut = tail(text, 3);
        assert!(cut.starts_with("..."));
        assert!(text.ends_with(cut.trim_start_matches("...")));
        assert_eq!(tail("short", 10), "short");
    }
}
