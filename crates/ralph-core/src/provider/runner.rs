//! Streaming subprocess runner for provider CLIs.
//!
//! Spawns the provider with color disabled and stdin closed, parses each
//! stdout line as a stream event, tracks tool-use counts and the last
//! text chunk, warns when the process goes silent, and enforces a hard
//! wall-clock timeout. The runner never retries; rate-limit handling
//! belongs to the caller.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;

use super::{ProviderConfig, ProviderKind, StreamEvent};

/// Knobs for one provider invocation.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Silence threshold before a stall warning is emitted.
    pub stall_warning: Duration,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            stall_warning: Duration::from_secs(60),
            env: Vec::new(),
        }
    }
}

/// What came back from a provider invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Exit code 0 and no provider-reported error.
    pub success: bool,
    /// Accumulated text output (all text chunks plus raw non-JSON lines).
    pub output: String,
    pub error: Option<String>,
    /// Wall-clock seconds.
    pub duration: f64,
    /// The last text chunk: the model's final message.
    pub summary: String,
    /// Tool name -> invocation count.
    pub tools_used: HashMap<String, u32>,
}

/// Run a provider CLI to completion.
pub async fn run_provider(
    config: &ProviderConfig,
    prompt: &str,
    working_dir: &Path,
    options: &RunnerOptions,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let args = config.kind.build_args(prompt, &config.model, config.mode);

    let mut cmd = Command::new(config.binary_path());
    cmd.args(&args)
        .current_dir(working_dir)
        .env("FORCE_COLOR", "0")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "failed to spawn {} binary '{}'",
            config.kind.display_name(),
            config.binary_path()
        )
    })?;

    let stdout = child.stdout.take().context("child has no stdout pipe")?;
    let mut stderr_pipe = child.stderr.take();

    // Drain stderr concurrently so the child never blocks on a full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    let deadline = started + options.timeout;
    let mut events = event_stream(config.kind, stdout);
    let mut outcome = RunOutcome::default();
    let mut output_lines: Vec<String> = Vec::new();
    let mut provider_error: Option<String> = None;
    let mut last_output = Instant::now();
    let mut stall_warned = false;
    let mut timed_out = false;

    loop {
        let stall_deadline = last_output + options.stall_warning;
        tokio::select! {
            event = events.next() => match event {
                Some(RunnerEvent::Parsed(event)) => {
                    last_output = Instant::now();
                    stall_warned = false;
                    match event {
                        StreamEvent::Text { content } => {
                            tracing::debug!(provider = %config.kind, "text chunk ({} chars)", content.len());
                            outcome.summary = content.clone();
                            output_lines.push(content);
                        }
                        StreamEvent::ToolUse { tool } => {
                            tracing::debug!(provider = %config.kind, tool = %tool, "tool use");
                            *outcome.tools_used.entry(tool).or_default() += 1;
                        }
                        StreamEvent::Error { message } => {
                            tracing::warn!(provider = %config.kind, error = %message, "provider error event");
                            output_lines.push(message.clone());
                            provider_error = Some(message);
                        }
                    }
                }
                Some(RunnerEvent::Raw(line)) => {
                    // Not JSON; keep the raw line as output.
                    last_output = Instant::now();
                    stall_warned = false;
                    output_lines.push(line);
                }
                Some(RunnerEvent::ReadError(message)) => {
                    tracing::warn!(error = %message, "error reading provider stdout");
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(stall_deadline), if !stall_warned => {
                tracing::warn!(
                    provider = %config.kind,
                    silent_secs = options.stall_warning.as_secs(),
                    "no output for {}s; still waiting",
                    options.stall_warning.as_secs()
                );
                stall_warned = true;
            }
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
        }
    }

    if timed_out {
        tracing::warn!(
            provider = %config.kind,
            timeout_secs = options.timeout.as_secs(),
            "provider timed out; killing"
        );
        kill_child(&mut child).await;
        stderr_task.abort();
        return Ok(RunOutcome {
            success: false,
            output: output_lines.join("\n"),
            error: Some(format!(
                "provider timed out after {}s",
                options.timeout.as_secs()
            )),
            duration: started.elapsed().as_secs_f64(),
            summary: outcome.summary,
            tools_used: outcome.tools_used,
        });
    }

    // Stdout closed; wait for exit within whatever timeout budget is left.
    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed waiting on provider exit");
            None
        }
        Err(_) => {
            kill_child(&mut child).await;
            None
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();
    let exit_ok = status.as_ref().is_some_and(|s| s.success());
    let success = exit_ok && provider_error.is_none();

    outcome.success = success;
    outcome.output = output_lines.join("\n");
    outcome.duration = started.elapsed().as_secs_f64();
    outcome.error = if success {
        None
    } else {
        provider_error.or_else(|| {
            let code = status.and_then(|s| s.code());
            let snippet = tail_snippet(&stderr, 1024);
            Some(match code {
                Some(code) => format!("provider exited with code {code}: {snippet}"),
                None => format!("provider terminated by signal: {snippet}"),
            })
        })
    };

    Ok(outcome)
}

/// What the stdout stream yields: parsed events, raw non-JSON lines,
/// or a terminal read error.
enum RunnerEvent {
    Parsed(StreamEvent),
    Raw(String),
    ReadError(String),
}

/// Turn the child's stdout into a stream of runner events, one line at
/// a time, ending when the pipe closes.
fn event_stream(
    kind: ProviderKind,
    stdout: ChildStdout,
) -> Pin<Box<dyn Stream<Item = RunnerEvent> + Send>> {
    Box::pin(async_stream::stream! {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match kind.parse_event(trimmed) {
                        Ok(events) => {
                            for event in events {
                                yield RunnerEvent::Parsed(event);
                            }
                        }
                        Err(_) => yield RunnerEvent::Raw(trimmed.to_string()),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield RunnerEvent::ReadError(e.to_string());
                    break;
                }
            }
        }
    })
}

/// SIGTERM, brief grace period, then SIGKILL.
async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            tracing::debug!(pid, "SIGTERM failed, falling through to SIGKILL");
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

/// The last `max_bytes` of a string, on a char boundary.
fn tail_snippet(s: &str, max_bytes: usize) -> String {
    let s = s.trim();
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    fn script_provider(dir: &Path, name: &str, body: &str) -> ProviderConfig {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let mut config = ProviderConfig::new(ProviderKind::Claude, "opus");
        config.binary = Some(path.to_string_lossy().into_owned());
        config
    }

    #[tokio::test]
    async fn streams_events_and_reports_success() {
        let tmp = tempfile::tempdir().unwrap();
        let config = script_provider(
            tmp.path(),
            "fake_claude.sh",
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"},{"type":"tool_use","name":"Bash","input":{}}]}}'
echo '{"type":"tool_use","name":"Bash"}'
echo '{"type":"result","result":"Finished. TASK_COMPLETE"}'
"#,
        );

        let outcome = run_provider(&config, "prompt", tmp.path(), &RunnerOptions::default())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.summary, "Finished. TASK_COMPLETE");
        assert!(outcome.output.contains("thinking"));
        assert_eq!(outcome.tools_used.get("Bash"), Some(&2));
        assert!(outcome.error.is_none());
        assert!(outcome.duration >= 0.0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_stderr_snippet() {
        let tmp = tempfile::tempdir().unwrap();
        let config = script_provider(
            tmp.path(),
            "failing.sh",
            "echo 'boom' >&2\nexit 3\n",
        );

        let outcome = run_provider(&config, "prompt", tmp.path(), &RunnerOptions::default())
            .await
            .unwrap();

        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("code 3"), "error was: {error}");
        assert!(error.contains("boom"), "error was: {error}");
    }

    #[tokio::test]
    async fn provider_error_event_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = script_provider(
            tmp.path(),
            "limited.sh",
            r#"echo '{"type":"error","error":{"message":"rate_limit_error: try later"}}'
"#,
        );

        let outcome = run_provider(&config, "prompt", tmp.path(), &RunnerOptions::default())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("rate_limit_error"));
        assert!(outcome.output.contains("rate_limit_error"));
    }

    #[tokio::test]
    async fn timeout_kills_the_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let config = script_provider(tmp.path(), "sleepy.sh", "sleep 600\n");

        let options = RunnerOptions {
            timeout: Duration::from_millis(300),
            ..RunnerOptions::default()
        };
        let started = std::time::Instant::now();
        let outcome = run_provider(&config, "prompt", tmp.path(), &options)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
        // Includes the 5s SIGTERM grace at most; must not wait the full sleep.
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let mut config = ProviderConfig::new(ProviderKind::Claude, "opus");
        config.binary = Some("/nonexistent/ralph/claude".to_string());
        let result = run_provider(
            &config,
            "prompt",
            Path::new("/tmp"),
            &RunnerOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_json_lines_are_kept_as_output() {
        let tmp = tempfile::tempdir().unwrap();
        let config = script_provider(
            tmp.path(),
            "plain.sh",
            "echo 'not json at all'\necho '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let outcome = run_provider(&config, "prompt", tmp.path(), &RunnerOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.output.contains("not json at all"));
        assert_eq!(outcome.summary, "ok");
    }

    #[test]
    fn tail_snippet_truncates_from_the_front() {
        assert_eq!(tail_snippet("short", 10), "short");
        let long = "a".repeat(20);
        let snippet = tail_snippet(&long, 5);
        assert_eq!(snippet, "...aaaaa");
    }
}
