//! Subprocess-backed speaker.
//!
//! The adapter spawns one non-interactive child per turn, feeds the assembled
//! prompt via stdin or a configured flag, and parses stdout in one of three
//! families: plain text, newline-delimited JSON events, or a JSON event
//! stream whose first line carries a backend session id that is captured for
//! reuse.  stderr is drained concurrently into a bounded buffer used for
//! error reporting, and cancellation kills the child.
//!
//! One vendor CLI closes its stream non-cleanly, so a non-zero exit paired
//! with non-empty stdout is accepted as success and logged as a warning;
//! the exit code is not authoritative when output was produced.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::roundtable::agent::{Agent, AgentIdentity, ChunkSink};
use crate::roundtable::config::{AgentConfig, OutputFormat};
use crate::roundtable::error::AgentError;
use crate::roundtable::message::{Message, TokenUsage};
use crate::roundtable::prompt;

/// Cap on buffered stderr kept for error reports.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Deadline applied to health-check and version probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What one stdout line contributed to the response.
#[derive(Debug, PartialEq)]
enum ParsedLine {
    /// Assistant text to append (and stream).
    Fragment(String),
    /// Backend session id from the stream preamble.
    Session(String),
    /// Completion sentinel; an embedded final result replaces the
    /// accumulated fragments when present, and usage may ride along.
    Completed {
        result: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// Recognized JSON of a type we do not consume.
    Ignored,
}

/// Parse one newline-delimited JSON event line.
///
/// Malformed JSON falls back to treating the line as plain text; valid JSON
/// with an unknown `type` is ignored.
fn parse_event_line(line: &str) -> ParsedLine {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return ParsedLine::Fragment(line.to_string()),
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            // Either a flat text field or an Anthropic-style content array.
            if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
                return ParsedLine::Fragment(text.to_string());
            }
            if let Some(blocks) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                let mut text = String::new();
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                }
                if !text.is_empty() {
                    return ParsedLine::Fragment(text);
                }
            }
            ParsedLine::Ignored
        }
        Some("content") => match value
            .get("text")
            .or_else(|| value.get("content"))
            .and_then(|t| t.as_str())
        {
            Some(text) => ParsedLine::Fragment(text.to_string()),
            None => ParsedLine::Ignored,
        },
        Some("system") => match value.get("session_id").and_then(|s| s.as_str()) {
            Some(id) => ParsedLine::Session(id.to_string()),
            None => ParsedLine::Ignored,
        },
        Some("result") => {
            let result = value
                .get("result")
                .and_then(|r| r.as_str())
                .map(|s| s.to_string());
            let usage = value.get("usage").map(|u| {
                let input = u
                    .get("input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                let output = u
                    .get("output_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                }
            });
            ParsedLine::Completed { result, usage }
        }
        _ => ParsedLine::Ignored,
    }
}

/// Resolve a command to an executable path.
///
/// A command containing a path separator is checked directly; a bare name is
/// searched on `PATH`.
fn resolve_binary(command: &str) -> Option<PathBuf> {
    if command.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(command);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        return None;
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Subprocess adapter: one child process per turn.
pub struct ProcessAgent {
    identity: AgentIdentity,
    command: String,
    resolved: Option<PathBuf>,
    args: Vec<String>,
    prompt_flag: Option<String>,
    model_flag: Option<String>,
    session_flag: Option<String>,
    output_format: OutputFormat,
    /// Backend session id captured from a `stream-json` preamble; reused via
    /// `session_flag` on subsequent invocations.  Adapter-private state.
    session_id: Mutex<Option<String>>,
    usage: Mutex<Option<TokenUsage>>,
}

impl ProcessAgent {
    /// Build from config.  The binary defaults to the agent id when no
    /// `command` is configured; resolution happens in
    /// [`initialize`](Agent::initialize).
    pub fn new(cfg: &AgentConfig) -> Self {
        Self {
            identity: AgentIdentity::from_config(cfg),
            command: cfg.command.clone().unwrap_or_else(|| cfg.id.clone()),
            resolved: None,
            args: cfg.args.clone(),
            prompt_flag: cfg.prompt_flag.clone(),
            model_flag: cfg.model_flag.clone(),
            session_flag: cfg.session_flag.clone(),
            output_format: cfg.output_format,
            session_id: Mutex::new(None),
            usage: Mutex::new(None),
        }
    }

    /// Executable path, available after initialization.
    fn binary(&self) -> Result<&Path, AgentError> {
        self.resolved
            .as_deref()
            .ok_or_else(|| AgentError::Unavailable(format!("'{}' was not initialized", self.command)))
    }

    /// The argv for one turn, including any remembered session id.
    async fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if let (Some(flag), Some(model)) = (&self.model_flag, &self.identity.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }
        if let Some(flag) = &self.session_flag {
            if let Some(session) = self.session_id.lock().await.clone() {
                args.push(flag.clone());
                args.push(session);
            }
        }
        if let Some(flag) = &self.prompt_flag {
            args.push(flag.clone());
            args.push(prompt.to_string());
        }
        args
    }

    /// Spawn the child, feed the prompt, and collect the parsed response.
    ///
    /// `sink` receives decoded fragments as they arrive when streaming.
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        mut sink: Option<ChunkSink<'_>>,
    ) -> Result<String, AgentError> {
        let binary = self.binary()?.to_path_buf();
        let assembled = prompt::assemble_flat(&self.identity, transcript);
        let args = self.build_args(&assembled).await;
        let via_stdin = self.prompt_flag.is_none();

        let mut command = Command::new(&binary);
        command
            .args(&args)
            .stdin(if via_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            AgentError::Permanent(format!("failed to spawn '{}': {}", binary.display(), e))
        })?;

        if via_stdin {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                AgentError::Permanent("child stdin was not piped".to_string())
            })?;
            let prompt_bytes = assembled.into_bytes();
            // Write from a task so a child that floods stdout before reading
            // stdin cannot deadlock against us.
            tokio::spawn(async move {
                let _ = stdin.write_all(&prompt_bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Permanent("child stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Permanent("child stderr was not piped".to_string()))?;

        // Drain stderr concurrently into a bounded buffer.
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut buffer = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                if buffer.len() < MAX_STDERR_BYTES {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            }
            buffer
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut usage: Option<TokenUsage> = None;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(AgentError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(AgentError::Transient(format!("stdout read error: {}", e)));
                }
            };

            match self.output_format {
                OutputFormat::Text => {
                    if let Some(sink) = sink.as_mut() {
                        sink(&line);
                    }
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
                OutputFormat::JsonEvents | OutputFormat::StreamJson => {
                    match parse_event_line(&line) {
                        ParsedLine::Fragment(text) => {
                            if let Some(sink) = sink.as_mut() {
                                sink(&text);
                            }
                            accumulated.push_str(&text);
                        }
                        ParsedLine::Session(id) => {
                            if self.output_format == OutputFormat::StreamJson {
                                *self.session_id.lock().await = Some(id);
                            }
                        }
                        ParsedLine::Completed { result, usage: u } => {
                            if let Some(r) = result {
                                if !r.is_empty() {
                                    final_result = Some(r);
                                }
                            }
                            if u.is_some() {
                                usage = u;
                            }
                        }
                        ParsedLine::Ignored => {}
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(AgentError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| {
                AgentError::Transient(format!("wait on '{}' failed: {}", binary.display(), e))
            })?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        *self.usage.lock().await = usage;

        let content = match final_result {
            Some(result) => result,
            None => accumulated.trim().to_string(),
        };

        if !status.success() {
            if !content.is_empty() {
                // Some vendor CLIs exit non-zero after producing a valid
                // response; accept the output and keep the exit code visible.
                log::warn!(
                    "'{}' exited with {:?} but produced output; accepting it",
                    binary.display(),
                    status.code()
                );
            } else {
                let excerpt: String = stderr_text.chars().take(400).collect();
                return Err(AgentError::Permanent(format!(
                    "'{}' exited with {:?}: {}",
                    binary.display(),
                    status.code(),
                    excerpt.trim()
                )));
            }
        } else if content.is_empty() {
            return Err(AgentError::Permanent(format!(
                "'{}' produced no output",
                binary.display()
            )));
        }

        Ok(content)
    }

    /// Run the binary with `--version` under the probe deadline.
    async fn probe_version(&self, cancel: &CancellationToken) -> Result<String, AgentError> {
        let binary = self.binary()?.to_path_buf();
        let run = async {
            let output = Command::new(&binary)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| AgentError::Unhealthy(format!("version probe failed: {}", e)))?;
            let text = String::from_utf8_lossy(&output.stdout);
            let text = if text.trim().is_empty() {
                String::from_utf8_lossy(&output.stderr).to_string()
            } else {
                text.to_string()
            };
            let first = text.lines().next().unwrap_or("").trim().to_string();
            if first.is_empty() {
                return Err(AgentError::Unhealthy(format!(
                    "'{}' --version produced no output",
                    binary.display()
                )));
            }
            Ok(first)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(PROBE_TIMEOUT, run) => match result {
                Ok(inner) => inner,
                Err(_) => Err(AgentError::Unhealthy(format!(
                    "'{}' --version did not return within {:?}",
                    self.command, PROBE_TIMEOUT
                ))),
            },
        }
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    async fn initialize(&mut self) -> Result<(), AgentError> {
        match resolve_binary(&self.command) {
            Some(path) => {
                log::debug!("agent '{}' resolved to {}", self.identity.id, path.display());
                self.resolved = Some(path);
                Ok(())
            }
            None => Err(AgentError::Unavailable(format!(
                "'{}' not found on PATH",
                self.command
            ))),
        }
    }

    fn is_available(&self) -> bool {
        self.resolved.is_some() || resolve_binary(&self.command).is_some()
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.probe_version(cancel).await.map(|_| ())
    }

    async fn cli_version(&self, cancel: &CancellationToken) -> Result<String, AgentError> {
        self.probe_version(cancel).await
    }

    async fn send_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
    ) -> Result<String, AgentError> {
        self.invoke(cancel, transcript, None).await
    }

    async fn stream_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        sink: ChunkSink<'_>,
    ) -> Result<String, AgentError> {
        self.invoke(cancel, transcript, Some(sink)).await
    }

    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}
