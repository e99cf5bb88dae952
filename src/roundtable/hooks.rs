//! Observer callbacks invoked once per finalized transcript message.
//!
//! External collaborators such as transcript writers, outbound bridges,
//! chat-room mirrors, and state snapshotters implement [`MessageHook`] and
//! register with the orchestrator before the conversation starts.  Hooks run
//! synchronously
//! after every append, in registration order, and see the message only after
//! it is part of the transcript; a failing hook is logged and swallowed so
//! observability problems can never stop a conversation.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use roundtable::hooks::{HookError, MessageHook};
//! use roundtable::message::Message;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHook for Printer {
//!     async fn on_message(&self, message: &Message) -> Result<(), HookError> {
//!         println!("[{}] {}", message.agent_name, message.content);
//!         Ok(())
//!     }
//! }
//! ```

use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Local, TimeZone};

use crate::roundtable::config::{LogFormat, LoggingConfig};
use crate::roundtable::message::{Message, Role};

/// Boxed error surfaced by a hook; logged by the dispatcher, never fatal.
pub type HookError = Box<dyn Error + Send + Sync>;

/// Callback receiving every finalized message exactly once.
///
/// Hooks must not mutate conversation state; they receive the message by
/// shared reference after the append is complete.
#[async_trait]
pub trait MessageHook: Send + Sync {
    /// Called after `message` has been appended to the transcript.
    async fn on_message(&self, message: &Message) -> Result<(), HookError>;
}

/// Hook that appends every message to a transcript log file.
///
/// Rendering follows the `logging` config section: `text` writes one
/// human-readable line per message, `json` one JSON object per line, and
/// `show_metrics` adds a duration/token/cost suffix to agent turns.
pub struct TranscriptLogger {
    file: Mutex<std::fs::File>,
    format: LogFormat,
    show_metrics: bool,
}

impl TranscriptLogger {
    /// Open (or create) the configured log file for appending.
    pub fn new(config: &LoggingConfig) -> std::io::Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        Ok(Self {
            file: Mutex::new(file),
            format: config.format,
            show_metrics: config.show_metrics,
        })
    }

    fn render_text(&self, message: &Message) -> String {
        let stamp = Local
            .timestamp_opt(message.timestamp, 0)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "00:00:00".to_string());
        let speaker = match message.role {
            Role::System => format!("SYSTEM ({})", message.agent_name),
            _ => message.agent_name.clone(),
        };
        let mut line = format!("[{}] {}: {}", stamp, speaker, message.content);
        if self.show_metrics {
            if let Some(metrics) = &message.metrics {
                line.push_str(&format!(
                    "  ({} ms, {} in / {} out tokens, ${:.6})",
                    metrics.duration_ms,
                    metrics.input_tokens,
                    metrics.output_tokens,
                    metrics.estimated_cost
                ));
            }
        }
        line
    }
}

#[async_trait]
impl MessageHook for TranscriptLogger {
    async fn on_message(&self, message: &Message) -> Result<(), HookError> {
        let line = match self.format {
            LogFormat::Text => self.render_text(message),
            LogFormat::Json => {
                if self.show_metrics {
                    serde_json::to_string(message)?
                } else {
                    let mut stripped = message.clone();
                    stripped.metrics = None;
                    serde_json::to_string(&stripped)?
                }
            }
        };
        let mut file = self.file.lock().expect("transcript log poisoned");
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roundtable::message::TurnMetrics;
    use std::path::PathBuf;

    fn logging_config(dir: &tempfile::TempDir, format: LogFormat, show_metrics: bool) -> LoggingConfig {
        LoggingConfig {
            path: PathBuf::from(dir.path()).join("transcript.log"),
            format,
            show_metrics,
        }
    }

    #[tokio::test]
    async fn text_lines_include_metrics_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = logging_config(&dir, LogFormat::Text, true);
        let logger = TranscriptLogger::new(&config).unwrap();

        let msg = Message::from_agent("a1", "Alice", "process", "hello").with_metrics(TurnMetrics {
            duration_ms: 42,
            input_tokens: 10,
            output_tokens: 3,
            total_tokens: 13,
            model: "gpt-4o".to_string(),
            estimated_cost: 0.001,
        });
        logger.on_message(&msg).await.unwrap();

        let text = std::fs::read_to_string(&config.path).unwrap();
        assert!(text.contains("Alice: hello"));
        assert!(text.contains("42 ms"));
    }

    #[tokio::test]
    async fn json_lines_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = logging_config(&dir, LogFormat::Json, true);
        let logger = TranscriptLogger::new(&config).unwrap();

        let msg = Message::host("Say hi");
        logger.on_message(&msg).await.unwrap();

        let text = std::fs::read_to_string(&config.path).unwrap();
        let back: Message = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(back, msg);
    }
}
