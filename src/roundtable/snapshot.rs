//! Resumable conversation state payload.
//!
//! The core supplies the snapshot format; a collaborator hook decides when
//! to write it.  The payload is a single JSON object carrying the schema
//! version, a save stamp, the full transcript, the configuration that
//! produced it, and summary metadata.  Files are written with owner-only
//! permissions since transcripts routinely contain sensitive prompt
//! material.
//!
//! # Example
//!
//! ```rust,no_run
//! use roundtable::config::Config;
//! use roundtable::orchestrator::Orchestrator;
//! use roundtable::snapshot::Snapshot;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_path("conversation.yaml")?;
//! let mut orchestrator = Orchestrator::from_config(&config).await?;
//! let report = orchestrator.run(CancellationToken::new()).await?;
//!
//! let snapshot = Snapshot::from_report(&config, &report, "nightly design review");
//! snapshot.save("state.json")?;
//!
//! let restored = Snapshot::load("state.json")?;
//! assert_eq!(restored.messages.len(), report.messages.len());
//! # Ok(())
//! # }
//! ```

use std::error::Error;
use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::roundtable::config::Config;
use crate::roundtable::message::Message;
use crate::roundtable::orchestrator::ConversationReport;

/// Snapshot schema version.
pub const SNAPSHOT_VERSION: &str = "1";

/// Errors from snapshot persistence.
#[derive(Debug)]
pub enum SnapshotError {
    /// Filesystem failure.
    Io(std::io::Error),
    /// The file did not contain a valid snapshot.
    Malformed(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Io(e) => write!(f, "snapshot io error: {}", e),
            SnapshotError::Malformed(msg) => write!(f, "malformed snapshot: {}", msg),
        }
    }
}

impl Error for SnapshotError {}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e)
    }
}

/// Aggregate figures describing the finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Scheduled turns, including failed ones.
    pub total_turns: u32,
    /// Transcript length.
    pub total_messages: usize,
    /// Wall-clock duration of the run in milliseconds.
    pub total_duration_ms: u64,
    /// RFC 3339 stamp taken when the run began.
    pub started_at: String,
    /// Free-form caller-supplied description.
    #[serde(default)]
    pub description: String,
    /// Short summary, when one was generated.
    #[serde(default)]
    pub short_text: String,
    /// Comprehensive summary, when one was generated.
    #[serde(default)]
    pub text: String,
}

/// The complete persisted state of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version.
    pub version: String,
    /// RFC 3339 stamp taken when the snapshot was built.
    pub saved_at: String,
    /// The full transcript.
    pub messages: Vec<Message>,
    /// The configuration the conversation ran with.
    pub config: Config,
    /// Aggregate figures and summaries.
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Assemble a snapshot from a finished conversation.
    pub fn from_report(
        config: &Config,
        report: &ConversationReport,
        description: impl Into<String>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            saved_at: Utc::now().to_rfc3339(),
            messages: report.messages.clone(),
            config: config.clone(),
            metadata: SnapshotMetadata {
                total_turns: report.total_turns,
                total_messages: report.total_messages,
                total_duration_ms: report.total_duration_ms,
                started_at: report.started_at.clone(),
                description: description.into(),
                short_text: report.short_summary.clone().unwrap_or_default(),
                text: report.long_summary.clone().unwrap_or_default(),
            },
        }
    }

    /// Serialize to pretty JSON and write with owner-only permissions.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read a snapshot back from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Snapshot::load(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::Malformed(_)));
    }
}
