//! Post-conversation summary generation.
//!
//! When a conversation terminates normally with summaries enabled, the
//! orchestrator commissions a *transient* agent (built through the regular
//! adapter factory but never added to the roster) and asks it for two
//! summaries over the completed transcript: a 1-2 sentence version and a
//! comprehensive one.  The outputs are attached to the conversation report;
//! they never enter the transcript, and failures are logged rather than
//! surfaced as conversation errors.

use tokio_util::sync::CancellationToken;

use crate::roundtable::adapters;
use crate::roundtable::config::AgentConfig;
use crate::roundtable::error::AgentError;
use crate::roundtable::message::Message;

/// Instruction for the short summary.
const SHORT_INSTRUCTION: &str =
    "Produce a 1-2 sentence summary of the conversation above.";

/// Instruction for the long summary.
const LONG_INSTRUCTION: &str =
    "Produce a comprehensive summary of the conversation above, covering each \
     participant's main points and how the discussion developed.";

/// Generate `(short, long)` summaries over a completed transcript.
///
/// The transient instance gets a reserved identity so the prompt assembler's
/// self-exclusion never hides roster messages from it; the summary agent
/// config is frequently a copy of a roster member's.
pub async fn generate(
    cancel: &CancellationToken,
    template: &AgentConfig,
    transcript: &[Message],
) -> Result<(String, String), AgentError> {
    let mut cfg = template.clone();
    cfg.id = "summarizer".to_string();
    cfg.name = "Summarizer".to_string();
    cfg.prompt = "You write faithful, neutral summaries of multi-party conversations.".to_string();
    cfg.announcement = None;

    let agent = adapters::build(&cfg).await?;

    let short = request(&*agent, cancel, transcript, SHORT_INSTRUCTION).await?;
    let long = request(&*agent, cancel, transcript, LONG_INSTRUCTION).await?;
    Ok((short, long))
}

/// One summary request: the transcript plus a host instruction appended at
/// the end.
async fn request(
    agent: &dyn crate::roundtable::agent::Agent,
    cancel: &CancellationToken,
    transcript: &[Message],
    instruction: &str,
) -> Result<String, AgentError> {
    let mut view: Vec<Message> = transcript.to_vec();
    view.push(Message::announcement(
        "summary-request",
        "summary-request",
        "system",
        instruction,
    ));
    agent.send_message(cancel, &view).await
}
