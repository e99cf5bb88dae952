use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use roundtable::agent::{Agent, AgentIdentity, ChunkSink};
use roundtable::config::{AgentConfig, Mode, OrchestratorConfig, SummaryConfig};
use roundtable::error::AgentError;
use roundtable::hooks::{HookError, MessageHook};
use roundtable::message::{Message, Role};
use roundtable::orchestrator::{Orchestrator, Outcome};
use roundtable::prompt;

/// Scriptable in-memory speaker used across the scenarios.
struct MockAgent {
    identity: AgentIdentity,
    response: String,
    delay: Duration,
    fail_with: Option<AgentError>,
    /// 1-based invocation indices that fail (used with `fail_with`); empty
    /// means every call fails when `fail_with` is set.
    fail_calls: Vec<u32>,
    calls: Mutex<u32>,
    prompts: Mutex<Vec<String>>,
}

impl MockAgent {
    fn new(id: &str, name: &str, response: &str) -> Self {
        let mut cfg = AgentConfig::new(id, "process");
        cfg.name = name.to_string();
        Self {
            identity: AgentIdentity::from_config(&cfg),
            response: response.to_string(),
            delay: Duration::ZERO,
            fail_with: None,
            fail_calls: Vec::new(),
            calls: Mutex::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self, error: AgentError) -> Self {
        self.fail_with = Some(error);
        self
    }

    fn failing_on_calls(mut self, error: AgentError, calls: Vec<u32>) -> Self {
        self.fail_with = Some(error);
        self.fail_calls = calls;
        self
    }

    async fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn initialize(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn health_check(&self, _cancel: &CancellationToken) -> Result<(), AgentError> {
        Ok(())
    }

    async fn cli_version(&self, _cancel: &CancellationToken) -> Result<String, AgentError> {
        Ok("mock 1.0".to_string())
    }

    async fn send_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
    ) -> Result<String, AgentError> {
        // Assemble the prompt the way a real adapter would, so the
        // self-exclusion invariant is exercised end to end.
        let assembled = prompt::assemble_flat(&self.identity, transcript);
        self.prompts.lock().await.push(assembled);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let call = {
            let mut calls = self.calls.lock().await;
            *calls += 1;
            *calls
        };
        if let Some(error) = &self.fail_with {
            if self.fail_calls.is_empty() || self.fail_calls.contains(&call) {
                return Err(error.clone());
            }
        }
        Ok(self.response.clone())
    }

    async fn stream_message(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        sink: ChunkSink<'_>,
    ) -> Result<String, AgentError> {
        let full = self.send_message(cancel, transcript).await?;
        sink(&full);
        Ok(full)
    }

    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config(mode: Mode, max_turns: u32, initial_prompt: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        mode,
        max_turns,
        turn_timeout_secs: 5.0,
        response_delay_secs: 0.0,
        initial_prompt: initial_prompt.to_string(),
        summary: SummaryConfig {
            enabled: false,
            agent: None,
        },
    }
}

fn agent_messages(transcript: &[Message]) -> Vec<&Message> {
    transcript.iter().filter(|m| m.role == Role::Agent).collect()
}

/// Round-robin, two agents, two turns: exact transcript shape.
#[tokio::test]
async fn round_robin_two_agents_two_turns() {
    init_logging();
    let a = Arc::new(MockAgent::new("a", "A", "Hi from A"));
    let b = Arc::new(MockAgent::new("b", "B", "Hi from B"));
    let mut orchestrator = Orchestrator::new(
        vec![a.clone(), b.clone()],
        fast_config(Mode::RoundRobin, 2, "Say hi"),
    )
    .unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);

    let msgs = &report.messages;
    assert_eq!(msgs.len(), 6);
    assert_eq!((msgs[0].agent_id.as_str(), &msgs[0].role), ("host", &Role::System));
    assert_eq!(msgs[0].content, "Say hi");
    assert_eq!((msgs[1].agent_id.as_str(), &msgs[1].role), ("a", &Role::System));
    assert_eq!((msgs[2].agent_id.as_str(), &msgs[2].role), ("b", &Role::System));
    assert_eq!((msgs[3].agent_id.as_str(), msgs[3].content.as_str()), ("a", "Hi from A"));
    assert_eq!(msgs[3].role, Role::Agent);
    assert_eq!((msgs[4].agent_id.as_str(), msgs[4].content.as_str()), ("b", "Hi from B"));
    assert_eq!((msgs[5].agent_id.as_str(), msgs[5].content.as_str()), ("host", "Completed."));
    assert!(report.short_summary.is_none());
}

/// Round-robin speaker order equals the roster cycled from roster[0].
#[tokio::test]
async fn round_robin_cycles_the_roster() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "ra")),
        Arc::new(MockAgent::new("b", "B", "rb")),
        Arc::new(MockAgent::new("c", "C", "rc")),
    ];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::RoundRobin, 7, "go")).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let order: Vec<&str> = agent_messages(&report.messages)
        .iter()
        .map(|m| m.agent_id.as_str())
        .collect();
    assert_eq!(order, vec!["a", "b", "c", "a", "b", "c", "a"]);
}

/// Reactive, three agents, five turns: no agent speaks twice in a row.
#[tokio::test]
async fn reactive_never_repeats_a_speaker() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "ra")),
        Arc::new(MockAgent::new("b", "B", "rb")),
        Arc::new(MockAgent::new("c", "C", "rc")),
    ];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::Reactive, 5, "go")).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let speakers: Vec<&str> = agent_messages(&report.messages)
        .iter()
        .map(|m| m.agent_id.as_str())
        .collect();
    assert_eq!(speakers.len(), 5);
    for pair in speakers.windows(2) {
        assert_ne!(pair[0], pair[1], "agent spoke twice consecutively");
    }
}

/// Free-form, three agents, one turn: roster-order append regardless of
/// finish order, timestamps still non-decreasing.
#[tokio::test]
async fn free_form_appends_in_roster_order() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "hello-A").with_delay(Duration::from_millis(300))),
        Arc::new(MockAgent::new("b", "B", "hello-B").with_delay(Duration::from_millis(100))),
        Arc::new(MockAgent::new("c", "C", "hello-C").with_delay(Duration::from_millis(200))),
    ];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::FreeForm, 1, "go")).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let agent_msgs = agent_messages(&report.messages);
    assert_eq!(agent_msgs.len(), 3);
    assert_eq!(agent_msgs[0].content, "hello-A");
    assert_eq!(agent_msgs[1].content, "hello-B");
    assert_eq!(agent_msgs[2].content, "hello-C");

    for pair in report.messages.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
}

/// Turn timeout: the slow agent's turn fails without appending a
/// message and the loop still reaches max_turns.
#[tokio::test]
async fn slow_agent_times_out_without_a_message() {
    init_logging();
    let a = Arc::new(MockAgent::new("a", "A", "slow").with_delay(Duration::from_millis(500)));
    let b = Arc::new(MockAgent::new("b", "B", "fast"));
    let mut config = fast_config(Mode::RoundRobin, 2, "go");
    config.turn_timeout_secs = 0.1;
    let mut orchestrator = Orchestrator::new(vec![a, b], config).unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);

    let agent_msgs = agent_messages(&report.messages);
    assert_eq!(agent_msgs.len(), 1);
    assert_eq!(agent_msgs[0].agent_id, "b");
    assert_eq!(report.total_turns, 2);
}

/// Trips the conversation token once the first agent
/// message lands.
struct CancelAfterFirstAgentMessage {
    token: CancellationToken,
}

#[async_trait]
impl MessageHook for CancelAfterFirstAgentMessage {
    async fn on_message(&self, message: &Message) -> Result<(), HookError> {
        if message.role == Role::Agent {
            self.token.cancel();
        }
        Ok(())
    }
}

/// Cancellation mid-conversation: one agent message, then the
/// "Interrupted." marker, in that order, and nothing after it.
#[tokio::test]
async fn cancellation_appends_interrupted_marker_once() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "ra")),
        Arc::new(MockAgent::new("b", "B", "rb")),
    ];
    let mut config = fast_config(Mode::RoundRobin, 50, "go");
    config.response_delay_secs = 0.2;
    let mut orchestrator = Orchestrator::new(roster, config).unwrap();

    let token = CancellationToken::new();
    orchestrator.add_hook(Arc::new(CancelAfterFirstAgentMessage {
        token: token.clone(),
    }));

    let report = orchestrator.run(token).await.unwrap();
    assert_eq!(report.outcome, Outcome::Interrupted);
    assert_eq!(agent_messages(&report.messages).len(), 1);

    let last = report.messages.last().unwrap();
    assert_eq!(last.content, "Interrupted.");
    assert_eq!(last.agent_id, "host");
    let interrupted_count = report
        .messages
        .iter()
        .filter(|m| m.content == "Interrupted.")
        .count();
    assert_eq!(interrupted_count, 1);
}

/// Prompt self-exclusion over three turns of a single-agent
/// conversation.
#[tokio::test]
async fn prompts_never_contain_own_messages() {
    init_logging();
    let a = Arc::new(MockAgent::new("a", "A", "marker-from-A"));
    let mut orchestrator =
        Orchestrator::new(vec![a.clone()], fast_config(Mode::RoundRobin, 3, "go")).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(agent_messages(&report.messages).len(), 3);

    let prompts = a.seen_prompts().await;
    assert_eq!(prompts.len(), 3);
    for prompt in &prompts {
        assert!(
            !prompt.contains("marker-from-A"),
            "prompt leaked the agent's own output: {}",
            prompt
        );
    }
}

/// Injection treats the injected author as the previous speaker, so
/// round-robin selection moves to the next roster entry.
#[tokio::test]
async fn injection_splices_before_selection_and_advances_the_cursor() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "ra")),
        Arc::new(MockAgent::new("b", "B", "rb")),
    ];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::RoundRobin, 1, "go")).unwrap();

    let handle = orchestrator.handle();
    let mut injected = Message::external("human-1", "Human", "a human interjects");
    injected.agent_id = "a".to_string(); // mapped onto roster agent A
    handle.inject(injected).unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let spliced_pos = report
        .messages
        .iter()
        .position(|m| m.content == "a human interjects")
        .expect("injected message missing");
    let first_agent = agent_messages(&report.messages)[0];
    // B speaks because the injected message counted as A's turn.
    assert_eq!(first_agent.agent_id, "b");
    let first_agent_pos = report
        .messages
        .iter()
        .position(|m| m.role == Role::Agent)
        .unwrap();
    assert!(spliced_pos < first_agent_pos);
}

/// Three consecutive failures escalate to a fatal outcome with the
/// documented terminal marker.
#[tokio::test]
async fn repeated_failures_end_the_conversation() {
    init_logging();
    let flaky = Arc::new(
        MockAgent::new("f", "Flaky", "unused")
            .failing(AgentError::Permanent("backend rejected the request".to_string())),
    );
    let mut orchestrator =
        Orchestrator::new(vec![flaky], fast_config(Mode::RoundRobin, 0, "go")).unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    match &report.outcome {
        Outcome::Failed(agent, reason) => {
            assert_eq!(agent, "Flaky");
            assert!(reason.contains("backend rejected"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(agent_messages(&report.messages).is_empty());
    let last = report.messages.last().unwrap();
    assert!(last.content.starts_with("Ended with error: Flaky:"));
}

/// A success resets the consecutive-failure counter: four failures overall,
/// but never three in a row, so the conversation completes.
#[tokio::test]
async fn failure_counter_resets_on_success() {
    init_logging();
    let flaky = Arc::new(MockAgent::new("f", "Flaky", "recovered").failing_on_calls(
        AgentError::Transient("flaky network".to_string()),
        vec![1, 2, 4, 5],
    ));
    let mut orchestrator =
        Orchestrator::new(vec![flaky], fast_config(Mode::RoundRobin, 6, "go")).unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    // Calls 3 and 6 succeeded.
    assert_eq!(agent_messages(&report.messages).len(), 2);
}

/// Failing hooks are logged and swallowed; the conversation continues.
struct FailingHook;

#[async_trait]
impl MessageHook for FailingHook {
    async fn on_message(&self, _message: &Message) -> Result<(), HookError> {
        Err("observer exploded".into())
    }
}

#[tokio::test]
async fn hook_failures_do_not_stop_the_conversation() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![Arc::new(MockAgent::new("a", "A", "ra"))];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::RoundRobin, 2, "go")).unwrap();
    orchestrator.add_hook(Arc::new(FailingHook));

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(agent_messages(&report.messages).len(), 2);
}

/// Hooks observe every append, including seed and terminal markers, in
/// order.
struct RecordingHook {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHook for RecordingHook {
    async fn on_message(&self, message: &Message) -> Result<(), HookError> {
        self.seen.lock().await.push(message.content.clone());
        Ok(())
    }
}

#[tokio::test]
async fn hooks_see_every_finalized_message_in_order() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![Arc::new(MockAgent::new("a", "A", "ra"))];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::RoundRobin, 1, "kickoff")).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    orchestrator.add_hook(Arc::new(RecordingHook { seen: seen.clone() }));

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    let seen = seen.lock().await.clone();
    let transcript: Vec<String> = report.messages.iter().map(|m| m.content.clone()).collect();
    assert_eq!(seen, transcript);
    assert_eq!(seen.first().map(String::as_str), Some("kickoff"));
    assert_eq!(seen.last().map(String::as_str), Some("Completed."));
}

/// Summary generation runs after normal completion and lands in the report,
/// not the transcript.
#[tokio::test]
async fn summary_attaches_to_the_report() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![Arc::new(MockAgent::new("a", "A", "the only point"))];
    let mut config = fast_config(Mode::RoundRobin, 1, "go");
    let mut summary_agent = AgentConfig::new("cat-summarizer", "process");
    summary_agent.command = Some("cat".to_string());
    config.summary = SummaryConfig {
        enabled: true,
        agent: Some(summary_agent),
    };
    let mut orchestrator = Orchestrator::new(roster, config).unwrap();

    let report = orchestrator.run(CancellationToken::new()).await.unwrap();
    let transcript_len = report.messages.len();

    let short = report.short_summary.expect("short summary missing");
    assert!(short.contains("the only point"));
    assert!(report.long_summary.is_some());
    // Summaries never enter the transcript.
    assert_eq!(report.total_messages, transcript_len);
    assert!(report.messages.iter().all(|m| !m.content.contains("1-2 sentence")));
}

/// The declarative path end to end: config file, factory-built subprocess
/// agents, and the transcript logger hook.
#[tokio::test]
async fn from_config_runs_subprocess_agents_and_logs_the_transcript() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("transcript.log");
    let yaml = format!(
        r#"
agents:
  - id: parrot
    type: process
    name: Parrot
    command: cat
orchestrator:
  mode: round-robin
  max_turns: 2
  turn_timeout_secs: 5
  response_delay_secs: 0
  initial_prompt: "Talk amongst yourselves."
  summary:
    enabled: false
logging:
  path: {}
  format: text
"#,
        log_path.display()
    );
    let config = roundtable::config::Config::from_yaml_str(&yaml).unwrap();

    let mut orchestrator = Orchestrator::from_config(&config).await.unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    let agent_msgs = agent_messages(&report.messages);
    assert_eq!(agent_msgs.len(), 2);
    // `cat` echoes the assembled prompt, which names the speaker.
    assert!(agent_msgs[0].content.contains("You are Parrot"));

    let log_text = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_text.contains("Talk amongst yourselves."));
    assert!(log_text.contains("Completed."));
}

/// Duplicate ids are rejected at construction.
#[tokio::test]
async fn duplicate_agent_ids_are_rejected() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![
        Arc::new(MockAgent::new("a", "A", "r1")),
        Arc::new(MockAgent::new("a", "A again", "r2")),
    ];
    assert!(Orchestrator::new(roster, fast_config(Mode::RoundRobin, 1, "")).is_err());
}

/// An empty initial prompt emits no host seed message.
#[tokio::test]
async fn empty_initial_prompt_is_not_seeded() {
    init_logging();
    let roster: Vec<Arc<dyn Agent>> = vec![Arc::new(MockAgent::new("a", "A", "ra"))];
    let mut orchestrator =
        Orchestrator::new(roster, fast_config(Mode::RoundRobin, 1, "")).unwrap();
    let report = orchestrator.run(CancellationToken::new()).await.unwrap();

    // First message is the announcement, not a host seed.
    assert_eq!(report.messages[0].agent_id, "a");
    assert_eq!(report.messages[0].role, Role::System);
}
