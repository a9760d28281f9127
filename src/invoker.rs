//! Agent invocation - "ask the agent and wait for the final answer"
//!
//! An invocation moves through `Sent -> AwaitingCompletion ->
//! FetchingTranscript -> Resolved`, or ends in `TimedOut`. Once the run
//! completes, the answer text is taken from the first usable source in
//! [`TEXT_SOURCES`] order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::ProbeError;
use crate::link::GatewayLink;
use crate::router::{EventRouter, SubscriptionId};

/// Turn-completion event family
pub const CHAT_EVENT: &str = "chat";
/// Streaming-fragment event family
pub const AGENT_EVENT: &str = "agent";

/// Where an invocation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Sent,
    AwaitingCompletion,
    FetchingTranscript,
    Resolved,
    TimedOut,
}

/// Channel that supplied the answer text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    Transcript,
    StreamedFragments,
    CompletionPayload,
}

/// Order in which a completed run's answer sources are consulted
pub const TEXT_SOURCES: [TextSource; 3] = [
    TextSource::Transcript,
    TextSource::StreamedFragments,
    TextSource::CompletionPayload,
];

/// Why a run produced no answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The remote model reported an error
    Upstream(String),
    /// The run was cancelled on the gateway
    Aborted(String),
    /// Completed, but no source held any text
    Empty,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunFailure::Upstream(reason) => write!(f, "upstream agent error: {reason}"),
            RunFailure::Aborted(reason) => write!(f, "agent run aborted: {reason}"),
            RunFailure::Empty => f.write_str("no assistant response found"),
        }
    }
}

/// Terminal outcome of an agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { text: String, source: TextSource },
    /// Completion never arrived; `partial` holds any streamed text
    TimedOut { partial: Option<String> },
    Failed(RunFailure),
}

/// Result of one invocation
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub run_id: String,
    pub session_key: String,
    pub outcome: RunOutcome,
}

/// Anything that can run a prompt through an agent
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Fresh session key; every attempt on one target shares it
    fn session_key(&self) -> String;

    async fn invoke(
        &self,
        prompt: &str,
        session_key: Option<&str>,
        completion_timeout: Duration,
    ) -> Result<AgentReply, ProbeError>;
}

/// One remote agent execution being awaited
#[derive(Debug)]
pub struct AgentRun {
    pub run_id: String,
    pub session_key: String,
    phase: RunPhase,
    fragments: Vec<String>,
    started: Instant,
}

impl AgentRun {
    fn new(run_id: String, session_key: String) -> Self {
        Self {
            run_id,
            session_key,
            phase: RunPhase::Sent,
            fragments: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn advance(&mut self, phase: RunPhase) {
        debug!(
            run_id = %self.run_id,
            from = ?self.phase,
            to = ?phase,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Run phase"
        );
        self.phase = phase;
    }

    fn push_fragment(&mut self, text: String) {
        if !text.is_empty() {
            self.fragments.push(text);
        }
    }

    /// Streamed text so far, if any
    pub fn partial_text(&self) -> Option<String> {
        let joined = self.fragments.concat();
        (!joined.trim().is_empty()).then_some(joined)
    }
}

/// Run-scoped event forwarded from the router
#[derive(Debug)]
enum RunEvent {
    Fragment {
        run_id: Option<String>,
        text: String,
    },
    Terminal {
        run_id: Option<String>,
        state: Terminal,
        payload: Value,
    },
}

#[derive(Debug)]
enum Terminal {
    Final,
    Error(String),
    Aborted,
}

impl RunEvent {
    fn from_chat(payload: &Value) -> Option<Self> {
        let state = match payload.get("state").and_then(Value::as_str)? {
            "final" => Terminal::Final,
            "error" => Terminal::Error(
                non_empty_str(payload.get("errorMessage"))
                    .unwrap_or("agent run failed")
                    .to_owned(),
            ),
            "aborted" => Terminal::Aborted,
            _ => return None,
        };
        Some(RunEvent::Terminal {
            run_id: run_id_of(payload),
            state,
            payload: payload.clone(),
        })
    }

    fn from_agent(payload: &Value) -> Option<Self> {
        if payload.get("stream").and_then(Value::as_str) != Some("assistant") {
            return None;
        }
        let data = payload.get("data")?;
        let text = data
            .get("delta")
            .or_else(|| data.get("text"))
            .and_then(Value::as_str)?;
        Some(RunEvent::Fragment {
            run_id: run_id_of(payload),
            text: text.to_owned(),
        })
    }

    fn belongs_to(&self, run_id: &str) -> bool {
        let own = match self {
            RunEvent::Fragment { run_id, .. } | RunEvent::Terminal { run_id, .. } => run_id,
        };
        own.as_deref() == Some(run_id)
    }
}

fn run_id_of(payload: &Value) -> Option<String> {
    payload.get("runId").and_then(Value::as_str).map(str::to_owned)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn same_session(payload: &Value, session_key: &str) -> bool {
    payload
        .get("sessionKey")
        .and_then(Value::as_str)
        .map_or(true, |key| key.eq_ignore_ascii_case(session_key))
}

/// Plain text of a transcript message or event message.
/// `content` may be a string or a list of `{type: "text", text}` parts.
pub fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(_) if part.get("type").and_then(Value::as_str).unwrap_or("text") == "text" => {
                    part.get("text").and_then(Value::as_str)
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}

/// Newest assistant turn of a transcript
#[derive(Debug, PartialEq)]
enum AssistantTurn {
    Text(String),
    Failed(String),
}

fn latest_assistant_turn(history: &Value) -> Option<AssistantTurn> {
    let messages = history
        .get("messages")
        .and_then(Value::as_array)
        .or_else(|| history.as_array())?;
    let message = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))?;

    if let Some(error) = non_empty_str(message.get("errorMessage")) {
        return Some(AssistantTurn::Failed(error.to_owned()));
    }
    if message.get("stopReason").and_then(Value::as_str) == Some("error") {
        return Some(AssistantTurn::Failed("model stopped with an error".into()));
    }
    Some(AssistantTurn::Text(message_text(message)))
}

/// Unsubscribes its handlers when dropped, on every exit path
struct Subscriptions {
    router: Arc<EventRouter>,
    ids: Vec<(&'static str, SubscriptionId)>,
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (event, id) in self.ids.drain(..) {
            self.router.unsubscribe(event, id);
        }
    }
}

/// Marks a run id as awaited until dropped
struct RunClaim {
    runs: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.run_id);
    }
}

enum Completion {
    Completed(Value),
    Failed(RunFailure),
    TimedOut,
}

/// Runs prompts through the gateway's agent
pub struct AgentInvoker {
    link: Arc<GatewayLink>,
    config: AgentConfig,
    /// Run ids currently awaited
    active_runs: Arc<Mutex<HashSet<String>>>,
}

impl AgentInvoker {
    pub fn new(link: Arc<GatewayLink>, config: AgentConfig) -> Self {
        Self {
            link,
            config,
            active_runs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn link(&self) -> &Arc<GatewayLink> {
        &self.link
    }

    /// Fresh key so concurrent invocations never share conversation context
    pub fn generate_session_key(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.session_prefix, &id[..8])
    }

    /// Number of runs currently awaited
    pub fn active_runs(&self) -> usize {
        self.active_runs.lock().len()
    }

    fn subscribe(&self, session_key: &str, tx: mpsc::UnboundedSender<RunEvent>) -> Subscriptions {
        let router = Arc::clone(self.link.router());

        let chat_key = session_key.to_owned();
        let chat_tx = tx.clone();
        let chat = router.subscribe(CHAT_EVENT, move |payload| {
            if same_session(payload, &chat_key) {
                if let Some(event) = RunEvent::from_chat(payload) {
                    let _ = chat_tx.send(event);
                }
            }
            Ok(())
        });

        let agent_key = session_key.to_owned();
        let agent = router.subscribe(AGENT_EVENT, move |payload| {
            if same_session(payload, &agent_key) {
                if let Some(event) = RunEvent::from_agent(payload) {
                    let _ = tx.send(event);
                }
            }
            Ok(())
        });

        Subscriptions {
            router,
            ids: vec![(CHAT_EVENT, chat), (AGENT_EVENT, agent)],
        }
    }

    fn claim(&self, run_id: &str) -> Result<RunClaim, ProbeError> {
        if !self.active_runs.lock().insert(run_id.to_owned()) {
            return Err(ProbeError::DuplicateRun(run_id.to_owned()));
        }
        Ok(RunClaim {
            runs: Arc::clone(&self.active_runs),
            run_id: run_id.to_owned(),
        })
    }

    /// Send `prompt` and wait up to `completion_timeout` for the final answer
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn invoke(
        &self,
        prompt: &str,
        session_key: Option<&str>,
        completion_timeout: Duration,
    ) -> Result<AgentReply, ProbeError> {
        let session_key = session_key
            .map(str::to_owned)
            .unwrap_or_else(|| self.generate_session_key());

        // Subscribe before sending so no event can slip past
        let (tx, mut events) = mpsc::unbounded_channel();
        let _subscriptions = self.subscribe(&session_key, tx);

        let idempotency_key = Uuid::new_v4().to_string();
        let ack = self
            .link
            .request(
                "chat.send",
                json!({
                    "sessionKey": session_key,
                    "message": prompt,
                    "idempotencyKey": idempotency_key,
                }),
                self.config.send_timeout(),
            )
            .await?;
        let run_id = ack
            .get("runId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or(idempotency_key);
        let _claim = self.claim(&run_id)?;

        let mut run = AgentRun::new(run_id, session_key);
        run.advance(RunPhase::AwaitingCompletion);

        let outcome = match self
            .await_completion(&mut run, &mut events, completion_timeout)
            .await?
        {
            Completion::Completed(payload) => self.resolve(&mut run, &payload).await,
            Completion::Failed(failure) => {
                run.advance(RunPhase::Resolved);
                RunOutcome::Failed(failure)
            }
            Completion::TimedOut => {
                run.advance(RunPhase::TimedOut);
                let partial = run.partial_text();
                warn!(
                    run_id = %run.run_id,
                    after_secs = completion_timeout.as_secs_f64(),
                    has_partial = partial.is_some(),
                    "Agent run timed out"
                );
                RunOutcome::TimedOut { partial }
            }
        };

        info!(
            run_id = %run.run_id,
            session = %run.session_key,
            outcome = outcome_kind(&outcome),
            "Agent run finished"
        );
        Ok(AgentReply {
            run_id: run.run_id,
            session_key: run.session_key,
            outcome,
        })
    }

    async fn await_completion(
        &self,
        run: &mut AgentRun,
        events: &mut mpsc::UnboundedReceiver<RunEvent>,
        timeout: Duration,
    ) -> Result<Completion, ProbeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Ok(Completion::TimedOut),
                // Subscriptions were dropped: the link is gone
                Ok(None) => {
                    return Err(ProbeError::Closed {
                        method: format!("run {}", run.run_id),
                    })
                }
                Ok(Some(event)) => event,
            };
            if !event.belongs_to(&run.run_id) {
                continue;
            }
            match event {
                RunEvent::Fragment { text, .. } => run.push_fragment(text),
                RunEvent::Terminal { state, payload, .. } => {
                    return Ok(match state {
                        Terminal::Final => Completion::Completed(payload),
                        Terminal::Error(reason) => Completion::Failed(RunFailure::Upstream(reason)),
                        Terminal::Aborted => Completion::Failed(RunFailure::Aborted(
                            non_empty_str(payload.get("reason"))
                                .unwrap_or("cancelled")
                                .to_owned(),
                        )),
                    });
                }
            }
        }
    }

    /// Pick the answer text of a completed run
    async fn resolve(&self, run: &mut AgentRun, completion: &Value) -> RunOutcome {
        run.advance(RunPhase::FetchingTranscript);
        let mut transcript = None;
        match self.fetch_transcript(&run.session_key).await {
            Ok(Some(AssistantTurn::Failed(reason))) => {
                run.advance(RunPhase::Resolved);
                return RunOutcome::Failed(RunFailure::Upstream(reason));
            }
            Ok(Some(AssistantTurn::Text(text))) => transcript = Some(text),
            Ok(None) => debug!(run_id = %run.run_id, "Transcript has no assistant turn"),
            Err(e) => warn!(run_id = %run.run_id, error = %e, "Transcript fetch failed"),
        }
        run.advance(RunPhase::Resolved);

        for source in TEXT_SOURCES {
            let text = match source {
                TextSource::Transcript => transcript.take(),
                TextSource::StreamedFragments => run.partial_text(),
                TextSource::CompletionPayload => completion.get("message").map(message_text),
            };
            if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                return RunOutcome::Completed { text, source };
            }
        }
        RunOutcome::Failed(RunFailure::Empty)
    }

    async fn fetch_transcript(&self, session_key: &str) -> Result<Option<AssistantTurn>, ProbeError> {
        let history = self
            .link
            .request(
                "chat.history",
                json!({ "sessionKey": session_key, "limit": self.config.history_limit }),
                self.config.history_timeout(),
            )
            .await?;
        Ok(latest_assistant_turn(&history))
    }
}

fn outcome_kind(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed { .. } => "completed",
        RunOutcome::TimedOut { .. } => "timed_out",
        RunOutcome::Failed(_) => "failed",
    }
}

#[async_trait]
impl AgentBackend for AgentInvoker {
    fn session_key(&self) -> String {
        self.generate_session_key()
    }

    async fn invoke(
        &self,
        prompt: &str,
        session_key: Option<&str>,
        completion_timeout: Duration,
    ) -> Result<AgentReply, ProbeError> {
        AgentInvoker::invoke(self, prompt, session_key, completion_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::connected_link;
    use crate::transport::GatewayEnd;

    const SESSION: &str = "agent:main:test-1";

    fn test_config() -> AgentConfig {
        AgentConfig {
            send_timeout_secs: 2,
            history_timeout_secs: 2,
            ..Default::default()
        }
    }

    async fn setup() -> (AgentInvoker, GatewayEnd) {
        let (link, end) = connected_link().await;
        (AgentInvoker::new(link, test_config()), end)
    }

    fn event(name: &str, payload: Value) -> Value {
        json!({"type": "event", "event": name, "payload": payload})
    }

    fn fragment(run_id: &str, delta: &str) -> Value {
        event(AGENT_EVENT, json!({"runId": run_id, "sessionKey": SESSION, "stream": "assistant", "data": {"delta": delta}}))
    }

    fn chat_state(run_id: &str, state: &str) -> Value {
        event(CHAT_EVENT, json!({"runId": run_id, "sessionKey": SESSION, "state": state}))
    }

    /// Answers `chat.send` with `run_id` and returns the request
    async fn ack_send(end: &mut GatewayEnd, run_id: &str) -> Value {
        let send = end.next_json().await.expect("chat.send");
        assert_eq!(send["method"], "chat.send");
        end.push(json!({"type": "res", "id": send["id"], "ok": true, "payload": {"runId": run_id, "status": "started"}}));
        send
    }

    async fn answer_history(end: &mut GatewayEnd, messages: Value) -> Value {
        let history = end.next_json().await.expect("chat.history");
        assert_eq!(history["method"], "chat.history");
        end.push(json!({"type": "res", "id": history["id"], "ok": true, "payload": {"messages": messages}}));
        history
    }

    // === Completion Tests ===

    #[tokio::test]
    async fn test_completed_run_reads_transcript() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            let send = ack_send(&mut end, "run-1").await;
            assert_eq!(send["params"]["sessionKey"], SESSION);
            assert_eq!(send["params"]["message"], "analyze shop.com");
            end.push(fragment("run-1", "{\"partial\""));
            end.push(chat_state("run-1", "final"));
            let history = answer_history(
                &mut end,
                json!([
                    {"role": "user", "content": "analyze shop.com"},
                    {"role": "assistant", "content": [{"type": "text", "text": "{\"is_ecommerce\": true}"}]},
                ]),
            )
            .await;
            assert_eq!(history["params"]["sessionKey"], SESSION);
            assert_eq!(history["params"]["limit"], 5);
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("analyze shop.com", Some(SESSION), Duration::from_secs(5)),
            gateway
        );

        let reply = reply.unwrap();
        assert_eq!(reply.run_id, "run-1");
        assert_eq!(
            reply.outcome,
            RunOutcome::Completed {
                text: "{\"is_ecommerce\": true}".into(),
                source: TextSource::Transcript,
            }
        );
        assert!(invoker.link().router().is_empty());
        assert_eq!(invoker.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_in_transcript() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-2").await;
            end.push(chat_state("run-2", "final"));
            answer_history(
                &mut end,
                json!([{"role": "assistant", "content": [], "stopReason": "error", "errorMessage": "rate limited"}]),
            )
            .await;
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Failed(RunFailure::Upstream("rate limited".into()))
        );
    }

    #[tokio::test]
    async fn test_error_state_is_upstream_failure() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-3").await;
            end.push(event(CHAT_EVENT, json!({"runId": "run-3", "state": "error", "errorMessage": "model overloaded"})));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Failed(RunFailure::Upstream("model overloaded".into()))
        );
    }

    // === Fallback Tests ===

    #[tokio::test]
    async fn test_failed_transcript_falls_back_to_fragments() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-4").await;
            end.push(fragment("run-4", "{\"a\":"));
            end.push(fragment("run-4", " 1}"));
            end.push(chat_state("run-4", "final"));
            let history = end.next_json().await.unwrap();
            end.push(json!({"type": "res", "id": history["id"], "ok": false, "error": {"message": "history unavailable"}}));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Completed {
                text: "{\"a\": 1}".into(),
                source: TextSource::StreamedFragments,
            }
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_completion_payload() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-5").await;
            end.push(event(
                CHAT_EVENT,
                json!({"runId": "run-5", "state": "final", "message": {"role": "assistant", "content": "inline answer"}}),
            ));
            answer_history(&mut end, json!([{"role": "user", "content": "p"}])).await;
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Completed {
                text: "inline answer".into(),
                source: TextSource::CompletionPayload,
            }
        );
    }

    #[tokio::test]
    async fn test_no_text_anywhere_is_empty_failure() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-6").await;
            end.push(chat_state("run-6", "final"));
            answer_history(&mut end, json!([{"role": "assistant", "content": "   "}])).await;
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(reply.unwrap().outcome, RunOutcome::Failed(RunFailure::Empty));
    }

    // === Timeout Tests ===

    #[tokio::test]
    async fn test_timeout_returns_partial_text() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-7").await;
            end.push(fragment("run-7", "{\"events\": []}"));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_millis(100)),
            gateway
        );
        let reply = reply.unwrap();
        assert_eq!(
            reply.outcome,
            RunOutcome::TimedOut {
                partial: Some("{\"events\": []}".into())
            }
        );
        assert!(invoker.link().router().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_without_fragments_keeps_run_id() {
        let (invoker, mut end) = setup().await;

        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_millis(50)),
            ack_send(&mut end, "run-8")
        );
        let reply = reply.unwrap();
        assert_eq!(reply.run_id, "run-8");
        assert_eq!(reply.outcome, RunOutcome::TimedOut { partial: None });
    }

    // === Filtering Tests ===

    #[tokio::test]
    async fn test_ignores_other_runs_and_sessions() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-9").await;
            end.push(fragment("other-run", "wrong"));
            end.push(event(AGENT_EVENT, json!({"runId": "run-9", "sessionKey": "agent:main:else", "stream": "assistant", "data": {"delta": "wrong"}})));
            end.push(event(AGENT_EVENT, json!({"runId": "run-9", "stream": "lifecycle", "data": {"phase": "start"}})));
            end.push(chat_state("other-run", "final"));
            end.push(fragment("run-9", "right"));
            end.push(chat_state("run-9", "final"));
            let history = end.next_json().await.unwrap();
            end.push(json!({"type": "res", "id": history["id"], "ok": true, "payload": {"messages": []}}));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Completed {
                text: "right".into(),
                source: TextSource::StreamedFragments,
            }
        );
    }

    #[tokio::test]
    async fn test_completion_without_run_id_is_ignored() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            ack_send(&mut end, "run-12").await;
            end.push(event(
                CHAT_EVENT,
                json!({"state": "final", "message": {"content": "someone else's answer"}}),
            ));
            end.push(event(AGENT_EVENT, json!({"stream": "assistant", "data": {"delta": "stray"}})));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_millis(150)),
            gateway
        );
        assert_eq!(reply.unwrap().outcome, RunOutcome::TimedOut { partial: None });
    }

    #[tokio::test]
    async fn test_events_before_ack_are_buffered() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            let send = end.next_json().await.unwrap();
            end.push(fragment("run-10", "early"));
            end.push(chat_state("run-10", "final"));
            end.push(json!({"type": "res", "id": send["id"], "ok": true, "payload": {"runId": "run-10"}}));
            answer_history(&mut end, json!([])).await;
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert_eq!(
            reply.unwrap().outcome,
            RunOutcome::Completed {
                text: "early".into(),
                source: TextSource::StreamedFragments,
            }
        );
    }

    // === Cleanup Tests ===

    #[tokio::test]
    async fn test_send_failure_leaves_no_subscriptions() {
        let (invoker, mut end) = setup().await;

        let gateway = async {
            let send = end.next_json().await.unwrap();
            end.push(json!({"type": "res", "id": send["id"], "ok": false, "error": "session busy"}));
        };
        let (reply, _) = tokio::join!(
            invoker.invoke("p", Some(SESSION), Duration::from_secs(5)),
            gateway
        );
        assert!(matches!(reply, Err(ProbeError::Remote { .. })));
        assert!(invoker.link().router().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_waiting_invocation() {
        let (invoker, mut end) = setup().await;
        let link = Arc::clone(invoker.link());

        let gateway = async {
            ack_send(&mut end, "run-11").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            link.disconnect().await;
        };
        let (reply, _) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(invoker.invoke("p", Some(SESSION), Duration::from_secs(60)), gateway)
        })
        .await
        .expect("invocation must not hang");

        assert!(matches!(reply, Err(ProbeError::Closed { .. })));
        assert_eq!(invoker.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_generated_session_keys_are_unique() {
        let (invoker, _end) = setup().await;
        let a = invoker.generate_session_key();
        let b = invoker.generate_session_key();
        assert!(a.starts_with("agent:main:probe-"));
        assert_eq!(a.len(), "agent:main:probe-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_text_shapes() {
        assert_eq!(message_text(&json!({"content": "plain"})), "plain");
        assert_eq!(
            message_text(&json!({"content": [
                {"type": "text", "text": "one"},
                {"type": "tool_use", "name": "web_fetch"},
                {"type": "text", "text": "two"},
            ]})),
            "one\ntwo"
        );
        assert_eq!(message_text(&json!({"text": "legacy"})), "legacy");
        assert_eq!(message_text(&json!({})), "");
    }
}
