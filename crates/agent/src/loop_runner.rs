//! The reason→act→observe loop.
//!
//! Each iteration sends the working transcript to a provider, parses the
//! response into a [`Directive`], and either executes the requested tool
//! (feeding exactly one observation back before the next call) or
//! finalizes the answer. The loop is bounded: hitting the iteration
//! budget fails the state exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arbiter_core::error::Error;
use arbiter_core::event::{DomainEvent, EventBus};
use arbiter_core::message::{Message, Role};
use arbiter_core::provider::{Provider, ProviderRequest, Usage};
use arbiter_core::retrieval::RetrievalHit;
use arbiter_core::tool::ToolCall;
use arbiter_tools::ToolDispatcher;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directive::{Directive, DirectiveParser, JsonDirectiveParser};
use crate::postprocess::{acknowledgment_for, post_process};
use crate::prompt::PromptBuilder;
use crate::state::{AgentState, AgentStatus, AgentStep};
use crate::stream_event::{AnswerStreamEvent, StreamErrorCode};

/// What a completed (successful) loop run produced.
#[derive(Debug, Clone)]
pub struct LoopRun {
    /// The post-processed final answer
    pub answer: String,

    /// Aggregate token usage across all iterations
    pub usage: Option<Usage>,

    /// The model that produced the final answer
    pub model: String,
}

/// The bounded reasoning loop.
pub struct ReasoningLoop {
    /// The LLM provider (typically a fallback chain)
    provider: Arc<dyn Provider>,

    /// The model to request
    model: String,

    /// Temperature setting
    temperature: f32,

    /// Max tokens per response
    max_tokens: Option<u32>,

    /// Tool dispatcher
    dispatcher: Arc<ToolDispatcher>,

    /// Parses provider output into directives
    parser: Arc<dyn DirectiveParser>,

    /// System prompt assembly
    prompt: PromptBuilder,

    /// Iteration budget per query
    max_iterations: u32,

    /// Wall-clock budget per query
    time_budget: Option<Duration>,

    /// Event bus for domain events
    event_bus: Arc<EventBus>,
}

impl ReasoningLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        dispatcher: Arc<ToolDispatcher>,
        prompt: PromptBuilder,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.3,
            max_tokens: None,
            dispatcher,
            parser: Arc::new(JsonDirectiveParser),
            prompt,
            max_iterations: 8,
            time_budget: None,
            event_bus,
        }
    }

    /// Set the iteration budget.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set a max-tokens cap per response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set a wall-clock budget for the whole run. Checked between
    /// iterations, so an in-flight provider call is not interrupted.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Swap in a different directive parser.
    pub fn with_parser(mut self, parser: Arc<dyn DirectiveParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Run the loop to completion, buffering each provider response.
    ///
    /// Mutates `state` in place: the transcript grows one assistant
    /// message per iteration (plus one observation per tool call), and
    /// the status ends `Done` on success or `Failed` on error.
    pub async fn run(
        &self,
        state: &mut AgentState,
        hits: &[RetrievalHit],
    ) -> Result<LoopRun, Error> {
        self.prepare_transcript(state, hits);

        let started = Instant::now();
        let mut total_usage: Option<Usage> = None;
        let mut model_used = self.model.clone();

        loop {
            if let Some(budget) = self.time_budget {
                if started.elapsed() >= budget {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    warn!(
                        session_id = %state.transcript.id,
                        elapsed_ms,
                        "Reasoning deadline exceeded"
                    );
                    state.transition(AgentStatus::TimedOut);
                    self.publish_error(state, "reasoning deadline exceeded");
                    return Err(Error::DeadlineExceeded { elapsed_ms });
                }
            }
            if state.iteration >= self.max_iterations {
                warn!(
                    session_id = %state.transcript.id,
                    iterations = state.iteration,
                    "Iteration budget exhausted"
                );
                state.transition(AgentStatus::Failed);
                self.publish_error(state, "iteration budget exhausted");
                return Err(Error::IterationBudgetExceeded {
                    iterations: state.iteration,
                });
            }
            state.iteration += 1;
            state.transition(AgentStatus::Reasoning);

            debug!(
                session_id = %state.transcript.id,
                iteration = state.iteration,
                "Loop iteration"
            );

            let request = self.request(state, false);
            let response = match self.provider.complete(request).await {
                Ok(r) => r,
                Err(e) => {
                    state.transition(AgentStatus::Failed);
                    self.publish_error(state, &e.to_string());
                    return Err(e.into());
                }
            };
            accumulate_usage(&mut total_usage, response.usage.clone());
            model_used = response.model.clone();

            match self.parser.parse(&response.text) {
                Directive::ToolRequest { name, input } => {
                    state.transition(AgentStatus::AwaitingTool);
                    let observation =
                        self.run_tool(state, &response.text, name, input).await;
                    debug!(ok = observation.ok, "Tool observation recorded");
                }
                Directive::FinalAnswer(text) => {
                    let answer = post_process(&state.query, &text);
                    state.transcript.push(Message::assistant(&answer));
                    state.push_step(AgentStep {
                        index: state.iteration,
                        thought: None,
                        tool_call: None,
                        observation: None,
                    });
                    state.final_answer = Some(answer.clone());
                    state.transition(AgentStatus::Done);

                    let tokens_used =
                        total_usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
                    info!(
                        session_id = %state.transcript.id,
                        iterations = state.iteration,
                        tokens = tokens_used,
                        "Answer generated"
                    );
                    self.event_bus.publish(DomainEvent::AnswerGenerated {
                        session_id: state.transcript.id.to_string(),
                        model: model_used.clone(),
                        tokens_used,
                        iterations: state.iteration,
                        timestamp: Utc::now(),
                    });

                    return Ok(LoopRun {
                        answer,
                        usage: total_usage,
                        model: model_used,
                    });
                }
            }
        }
    }

    /// Run the loop in streaming mode.
    ///
    /// Intermediate (tool-requesting) responses are buffered and never
    /// emitted. Once a response is recognizably plain text, its deltas
    /// are relayed as `Chunk` events as they arrive, with any
    /// `<scratch>` region filtered out even when its markers straddle
    /// delta boundaries. A retryable provider failure before anything
    /// has reached the consumer reopens the stream once instead of
    /// surfacing. The stream always ends with exactly one terminator,
    /// `Done` or `Error`, and a dropped receiver cancels the run at
    /// the next send.
    pub fn run_stream(
        self: Arc<Self>,
        mut state: AgentState,
        hits: Vec<RetrievalHit>,
    ) -> mpsc::Receiver<AnswerStreamEvent> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            self.prepare_transcript(&mut state, &hits);

            let started = Instant::now();
            let mut total_usage: Option<Usage> = None;
            let mut model_used = self.model.clone();
            // Acknowledgment prefix, emitted at most once before the
            // first relayed content chunk.
            let mut ack_pending = acknowledgment_for(&state.query);
            // Set once anything has been sent to the consumer; gates
            // the silent stream reopen below.
            let mut sent_any = false;

            loop {
                if let Some(budget) = self.time_budget {
                    if started.elapsed() >= budget {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        state.transition(AgentStatus::TimedOut);
                        self.publish_error(&state, "reasoning deadline exceeded");
                        let _ = tx
                            .send(AnswerStreamEvent::Error {
                                code: StreamErrorCode::Internal,
                                message: format!(
                                    "reasoning deadline exceeded after {elapsed_ms} ms"
                                ),
                            })
                            .await;
                        return;
                    }
                }
                if state.iteration >= self.max_iterations {
                    state.transition(AgentStatus::Failed);
                    self.publish_error(&state, "iteration budget exhausted");
                    let _ = tx
                        .send(AnswerStreamEvent::Error {
                            code: StreamErrorCode::Internal,
                            message: format!(
                                "iteration budget exhausted after {} iterations",
                                state.iteration
                            ),
                        })
                        .await;
                    return;
                }
                state.iteration += 1;
                state.transition(AgentStatus::Reasoning);

                let request = self.request(&state, true);
                let mut reopened = false;

                // One provider exchange, reopened at most once when a
                // retryable failure lands before anything has reached
                // the consumer.
                let (buffered, relaying, relayed) = 'attempt: loop {
                    let mut chunks = match self.provider.stream(request.clone()).await {
                        Ok(rx) => rx,
                        Err(e) => {
                            state.transition(AgentStatus::Failed);
                            self.publish_error(&state, &e.to_string());
                            let _ = tx
                                .send(AnswerStreamEvent::Error {
                                    code: StreamErrorCode::from_provider_error(&e),
                                    message: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    };

                    // Buffer until the response is decidable: a directive
                    // (or leading scratch region) is parsed whole and
                    // never relayed; anything else streams through as the
                    // final answer, with scratch regions filtered out
                    // even when their markers span delta boundaries.
                    let mut buffered = String::new();
                    let mut relaying = false;
                    let mut scratch = ScratchFilter::new();
                    let mut relayed = String::new();

                    loop {
                        match chunks.recv().await {
                            Some(Ok(chunk)) => {
                                if let Some(usage) = &chunk.usage {
                                    accumulate_usage(&mut total_usage, Some(usage.clone()));
                                }
                                if let Some(delta) = &chunk.delta {
                                    buffered.push_str(delta);
                                    let outgoing = if relaying {
                                        Some(delta.clone())
                                    } else if matches!(
                                        first_content_kind(&buffered),
                                        ContentKind::Prose
                                    ) {
                                        relaying = true;
                                        if let Some(ack) = ack_pending.take() {
                                            if tx
                                                .send(AnswerStreamEvent::Chunk {
                                                    content: ack.to_string(),
                                                })
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                            sent_any = true;
                                        }
                                        Some(buffered.clone())
                                    } else {
                                        None
                                    };
                                    if let Some(text) = outgoing {
                                        let safe = scratch.push(&text);
                                        if !safe.is_empty() {
                                            if tx
                                                .send(AnswerStreamEvent::Chunk {
                                                    content: safe.clone(),
                                                })
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                            sent_any = true;
                                            relayed.push_str(&safe);
                                        }
                                    }
                                }
                                if chunk.done {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                if e.is_retryable() && !sent_any && !reopened {
                                    reopened = true;
                                    warn!(
                                        session_id = %state.transcript.id,
                                        error = %e,
                                        "Stream failed before any output reached the caller, reopening"
                                    );
                                    continue 'attempt;
                                }
                                state.transition(AgentStatus::Failed);
                                self.publish_error(&state, &e.to_string());
                                let _ = tx
                                    .send(AnswerStreamEvent::Error {
                                        code: StreamErrorCode::from_provider_error(&e),
                                        message: e.to_string(),
                                    })
                                    .await;
                                return;
                            }
                            None => break,
                        }
                    }

                    if relaying {
                        // Release anything held back as a possible
                        // partial marker.
                        let tail = scratch.finish();
                        if !tail.is_empty() {
                            if tx
                                .send(AnswerStreamEvent::Chunk {
                                    content: tail.clone(),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                            sent_any = true;
                            relayed.push_str(&tail);
                        }
                    }
                    break 'attempt (buffered, relaying, relayed);
                };

                if relaying {
                    // The whole response streamed through: the filtered
                    // text is the answer.
                    state.transcript.push(Message::assistant(&relayed));
                    state.push_step(AgentStep {
                        index: state.iteration,
                        thought: None,
                        tool_call: None,
                        observation: None,
                    });
                    state.final_answer = Some(relayed);
                    state.transition(AgentStatus::Done);

                    let tokens_used =
                        total_usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
                    self.event_bus.publish(DomainEvent::AnswerGenerated {
                        session_id: state.transcript.id.to_string(),
                        model: model_used.clone(),
                        tokens_used,
                        iterations: state.iteration,
                        timestamp: Utc::now(),
                    });
                    let _ = tx
                        .send(AnswerStreamEvent::Done {
                            session_id: state.transcript.id.to_string(),
                            usage: total_usage,
                            iterations: state.iteration,
                        })
                        .await;
                    return;
                }

                // Buffered mode: a directive (or a fully structured
                // response that never turned into prose).
                match self.parser.parse(&buffered) {
                    Directive::ToolRequest { name, input } => {
                        state.transition(AgentStatus::AwaitingTool);
                        let observation =
                            self.run_tool(&mut state, &buffered, name, input).await;
                        debug!(ok = observation.ok, "Tool observation recorded");
                        model_used = self.model.clone();
                    }
                    Directive::FinalAnswer(text) => {
                        // post_process prepends the acknowledgment when
                        // one applies, so the pending one must not go
                        // out as its own chunk.
                        let answer = post_process(&state.query, &text);
                        state.transcript.push(Message::assistant(&answer));
                        state.push_step(AgentStep {
                            index: state.iteration,
                            thought: None,
                            tool_call: None,
                            observation: None,
                        });
                        state.final_answer = Some(answer.clone());
                        state.transition(AgentStatus::Done);

                        let tokens_used =
                            total_usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
                        self.event_bus.publish(DomainEvent::AnswerGenerated {
                            session_id: state.transcript.id.to_string(),
                            model: model_used.clone(),
                            tokens_used,
                            iterations: state.iteration,
                            timestamp: Utc::now(),
                        });

                        if tx
                            .send(AnswerStreamEvent::Chunk { content: answer })
                            .await
                            .is_err()
                        {
                            return;
                        }
                        let _ = tx
                            .send(AnswerStreamEvent::Done {
                                session_id: state.transcript.id.to_string(),
                                usage: total_usage,
                                iterations: state.iteration,
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        rx
    }

    /// Seed the transcript: system prompt first, then the user query.
    fn prepare_transcript(&self, state: &mut AgentState, hits: &[RetrievalHit]) {
        let system = self.prompt.build(hits, &self.dispatcher.descriptors());
        match state.transcript.messages.first() {
            Some(m) if m.role == Role::System => {
                state.transcript.messages[0] = Message::system(&system);
            }
            _ => {
                state.transcript.messages.insert(0, Message::system(&system));
            }
        }
        state.transcript.push(Message::user(state.query.clone()));
    }

    fn request(&self, state: &AgentState, stream: bool) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            messages: state.transcript.messages.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            stop: vec![],
        }
    }

    /// Execute one tool request and feed its observation back.
    ///
    /// Exactly one observation enters the transcript per call, whether
    /// the tool succeeded or not.
    async fn run_tool(
        &self,
        state: &mut AgentState,
        raw_response: &str,
        name: String,
        input: serde_json::Value,
    ) -> arbiter_core::tool::ToolResult {
        let call = ToolCall {
            call_id: format!("call_{}", Uuid::new_v4()),
            name,
            input,
        };

        state.transcript.push(Message::assistant(raw_response));

        let result = self.dispatcher.execute(&call).await;
        state
            .transcript
            .push(Message::observation(&call.call_id, result.observation_text()));

        state.push_step(AgentStep {
            index: state.iteration,
            thought: Some(raw_response.to_string()),
            tool_call: Some(call),
            observation: Some(result.clone()),
        });

        result
    }

    fn publish_error(&self, state: &AgentState, message: &str) {
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            context: format!("reasoning_loop:{}", state.transcript.id),
            error_message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

enum ContentKind {
    /// Only whitespace so far
    Undecided,
    /// Starts with `{` or a scratch tag: buffer it whole
    Structured,
    /// Plain prose: safe to relay
    Prose,
}

fn first_content_kind(buffered: &str) -> ContentKind {
    let trimmed = buffered.trim_start();
    if trimmed.is_empty() {
        return ContentKind::Undecided;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('<') {
        return ContentKind::Structured;
    }
    ContentKind::Prose
}

const SCRATCH_OPEN: &str = "<scratch>";
const SCRATCH_CLOSE: &str = "</scratch>";

/// Drops `<scratch>…</scratch>` regions from streamed text.
///
/// Stateful so a marker split across deltas is still caught: text that
/// could be the start of a marker is held back until the next delta
/// (or [`ScratchFilter::finish`]) disambiguates it.
struct ScratchFilter {
    pending: String,
    in_scratch: bool,
}

impl ScratchFilter {
    fn new() -> Self {
        Self {
            pending: String::new(),
            in_scratch: false,
        }
    }

    /// Feed a delta; returns the part that is safe to emit.
    fn push(&mut self, delta: &str) -> String {
        self.pending.push_str(delta);
        let mut out = String::new();
        loop {
            if self.in_scratch {
                if let Some(pos) = self.pending.find(SCRATCH_CLOSE) {
                    self.pending.drain(..pos + SCRATCH_CLOSE.len());
                    self.in_scratch = false;
                } else {
                    let keep = partial_marker_start(&self.pending, SCRATCH_CLOSE);
                    self.pending.drain(..keep);
                    return out;
                }
            } else if let Some(pos) = self.pending.find(SCRATCH_OPEN) {
                out.push_str(&self.pending[..pos]);
                self.pending.drain(..pos + SCRATCH_OPEN.len());
                self.in_scratch = true;
            } else {
                let keep = partial_marker_start(&self.pending, SCRATCH_OPEN);
                out.push_str(&self.pending[..keep]);
                self.pending.drain(..keep);
                return out;
            }
        }
    }

    /// Stream ended: release held text. An unterminated scratch region
    /// is dropped rather than leaked.
    fn finish(&mut self) -> String {
        if self.in_scratch {
            self.pending.clear();
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }
}

/// Byte index where a trailing partial occurrence of `marker` begins,
/// or the text length when the tail cannot open one.
fn partial_marker_start(text: &str, marker: &str) -> usize {
    match text.rfind('<') {
        Some(idx) if marker.starts_with(&text[idx..]) => idx,
        _ => text.len(),
    }
}

fn accumulate_usage(total: &mut Option<Usage>, usage: Option<Usage>) {
    let Some(u) = usage else { return };
    match total {
        Some(t) => {
            t.prompt_tokens += u.prompt_tokens;
            t.completion_tokens += u.completion_tokens;
            t.total_tokens += u.total_tokens;
        }
        None => *total = Some(u),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedResponse, SequentialMockProvider};
    use arbiter_config::PersonaConfig;
    use arbiter_core::error::{ProviderError, ToolError};
    use arbiter_core::message::Transcript;
    use arbiter_core::provider::{ProviderResponse, StreamChunk};
    use arbiter_core::tool::{Tool, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its input back"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn invoke(&self, input: serde_json::Value) -> Result<String, ToolError> {
            Ok(format!("echo: {input}"))
        }
    }

    fn persona() -> PersonaConfig {
        PersonaConfig {
            name: "Test Assistant".into(),
            description: "Answers test questions.".into(),
        }
    }

    fn dispatcher() -> Arc<ToolDispatcher> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        Arc::new(ToolDispatcher::new(registry))
    }

    fn make_loop(provider: Arc<dyn Provider>) -> ReasoningLoop {
        ReasoningLoop::new(
            provider,
            "test-model",
            dispatcher(),
            PromptBuilder::new(persona()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn plain_text_is_the_final_answer() {
        let provider = Arc::new(SequentialMockProvider::single_text(
            "The standard rate is 21%.",
        ));
        let runner = make_loop(provider.clone());

        let mut state = AgentState::new("What is the standard rate?", Transcript::new());
        let run = runner.run(&mut state, &[]).await.unwrap();

        assert_eq!(run.answer, "The standard rate is 21%.");
        assert_eq!(state.status(), AgentStatus::Done);
        assert_eq!(state.iteration, 1);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(state.final_answer.as_deref(), Some("The standard rate is 21%."));
    }

    #[tokio::test]
    async fn tool_call_gets_exactly_one_observation() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            "echo",
            serde_json::json!({"msg": "hi"}),
            "Done.",
        ));
        let runner = make_loop(provider.clone());

        let mut state = AgentState::new("use the echo tool", Transcript::new());
        let run = runner.run(&mut state, &[]).await.unwrap();

        assert_eq!(run.answer, "Done.");
        assert_eq!(state.iteration, 2);
        assert_eq!(state.tool_calls_made(), 1);

        // Step 1 pairs the call with its observation
        let step = &state.steps[0];
        let call = step.tool_call.as_ref().unwrap();
        let obs = step.observation.as_ref().unwrap();
        assert_eq!(obs.call_id, call.call_id);
        assert!(obs.ok);

        // The observation reached the provider before the second call
        let second_request = &provider.requests_seen()[1];
        let tool_messages: Vec<_> = second_request
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some(call.call_id.as_str()));
    }

    #[tokio::test]
    async fn unknown_tool_failure_still_feeds_back() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            "no_such_tool",
            serde_json::json!({}),
            "Recovered.",
        ));
        let runner = make_loop(provider);

        let mut state = AgentState::new("test", Transcript::new());
        let run = runner.run(&mut state, &[]).await.unwrap();

        assert_eq!(run.answer, "Recovered.");
        let obs = state.steps[0].observation.as_ref().unwrap();
        assert!(!obs.ok);
        assert!(obs.observation_text().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn iteration_budget_fails_exactly_once() {
        let directive =
            serde_json::json!({"action": "echo", "input": {"n": 1}}).to_string();
        let provider = Arc::new(SequentialMockProvider::new(vec![
            ScriptedResponse::Text(directive.clone()),
            ScriptedResponse::Text(directive.clone()),
            ScriptedResponse::Text(directive),
        ]));
        let runner = make_loop(provider.clone()).with_max_iterations(2);

        let mut state = AgentState::new("loop forever", Transcript::new());
        let err = runner.run(&mut state, &[]).await.unwrap_err();

        assert!(matches!(err, Error::IterationBudgetExceeded { iterations: 2 }));
        assert_eq!(state.status(), AgentStatus::Failed);
        assert_eq!(provider.call_count(), 2);

        // Terminal state holds: no further transitions
        assert!(!state.transition(AgentStatus::Done));
        assert_eq!(state.status(), AgentStatus::Failed);
    }

    #[tokio::test]
    async fn fatal_provider_error_fails_the_state() {
        let provider = Arc::new(SequentialMockProvider::new(vec![ScriptedResponse::Error(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let runner = make_loop(provider);

        let mut state = AgentState::new("test", Transcript::new());
        let err = runner.run(&mut state, &[]).await.unwrap_err();

        assert!(matches!(err, Error::Provider(_)));
        assert_eq!(state.status(), AgentStatus::Failed);
    }

    #[tokio::test]
    async fn emotional_query_gets_acknowledgment() {
        let provider = Arc::new(SequentialMockProvider::single_text(
            "You can file an extension.",
        ));
        let runner = make_loop(provider);

        let mut state =
            AgentState::new("I'm worried I missed the filing deadline", Transcript::new());
        let run = runner.run(&mut state, &[]).await.unwrap();

        assert!(run.answer.starts_with("I understand"));
        assert!(run.answer.ends_with("You can file an extension."));
    }

    #[tokio::test]
    async fn answer_generated_event_is_published() {
        let provider = Arc::new(SequentialMockProvider::single_text("Answer."));
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();

        let runner = ReasoningLoop::new(
            provider,
            "test-model",
            dispatcher(),
            PromptBuilder::new(persona()),
            bus.clone(),
        );
        let mut state = AgentState::new("q", Transcript::new());
        runner.run(&mut state, &[]).await.unwrap();

        let event = events.recv().await.unwrap();
        match &*event {
            DomainEvent::AnswerGenerated { iterations, .. } => assert_eq!(*iterations, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // --- Streaming ---

    /// Streams a scripted text delta-by-delta. A second scripted text,
    /// if present, is served on the next `stream` call.
    struct ChunkedProvider {
        scripts: std::sync::Mutex<Vec<Vec<String>>>,
        cancelled: Arc<AtomicBool>,
    }

    impl ChunkedProvider {
        fn new(scripts: Vec<Vec<&str>>) -> Self {
            Self {
                scripts: std::sync::Mutex::new(
                    scripts
                        .into_iter()
                        .map(|s| s.into_iter().map(String::from).collect())
                        .collect(),
                ),
                cancelled: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Provider for ChunkedProvider {
        fn name(&self) -> &str {
            "chunked"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("stream only".into()))
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
        {
            let deltas = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    return Err(ProviderError::Unavailable("no more scripts".into()));
                }
                scripts.remove(0)
            };
            let cancelled = self.cancelled.clone();
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                for delta in deltas {
                    if tx
                        .send(Ok(StreamChunk {
                            delta: Some(delta),
                            done: false,
                            usage: None,
                        }))
                        .await
                        .is_err()
                    {
                        cancelled.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        delta: None,
                        done: true,
                        usage: Some(Usage {
                            prompt_tokens: 10,
                            completion_tokens: 5,
                            total_tokens: 15,
                        }),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    async fn collect_events(
        mut rx: mpsc::Receiver<AnswerStreamEvent>,
    ) -> Vec<AnswerStreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn stream_relays_prose_chunks_with_done_terminator() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            "The rate ", "is ", "21%.",
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("What is the rate?", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        let chunks: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.join(""), "The rate is 21%.");

        match events.last().unwrap() {
            AnswerStreamEvent::Done { iterations, usage, .. } => {
                assert_eq!(*iterations, 1);
                assert_eq!(usage.as_ref().unwrap().total_tokens, 15);
            }
            other => panic!("expected Done terminator, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_buffers_tool_directive_without_leaking() {
        let provider = Arc::new(ChunkedProvider::new(vec![
            vec![r#"{"action": "echo","#, r#" "input": {"x": 1}}"#],
            vec!["All ", "done."],
        ]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("use echo then answer", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        // No chunk ever contains directive JSON
        for event in &events {
            if let AnswerStreamEvent::Chunk { content } = event {
                assert!(!content.contains("action"), "directive leaked: {content}");
            }
        }

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "All done.");

        match events.last().unwrap() {
            AnswerStreamEvent::Done { iterations, .. } => assert_eq!(*iterations, 2),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_emits_acknowledgment_before_first_chunk() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            "File an ", "extension.",
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new(
            "I'm stressed about the filing deadline",
            Transcript::new(),
        );
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        match &events[0] {
            AnswerStreamEvent::Chunk { content } => {
                assert!(content.starts_with("I understand"));
            }
            other => panic!("expected acknowledgment chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_the_run() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            "a", "b", "c", "d", "e", "f", "g", "h",
        ]]));
        let cancelled = provider.cancelled.clone();
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("long answer", Transcript::new());
        let mut rx = runner.run_stream(state, vec![]);

        // Take two chunks, then walk away
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        drop(rx);

        // The relay notices the closed channel at its next send and the
        // provider stream is dropped in turn
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stream_open_failure_maps_to_error_code() {
        struct QuotaProvider;

        #[async_trait]
        impl Provider for QuotaProvider {
            fn name(&self) -> &str {
                "quota"
            }
            async fn complete(
                &self,
                _request: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                Err(ProviderError::RateLimited { retry_after_secs: 30 })
            }
            async fn stream(
                &self,
                _request: ProviderRequest,
            ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
            {
                Err(ProviderError::RateLimited { retry_after_secs: 30 })
            }
        }

        let runner = Arc::new(make_loop(Arc::new(QuotaProvider)));
        let state = AgentState::new("q", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            AnswerStreamEvent::Error { code, .. } => {
                assert_eq!(*code, StreamErrorCode::QuotaExceeded);
            }
            other => panic!("expected Error terminator, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_iteration_budget_terminates_with_error() {
        let directive = r#"{"action": "echo", "input": {}}"#;
        let provider = Arc::new(ChunkedProvider::new(vec![
            vec![directive],
            vec![directive],
            vec![directive],
        ]));
        let runner = Arc::new(make_loop(provider).with_max_iterations(2));

        let state = AgentState::new("loop forever", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            AnswerStreamEvent::Error { code: StreamErrorCode::Internal, .. }
        ));
    }

    #[tokio::test]
    async fn stream_suppresses_scratch_after_prose_began() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            "The answer ",
            "<scratch>working through the deduction tables</scratch>",
            "is 5.",
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("What is the result?", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        let chunks: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.join(""), "The answer is 5.");
        for chunk in &chunks {
            assert!(!chunk.contains("scratch"), "leaked: {chunk}");
            assert!(!chunk.contains("working through"), "leaked: {chunk}");
        }
        assert!(matches!(events.last().unwrap(), AnswerStreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn stream_suppresses_scratch_split_across_deltas() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            "Rate is 21%. ",
            "<scr",
            "atch>check the updated tables</scra",
            "tch>",
            "Final.",
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("What is the rate?", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Rate is 21%. Final.");
    }

    #[tokio::test]
    async fn stream_acknowledges_buffered_answer_exactly_once() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec![
            r#"{"final_answer": "File an extension."}"#,
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new(
            "I'm stressed about the filing deadline",
            Transcript::new(),
        );
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert!(text.starts_with("I understand"), "missing acknowledgment: {text}");
        assert_eq!(text.matches("I understand").count(), 1, "duplicated: {text}");
        assert!(text.ends_with("File an extension."));
        assert!(matches!(events.last().unwrap(), AnswerStreamEvent::Done { .. }));
    }

    enum StreamItem {
        Delta(&'static str),
        Fail(ProviderError),
    }

    /// Serves one scripted stream per `stream` call; a `Fail` item ends
    /// that stream with the given error instead of a done chunk.
    struct ScriptedStreamProvider {
        scripts: std::sync::Mutex<Vec<Vec<StreamItem>>>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl ScriptedStreamProvider {
        fn new(scripts: Vec<Vec<StreamItem>>) -> Self {
            Self {
                scripts: std::sync::Mutex::new(scripts),
                calls: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedStreamProvider {
        fn name(&self) -> &str {
            "scripted_stream"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("stream only".into()))
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    return Err(ProviderError::Unavailable("no more scripts".into()));
                }
                scripts.remove(0)
            };
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                for item in items {
                    match item {
                        StreamItem::Delta(text) => {
                            if tx
                                .send(Ok(StreamChunk {
                                    delta: Some(text.to_string()),
                                    done: false,
                                    usage: None,
                                }))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        StreamItem::Fail(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        delta: None,
                        done: true,
                        usage: None,
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn stream_reopens_when_failure_precedes_any_output() {
        let provider = Arc::new(ScriptedStreamProvider::new(vec![
            vec![
                StreamItem::Delta(r#"{"action": "ec"#),
                StreamItem::Fail(ProviderError::RateLimited { retry_after_secs: 1 }),
            ],
            vec![StreamItem::Delta(r#"{"action": "echo", "input": {"x": 1}}"#)],
            vec![StreamItem::Delta("All good.")],
        ]));
        let calls = provider.calls.clone();
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("use echo then answer", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        assert!(
            !events.iter().any(|e| matches!(e, AnswerStreamEvent::Error { .. })),
            "failure surfaced despite nothing relayed: {events:?}"
        );
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AnswerStreamEvent::Chunk { content } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "All good.");
        match events.last().unwrap() {
            AnswerStreamEvent::Done { iterations, .. } => assert_eq!(*iterations, 2),
            other => panic!("expected Done, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_failure_after_relay_surfaces_error() {
        let provider = Arc::new(ScriptedStreamProvider::new(vec![vec![
            StreamItem::Delta("Partial prose "),
            StreamItem::Fail(ProviderError::RateLimited { retry_after_secs: 1 }),
        ]]));
        let runner = Arc::new(make_loop(provider));

        let state = AgentState::new("q", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        assert!(matches!(
            &events[0],
            AnswerStreamEvent::Chunk { content } if content == "Partial prose "
        ));
        match events.last().unwrap() {
            AnswerStreamEvent::Error { code, .. } => {
                assert_eq!(*code, StreamErrorCode::QuotaExceeded);
            }
            other => panic!("expected Error terminator, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_exceeded_times_out_the_state() {
        let provider = Arc::new(SequentialMockProvider::single_text("never reached"));
        let runner = make_loop(provider.clone()).with_time_budget(Duration::ZERO);

        let mut state = AgentState::new("slow question", Transcript::new());
        let err = runner.run(&mut state, &[]).await.unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(state.status(), AgentStatus::TimedOut);
        assert_eq!(provider.call_count(), 0);

        // Terminal state holds: no further transitions
        assert!(!state.transition(AgentStatus::Reasoning));
        assert_eq!(state.status(), AgentStatus::TimedOut);
    }

    #[tokio::test]
    async fn stream_deadline_terminates_with_error() {
        let provider = Arc::new(ChunkedProvider::new(vec![vec!["unused"]]));
        let runner = Arc::new(make_loop(provider).with_time_budget(Duration::ZERO));

        let state = AgentState::new("slow question", Transcript::new());
        let rx = runner.run_stream(state, vec![]);
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            AnswerStreamEvent::Error { code, message } => {
                assert_eq!(*code, StreamErrorCode::Internal);
                assert!(message.contains("deadline"));
            }
            other => panic!("expected Error terminator, got {other:?}"),
        }
    }

    #[test]
    fn scratch_filter_passes_plain_text() {
        let mut filter = ScratchFilter::new();
        assert_eq!(filter.push("no markers here"), "no markers here");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn scratch_filter_holds_then_releases_a_lone_bracket() {
        let mut filter = ScratchFilter::new();
        assert_eq!(filter.push("5 <"), "5 ");
        assert_eq!(filter.push(" 6"), "< 6");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn scratch_filter_drops_unterminated_region() {
        let mut filter = ScratchFilter::new();
        assert_eq!(filter.push("ok <scratch>half finished"), "ok ");
        assert_eq!(filter.finish(), "");
    }
}
