//! Agent execution state — the reason→act→observe record for one query.

use arbiter_core::message::Transcript;
use arbiter_core::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};

/// Where the loop is in its lifecycle.
///
/// Terminal states (`Done`, `Failed`, `TimedOut`) are entered at most
/// once; [`AgentState::transition`] rejects any transition out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Reasoning,
    AwaitingTool,
    Done,
    Failed,
    TimedOut,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::TimedOut)
    }
}

/// One completed reasoning step, kept for inspection and debug output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// 1-based step index
    pub index: u32,

    /// The model's reasoning text for this step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,

    /// The tool request the step produced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,

    /// The observation fed back (exactly one per tool_call)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<ToolResult>,
}

/// The full execution state for a single query.
///
/// One per query, owned by one task; never shared across queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// The user's question
    pub query: String,

    /// The working transcript sent to the provider
    pub transcript: Transcript,

    /// Completed steps, in order
    pub steps: Vec<AgentStep>,

    /// Iterations consumed so far
    pub iteration: u32,

    status: AgentStatus,

    /// The final answer, set exactly when status becomes Done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
}

impl AgentState {
    pub fn new(query: impl Into<String>, transcript: Transcript) -> Self {
        Self {
            query: query.into(),
            transcript,
            steps: Vec::new(),
            iteration: 0,
            status: AgentStatus::Reasoning,
            final_answer: None,
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Attempt a status transition.
    ///
    /// Returns false (and leaves the state untouched) when the current
    /// status is already terminal.
    pub fn transition(&mut self, next: AgentStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        true
    }

    /// Record a completed step.
    pub fn push_step(&mut self, step: AgentStep) {
        self.steps.push(step);
    }

    /// Total tool calls made across all steps.
    pub fn tool_calls_made(&self) -> usize {
        self.steps.iter().filter(|s| s.tool_call.is_some()).count()
    }
}
