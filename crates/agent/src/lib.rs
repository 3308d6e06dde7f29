//! The reasoning loop and answering pipeline — the heart of Arbiter.
//!
//! A query flows through five stages:
//!
//! 1. **Route** — the query router picks the partitions to search
//! 2. **Retrieve** — a concurrent fan-out over the chosen partitions
//! 3. **Reconcile** — the conflict resolver settles contradictory hits
//! 4. **Reason** — a bounded reason→act→observe loop over a provider,
//!    executing tool directives and feeding observations back
//! 5. **Assemble** — post-processing and the final [`Answer`]
//!
//! The loop continues until the model emits a final answer (plain text
//! or an explicit answer block), the provider chain is exhausted, or
//! the iteration budget runs out.

pub mod directive;
pub mod loop_runner;
pub mod pipeline;
pub mod postprocess;
pub mod prompt;
pub mod state;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use directive::{Directive, DirectiveParser, JsonDirectiveParser};
pub use loop_runner::{LoopRun, ReasoningLoop};
pub use pipeline::{Answer, AnswerPipeline, AskOptions};
pub use prompt::PromptBuilder;
pub use state::{AgentState, AgentStatus, AgentStep};
pub use stream_event::{AnswerStreamEvent, StreamErrorCode};
