//! # Arbiter Core
//!
//! Domain types, traits, and error definitions for the Arbiter answering
//! pipeline. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (knowledge partitions, LLM providers, tool
//! protocols, history stores) is defined as a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use history::HistoryStore;
pub use message::{Message, Role, SessionId, Transcript};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use retrieval::{ConflictAnnotation, ConflictStatus, PartitionClient, RetrievalHit};
pub use tool::{Tool, ToolCall, ToolDescriptor, ToolProtocolClient, ToolRegistry, ToolResult};
