//! LLM provider adapters for Arbiter.
//!
//! All providers implement the `arbiter_core::Provider` trait. The
//! fallback chain wraps an ordered list of providers and retries
//! retryable failures on the next entry; the registry builds both from
//! configuration.

pub mod fallback;
pub mod openai_compat;
pub mod registry;

pub use fallback::FallbackChain;
pub use openai_compat::OpenAiCompatProvider;
pub use registry::ProviderRegistry;
