//! Provider fallback — an ordered retry chain with per-provider timeouts.
//!
//! The chain distinguishes retryable failures (rate limits, outages,
//! timeouts, network errors) from fatal ones (bad credentials, invalid
//! requests). Retryable failures move on to the next provider with the
//! identical request; fatal failures surface immediately so a
//! misconfiguration is never papered over by burning through the chain.

use arbiter_core::error::ProviderError;
use arbiter_core::event::{DomainEvent, EventBus};
use arbiter_core::provider::{ProviderRequest, ProviderResponse, StreamChunk};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A provider that wraps an ordered list of providers and falls back
/// on retryable failure.
pub struct FallbackChain {
    name: String,
    chain: Vec<ChainEntry>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("name", &self.name)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

#[derive(Clone)]
struct ChainEntry {
    provider: Arc<dyn arbiter_core::Provider>,
    timeout: Duration,
}

impl FallbackChain {
    /// Create a new fallback chain with no entries.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
            events: None,
        }
    }

    /// Publish `ProviderFellBack` events to the given bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Add a provider to the chain with a custom timeout.
    pub fn add(mut self, provider: Arc<dyn arbiter_core::Provider>, timeout: Duration) -> Self {
        self.chain.push(ChainEntry { provider, timeout });
        self
    }

    /// Add a provider with the default timeout (120s).
    pub fn add_default(self, provider: Arc<dyn arbiter_core::Provider>) -> Self {
        self.add(provider, Duration::from_secs(120))
    }

    /// Number of providers in the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    fn publish_fellback(events: &Option<Arc<EventBus>>, from: &str, reason: &str) {
        if let Some(bus) = events {
            bus.publish(DomainEvent::ProviderFellBack {
                from: from.to_string(),
                reason: reason.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }
    }
}

#[async_trait]
impl arbiter_core::Provider for FallbackChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        if self.chain.is_empty() {
            return Err(ProviderError::NotConfigured(
                "No providers in fallback chain".into(),
            ));
        }

        let mut last_error: Option<ProviderError> = None;

        for (i, entry) in self.chain.iter().enumerate() {
            let provider_name = entry.provider.name().to_string();

            info!(
                provider = %provider_name,
                attempt = i + 1,
                total = self.chain.len(),
                "Fallback: trying provider"
            );

            match tokio::time::timeout(entry.timeout, entry.provider.complete(request.clone()))
                .await
            {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Fallback: retryable failure, trying next"
                    );
                    Self::publish_fellback(&self.events, &provider_name, &e.to_string());
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Fallback: fatal failure, not retrying"
                    );
                    return Err(e);
                }
                Err(_) => {
                    warn!(
                        provider = %provider_name,
                        timeout_secs = entry.timeout.as_secs(),
                        "Fallback: provider timed out, trying next"
                    );
                    let e = ProviderError::Timeout(format!(
                        "Provider '{}' timed out after {}s",
                        provider_name,
                        entry.timeout.as_secs()
                    ));
                    Self::publish_fellback(&self.events, &provider_name, &e.to_string());
                    last_error = Some(e);
                }
            }
        }

        // Unreachable with an empty last_error since the chain is non-empty
        Err(ProviderError::ChainExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts recorded".into()),
        ))
    }

    /// Stream with mid-chain fallback.
    ///
    /// A retryable failure that happens before any content has been
    /// relayed to the caller falls back silently (partial internal text
    /// is discarded). Once a content delta has gone out, the stream can
    /// no longer be retracted, so later failures are forwarded as
    /// errors instead of retried.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        if self.chain.is_empty() {
            return Err(ProviderError::NotConfigured(
                "No providers in fallback chain".into(),
            ));
        }

        let entries = self.chain.clone();
        let events = self.events.clone();
        let total = entries.len();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut last_error: Option<ProviderError> = None;

            'providers: for (i, entry) in entries.iter().enumerate() {
                let provider_name = entry.provider.name().to_string();

                info!(
                    provider = %provider_name,
                    attempt = i + 1,
                    total,
                    "Fallback: trying provider (streaming)"
                );

                let mut inner = match tokio::time::timeout(
                    entry.timeout,
                    entry.provider.stream(request.clone()),
                )
                .await
                {
                    Ok(Ok(rx)) => rx,
                    Ok(Err(e)) if e.is_retryable() => {
                        warn!(provider = %provider_name, error = %e, "Fallback: stream open failed, trying next");
                        Self::publish_fellback(&events, &provider_name, &e.to_string());
                        last_error = Some(e);
                        continue;
                    }
                    Ok(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(_) => {
                        let e = ProviderError::Timeout(format!(
                            "Provider '{}' stream timed out after {}s",
                            provider_name,
                            entry.timeout.as_secs()
                        ));
                        warn!(provider = %provider_name, "Fallback: stream open timed out, trying next");
                        Self::publish_fellback(&events, &provider_name, &e.to_string());
                        last_error = Some(e);
                        continue;
                    }
                };

                let mut relayed_content = false;

                loop {
                    match inner.recv().await {
                        Some(Ok(chunk)) => {
                            if chunk.delta.as_ref().is_some_and(|d| !d.is_empty()) {
                                relayed_content = true;
                            }
                            let done = chunk.done;
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Consumer disconnected; stop streaming
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            if !relayed_content && e.is_retryable() {
                                warn!(
                                    provider = %provider_name,
                                    error = %e,
                                    "Fallback: stream failed before first chunk, trying next"
                                );
                                Self::publish_fellback(&events, &provider_name, &e.to_string());
                                last_error = Some(e);
                                continue 'providers;
                            }
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        None => {
                            // Provider stream ended without a done marker
                            let _ = tx
                                .send(Ok(StreamChunk {
                                    delta: None,
                                    done: true,
                                    usage: None,
                                }))
                                .await;
                            return;
                        }
                    }
                }
            }

            let _ = tx
                .send(Err(ProviderError::ChainExhausted(
                    last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no attempts recorded".into()),
                )))
                .await;
        });

        Ok(rx)
    }
}
