//! Provider registry — builds providers and fallback chains from config.

use crate::fallback::FallbackChain;
use crate::openai_compat::OpenAiCompatProvider;
use arbiter_config::AppConfig;
use arbiter_core::error::ProviderError;
use arbiter_core::event::EventBus;
use arbiter_core::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Holds every configured provider, keyed by name.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Build providers from configuration.
    ///
    /// Every entry in `[providers]` becomes an OpenAI-compatible adapter;
    /// the default provider is created implicitly if not listed.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

        for (name, provider_config) in &config.providers {
            let api_key = provider_config
                .api_key
                .clone()
                .or_else(|| config.api_key.clone())
                .unwrap_or_default();
            let base_url = provider_config
                .api_url
                .clone()
                .unwrap_or_else(|| default_base_url(name));

            let provider = OpenAiCompatProvider::new(
                name,
                &base_url,
                &api_key,
                provider_config.timeout_secs,
            )?;
            providers.insert(name.clone(), Arc::new(provider));
        }

        if !providers.contains_key(&config.default_provider) {
            let api_key = config.api_key.clone().unwrap_or_default();
            let base_url = default_base_url(&config.default_provider);
            let provider =
                OpenAiCompatProvider::new(&config.default_provider, &base_url, &api_key, 120)?;
            providers.insert(config.default_provider.clone(), Arc::new(provider));
        }

        debug!(count = providers.len(), "Built provider registry");

        Ok(Self {
            providers,
            default_provider: config.default_provider.clone(),
        })
    }

    /// Register a provider, replacing any existing entry with that name.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Get the default provider.
    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.get(&self.default_provider)
    }

    /// List registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Assemble the fallback chain for a task category.
    ///
    /// The chain order comes from `config.fallback_chain(category)`;
    /// chain entries naming unknown providers are an error rather than
    /// being skipped, since a typo would silently shorten the chain.
    pub fn chain_for(
        &self,
        config: &AppConfig,
        category: &str,
        events: Option<Arc<EventBus>>,
    ) -> Result<FallbackChain, ProviderError> {
        let mut chain = FallbackChain::new(category);
        if let Some(bus) = events {
            chain = chain.with_events(bus);
        }

        for name in config.fallback_chain(category) {
            let provider = self.get(&name).ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "Fallback chain '{category}' references unknown provider '{name}'"
                ))
            })?;
            let timeout_secs = config
                .providers
                .get(&name)
                .map(|p| p.timeout_secs)
                .unwrap_or(120);
            chain = chain.add(provider, Duration::from_secs(timeout_secs));
        }

        Ok(chain)
    }
}

/// Default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "anthropic" => "https://api.anthropic.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
