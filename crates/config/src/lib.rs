//! Configuration loading, validation, and management for Arbiter.
//!
//! Loads configuration from `~/.arbiter/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.arbiter/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Ordered provider fallback chains, keyed by task category.
    /// The "default" key is used when no category-specific chain exists.
    #[serde(default)]
    pub fallback: HashMap<String, Vec<String>>,

    /// Query routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Cross-partition conflict configuration
    #[serde(default)]
    pub conflicts: ConflictConfig,

    /// Agent loop configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Persona shaping the answer prompt
    #[serde(default)]
    pub persona: PersonaConfig,

    /// External tool-protocol endpoint, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_protocol: Option<ToolProtocolConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            providers: HashMap::new(),
            fallback: HashMap::new(),
            routing: RoutingConfig::default(),
            conflicts: ConflictConfig::default(),
            agent: AgentConfig::default(),
            persona: PersonaConfig::default(),
            tool_protocol: None,
        }
    }
}

/// Per-provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider-specific API key (falls back to the global key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model override for this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Per-provider request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

/// A knowledge domain the router can map queries onto.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    /// The partition serving this domain
    pub partition: String,

    /// Keywords that signal this domain
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Query routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Domain name → partition + keyword signals
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,

    /// Partition used when no domain matches
    #[serde(default = "default_partition")]
    pub default_partition: String,

    /// Phrases marking an open-ended, exploratory query
    #[serde(default = "default_exploratory_markers")]
    pub exploratory_markers: Vec<String>,

    /// Hits requested per partition
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_partition() -> String {
    "tax_knowledge".into()
}

fn default_exploratory_markers() -> Vec<String> {
    [
        "research",
        "compare",
        "everything about",
        "in depth",
        "deep dive",
        "investigate",
        "overview of",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_top_k() -> usize {
    5
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut domains = HashMap::new();
        domains.insert(
            "tax".into(),
            DomainConfig {
                partition: "tax_knowledge".into(),
                keywords: ["tax", "vat", "deduction", "income", "filing", "return"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
        );
        domains.insert(
            "tax_updates".into(),
            DomainConfig {
                partition: "tax_updates".into(),
                keywords: ["new rule", "change", "latest", "update", "this year"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
        );
        domains.insert(
            "payroll".into(),
            DomainConfig {
                partition: "payroll_knowledge".into(),
                keywords: ["payroll", "salary", "wage", "employer", "social security"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
        );
        Self {
            domains,
            default_partition: default_partition(),
            exploratory_markers: default_exploratory_markers(),
            top_k: default_top_k(),
        }
    }
}

/// A statically configured pair of partitions known to potentially hold
/// contradictory information about the same topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictPairConfig {
    pub partition_a: String,
    pub partition_b: String,

    /// When set, names the side that temporally supersedes the other;
    /// the pair is then resolved as a temporal conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates_side: Option<String>,

    /// Per-pair override of the loser score penalty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty: Option<f32>,
}

/// Conflict resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Candidate pairs, in declaration order (order breaks score ties)
    #[serde(default)]
    pub pairs: Vec<ConflictPairConfig>,

    /// Score multiplier applied to conflict losers (0 < penalty < 1)
    #[serde(default = "default_penalty")]
    pub penalty: f32,
}

fn default_penalty() -> f32 {
    0.5
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            pairs: vec![ConflictPairConfig {
                partition_a: "tax_knowledge".into(),
                partition_b: "tax_updates".into(),
                updates_side: Some("tax_updates".into()),
                penalty: None,
            }],
            penalty: default_penalty(),
        }
    }
}

/// Agent loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum reason→act→observe iterations per query
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Task category used to select the fallback chain
    #[serde(default = "default_task_category")]
    pub task_category: String,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_task_category() -> String {
    "default".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            task_category: default_task_category(),
        }
    }
}

/// Persona shaping the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,

    #[serde(default = "default_persona_description")]
    pub description: String,
}

fn default_persona_name() -> String {
    "Arbiter".into()
}
fn default_persona_description() -> String {
    "A careful advisory assistant. Answers are grounded in the retrieved \
     context, cite their sources, and say so when the context is insufficient."
        .into()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            description: default_persona_description(),
        }
    }
}

/// External tool-protocol endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProtocolConfig {
    /// Base URL of the tool server
    pub base_url: String,

    /// Optional bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl AppConfig {
    /// Load from the default location with environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        if config.api_key.is_none() {
            config.api_key = std::env::var("ARBITER_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("ARBITER_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("ARBITER_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load from a specific path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// The configuration directory (`~/.arbiter`).
    pub fn config_dir() -> PathBuf {
        home_dir().join(".arbiter")
    }

    /// Validate settings that can't be expressed in the type system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(format!(
                "default_temperature must be in [0.0, 2.0], got {}",
                self.default_temperature
            )));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.conflicts.penalty) || self.conflicts.penalty == 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "conflicts.penalty must be in (0.0, 1.0), got {}",
                self.conflicts.penalty
            )));
        }

        for pair in &self.conflicts.pairs {
            if let Some(side) = &pair.updates_side
                && side != &pair.partition_a
                && side != &pair.partition_b
            {
                return Err(ConfigError::ValidationError(format!(
                    "conflict pair ({}, {}): updates_side '{}' matches neither partition",
                    pair.partition_a, pair.partition_b, side
                )));
            }
            if let Some(penalty) = pair.penalty
                && (!(0.0..1.0).contains(&penalty) || penalty == 0.0)
            {
                return Err(ConfigError::ValidationError(format!(
                    "conflict pair ({}, {}): penalty must be in (0.0, 1.0)",
                    pair.partition_a, pair.partition_b
                )));
            }
        }

        for (category, chain) in &self.fallback {
            if chain.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "fallback chain '{category}' is empty"
                )));
            }
        }

        Ok(())
    }

    /// The ordered fallback chain for a task category.
    ///
    /// Falls back to the "default" chain, then to a one-element chain of
    /// the default provider.
    pub fn fallback_chain(&self, category: &str) -> Vec<String> {
        self.fallback
            .get(category)
            .or_else(|| self.fallback.get("default"))
            .cloned()
            .unwrap_or_else(|| vec![self.default_provider.clone()])
    }
}

fn home_dir() -> PathBuf {
    #[cfg(windows)]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    }
    #[cfg(not(windows))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_provider, "openai");
        assert!((config.conflicts.penalty - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.agent.max_iterations, 10);
    }

    #[test]
    fn parses_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
default_provider = "anthropic"

[fallback]
default = ["anthropic", "openai"]

[[conflicts.pairs]]
partition_a = "tax_knowledge"
partition_b = "tax_updates"
updates_side = "tax_updates"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.default_provider, "anthropic");
        assert_eq!(config.fallback_chain("default"), vec!["anthropic", "openai"]);
        assert_eq!(
            config.conflicts.pairs[0].updates_side.as_deref(),
            Some("tax_updates")
        );
    }

    #[test]
    fn rejects_bad_updates_side() {
        let config = AppConfig {
            conflicts: ConflictConfig {
                pairs: vec![ConflictPairConfig {
                    partition_a: "a".into(),
                    partition_b: "b".into(),
                    updates_side: Some("c".into()),
                    penalty: None,
                }],
                penalty: 0.5,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_penalty() {
        let config = AppConfig {
            conflicts: ConflictConfig {
                pairs: vec![],
                penalty: 1.5,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_chain_falls_back_to_default_provider() {
        let config = AppConfig::default();
        assert_eq!(config.fallback_chain("research"), vec!["openai"]);
    }

    #[test]
    fn fallback_chain_uses_category_then_default() {
        let mut config = AppConfig::default();
        config
            .fallback
            .insert("default".into(), vec!["openai".into(), "anthropic".into()]);
        config
            .fallback
            .insert("research".into(), vec!["anthropic".into()]);

        assert_eq!(config.fallback_chain("research"), vec!["anthropic"]);
        assert_eq!(config.fallback_chain("chat"), vec!["openai", "anthropic"]);
    }
}
