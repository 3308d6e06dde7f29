//! Query router — classifies a query into a retrieval strategy.
//!
//! Detectors run in a fixed order, first match wins:
//!
//! 1. **Exploratory research** — open-ended phrasing → search every
//!    configured partition with the multi-step strategy.
//! 2. **Cross-partition synthesis** — the query touches two or more
//!    domains → search the matched set together.
//! 3. **Default** — the best-matching single partition from the static
//!    domain map; no match at all silently falls through to the
//!    configured default partition.

use arbiter_config::RoutingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// How the retrieval stage should treat a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Open-ended research across all relevant partitions
    MultiStepResearch,
    /// Compound query spanning several domains
    CrossSynthesis,
    /// Focused query answered from one partition
    SinglePartition,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiStepResearch => "multi_step_research",
            Self::CrossSynthesis => "cross_synthesis",
            Self::SinglePartition => "single_partition",
        }
    }
}

/// Caller-supplied routing hints.
#[derive(Debug, Clone, Default)]
pub struct QuerySignals {
    /// Domains the caller already knows are relevant
    pub preferred_domains: Vec<String>,
}

/// The routing decision for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub strategy: RetrievalStrategy,
    /// Partitions to search, in deterministic order
    pub partitions: Vec<String>,
}

/// Classifies queries against the configured domain map.
pub struct QueryRouter {
    config: RoutingConfig,
}

impl QueryRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Classify a query. Never fails: an unmatched query routes to the
    /// default partition.
    pub fn route(&self, query: &str, signals: &QuerySignals) -> Route {
        let query_lower = query.to_lowercase();

        // Detector 1: exploratory research
        if self.is_exploratory(&query_lower) {
            let partitions = self.all_partitions();
            debug!(partitions = partitions.len(), "Router: exploratory query");
            return Route {
                strategy: RetrievalStrategy::MultiStepResearch,
                partitions,
            };
        }

        // Detector 2: cross-partition synthesis
        let matched = self.matched_domains(&query_lower, signals);
        if matched.len() >= 2 {
            let partitions: Vec<String> = matched
                .iter()
                .filter_map(|d| self.config.domains.get(d).map(|c| c.partition.clone()))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if partitions.len() >= 2 {
                debug!(domains = ?matched, "Router: cross-partition query");
                return Route {
                    strategy: RetrievalStrategy::CrossSynthesis,
                    partitions,
                };
            }
        }

        // Default: best-matching single partition
        let partition = self
            .best_domain(&query_lower, signals)
            .and_then(|d| self.config.domains.get(&d).map(|c| c.partition.clone()))
            .unwrap_or_else(|| self.config.default_partition.clone());

        debug!(partition = %partition, "Router: single partition");
        Route {
            strategy: RetrievalStrategy::SinglePartition,
            partitions: vec![partition],
        }
    }

    fn is_exploratory(&self, query_lower: &str) -> bool {
        self.config
            .exploratory_markers
            .iter()
            .any(|marker| query_lower.contains(marker.as_str()))
    }

    /// Domains whose keywords appear in the query, in sorted order for
    /// determinism. Caller-preferred domains count as matched.
    fn matched_domains(&self, query_lower: &str, signals: &QuerySignals) -> Vec<String> {
        let mut matched: BTreeSet<String> = signals
            .preferred_domains
            .iter()
            .filter(|d| self.config.domains.contains_key(*d))
            .cloned()
            .collect();

        for (domain, cfg) in &self.config.domains {
            if cfg
                .keywords
                .iter()
                .any(|kw| query_lower.contains(kw.to_lowercase().as_str()))
            {
                matched.insert(domain.clone());
            }
        }
        matched.into_iter().collect()
    }

    /// The single domain with the most keyword matches; ties resolve to
    /// the lexicographically first domain name.
    fn best_domain(&self, query_lower: &str, signals: &QuerySignals) -> Option<String> {
        if let Some(preferred) = signals
            .preferred_domains
            .iter()
            .find(|d| self.config.domains.contains_key(*d))
        {
            return Some(preferred.clone());
        }

        let mut best: Option<(usize, String)> = None;
        let mut domains: Vec<_> = self.config.domains.iter().collect();
        domains.sort_by_key(|(name, _)| name.to_string());

        for (domain, cfg) in domains {
            let matches = cfg
                .keywords
                .iter()
                .filter(|kw| query_lower.contains(kw.to_lowercase().as_str()))
                .count();
            if matches > 0 && best.as_ref().is_none_or(|(n, _)| matches > *n) {
                best = Some((matches, domain.clone()));
            }
        }
        best.map(|(_, domain)| domain)
    }

    fn all_partitions(&self) -> Vec<String> {
        let mut partitions: BTreeSet<String> = self
            .config
            .domains
            .values()
            .map(|c| c.partition.clone())
            .collect();
        partitions.insert(self.config.default_partition.clone());
        partitions.into_iter().collect()
    }
}
