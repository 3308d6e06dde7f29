//! Conflict resolver — reconciles contradictory hits across partitions.
//!
//! Partitions that cover overlapping topics are declared as candidate
//! pairs in configuration. For each pair where both sides produced hits,
//! the resolver compares the top hit of each side and declares a winner:
//!
//! - **temporal** pairs (one side is the "updates" counterpart of the
//!   other): the updates side always wins, regardless of score.
//! - **semantic** pairs: the strictly higher score wins; exact ties favor
//!   the first-declared partition of the pair.
//!
//! No hit is ever dropped. Losers stay in the reconciled set with their
//! score multiplied by the configured penalty and a
//! `conflict_resolution` annotation; winners are tagged `preferred`.
//!
//! Lifetime counters (detected/resolved, by kind) are the only
//! process-wide mutable state in the core. They reset on restart only
//! and are exposed as a read-only snapshot copy.

use arbiter_config::{ConflictConfig, ConflictPairConfig};
use arbiter_core::retrieval::{ConflictAnnotation, ConflictStatus, RetrievalHit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

static DETECTED_TEMPORAL: AtomicU64 = AtomicU64::new(0);
static DETECTED_SEMANTIC: AtomicU64 = AtomicU64::new(0);
static RESOLVED_TEMPORAL: AtomicU64 = AtomicU64::new(0);
static RESOLVED_SEMANTIC: AtomicU64 = AtomicU64::new(0);

/// The rule class a conflict was resolved under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Temporal,
    Semantic,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporal => "temporal",
            Self::Semantic => "semantic",
        }
    }
}

/// One detected conflict between the top hits of a configured pair.
///
/// Request-scoped; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub partition_a: String,
    pub partition_b: String,
    pub hit_a: RetrievalHit,
    pub hit_b: RetrievalHit,
    pub kind: ConflictKind,
    pub winner_partition: String,
    pub loser_partition: String,
    pub reason: String,
}

/// Read-only copy of the lifetime conflict counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConflictStats {
    pub detected_temporal: u64,
    pub detected_semantic: u64,
    pub resolved_temporal: u64,
    pub resolved_semantic: u64,
}

/// Resolves conflicts between overlapping knowledge partitions.
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Detect conflicts among the pooled results.
    ///
    /// Emits one report per configured pair where both sides have at
    /// least one hit, comparing each side's top hit. Deterministic:
    /// identical inputs always produce identical reports.
    pub fn detect(
        &self,
        results_by_partition: &HashMap<String, Vec<RetrievalHit>>,
    ) -> Vec<ConflictReport> {
        let mut reports = Vec::new();

        for pair in &self.config.pairs {
            let Some(hit_a) = top_hit(results_by_partition, &pair.partition_a) else {
                continue;
            };
            let Some(hit_b) = top_hit(results_by_partition, &pair.partition_b) else {
                continue;
            };

            let report = self.judge(pair, hit_a.clone(), hit_b.clone());
            match report.kind {
                ConflictKind::Temporal => DETECTED_TEMPORAL.fetch_add(1, Ordering::Relaxed),
                ConflictKind::Semantic => DETECTED_SEMANTIC.fetch_add(1, Ordering::Relaxed),
            };

            debug!(
                pair = %format!("({}, {})", pair.partition_a, pair.partition_b),
                kind = report.kind.as_str(),
                winner = %report.winner_partition,
                "Conflict detected"
            );
            reports.push(report);
        }

        reports
    }

    /// Apply the reports to the pooled results.
    ///
    /// Returns the reconciled hit set (every input hit, losers penalized
    /// and annotated, winners tagged preferred, sorted by adjusted score
    /// descending with ties going to the first-declared partition)
    /// together with the reports.
    pub fn resolve(
        &self,
        results_by_partition: &HashMap<String, Vec<RetrievalHit>>,
        reports: Vec<ConflictReport>,
    ) -> (Vec<RetrievalHit>, Vec<ConflictReport>) {
        let mut reconciled: Vec<RetrievalHit> = results_by_partition
            .values()
            .flat_map(|hits| hits.iter().cloned())
            .collect();

        for report in &reports {
            let penalty = self.penalty_for(&report.partition_a, &report.partition_b);

            for hit in reconciled.iter_mut() {
                if hit.document_id == report.hit_a.document_id
                    && hit.partition_id == report.hit_a.partition_id
                    || hit.document_id == report.hit_b.document_id
                        && hit.partition_id == report.hit_b.partition_id
                {
                    if hit.partition_id == report.winner_partition {
                        hit.conflict_resolution = Some(ConflictAnnotation {
                            status: ConflictStatus::Preferred,
                            reason: report.reason.clone(),
                        });
                    } else {
                        hit.score *= penalty;
                        hit.conflict_resolution = Some(ConflictAnnotation {
                            status: loser_status(report),
                            reason: report.reason.clone(),
                        });
                    }
                }
            }

            match report.kind {
                ConflictKind::Temporal => RESOLVED_TEMPORAL.fetch_add(1, Ordering::Relaxed),
                ConflictKind::Semantic => RESOLVED_SEMANTIC.fetch_add(1, Ordering::Relaxed),
            };
        }

        // Adjusted score descending; ties go to the first-declared
        // partition, then stable identifiers, so the ordering never
        // depends on pool iteration order.
        reconciled.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.partition_rank(&a.partition_id)
                        .cmp(&self.partition_rank(&b.partition_id))
                })
                .then_with(|| a.partition_id.cmp(&b.partition_id))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });

        if !reports.is_empty() {
            info!(
                conflicts = reports.len(),
                hits = reconciled.len(),
                "Conflicts resolved"
            );
        }

        (reconciled, reports)
    }

    /// Read-only copy of the lifetime counters. Reset on restart only.
    pub fn stats() -> ConflictStats {
        ConflictStats {
            detected_temporal: DETECTED_TEMPORAL.load(Ordering::Relaxed),
            detected_semantic: DETECTED_SEMANTIC.load(Ordering::Relaxed),
            resolved_temporal: RESOLVED_TEMPORAL.load(Ordering::Relaxed),
            resolved_semantic: RESOLVED_SEMANTIC.load(Ordering::Relaxed),
        }
    }

    /// Decide the winner for one pair. Pure and deterministic.
    fn judge(
        &self,
        pair: &ConflictPairConfig,
        hit_a: RetrievalHit,
        hit_b: RetrievalHit,
    ) -> ConflictReport {
        if let Some(updates_side) = &pair.updates_side {
            // Temporal rule: the updates side wins regardless of score.
            let (winner, loser) = if updates_side == &pair.partition_a {
                (pair.partition_a.clone(), pair.partition_b.clone())
            } else {
                (pair.partition_b.clone(), pair.partition_a.clone())
            };
            return ConflictReport {
                partition_a: pair.partition_a.clone(),
                partition_b: pair.partition_b.clone(),
                hit_a,
                hit_b,
                kind: ConflictKind::Temporal,
                winner_partition: winner,
                loser_partition: loser,
                reason: "temporal priority".into(),
            };
        }

        // Semantic rule: strictly higher score wins; exact ties favor
        // the first-declared partition.
        let (winner, loser, reason) = if hit_b.score > hit_a.score {
            (
                pair.partition_b.clone(),
                pair.partition_a.clone(),
                "higher score".to_string(),
            )
        } else if hit_a.score > hit_b.score {
            (
                pair.partition_a.clone(),
                pair.partition_b.clone(),
                "higher score".to_string(),
            )
        } else {
            (
                pair.partition_a.clone(),
                pair.partition_b.clone(),
                "score tie, first-declared partition preferred".to_string(),
            )
        };

        ConflictReport {
            partition_a: pair.partition_a.clone(),
            partition_b: pair.partition_b.clone(),
            hit_a,
            hit_b,
            kind: ConflictKind::Semantic,
            winner_partition: winner,
            loser_partition: loser,
            reason,
        }
    }

    /// Position of the partition's first appearance across the declared
    /// pairs. Partitions outside any pair rank last.
    fn partition_rank(&self, partition: &str) -> usize {
        self.config
            .pairs
            .iter()
            .flat_map(|p| [p.partition_a.as_str(), p.partition_b.as_str()])
            .position(|declared| declared == partition)
            .unwrap_or(usize::MAX)
    }

    fn penalty_for(&self, partition_a: &str, partition_b: &str) -> f32 {
        self.config
            .pairs
            .iter()
            .find(|p| p.partition_a == partition_a && p.partition_b == partition_b)
            .and_then(|p| p.penalty)
            .unwrap_or(self.config.penalty)
    }
}

fn top_hit<'a>(
    results: &'a HashMap<String, Vec<RetrievalHit>>,
    partition: &str,
) -> Option<&'a RetrievalHit> {
    results.get(partition)?.iter().max_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// A temporal loser that carries a timestamp was demonstrably
/// superseded; without one it is merely an alternate reading.
fn loser_status(report: &ConflictReport) -> ConflictStatus {
    if report.kind == ConflictKind::Semantic {
        return ConflictStatus::Alternate;
    }
    let loser_hit = if report.hit_a.partition_id == report.loser_partition {
        &report.hit_a
    } else {
        &report.hit_b
    };
    if loser_hit.metadata.timestamp.is_some() {
        ConflictStatus::Outdated
    } else {
        ConflictStatus::Alternate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: Vec<(&str, Vec<RetrievalHit>)>) -> HashMap<String, Vec<RetrievalHit>> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn temporal_config() -> ConflictConfig {
        ConflictConfig {
            pairs: vec![ConflictPairConfig {
                partition_a: "tax_knowledge".into(),
                partition_b: "tax_updates".into(),
                updates_side: Some("tax_updates".into()),
                penalty: None,
            }],
            penalty: 0.5,
        }
    }

    fn semantic_config() -> ConflictConfig {
        ConflictConfig {
            pairs: vec![ConflictPairConfig {
                partition_a: "tax_knowledge".into(),
                partition_b: "payroll_knowledge".into(),
                updates_side: None,
                penalty: None,
            }],
            penalty: 0.5,
        }
    }

    #[test]
    fn temporal_updates_side_wins_regardless_of_score() {
        let resolver = ConflictResolver::new(temporal_config());
        // Scores deliberately favor the non-updates side.
        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "doc-old", "old rule", 0.8)],
            ),
            (
                "tax_updates",
                vec![RetrievalHit::new("tax_updates", "doc-new", "new rule", 0.6)],
            ),
        ]);

        let reports = resolver.detect(&results);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ConflictKind::Temporal);
        assert_eq!(reports[0].winner_partition, "tax_updates");
        assert_eq!(reports[0].reason, "temporal priority");
    }

    #[test]
    fn temporal_win_holds_under_randomized_scores() {
        let resolver = ConflictResolver::new(temporal_config());
        // Pseudo-random scores from a fixed seed; the winner never changes.
        let mut seed: u32 = 0x2545_F491;
        for _ in 0..50 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let score_a = (seed % 1000) as f32 / 1000.0;
            let score_b = ((seed >> 10) % 1000) as f32 / 1000.0;

            let results = pool(vec![
                (
                    "tax_knowledge",
                    vec![RetrievalHit::new("tax_knowledge", "a", "x", score_a)],
                ),
                (
                    "tax_updates",
                    vec![RetrievalHit::new("tax_updates", "b", "y", score_b)],
                ),
            ]);
            let reports = resolver.detect(&results);
            assert_eq!(reports[0].winner_partition, "tax_updates");
        }
    }

    #[test]
    fn semantic_higher_score_wins() {
        let resolver = ConflictResolver::new(semantic_config());
        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "a", "x", 0.4)],
            ),
            (
                "payroll_knowledge",
                vec![RetrievalHit::new("payroll_knowledge", "b", "y", 0.9)],
            ),
        ]);

        let reports = resolver.detect(&results);
        assert_eq!(reports[0].kind, ConflictKind::Semantic);
        assert_eq!(reports[0].winner_partition, "payroll_knowledge");
        assert_eq!(reports[0].reason, "higher score");
    }

    #[test]
    fn semantic_tie_favors_first_declared_partition() {
        let resolver = ConflictResolver::new(semantic_config());
        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "a", "x", 0.7)],
            ),
            (
                "payroll_knowledge",
                vec![RetrievalHit::new("payroll_knowledge", "b", "y", 0.7)],
            ),
        ]);

        // Run repeatedly: the tie-break must never flip.
        for _ in 0..10 {
            let reports = resolver.detect(&results);
            assert_eq!(reports[0].winner_partition, "tax_knowledge");
        }
    }

    #[test]
    fn no_conflict_when_one_side_is_empty() {
        let resolver = ConflictResolver::new(temporal_config());
        let results = pool(vec![(
            "tax_knowledge",
            vec![RetrievalHit::new("tax_knowledge", "a", "x", 0.8)],
        )]);
        assert!(resolver.detect(&results).is_empty());
    }

    #[test]
    fn resolve_penalizes_loser_and_keeps_all_hits() {
        let resolver = ConflictResolver::new(temporal_config());
        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "doc-old", "old", 0.8)],
            ),
            (
                "tax_updates",
                vec![RetrievalHit::new("tax_updates", "doc-new", "new", 0.6)],
            ),
        ]);

        let reports = resolver.detect(&results);
        let (reconciled, reports) = resolver.resolve(&results, reports);

        assert_eq!(reconciled.len(), 2, "no hit may be dropped");
        assert_eq!(reports.len(), 1);

        let loser = reconciled
            .iter()
            .find(|h| h.partition_id == "tax_knowledge")
            .unwrap();
        assert!((loser.score - 0.4).abs() < 1e-6, "0.8 * 0.5 penalty");
        let annotation = loser.conflict_resolution.as_ref().unwrap();
        // No timestamp on the loser: tagged alternate, not outdated.
        assert_eq!(annotation.status, ConflictStatus::Alternate);
        assert_eq!(annotation.reason, "temporal priority");

        let winner = reconciled
            .iter()
            .find(|h| h.partition_id == "tax_updates")
            .unwrap();
        assert!((winner.score - 0.6).abs() < 1e-6, "winner score untouched");
        assert_eq!(
            winner.conflict_resolution.as_ref().unwrap().status,
            ConflictStatus::Preferred
        );
    }

    #[test]
    fn timestamped_temporal_loser_is_outdated() {
        let resolver = ConflictResolver::new(temporal_config());
        let mut old_hit = RetrievalHit::new("tax_knowledge", "doc-old", "old", 0.8);
        old_hit.metadata.timestamp = Some(chrono::Utc::now() - chrono::Duration::days(400));
        let results = pool(vec![
            ("tax_knowledge", vec![old_hit]),
            (
                "tax_updates",
                vec![RetrievalHit::new("tax_updates", "doc-new", "new", 0.6)],
            ),
        ]);

        let reports = resolver.detect(&results);
        let (reconciled, _) = resolver.resolve(&results, reports);
        let loser = reconciled
            .iter()
            .find(|h| h.partition_id == "tax_knowledge")
            .unwrap();
        assert_eq!(
            loser.conflict_resolution.as_ref().unwrap().status,
            ConflictStatus::Outdated
        );
    }

    #[test]
    fn per_pair_penalty_overrides_global() {
        let mut config = temporal_config();
        config.pairs[0].penalty = Some(0.25);
        let resolver = ConflictResolver::new(config);

        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "a", "x", 0.8)],
            ),
            (
                "tax_updates",
                vec![RetrievalHit::new("tax_updates", "b", "y", 0.6)],
            ),
        ]);

        let reports = resolver.detect(&results);
        let (reconciled, _) = resolver.resolve(&results, reports);
        let loser = reconciled
            .iter()
            .find(|h| h.partition_id == "tax_knowledge")
            .unwrap();
        assert!((loser.score - 0.2).abs() < 1e-6);
    }

    #[test]
    fn equal_scores_order_by_partition_declaration() {
        let resolver = ConflictResolver::new(semantic_config());

        // Rebuild the pool each round so map iteration order cannot
        // mask an unstable sort.
        for _ in 0..20 {
            let results = pool(vec![
                (
                    "payroll_knowledge",
                    vec![RetrievalHit::new("payroll_knowledge", "p-1", "x", 0.7)],
                ),
                (
                    "general_faq",
                    vec![RetrievalHit::new("general_faq", "g-1", "z", 0.7)],
                ),
                (
                    "tax_knowledge",
                    vec![RetrievalHit::new("tax_knowledge", "t-1", "y", 0.7)],
                ),
            ]);

            let (reconciled, _) = resolver.resolve(&results, Vec::new());
            let order: Vec<&str> =
                reconciled.iter().map(|h| h.partition_id.as_str()).collect();
            assert_eq!(
                order,
                vec!["tax_knowledge", "payroll_knowledge", "general_faq"],
                "first-declared partition must lead on a score tie"
            );
        }
    }

    #[test]
    fn lifetime_counters_increase_monotonically() {
        let before = ConflictResolver::stats();

        let resolver = ConflictResolver::new(temporal_config());
        let results = pool(vec![
            (
                "tax_knowledge",
                vec![RetrievalHit::new("tax_knowledge", "a", "x", 0.8)],
            ),
            (
                "tax_updates",
                vec![RetrievalHit::new("tax_updates", "b", "y", 0.6)],
            ),
        ]);
        let reports = resolver.detect(&results);
        let _ = resolver.resolve(&results, reports);

        let after = ConflictResolver::stats();
        assert!(after.detected_temporal >= before.detected_temporal + 1);
        assert!(after.resolved_temporal >= before.resolved_temporal + 1);
    }
}
