//! Retrieval domain types and the partition client trait.
//!
//! A *partition* is a named, independently searchable subset of the
//! embedded knowledge base. Similarity search over a partition returns
//! ranked [`RetrievalHit`]s which feed the conflict resolver and, after
//! reconciliation, the reasoning loop's prompt.

use crate::error::RetrievalError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata attached to a retrieval hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitMetadata {
    /// Document timestamp, when the partition tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Any additional partition-specific fields
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// How a hit fared in conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// This hit won its conflict
    Preferred,
    /// Lost a temporal conflict to an "updates" counterpart
    Outdated,
    /// Lost a semantic conflict on score
    Alternate,
}

/// Annotation stamped on a hit by the conflict resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAnnotation {
    pub status: ConflictStatus,
    pub reason: String,
}

/// One retrieval result from a partition search.
///
/// Hits are immutable once produced by a search; the conflict resolver
/// works on copies when it annotates and penalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    /// Which partition produced this hit
    pub partition_id: String,

    /// Source document identifier
    pub document_id: String,

    /// The retrieved text
    pub text: String,

    /// Similarity score in [0, 1]
    pub score: f32,

    /// Hit metadata
    #[serde(default)]
    pub metadata: HitMetadata,

    /// Set by the conflict resolver when this hit was part of a conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictAnnotation>,
}

impl RetrievalHit {
    /// Construct a plain hit with empty metadata.
    pub fn new(
        partition_id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        score: f32,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            document_id: document_id.into(),
            text: text.into(),
            score: score.clamp(0.0, 1.0),
            metadata: HitMetadata::default(),
            conflict_resolution: None,
        }
    }
}

/// The knowledge partition client trait.
///
/// Implementations: an in-memory client for tests and demos
/// (`arbiter-retrieval`), or an adapter over an external vector store.
#[async_trait]
pub trait PartitionClient: Send + Sync {
    /// Similarity search over a named partition.
    async fn search(
        &self,
        partition_id: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<RetrievalHit>, RetrievalError>;

    /// The partitions this client can serve.
    fn partitions(&self) -> Vec<String>;
}
