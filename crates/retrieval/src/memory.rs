//! In-memory partition client — useful for testing and demos.

use arbiter_core::error::RetrievalError;
use arbiter_core::retrieval::{HitMetadata, PartitionClient, RetrievalHit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// A document seeded into an in-memory partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedDocument {
    pub id: String,
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// An in-memory partition set with keyword-relevance scoring.
///
/// Not a real vector index — scores come from normalized keyword
/// occurrence counts, which is enough for tests and the demo CLI.
/// Guarded by a std `RwLock`; critical sections are short and never
/// held across an await point.
pub struct InMemoryPartitions {
    partitions: RwLock<HashMap<String, Vec<SeedDocument>>>,
}

impl InMemoryPartitions {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Add a document to a partition, creating the partition on demand.
    pub fn add_document(&self, partition: &str, doc: SeedDocument) {
        self.partitions
            .write()
            .expect("partition lock poisoned")
            .entry(partition.to_string())
            .or_default()
            .push(doc);
    }

    /// Seed several documents at once.
    pub fn seed(&self, partition: &str, docs: Vec<SeedDocument>) {
        self.partitions
            .write()
            .expect("partition lock poisoned")
            .entry(partition.to_string())
            .or_default()
            .extend(docs);
    }
}

impl Default for InMemoryPartitions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionClient for InMemoryPartitions {
    async fn search(
        &self,
        partition_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let partitions = self.partitions.read().expect("partition lock poisoned");
        let docs = partitions
            .get(partition_id)
            .ok_or_else(|| RetrievalError::UnknownPartition(partition_id.to_string()))?;

        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(String::from)
            .collect();

        let mut hits: Vec<RetrievalHit> = docs
            .iter()
            .filter_map(|doc| {
                let text_lower = doc.text.to_lowercase();
                let occurrences: usize = terms
                    .iter()
                    .map(|t| text_lower.matches(t.as_str()).count())
                    .sum();
                if occurrences == 0 {
                    return None;
                }
                // Normalized keyword relevance in [0, 1]
                let score =
                    (occurrences as f32 / (doc.text.len() as f32 / 100.0).max(1.0)).min(1.0);
                Some(RetrievalHit {
                    partition_id: partition_id.to_string(),
                    document_id: doc.id.clone(),
                    text: doc.text.clone(),
                    score,
                    metadata: HitMetadata {
                        timestamp: doc.timestamp,
                        tags: doc.tags.clone(),
                        extra: serde_json::Map::new(),
                    },
                    conflict_resolution: None,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .partitions
            .read()
            .expect("partition lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
