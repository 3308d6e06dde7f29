//! Concurrent partition fan-out.
//!
//! One query may need several partitions. Searches fan out concurrently
//! and join before conflict resolution; a failed partition degrades the
//! pool to fewer results instead of failing the query.

use arbiter_core::error::RetrievalError;
use arbiter_core::retrieval::{PartitionClient, RetrievalHit};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The joined result of a fan-out.
#[derive(Debug, Default)]
pub struct RetrievalPool {
    /// Hits grouped by the partition that produced them
    pub by_partition: HashMap<String, Vec<RetrievalHit>>,

    /// Partitions that failed, with the reason (degraded, not fatal)
    pub failed: Vec<(String, RetrievalError)>,
}

impl RetrievalPool {
    /// Number of partitions that returned at least one hit.
    pub fn partitions_hit(&self) -> usize {
        self.by_partition.values().filter(|v| !v.is_empty()).count()
    }

    /// Total hits across all partitions.
    pub fn total_hits(&self) -> usize {
        self.by_partition.values().map(Vec::len).sum()
    }
}

/// Search the given partitions concurrently and join the results.
pub async fn search_partitions(
    client: Arc<dyn PartitionClient>,
    partitions: &[String],
    query: &str,
    limit: usize,
) -> RetrievalPool {
    let searches = partitions.iter().map(|partition| {
        let client = client.clone();
        let partition = partition.clone();
        let query = query.to_string();
        async move {
            let result = client.search(&partition, &query, limit).await;
            (partition, result)
        }
    });

    let joined = futures::future::join_all(searches).await;

    let mut pool = RetrievalPool::default();
    for (partition, result) in joined {
        match result {
            Ok(hits) => {
                debug!(partition = %partition, hits = hits.len(), "Partition searched");
                pool.by_partition.insert(partition, hits);
            }
            Err(e) => {
                warn!(partition = %partition, error = %e, "Partition unavailable, degrading");
                pool.failed.push((partition, e));
            }
        }
    }
    pool
}
