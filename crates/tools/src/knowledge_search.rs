//! Knowledge search tool — lets the reasoning loop query a partition
//! mid-conversation, beyond the up-front retrieval pass.

use arbiter_core::error::ToolError;
use arbiter_core::retrieval::PartitionClient;
use arbiter_core::tool::Tool;
use async_trait::async_trait;
use std::sync::Arc;

pub struct KnowledgeSearchTool {
    client: Arc<dyn PartitionClient>,
    default_partition: String,
}

impl KnowledgeSearchTool {
    pub fn new(client: Arc<dyn PartitionClient>, default_partition: impl Into<String>) -> Self {
        Self {
            client,
            default_partition: default_partition.into(),
        }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search a knowledge partition for relevant documents. Returns chunks sorted by relevance."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "partition": {
                    "type": "string",
                    "description": "Partition to search (defaults to the main knowledge partition)"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum number of results (default 3)",
                    "default": 3
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> Result<String, ToolError> {
        let query = input["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;
        let partition = input["partition"]
            .as_str()
            .unwrap_or(&self.default_partition);
        let top_k = input["top_k"].as_u64().unwrap_or(3).min(10) as usize;

        let hits = self
            .client
            .search(partition, query, top_k)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "knowledge_search".into(),
                reason: e.to_string(),
            })?;

        if hits.is_empty() {
            return Ok(format!("No results in partition '{partition}' for: {query}"));
        }

        let rendered: Vec<String> = hits
            .iter()
            .map(|h| {
                format!(
                    "[{} score={:.2}] {}",
                    h.document_id, h.score, h.text
                )
            })
            .collect();
        Ok(rendered.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::error::RetrievalError;
    use arbiter_core::retrieval::{HitMetadata, RetrievalHit};

    struct OnePartitionStub;

    #[async_trait]
    impl PartitionClient for OnePartitionStub {
        async fn search(
            &self,
            partition_id: &str,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<RetrievalHit>, RetrievalError> {
            if partition_id != "tax_knowledge" {
                return Err(RetrievalError::UnknownPartition(partition_id.into()));
            }
            Ok(vec![RetrievalHit {
                partition_id: partition_id.into(),
                document_id: "doc-1".into(),
                text: "Standard deduction for 2026".into(),
                score: 0.9,
                metadata: HitMetadata::default(),
                conflict_resolution: None,
            }])
        }

        fn partitions(&self) -> Vec<String> {
            vec!["tax_knowledge".into()]
        }
    }

    #[tokio::test]
    async fn searches_default_partition() {
        let tool = KnowledgeSearchTool::new(Arc::new(OnePartitionStub), "tax_knowledge");
        let output = tool
            .invoke(serde_json::json!({"query": "standard deduction"}))
            .await
            .unwrap();
        assert!(output.contains("doc-1"));
        assert!(output.contains("Standard deduction"));
    }

    #[tokio::test]
    async fn unknown_partition_is_execution_failure() {
        let tool = KnowledgeSearchTool::new(Arc::new(OnePartitionStub), "tax_knowledge");
        let result = tool
            .invoke(serde_json::json!({"query": "x", "partition": "nope"}))
            .await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed { .. })));
    }

    #[tokio::test]
    async fn missing_query_is_invalid_arguments() {
        let tool = KnowledgeSearchTool::new(Arc::new(OnePartitionStub), "tax_knowledge");
        let result = tool.invoke(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }
}
