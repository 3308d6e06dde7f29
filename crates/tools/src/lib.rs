//! Native tools and the tool dispatcher for Arbiter.
//!
//! Native tools implement `arbiter_core::Tool`; remote tools arrive
//! through the external protocol client. The dispatcher resolves both
//! behind a single `execute` call.

pub mod calculator;
pub mod current_date;
pub mod dispatcher;
pub mod knowledge_search;
pub mod protocol;

pub use calculator::CalculatorTool;
pub use current_date::CurrentDateTool;
pub use dispatcher::ToolDispatcher;
pub use knowledge_search::KnowledgeSearchTool;
pub use protocol::HttpProtocolClient;

use arbiter_core::retrieval::PartitionClient;
use arbiter_core::tool::ToolRegistry;
use std::sync::Arc;

/// Build the default native tool registry.
pub fn default_registry(
    partitions: Arc<dyn PartitionClient>,
    default_partition: impl Into<String>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CalculatorTool));
    registry.register(Box::new(CurrentDateTool));
    registry.register(Box::new(KnowledgeSearchTool::new(
        partitions,
        default_partition,
    )));
    registry
}
