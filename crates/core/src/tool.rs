//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what let the reasoning loop act: search a knowledge partition,
//! run a calculation, look up session data. Native tools implement the
//! [`Tool`] trait directly; external-protocol tools are reached through the
//! dispatcher in `arbiter-tools`.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request to execute a tool, produced by the reasoning loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID; round-trips to exactly one [`ToolResult`]
    pub call_id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Input as a JSON value
    pub input: serde_json::Value,
}

/// The result of a tool execution.
///
/// Exactly one is produced per `call_id`, even when the handler failed —
/// failures are carried in `error` with `ok` set to false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub ok: bool,

    /// The output content (empty on failure)
    #[serde(default)]
    pub content: String,

    /// Failure description when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// Build a success result.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ok: true,
            content: content.into(),
            error: None,
        }
    }

    /// Build a failure result.
    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ok: false,
            content: String::new(),
            error: Some(error.into()),
        }
    }

    /// The text fed back to the model as an observation.
    pub fn observation_text(&self) -> String {
        if self.ok {
            self.content.clone()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown"))
        }
    }
}

/// A tool description advertised to the model and to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's input
    pub parameters: serde_json::Value,
}

/// The core Tool trait for native handlers.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculator", "knowledge_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (included in the tool catalogue).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input, returning the output text.
    async fn invoke(&self, input: serde_json::Value) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a descriptor for the catalogue.
    fn to_descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Client for an external tool-protocol endpoint.
///
/// Remote tools are discovered through `list_tools` and invoked by
/// name; the dispatcher in `arbiter-tools` consults this after the
/// native registry.
#[async_trait]
pub trait ToolProtocolClient: Send + Sync {
    /// Discover the tools the remote endpoint offers.
    async fn list_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, ToolError>;

    /// Invoke a remote tool by name.
    async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;
}

/// A registry of native tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool descriptors (for the catalogue).
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.to_descriptor()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
