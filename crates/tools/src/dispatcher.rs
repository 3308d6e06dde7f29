//! Tool dispatcher — one door for every tool execution.
//!
//! Resolution order: native registry first, then discovered
//! external-protocol tools, then an "unknown tool" failure that
//! enumerates every known name so the model can self-correct. Handler
//! errors never propagate: every `ToolCall` yields exactly one
//! `ToolResult`, failures carried as `ok = false`.

use arbiter_core::event::{DomainEvent, EventBus};
use arbiter_core::tool::{ToolCall, ToolDescriptor, ToolProtocolClient, ToolRegistry, ToolResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct ToolDispatcher {
    registry: ToolRegistry,
    protocol: Option<Arc<dyn ToolProtocolClient>>,
    protocol_tools: Vec<ToolDescriptor>,
    events: Option<Arc<EventBus>>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            protocol: None,
            protocol_tools: Vec::new(),
            events: None,
        }
    }

    /// Publish `ToolExecuted` events to the given bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach an external protocol client, discovering its tools.
    ///
    /// A failed discovery leaves the dispatcher native-only rather than
    /// failing construction; the endpoint may come back later.
    pub async fn attach_protocol(&mut self, client: Arc<dyn ToolProtocolClient>) {
        match client.list_tools().await {
            Ok(tools) => {
                debug!(count = tools.len(), "Discovered protocol tools");
                self.protocol_tools = tools;
            }
            Err(e) => {
                warn!(error = %e, "Protocol tool discovery failed; continuing with native tools only");
                self.protocol_tools = Vec::new();
            }
        }
        self.protocol = Some(client);
    }

    /// All tool descriptors: native first, then protocol.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all = self.registry.descriptors();
        all.extend(self.protocol_tools.iter().cloned());
        all
    }

    /// Every name the dispatcher can resolve, sorted.
    pub fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .map(String::from)
            .chain(self.protocol_tools.iter().map(|t| t.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Execute a single tool call. Always returns a result; never an error.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let result = self.execute_inner(call).await;

        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                ok: result.ok,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: chrono::Utc::now(),
            });
        }

        result
    }

    async fn execute_inner(&self, call: &ToolCall) -> ToolResult {
        // Native tools take precedence over protocol tools of the same name
        if let Some(tool) = self.registry.get(&call.name) {
            debug!(tool = %call.name, call_id = %call.call_id, "Executing native tool");
            return match tool.invoke(call.input.clone()).await {
                Ok(content) => ToolResult::success(&call.call_id, content),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Native tool failed");
                    ToolResult::failure(&call.call_id, e.to_string())
                }
            };
        }

        if self.protocol_tools.iter().any(|t| t.name == call.name) {
            if let Some(client) = &self.protocol {
                debug!(tool = %call.name, call_id = %call.call_id, "Executing protocol tool");
                return match client.invoke(&call.name, call.input.clone()).await {
                    Ok(value) => {
                        let content = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        ToolResult::success(&call.call_id, content)
                    }
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Protocol tool failed");
                        ToolResult::failure(&call.call_id, e.to_string())
                    }
                };
            }
        }

        let known = self.known_names().join(", ");
        ToolResult::failure(
            &call.call_id,
            format!("Unknown tool '{}'. Known tools: {known}", call.name),
        )
    }

    /// Execute an ordered list of calls, tolerating individual failures.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call).await);
        }
        results
    }
}
