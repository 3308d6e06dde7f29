//! Current date tool — tells the model what day it is.
//!
//! Temporal questions ("this year's rates", "the latest update") need an
//! anchor date the model can't be trusted to know.

use arbiter_core::error::ToolError;
use arbiter_core::tool::Tool;
use async_trait::async_trait;
use chrono::Utc;

pub struct CurrentDateTool;

#[async_trait]
impl Tool for CurrentDateTool {
    fn name(&self) -> &str {
        "current_date"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC. Takes no arguments."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn invoke(&self, _input: serde_json::Value) -> Result<String, ToolError> {
        let now = Utc::now();
        Ok(format!(
            "Current date: {} (ISO week {})",
            now.format("%Y-%m-%d %H:%M UTC"),
            now.format("%V")
        ))
    }
}
