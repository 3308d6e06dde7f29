//! HTTP implementation of the external tool protocol.
//!
//! The endpoint advertises tools at `GET {base}/tools` and executes them
//! at `POST {base}/tools/{name}/invoke`. Both sides speak plain JSON.

use arbiter_config::ToolProtocolConfig;
use arbiter_core::error::ToolError;
use arbiter_core::tool::{ToolDescriptor, ToolProtocolClient};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

pub struct HttpProtocolClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProtocolClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ToolError::Protocol(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &ToolProtocolConfig) -> Result<Self, ToolError> {
        Self::new(&config.base_url, config.api_key.clone())
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolListResponse {
    tools: Vec<ToolDescriptor>,
}

#[async_trait]
impl ToolProtocolClient for HttpProtocolClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let url = format!("{}/tools", self.base_url);
        debug!(url = %url, "Listing protocol tools");

        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ToolError::Protocol(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ToolError::Protocol(format!(
                "Tool listing returned status {}",
                response.status()
            )));
        }

        let listing: ToolListResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Protocol(format!("Malformed tool listing: {e}")))?;

        Ok(listing.tools)
    }

    async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let url = format!("{}/tools/{}/invoke", self.base_url, name);
        debug!(url = %url, tool = %name, "Invoking protocol tool");

        let response = self
            .request(self.client.post(&url))
            .json(&params)
            .send()
            .await
            .map_err(|e| ToolError::Protocol(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ToolError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: format!("status {status}: {body}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ToolError::Protocol(format!("Malformed tool response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped() {
        let client = HttpProtocolClient::new("https://tools.example.com/", None).unwrap();
        assert_eq!(client.base_url, "https://tools.example.com");
    }

    #[test]
    fn parse_tool_listing() {
        let data = r#"{
            "tools": [
                {"name": "payroll_lookup", "description": "Look up payroll data", "parameters": {"type": "object"}}
            ]
        }"#;
        let listing: ToolListResponse = serde_json::from_str(data).unwrap();
        assert_eq!(listing.tools.len(), 1);
        assert_eq!(listing.tools[0].name, "payroll_lookup");
    }
}
