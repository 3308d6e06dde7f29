//! Shared test helpers for loop and pipeline tests.

use arbiter_core::error::ProviderError;
use arbiter_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use std::sync::Mutex;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct SequentialMockProvider {
    name: String,
    responses: Mutex<Vec<ScriptedResponse>>,
    call_count: Mutex<usize>,
    requests_seen: Mutex<Vec<ProviderRequest>>,
}

/// One scripted step: either a response or an error.
pub enum ScriptedResponse {
    Text(String),
    Error(ProviderError),
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self::named("sequential_mock", responses)
    }

    pub fn named(name: &str, responses: Vec<ScriptedResponse>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
            requests_seen: Mutex::new(Vec::new()),
        }
    }

    /// A provider that returns a single text response.
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![ScriptedResponse::Text(text.into())])
    }

    /// A provider scripted to emit a tool directive, then a final answer.
    pub fn tool_then_answer(tool: &str, input: serde_json::Value, answer: &str) -> Self {
        let directive = serde_json::json!({"action": tool, "input": input}).to_string();
        let answer = serde_json::json!({"final_answer": answer}).to_string();
        Self::new(vec![
            ScriptedResponse::Text(directive),
            ScriptedResponse::Text(answer),
        ])
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// The requests this mock has received, for transcript assertions.
    pub fn requests_seen(&self) -> Vec<ProviderRequest> {
        self.requests_seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests_seen.lock().unwrap().push(request);

        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();

        if *count >= responses.len() {
            panic!(
                "SequentialMockProvider: no more responses (call #{}, have {})",
                *count,
                responses.len()
            );
        }

        let scripted = &responses[*count];
        *count += 1;

        match scripted {
            ScriptedResponse::Text(text) => Ok(ProviderResponse {
                text: text.clone(),
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                model: "mock-model".into(),
            }),
            ScriptedResponse::Error(e) => Err(e.clone()),
        }
    }
}
