//! Mock transport and function invoker for testing.
//!
//! This module provides deterministic collaborators for tests:
//! - MockTransport: queue-based responses with optional tool calls and outcomes
//! - MockFunctions: named function results and a log of invocations
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Mock Collaborators                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  MockTransport             MockFunctions                        │
//! │  ├── add_response()        ├── add_result()                     │
//! │  ├── add_tool_response()   ├── add_error()                      │
//! │  ├── add_outcome()         └── invocations()                    │
//! │  ├── requests()                                                 │
//! │  └── send_request()                                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::catalog::ModelFamily;
use crate::error::Result;
use crate::traits::{
    FunctionInvoker, FunctionOutput, ProviderRequest, ProviderResponse, ToolCall, Transport,
    TransportOutcome,
};
use crate::usage::UsageRecord;

/// A queued mock response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub outcome: TransportOutcome,
    /// Output tokens reported; estimated from the text when `None`.
    pub output_tokens: Option<u64>,
}

impl MockResponse {
    /// Completed text-only response.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            outcome: TransportOutcome::Completed,
            output_tokens: None,
        }
    }
}

/// Mock transport for testing.
///
/// Usage is synthesized from the request so ledger entries carry the model
/// and billing mode actually requested.
#[derive(Debug, Clone)]
pub struct MockTransport {
    responses: Arc<Mutex<Vec<MockResponse>>>,
    requests: Arc<Mutex<Vec<ProviderRequest>>>,
    call_count: Arc<AtomicUsize>,
    families: Vec<ModelFamily>,
    delay: Option<Duration>,
}

impl MockTransport {
    /// Create a mock that serves every provider family.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            families: vec![ModelFamily::OpenAI, ModelFamily::Anthropic, ModelFamily::Gemini],
            delay: None,
        }
    }

    /// Restrict the families this mock claims to serve.
    pub fn with_families(mut self, families: Vec<ModelFamily>) -> Self {
        self.families = families;
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add a text-only response.
    pub async fn add_response(&self, text: impl Into<String>) {
        self.push(MockResponse::text(text)).await;
    }

    /// Add a response with tool calls.
    pub async fn add_tool_response(&self, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.push(MockResponse {
            tool_calls,
            ..MockResponse::text(text)
        })
        .await;
    }

    /// Add a response ending with a specific outcome.
    pub async fn add_outcome(&self, text: impl Into<String>, outcome: TransportOutcome) {
        self.push(MockResponse {
            outcome,
            ..MockResponse::text(text)
        })
        .await;
    }

    /// Add a fully specified response.
    pub async fn push(&self, response: MockResponse) {
        self.responses.lock().await.push(response);
    }

    /// Get the number of requests served.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, in order.
    pub async fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().await.clone()
    }

    /// Check if all queued responses have been consumed.
    pub async fn is_exhausted(&self) -> bool {
        self.responses.lock().await.is_empty()
    }

    async fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().await;
        if responses.is_empty() {
            MockResponse::text("Mock response")
        } else {
            responses.remove(0)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_family(&self, family: ModelFamily) -> bool {
        self.families.contains(&family)
    }

    async fn send_request(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mock = self.next_response().await;
        let input_chars = request.system_instruction.len()
            + request.messages.iter().map(|m| m.content.len()).sum::<usize>();
        let output = mock
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(mock.text.len()));
        let usage = UsageRecord::new(&request.model, request.billing_mode)
            .with_input(estimate_tokens(input_chars), 0)
            .with_output(output, 0);

        Ok(ProviderResponse {
            text: mock.text,
            tool_calls: mock.tool_calls,
            usage,
            outcome: mock.outcome,
        })
    }
}

// ============================================================================
// MockFunctions
// ============================================================================

/// Mock function invoker with canned results per function name.
#[derive(Debug, Clone, Default)]
pub struct MockFunctions {
    results: Arc<Mutex<HashMap<String, FunctionOutput>>>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl MockFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result returned for every call of `name`.
    pub async fn add_result(&self, name: impl Into<String>, text: impl Into<String>) {
        self.results
            .lock()
            .await
            .insert(name.into(), FunctionOutput::ok(text));
    }

    /// Structured error returned for every call of `name`.
    pub async fn add_error(&self, name: impl Into<String>, error: impl Into<String>) {
        self.results
            .lock()
            .await
            .insert(name.into(), FunctionOutput::error(error));
    }

    /// Names of invoked functions, in order.
    pub async fn invocations(&self) -> Vec<String> {
        self.invocations.lock().await.clone()
    }
}

#[async_trait]
impl FunctionInvoker for MockFunctions {
    async fn invoke(&self, name: &str, _arguments: &Map<String, JsonValue>) -> FunctionOutput {
        self.invocations.lock().await.push(name.to_string());
        self.results
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or_else(|| FunctionOutput::error(format!("unknown function '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::ReasoningTier;
    use crate::traits::ChatMessage;
    use crate::usage::BillingMode;

    fn request(model: &str) -> ProviderRequest {
        ProviderRequest {
            model: model.to_string(),
            system_instruction: "Be helpful.".to_string(),
            messages: vec![ChatMessage::user("Hi")],
            reasoning: ReasoningTier::None,
            verbosity: None,
            output_restriction: None,
            reasoning_restriction: None,
            tools: Vec::new(),
            billing_mode: BillingMode::Batch,
            cache_pool_key: None,
        }
    }

    #[tokio::test]
    async fn test_queue_order_and_default() {
        let transport = MockTransport::new();
        transport.add_response("first").await;
        transport
            .add_outcome("cut", TransportOutcome::OutputCeilingReached)
            .await;

        let r1 = transport.send_request(&request("gpt-5")).await.unwrap();
        let r2 = transport.send_request(&request("gpt-5")).await.unwrap();
        let r3 = transport.send_request(&request("gpt-5")).await.unwrap();

        assert_eq!(r1.text, "first");
        assert_eq!(r2.outcome, TransportOutcome::OutputCeilingReached);
        assert_eq!(r3.text, "Mock response");
        assert_eq!(transport.call_count(), 3);
        assert!(transport.is_exhausted().await);
    }

    #[tokio::test]
    async fn test_usage_follows_request() {
        let transport = MockTransport::new();
        let response = transport.send_request(&request("gpt-5-mini")).await.unwrap();
        assert_eq!(response.usage.model, "gpt-5-mini");
        assert_eq!(response.usage.billing_mode, BillingMode::Batch);
        assert!(response.usage.input_tokens > 0);
        assert_eq!(transport.requests().await.len(), 1);
    }

    #[test]
    fn test_family_restriction() {
        let transport = MockTransport::new().with_families(vec![ModelFamily::OpenAI]);
        assert!(transport.supports_family(ModelFamily::OpenAI));
        assert!(!transport.supports_family(ModelFamily::Gemini));
    }

    #[tokio::test]
    async fn test_mock_functions() {
        let functions = MockFunctions::new();
        functions.add_result("weather", "sunny").await;
        functions.add_error("stocks", "market closed").await;

        let args = Map::new();
        assert_eq!(functions.invoke("weather", &args).await.text, "sunny");
        assert!(functions.invoke("stocks", &args).await.error.is_some());
        assert!(functions.invoke("missing", &args).await.error.is_some());
        assert_eq!(functions.invocations().await.len(), 3);
    }
}
