//! Collaborator interfaces consumed by the decision engine.
//!
//! # WHY: Trait-Based Transport Abstraction
//!
//! The engine decides *what* to send; it never speaks a wire protocol.
//! Using traits instead of concrete clients enables:
//! - **Testing**: `MockTransport` for unit tests (no API calls)
//! - **Flexibility**: any HTTP client or SDK can sit behind [`Transport`]
//! - **Family gating**: a transport states which provider families it handles
//!
//! # Key Traits
//!
//! - [`Transport`]: sends one fully decided request, returns text, usage and outcome
//! - [`FunctionInvoker`]: executes a tool call requested by the model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::catalog::{ModelFamily, Verbosity};
use crate::error::{LlmError, Result};
use crate::reasoning::ReasoningTier;
use crate::usage::{BillingMode, UsageRecord};

// ============================================================================
// Function/Tool Calling Types (OpenAI-compatible)
// ============================================================================

/// Definition of a tool that the model can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (always "function" for function tools).
    #[serde(rename = "type")]
    pub tool_type: String,

    /// Function definition.
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Create a new function tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: JsonValue,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Definition of a function that can be called by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,

    /// JSON Schema defining the function parameters.
    pub parameters: JsonValue,
}

/// A tool call request from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,

    /// Function call details.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the arguments as a JSON object of named values.
    pub fn parse_arguments(&self) -> Result<Map<String, JsonValue>> {
        match serde_json::from_str::<JsonValue>(&self.function.arguments) {
            Ok(JsonValue::Object(map)) => Ok(map),
            Ok(other) => Err(LlmError::InvalidArgument(format!(
                "tool arguments must be a JSON object, got {}",
                other
            ))),
            Err(e) => Err(LlmError::InvalidArgument(format!(
                "Failed to parse tool arguments: {}",
                e
            ))),
        }
    }

    /// Get the function name.
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Details of a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call.
    pub name: String,

    /// JSON-encoded arguments for the function.
    pub arguments: String,
}

// ============================================================================
// Conversation Items
// ============================================================================

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    /// Tool/function result message.
    Tool,
}

impl ChatRole {
    /// Convert role to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// One conversation item. The system instruction travels separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,

    /// Tool calls made by the assistant (only for assistant role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool call ID this message is responding to (only for tool role).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message with tool calls.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    /// Create a tool response message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// Coarse cap on output or reasoning tokens, loosened one notch at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRestriction {
    Low,
    Medium,
    High,
}

impl TokenRestriction {
    /// One notch looser, or `None` when already at `Low`.
    pub fn loosen(self) -> Option<Self> {
        match self {
            TokenRestriction::High => Some(TokenRestriction::Medium),
            TokenRestriction::Medium => Some(TokenRestriction::Low),
            TokenRestriction::Low => None,
        }
    }
}

/// A fully decided request handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,

    /// System instruction, including any padding and rating instruction.
    pub system_instruction: String,

    /// Standalone message or the whole conversation so far.
    pub messages: Vec<ChatMessage>,

    /// Effective reasoning tier.
    pub reasoning: ReasoningTier,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_restriction: Option<TokenRestriction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_restriction: Option<TokenRestriction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub billing_mode: BillingMode,

    /// Groups requests so the provider routes them to the same cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_pool_key: Option<String>,
}

/// How a provider call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportOutcome {
    #[default]
    Completed,
    /// Output stopped at the token ceiling.
    OutputCeilingReached,
    TimedOut,
    Aborted,
}

/// What the transport returns for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Visible output text.
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub usage: UsageRecord,

    #[serde(default)]
    pub outcome: TransportOutcome,
}

impl ProviderResponse {
    /// Check if the model requested any tool execution.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Sends requests to an LLM provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the name of this transport.
    fn name(&self) -> &str;

    /// Whether this transport can serve models of `family`.
    ///
    /// Only the OpenAI-compatible wire format is assumed by default.
    fn supports_family(&self, family: ModelFamily) -> bool {
        family == ModelFamily::OpenAI
    }

    /// Send one request.
    ///
    /// Ceiling hits, timeouts and aborts are reported through
    /// [`ProviderResponse::outcome`]; `Err` is reserved for failures the
    /// engine cannot react to.
    async fn send_request(&self, request: &ProviderRequest) -> Result<ProviderResponse>;
}

/// Result of executing one function.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionOutput {
    pub text: String,

    /// Structured error fed back to the model instead of the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionOutput {
    /// Successful result.
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: None,
        }
    }

    /// Failed invocation.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            error: Some(error.into()),
        }
    }

    /// Content of the conversation item fed back to the model.
    pub fn to_item_content(&self) -> String {
        match &self.error {
            Some(error) => serde_json::json!({ "error": error }).to_string(),
            None => self.text.clone(),
        }
    }
}

/// Executes functions the model asks for.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, name: &str, arguments: &Map<String, JsonValue>) -> FunctionOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments_object() {
        let call = ToolCall::new("call_1", "lookup", r#"{"city": "Paris", "days": 3}"#);
        let args = call.parse_arguments().unwrap();
        assert_eq!(args["city"], "Paris");
        assert_eq!(args["days"], 3);
        assert_eq!(call.name(), "lookup");
    }

    #[test]
    fn test_parse_arguments_invalid() {
        let call = ToolCall::new("call_1", "lookup", "{not json");
        assert!(matches!(call.parse_arguments(), Err(LlmError::InvalidArgument(_))));
        let call = ToolCall::new("call_2", "lookup", "[1, 2]");
        assert!(call.parse_arguments().is_err());
    }

    #[test]
    fn test_restriction_loosen_never_below_low() {
        assert_eq!(TokenRestriction::High.loosen(), Some(TokenRestriction::Medium));
        assert_eq!(TokenRestriction::Medium.loosen(), Some(TokenRestriction::Low));
        assert_eq!(TokenRestriction::Low.loosen(), None);
    }

    #[test]
    fn test_function_output_item_content() {
        assert_eq!(FunctionOutput::ok("42").to_item_content(), "42");
        let content = FunctionOutput::error("no such city").to_item_content();
        assert!(content.contains("\"error\""));
        assert!(content.contains("no such city"));
    }

    #[test]
    fn test_chat_message_constructors() {
        let msg = ChatMessage::assistant_with_tools("", vec![]);
        assert!(msg.tool_calls.is_none());
        let msg = ChatMessage::tool_result("call_1", "done");
        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
