//! Bounded function-call loop.
//!
//! Alternates model output and externally executed functions until the model
//! answers without requesting a tool, or the round budget runs out.
//!
//! ```text
//! round 1..=max_rounds:
//!     send ─► record usage as "<model>-<round>"
//!        │
//!        ├─ no tool calls ─► return
//!        └─ per tool call: append call, parse args, invoke, append result
//! budget exhausted ─► MaxFunctionIterationsExceeded
//! ```

use std::time::Duration;
use tracing::{debug, warn};

use crate::conversation::Conversation;
use crate::error::{LlmError, Result};
use crate::traits::{
    ChatMessage, FunctionInvoker, FunctionOutput, ProviderRequest, ProviderResponse, Transport,
    TransportOutcome,
};
use crate::usage::{UsageLedger, UsageRecord};

/// Final response of the loop and how many rounds it took.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub response: ProviderResponse,
    pub rounds: usize,
}

/// Ledger label of one round.
pub fn round_label(model: &str, round: usize) -> String {
    format!("{}-{}", model, round)
}

/// Send one request, turning an expired deadline into a `TimedOut` outcome.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    request: &ProviderRequest,
    timeout: Duration,
) -> Result<ProviderResponse> {
    match tokio::time::timeout(timeout, transport.send_request(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                model = %request.model,
                timeout_ms = timeout.as_millis() as u64,
                "Transport call exceeded deadline"
            );
            Ok(ProviderResponse {
                text: String::new(),
                tool_calls: Vec::new(),
                usage: UsageRecord::new(&request.model, request.billing_mode),
                outcome: TransportOutcome::TimedOut,
            })
        }
    }
}

/// Run the loop for one attempt.
///
/// `request.messages` is refreshed from `conversation` before every round.
/// Tool calls and results are appended to `conversation`.
pub async fn run_function_loop(
    transport: &dyn Transport,
    functions: Option<&dyn FunctionInvoker>,
    request: &mut ProviderRequest,
    conversation: &mut Conversation,
    ledger: &mut UsageLedger,
    max_rounds: usize,
    timeout: Duration,
) -> Result<LoopOutcome> {
    for round in 1..=max_rounds {
        request.messages = conversation.messages().to_vec();
        let response = send_with_timeout(transport, request, timeout).await?;
        ledger.record_as(round_label(&request.model, round), response.usage.clone())?;

        if response.outcome != TransportOutcome::Completed || !response.has_tool_calls() {
            return Ok(LoopOutcome { response, rounds: round });
        }

        debug!(
            model = %request.model,
            round,
            calls = response.tool_calls.len(),
            "Executing requested functions"
        );
        conversation.append(ChatMessage::assistant_with_tools(
            response.text.clone(),
            response.tool_calls.clone(),
        ));

        for call in &response.tool_calls {
            let output = match call.parse_arguments() {
                Ok(arguments) => match functions {
                    Some(invoker) => invoker.invoke(call.name(), &arguments).await,
                    None => FunctionOutput::error("no function implementations are available"),
                },
                Err(e) => {
                    warn!(function = %call.name(), error = %e, "Unparseable tool arguments");
                    FunctionOutput::error(e.to_string())
                }
            };
            conversation.append(ChatMessage::tool_result(call.id.clone(), output.to_item_content()));
        }
    }

    Err(LlmError::MaxFunctionIterationsExceeded { max: max_rounds })
}
