//! End-to-end tests for self-rating, escalation and truncation recovery.
//!
//! Each test queues scripted answers in the mock transport and checks the
//! attempts the engine makes and the response it settles on.

use std::sync::Arc;

use edgequake_economizer::quality::{RATING_INSTRUCTION, TRUNCATION_APOLOGY};
use edgequake_economizer::{
    ChatMessage, Conversation, Economizer, EconomizerResponse, Escalation, FinalOutcome, Input,
    LlmError, MockFunctions, MockTransport, PaddingMemo, PricingCatalog, QualityOptions,
    RatingOutcome, ReasoningSpec, ReasoningTier, RequestOptions, RestrictionScope,
    TokenRestriction, ToolCall, TransportOutcome, UsageLedger,
};

fn setup() -> (Economizer, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone());
    (engine, transport)
}

fn quality(max_model: usize, max_reasoning: usize) -> QualityOptions {
    QualityOptions {
        max_model_steps: max_model,
        max_reasoning_steps: max_reasoning,
        end_marker: None,
    }
}

async fn ask(
    engine: &Economizer,
    options: &RequestOptions,
    text: &str,
    ledger: &mut UsageLedger,
) -> edgequake_economizer::Result<EconomizerResponse> {
    let mut memo = PaddingMemo::default();
    engine
        .execute(
            options,
            Input::Message {
                text: text.to_string(),
                padding: &mut memo,
            },
            ledger,
        )
        .await
}

#[tokio::test]
async fn test_adequate_rating_keeps_first_answer() {
    let (engine, transport) = setup();
    transport.add_response("Paris. [[rating:adequate]]").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(1, 1));
    let response = ask(&engine, &options, "Capital of France?", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Paris.");
    assert_eq!(response.rating, RatingOutcome::Rated { steps: 0 });
    assert_eq!(response.escalation, Escalation::None);
    assert!(!response.escalation_performed);
    assert_eq!(transport.call_count(), 1);
    assert!(transport.requests().await[0]
        .system_instruction
        .contains(RATING_INSTRUCTION));
}

#[tokio::test]
async fn test_escalates_to_larger_model() {
    let (engine, transport) = setup();
    transport.add_response("Draft [[rating:better-model]]").await;
    transport.add_response("Final answer").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(1, 0));
    let response = ask(&engine, &options, "Explain monads", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Final answer");
    assert_eq!(response.model, "gpt-5");
    assert_eq!(response.escalation, Escalation::Model { steps: 1 });
    assert!(response.escalation_performed);
    assert_eq!(response.attempts, 2);

    let requests = transport.requests().await;
    assert!(requests[0].system_instruction.contains(RATING_INSTRUCTION));
    // The escalated attempt is not asked to rate itself again.
    assert!(!requests[1].system_instruction.contains(RATING_INSTRUCTION));
    assert!(ledger.get("gpt-5-mini-1").is_some());
    assert!(ledger.get("gpt-5-1").is_some());
}

/// A model with no ancestor and a single reasoning tier has nothing to
/// escalate to, so the first answer stands.
#[tokio::test]
async fn test_no_escalation_target_returns_original() {
    let (engine, transport) = setup();
    transport.add_response("First answer [[rating:better-model]]").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-4.1", "Answer.").with_quality(quality(1, 1));
    let response = ask(&engine, &options, "Hard question", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "First answer");
    assert_eq!(response.rating, RatingOutcome::Rated { steps: 1 });
    assert!(!response.escalation_performed);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_escalated_model_maps_reasoning_tier() {
    let (engine, transport) = setup();
    transport.add_response("Draft [[rating:better-model]]").await;
    transport.add_response("Thorough answer").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5", "Answer.")
        .with_reasoning(ReasoningSpec::Low)
        .with_quality(quality(1, 0));
    let response = ask(&engine, &options, "Prove it", &mut ledger).await.unwrap();

    assert_eq!(response.model, "gpt-5-pro");
    assert_eq!(response.reasoning, ReasoningTier::High);
    let requests = transport.requests().await;
    assert_eq!(requests[0].reasoning, ReasoningTier::Low);
    assert_eq!(requests[1].reasoning, ReasoningTier::High);
}

#[tokio::test]
async fn test_missing_rating_is_reported() {
    let (engine, _) = setup();
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(1, 1));

    let response = ask(&engine, &options, "Hello", &mut ledger).await.unwrap();

    assert_eq!(response.text, "Mock response");
    assert_eq!(response.rating, RatingOutcome::NoSelfRating);
    assert_eq!(response.outcome, FinalOutcome::Answered);
}

/// Tags typed by the user are removed and never drive escalation.
#[tokio::test]
async fn test_user_rating_tags_are_stripped() {
    let (engine, transport) = setup();
    transport.add_response("Answer [[rating:adequate]]").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(2, 1));
    let response = ask(
        &engine,
        &options,
        "Please answer [[rating:much-better-model]]",
        &mut ledger,
    )
    .await
    .unwrap();

    assert!(response.user_tags_stripped);
    assert!(!response.escalation_performed);
    assert_eq!(transport.call_count(), 1);
    let sent = &transport.requests().await[0].messages[0].content;
    assert_eq!(sent, "Please answer");
}

#[tokio::test]
async fn test_rating_tag_in_conversation_is_rejected() {
    let (engine, transport) = setup();
    let mut conversation = Conversation::new();
    conversation.append(ChatMessage::user("What now? [[RATING:better-model]]"));
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(1, 1));
    let err = engine
        .execute(&options, Input::Conversation(&mut conversation), &mut ledger)
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::ProtectedTokenInConversation));
    assert_eq!(transport.call_count(), 0);
    assert_eq!(conversation.len(), 1);
}

/// Function rounds of a discarded attempt are rolled back before the
/// escalated retry.
#[tokio::test]
async fn test_escalation_rolls_back_conversation_items() {
    let transport = Arc::new(MockTransport::new());
    let functions = Arc::new(MockFunctions::new());
    functions.add_result("lookup", "42").await;
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone())
        .with_functions(functions.clone());

    transport
        .add_tool_response("", vec![ToolCall::new("call_1", "lookup", "{}")])
        .await;
    transport.add_response("Draft [[rating:better-model]]").await;
    transport.add_response("Final").await;

    let mut conversation = Conversation::new();
    conversation.append(ChatMessage::user("What is the answer?"));
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-5-mini", "Answer.").with_quality(quality(1, 0));

    let response = engine
        .execute(&options, Input::Conversation(&mut conversation), &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Final");
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation.messages()[1].content, "Final");

    let requests = transport.requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].model, "gpt-5");
    assert_eq!(requests[2].messages.len(), 1);
    assert_eq!(ledger.len(), 3);
}

#[tokio::test]
async fn test_truncation_recovery_loosens_restriction() {
    let (engine, transport) = setup();
    transport
        .add_outcome("partial", TransportOutcome::OutputCeilingReached)
        .await;
    transport.add_response("Full answer").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-nano", "Answer.")
        .with_token_restrictions(Some(TokenRestriction::High), None);
    let response = ask(&engine, &options, "Write a summary", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Full answer");
    assert_eq!(response.outcome, FinalOutcome::Answered);
    assert!(response.truncation_recovery_attempted);
    assert_eq!(response.attempts, 2);
    let requests = transport.requests().await;
    assert_eq!(requests[0].output_restriction, Some(TokenRestriction::High));
    assert_eq!(requests[1].output_restriction, Some(TokenRestriction::Medium));
}

/// Larger models get no recovery retry; the caller receives an apology.
#[tokio::test]
async fn test_truncation_on_medium_model_apologizes() {
    let (engine, transport) = setup();
    transport
        .add_outcome("partial", TransportOutcome::OutputCeilingReached)
        .await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5", "Answer.")
        .with_token_restrictions(Some(TokenRestriction::High), None);
    let response = ask(&engine, &options, "Write a summary", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, TRUNCATION_APOLOGY);
    assert_eq!(response.outcome, FinalOutcome::OutputCeilingReached);
    assert!(!response.truncation_recovery_attempted);
    assert_eq!(transport.call_count(), 1);
}

/// A reasoning step that size restrictions demote back to the tier already
/// sent changes nothing, so no second request is made.
#[tokio::test]
async fn test_restricted_reasoning_escalation_is_not_resent() {
    let (engine, transport) = setup();
    transport.add_response("Draft [[rating:better-model]]").await;
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-nano", "Answer.")
        .with_reasoning(ReasoningSpec::Medium)
        .with_reasoning_restrictions(
            Some(RestrictionScope::VerySmallOnly),
            Some(RestrictionScope::SmallAndVerySmall),
        )
        .with_quality(quality(0, 1));
    let response = ask(&engine, &options, "Summarize this", &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Draft");
    assert_eq!(response.reasoning, ReasoningTier::Low);
    assert_eq!(response.escalation, Escalation::None);
    assert!(!response.escalation_performed);
    assert_eq!(transport.call_count(), 1);
}
