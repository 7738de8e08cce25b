//! End-to-end tests for the Economizer request pipeline.
//!
//! These tests drive the full engine through the mock transport: catalog
//! checks, padding, reasoning resolution, the function loop, timeouts and
//! the usage ledger.

use std::sync::Arc;
use std::time::Duration;

use edgequake_economizer::cache_padding::FILLER_PREAMBLE;
use edgequake_economizer::quality::TIMEOUT_APOLOGY;
use edgequake_economizer::{
    BillingMode, ChatMessage, ChatRole, Conversation, ConversationProfile, Economizer,
    EngineConfig, FinalOutcome, Input, LlmError, MockFunctions, MockTransport, ModelFamily,
    PaddingMemo, PaddingPlan, PricingCatalog, RatingOutcome, ReasoningSpec, ReasoningTier,
    RequestOptions, ToolCall, ToolDefinition, UsageLedger, UsageRecord, Verbosity,
};

fn setup() -> (Economizer, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone());
    (engine, transport)
}

async fn send(
    engine: &Economizer,
    options: &RequestOptions,
    text: &str,
    memo: &mut PaddingMemo,
    ledger: &mut UsageLedger,
) -> edgequake_economizer::Result<edgequake_economizer::EconomizerResponse> {
    engine
        .execute(
            options,
            Input::Message {
                text: text.to_string(),
                padding: memo,
            },
            ledger,
        )
        .await
}

#[tokio::test]
async fn test_single_message_records_ledger() {
    let (engine, transport) = setup();
    transport.add_response("Hello!").await;
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5-mini", "You are a friendly assistant.");
    let response = send(&engine, &options, "Hi", &mut memo, &mut ledger).await.unwrap();

    assert_eq!(response.text, "Hello!");
    assert_eq!(response.outcome, FinalOutcome::Answered);
    assert_eq!(response.rating, RatingOutcome::NotRequested);
    assert_eq!(response.model, "gpt-5-mini");
    assert_eq!(response.attempts, 1);
    assert!(!response.padded);
    assert_eq!(memo, PaddingMemo::NotEvaluated);

    let usage = ledger.get("gpt-5-mini-1").expect("round usage recorded");
    assert!(usage.input_tokens > 0);
    let report = engine.report(&ledger).unwrap();
    assert!(report.contains("gpt-5-mini-1"));
    assert!(report.contains("Total: $"));
}

#[tokio::test]
async fn test_padding_applied_once_and_memoized() {
    let (engine, transport) = setup();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    // About 500 tokens: below the 1024 threshold, above the pooled break-even.
    let instruction = "word ".repeat(500);
    let options = RequestOptions::new("gpt-5", instruction)
        .with_cache_pool_key("support-bot")
        .with_padding(PaddingPlan {
            expected_calls: 1000,
            conversation: None,
        });

    let first = send(&engine, &options, "Question one", &mut memo, &mut ledger)
        .await
        .unwrap();
    assert!(first.padded);
    let filler = memo.padding_text().expect("padding memoized").to_string();
    assert!(filler.starts_with(FILLER_PREAMBLE));

    let second = send(&engine, &options, "Question two", &mut memo, &mut ledger)
        .await
        .unwrap();
    assert!(second.padded);
    assert_eq!(memo.padding_text(), Some(filler.as_str()));

    let requests = transport.requests().await;
    assert!(requests[0].system_instruction.starts_with(FILLER_PREAMBLE));
    assert_eq!(requests[0].system_instruction, requests[1].system_instruction);
    assert_eq!(requests[0].cache_pool_key.as_deref(), Some("support-bot"));
}

#[tokio::test]
async fn test_small_instruction_not_padded_but_memoized() {
    let (engine, transport) = setup();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5", "Be brief.").with_padding(PaddingPlan {
        expected_calls: 3,
        conversation: None,
    });
    let response = send(&engine, &options, "Hi", &mut memo, &mut ledger).await.unwrap();

    assert!(!response.padded);
    assert_eq!(memo, PaddingMemo::NoPaddingNeeded);
    assert_eq!(transport.requests().await[0].system_instruction, "Be brief.");
}

#[tokio::test]
async fn test_adaptive_reasoning_follows_message_length() {
    let (engine, transport) = setup();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-5", "Answer questions.")
        .with_reasoning(ReasoningSpec::LowMediumOrHigh);

    let short = send(&engine, &options, "Quick one?", &mut memo, &mut ledger)
        .await
        .unwrap();
    let long_message = "detail ".repeat(500);
    let long = send(&engine, &options, &long_message, &mut memo, &mut ledger)
        .await
        .unwrap();

    assert_eq!(short.reasoning, ReasoningTier::Low);
    assert_eq!(long.reasoning, ReasoningTier::High);
    let requests = transport.requests().await;
    assert_eq!(requests[0].reasoning, ReasoningTier::Low);
    assert_eq!(requests[1].reasoning, ReasoningTier::High);
}

#[tokio::test]
async fn test_reasoning_thresholds_from_config() {
    let transport = Arc::new(MockTransport::new());
    let config = EngineConfig::from_toml(
        r#"
        [reasoning]
        short_instruction_chars = 5
        long_instruction_chars = 10
    "#,
    )
    .unwrap();
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone())
        .with_config(config)
        .unwrap();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5", "Answer.").with_reasoning(ReasoningSpec::NoneOrLow);
    let response = send(&engine, &options, "Hi", &mut memo, &mut ledger).await.unwrap();
    assert_eq!(response.reasoning, ReasoningTier::Low);
}

#[tokio::test]
async fn test_unsupported_reasoning_tier() {
    let (engine, transport) = setup();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-4.1", "Answer.").with_reasoning(ReasoningSpec::High);

    let err = send(&engine, &options, "Hi", &mut memo, &mut ledger)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::UnsupportedReasoningTier { .. }));
    assert_eq!(transport.call_count(), 0);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_unsupported_family_is_reported() {
    let transport = Arc::new(MockTransport::new().with_families(vec![ModelFamily::OpenAI]));
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone());
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gemini-2.5-flash", "Answer.");
    let err = send(&engine, &options, "Hi", &mut memo, &mut ledger)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::NotSupported(_)));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_verbosity_must_be_allowed() {
    let (engine, _) = setup();
    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-4.1", "Answer.").with_verbosity(Verbosity::Low);
    let err = send(&engine, &options, "Hi", &mut memo, &mut ledger)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::InvalidArgument(_)));

    let options = RequestOptions::new("gpt-5", "Answer.").with_verbosity(Verbosity::Low);
    assert!(send(&engine, &options, "Hi", &mut memo, &mut ledger).await.is_ok());
}

#[tokio::test]
async fn test_conversation_with_function_round() {
    let transport = Arc::new(MockTransport::new());
    let functions = Arc::new(MockFunctions::new());
    functions.add_result("get_weather", r#"{"temp_c": 21}"#).await;
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone())
        .with_functions(functions.clone());

    transport
        .add_tool_response(
            "",
            vec![ToolCall::new("call_1", "get_weather", r#"{"city": "Lyon"}"#)],
        )
        .await;
    transport.add_response("It is 21 degrees in Lyon.").await;

    let mut conversation = Conversation::new();
    conversation.append(ChatMessage::user("Weather in Lyon?"));
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-5-mini", "You can check the weather.").with_tools(vec![
        ToolDefinition::function(
            "get_weather",
            "Current weather for a city",
            serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        ),
    ]);

    let response = engine
        .execute(&options, Input::Conversation(&mut conversation), &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "It is 21 degrees in Lyon.");
    assert_eq!(conversation.len(), 4);
    assert_eq!(conversation.messages()[1].role, ChatRole::Assistant);
    assert_eq!(conversation.messages()[2].role, ChatRole::Tool);
    assert_eq!(conversation.messages()[3].content, "It is 21 degrees in Lyon.");
    assert_eq!(functions.invocations().await, vec!["get_weather".to_string()]);
    assert!(ledger.get("gpt-5-mini-1").is_some());
    assert!(ledger.get("gpt-5-mini-2").is_some());
    assert_eq!(transport.requests().await[0].tools.len(), 1);
}

#[tokio::test]
async fn test_function_loop_cap_returns_no_text() {
    let transport = Arc::new(MockTransport::new());
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone())
        .with_functions(Arc::new(MockFunctions::new()));
    for i in 0..6 {
        transport
            .add_tool_response("", vec![ToolCall::new(format!("call_{}", i), "search", "{}")])
            .await;
    }

    let mut memo = PaddingMemo::default();
    let mut ledger = UsageLedger::new();
    let options = RequestOptions::new("gpt-5-mini", "Use tools.");
    let err = send(&engine, &options, "Find it", &mut memo, &mut ledger)
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::MaxFunctionIterationsExceeded { max: 5 }));
    assert_eq!(transport.call_count(), 5);
}

#[tokio::test]
async fn test_timeout_becomes_apology() {
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(500)));
    let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), transport.clone());
    transport.add_response("too late").await;

    let mut conversation = Conversation::new();
    conversation.append(ChatMessage::user("Hello?"));
    let mut ledger = UsageLedger::new();
    let options =
        RequestOptions::new("gpt-5-mini", "Answer.").with_timeout(Duration::from_millis(20));

    let response = engine
        .execute(&options, Input::Conversation(&mut conversation), &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.outcome, FinalOutcome::TimedOut);
    assert_eq!(response.text, TIMEOUT_APOLOGY);
    // Nothing is appended for an unanswered turn.
    assert_eq!(conversation.len(), 1);
}

#[tokio::test]
async fn test_conversation_without_user_message() {
    let (engine, _) = setup();
    let mut conversation = Conversation::new();
    let mut ledger = UsageLedger::new();
    let err = engine
        .execute(
            &RequestOptions::new("gpt-5", "Answer."),
            Input::Conversation(&mut conversation),
            &mut ledger,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_batch_ledgers_merge() {
    let (engine, _) = setup();
    let options =
        RequestOptions::new("gpt-5-nano", "Classify.").with_billing_mode(BillingMode::Batch);
    let mut total = UsageLedger::new();

    for text in ["first item", "second item"] {
        let mut memo = PaddingMemo::default();
        let mut ledger = UsageLedger::new();
        send(&engine, &options, text, &mut memo, &mut ledger).await.unwrap();
        total.merge(&ledger).unwrap();
    }

    assert_eq!(total.len(), 1);
    let usage = total.get("gpt-5-nano-1").unwrap();
    assert_eq!(usage.billing_mode, BillingMode::Batch);
    assert!(total.total_cost(engine.catalog()).unwrap() > 0.0);
}

/// Real-time and batch calls of the same round share one ledger.
#[tokio::test]
async fn test_mixed_billing_modes_share_ledger() {
    let (engine, transport) = setup();
    let mut ledger = UsageLedger::new();

    let realtime = RequestOptions::new("gpt-5", "Answer.");
    let batch = RequestOptions::new("gpt-5", "Answer.").with_billing_mode(BillingMode::Batch);
    let mut memo = PaddingMemo::default();
    send(&engine, &realtime, "first", &mut memo, &mut ledger)
        .await
        .unwrap();
    let response = send(&engine, &batch, "second", &mut memo, &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.text, "Mock response");
    assert_eq!(transport.call_count(), 2);
    assert_eq!(ledger.len(), 2);
    let batch_key = UsageRecord::new("gpt-5", BillingMode::Batch).key();
    assert!(ledger.get_keyed("gpt-5-1", &batch_key).is_some());
    let realtime_key = UsageRecord::new("gpt-5", BillingMode::RealTime).key();
    assert!(ledger.get_keyed("gpt-5-1", &realtime_key).is_some());
    assert!(engine.report(&ledger).unwrap().contains("gpt-5-1: gpt-5 (batch)"));
}

/// A conversation profile without an opening message size is completed
/// from the conversation itself.
#[tokio::test]
async fn test_conversation_padding_measures_opening_message() {
    let (engine, transport) = setup();
    let mut conversation = Conversation::new();
    conversation.append(ChatMessage::user("Hello, I need help with my invoice."));
    let mut ledger = UsageLedger::new();

    let options = RequestOptions::new("gpt-5", "word ".repeat(900)).with_padding(PaddingPlan {
        expected_calls: 50,
        conversation: Some(ConversationProfile {
            turns: 2,
            first_user_message_tokens: None,
            avg_user_message_tokens: Some(40),
            avg_reply_tokens: Some(200),
        }),
    });

    let response = engine
        .execute(&options, Input::Conversation(&mut conversation), &mut ledger)
        .await
        .unwrap();

    assert_eq!(response.outcome, FinalOutcome::Answered);
    assert!(conversation.padding_memo().is_evaluated());
    assert_eq!(response.padded, conversation.padding_memo().padding_text().is_some());
    assert_eq!(transport.call_count(), 1);
}
