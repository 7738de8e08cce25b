//! EdgeQuake Economizer - Cost-Optimization Decision Layer for LLM Requests
//!
//! This crate sits between an application and an LLM provider's request
//! API. For each outgoing request it decides:
//! - How much to pad a reusable system instruction so the provider's
//!   automatic prompt cache activates
//! - Which reasoning tier to request, from instruction length and model size
//! - Whether to retry against a stronger model after the model rates its
//!   own answer
//! - How to loop a function-calling exchange to completion, within a budget
//!
//! It also prices raw token usage and keeps a per-conversation ledger.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`catalog`] | Immutable model table: prices, cache thresholds, lineage |
//! | [`usage`] | Usage records, cost, ledger and report |
//! | [`reasoning`] | Reasoning tier resolution, restriction and escalation |
//! | [`cache_padding`] | Cache-activation padding optimizer |
//! | [`quality`] | Self-rating and escalation state machine |
//! | [`function_loop`] | Bounded tool-call loop |
//! | [`engine`] | [`Economizer`], wiring everything for one request |
//!
//! # Architecture
//!
//! The network transport is not part of this crate. Applications implement
//! [`Transport`] (and [`FunctionInvoker`] for tools); the engine hands it a
//! fully decided [`ProviderRequest`] and reacts to the returned outcome.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use edgequake_economizer::{Economizer, Input, PricingCatalog, RequestOptions, UsageLedger};
//!
//! let engine = Economizer::new(Arc::new(PricingCatalog::builtin()), Arc::new(my_transport));
//! let mut ledger = UsageLedger::new();
//! let response = engine
//!     .execute(&RequestOptions::new("gpt-5-mini", "Be concise."), Input::Conversation(&mut conv), &mut ledger)
//!     .await?;
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for collaborator trait definitions
//! - [`crate::providers`] for the test doubles

pub mod cache_padding;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod function_loop;
pub mod providers;
pub mod quality;
pub mod reasoning;
pub mod tokenizer;
pub mod traits;
pub mod usage;

pub use cache_padding::{
    resolve_padding, ConversationProfile, PaddingDecision, PaddingMemo, PaddingParams,
};
pub use catalog::{ModelFamily, ModelRecord, PricingCatalog, SizeTier, Verbosity};
pub use config::EngineConfig;
pub use conversation::Conversation;
pub use engine::{
    Economizer, EconomizerResponse, FinalOutcome, Input, PaddingPlan, RequestOptions,
};
pub use error::{LlmError, Result};
pub use function_loop::run_function_loop;
pub use providers::{MockFunctions, MockTransport};
pub use quality::{Escalation, QualityOptions, RatingOutcome};
pub use reasoning::{
    apply_restrictions, compute_escalated_tier, resolve_effective, ReasoningSpec, ReasoningTier,
    RestrictionScope,
};
pub use tokenizer::Tokenizer;
pub use traits::{
    ChatMessage, ChatRole, FunctionCall, FunctionDefinition, FunctionInvoker, FunctionOutput,
    ProviderRequest, ProviderResponse, TokenRestriction, ToolCall, ToolDefinition, Transport,
    TransportOutcome,
};
pub use usage::{
    format_cost, format_tokens, BillingMode, CacheRetention, CostBreakdown, UsageKey,
    UsageLedger, UsageRecord,
};
