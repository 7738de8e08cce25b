//! The decision engine.
//!
//! # Overview
//!
//! [`Economizer`] wires the components together for one request:
//!
//! ```text
//! execute(options, input)
//!   ├─ catalog lookup, family gate, verbosity check
//!   ├─ sanitize rating tags typed by the user
//!   ├─ padding (memoized per call group)
//!   └─ loop over attempts (quality machine):
//!        ├─ effective reasoning tier (resolve ► restrict ► validate)
//!        ├─ function loop ► transport (with deadline) ► usage ledger
//!        └─ Retry ► roll back conversation items │ Finish ► response
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edgequake_economizer::catalog::PricingCatalog;
//! use edgequake_economizer::engine::{Economizer, Input, RequestOptions};
//! use edgequake_economizer::cache_padding::PaddingMemo;
//! use edgequake_economizer::providers::MockTransport;
//! use edgequake_economizer::usage::UsageLedger;
//!
//! # async fn demo() -> edgequake_economizer::Result<()> {
//! let engine = Economizer::new(
//!     Arc::new(PricingCatalog::builtin()),
//!     Arc::new(MockTransport::new()),
//! );
//! let mut memo = PaddingMemo::default();
//! let mut ledger = UsageLedger::new();
//!
//! let options = RequestOptions::new("gpt-5-mini", "You are a concise assistant.");
//! let input = Input::Message { text: "Hello".to_string(), padding: &mut memo };
//! let response = engine.execute(&options, input, &mut ledger).await?;
//! println!("{}\n{}", response.text, engine.report(&ledger)?);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache_padding::{resolve_padding, ConversationProfile, PaddingMemo, PaddingParams};
use crate::catalog::{ModelRecord, PricingCatalog, Verbosity};
use crate::config::EngineConfig;
use crate::conversation::Conversation;
use crate::error::{LlmError, Result};
use crate::function_loop::run_function_loop;
use crate::quality::{
    contains_rating_tag, strip_rating_tags, with_rating_instruction, AttemptSettings, Escalation,
    QualityMachine, QualityOptions, RatingOutcome, Step,
};
use crate::reasoning::{
    apply_restrictions, resolve_effective, ReasoningSpec, ReasoningTier, RestrictionScope,
};
use crate::tokenizer::Tokenizer;
use crate::traits::{
    ChatMessage, FunctionInvoker, ProviderRequest, TokenRestriction, ToolDefinition, Transport,
    TransportOutcome,
};
use crate::usage::{BillingMode, UsageLedger};

// ============================================================================
// Request options
// ============================================================================

/// Expected reuse of the system instruction, for cache padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingPlan {
    /// Expected calls (single shot) or conversations sharing the instruction.
    pub expected_calls: u32,

    /// Shape of those conversations, when they are multi-turn.
    #[serde(default)]
    pub conversation: Option<ConversationProfile>,
}

/// Everything the caller decides about one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub model: String,
    pub system_instruction: String,
    pub reasoning: ReasoningSpec,
    pub restrict_high_reasoning: Option<RestrictionScope>,
    pub restrict_medium_reasoning: Option<RestrictionScope>,
    pub verbosity: Option<Verbosity>,
    pub output_restriction: Option<TokenRestriction>,
    pub reasoning_restriction: Option<TokenRestriction>,
    pub billing_mode: BillingMode,
    pub cache_pool_key: Option<String>,
    /// `None` disables padding.
    pub padding: Option<PaddingPlan>,
    /// `None` disables self-rating and escalation.
    pub quality: Option<QualityOptions>,
    pub tools: Vec<ToolDefinition>,
    /// Per-call deadline; the engine default applies when `None`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new(model: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: system_instruction.into(),
            reasoning: ReasoningSpec::default(),
            restrict_high_reasoning: None,
            restrict_medium_reasoning: None,
            verbosity: None,
            output_restriction: None,
            reasoning_restriction: None,
            billing_mode: BillingMode::RealTime,
            cache_pool_key: None,
            padding: None,
            quality: None,
            tools: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningSpec) -> Self {
        self.reasoning = reasoning;
        self
    }

    /// Demote high/medium reasoning one step for the given model sizes.
    pub fn with_reasoning_restrictions(
        mut self,
        at_high: Option<RestrictionScope>,
        at_medium: Option<RestrictionScope>,
    ) -> Self {
        self.restrict_high_reasoning = at_high;
        self.restrict_medium_reasoning = at_medium;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = Some(verbosity);
        self
    }

    pub fn with_token_restrictions(
        mut self,
        output: Option<TokenRestriction>,
        reasoning: Option<TokenRestriction>,
    ) -> Self {
        self.output_restriction = output;
        self.reasoning_restriction = reasoning;
        self
    }

    pub fn with_billing_mode(mut self, mode: BillingMode) -> Self {
        self.billing_mode = mode;
        self
    }

    pub fn with_cache_pool_key(mut self, key: impl Into<String>) -> Self {
        self.cache_pool_key = Some(key.into());
        self
    }

    pub fn with_padding(mut self, plan: PaddingPlan) -> Self {
        self.padding = Some(plan);
        self
    }

    pub fn with_quality(mut self, quality: QualityOptions) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What the request is about.
#[derive(Debug)]
pub enum Input<'a> {
    /// Standalone message; the memo is shared by the caller's call group.
    Message {
        text: String,
        padding: &'a mut PaddingMemo,
    },
    /// Open conversation whose last user message is the new turn.
    Conversation(&'a mut Conversation),
}

// ============================================================================
// Response
// ============================================================================

/// How the call ended, after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalOutcome {
    Answered,
    OutputCeilingReached,
    TimedOut,
    Aborted,
}

impl From<TransportOutcome> for FinalOutcome {
    fn from(outcome: TransportOutcome) -> Self {
        match outcome {
            TransportOutcome::Completed => FinalOutcome::Answered,
            TransportOutcome::OutputCeilingReached => FinalOutcome::OutputCeilingReached,
            TransportOutcome::TimedOut => FinalOutcome::TimedOut,
            TransportOutcome::Aborted => FinalOutcome::Aborted,
        }
    }
}

/// Final answer and the decisions that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomizerResponse {
    /// Answer with rating tags stripped, or an apology for ceiling/timeout.
    pub text: String,
    pub outcome: FinalOutcome,
    pub rating: RatingOutcome,
    pub escalation: Escalation,
    pub escalation_performed: bool,
    /// The caller's message carried rating tags that were removed.
    pub user_tags_stripped: bool,
    pub truncation_recovery_attempted: bool,
    /// Model that produced the final answer.
    pub model: String,
    /// Reasoning tier of the final attempt.
    pub reasoning: ReasoningTier,
    /// Attempts made (1 to 3).
    pub attempts: usize,
    pub padded: bool,
}

// ============================================================================
// Engine
// ============================================================================

/// Cost-optimization decision engine.
pub struct Economizer {
    catalog: Arc<PricingCatalog>,
    transport: Arc<dyn Transport>,
    functions: Option<Arc<dyn FunctionInvoker>>,
    config: EngineConfig,
    /// Tokenizers by model name, loaded on first use.
    tokenizers: RwLock<HashMap<String, Arc<Tokenizer>>>,
}

impl Economizer {
    /// Create an engine with the default configuration.
    pub fn new(catalog: Arc<PricingCatalog>, transport: Arc<dyn Transport>) -> Self {
        Self {
            catalog,
            transport,
            functions: None,
            config: EngineConfig::default(),
            tokenizers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the configuration after validating it.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Functions the model may call.
    pub fn with_functions(mut self, functions: Arc<dyn FunctionInvoker>) -> Self {
        self.functions = Some(functions);
        self
    }

    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Human-readable ledger priced with this engine's catalog.
    pub fn report(&self, ledger: &UsageLedger) -> Result<String> {
        ledger.report(&self.catalog)
    }

    /// Decide, send and (if needed) retry one request.
    pub async fn execute(
        &self,
        options: &RequestOptions,
        input: Input<'_>,
        ledger: &mut UsageLedger,
    ) -> Result<EconomizerResponse> {
        let model = self.catalog.get(&options.model)?;
        self.check_model(model, options.verbosity)?;
        let rated = options.quality.is_some();

        match input {
            Input::Message { text, padding } => {
                let (text, user_tags_stripped) = if rated && contains_rating_tag(&text) {
                    warn!("Rating tags removed from user message");
                    (strip_rating_tags(&text).0, true)
                } else {
                    (text, false)
                };
                let tokenizer = self.tokenizer_for(&model.name).await;
                let first_user = tokenizer.count_tokens(&text) as u64;
                let filler = self
                    .padding_for(model, options, &tokenizer, Some(first_user), padding)?;
                let mut scratch = Conversation::new();
                scratch.append(ChatMessage::user(text));
                self.run(model, options, &mut scratch, filler, ledger, user_tags_stripped)
                    .await
            }
            Input::Conversation(conversation) => {
                let Some(last) = conversation.last_user_text() else {
                    return Err(LlmError::InvalidArgument(
                        "conversation has no user message".to_string(),
                    ));
                };
                if rated && contains_rating_tag(last) {
                    return Err(LlmError::ProtectedTokenInConversation);
                }
                let tokenizer = self.tokenizer_for(&model.name).await;
                let estimated = self.baseline_tokens(options, &tokenizer)?
                    + conversation.estimate_total_tokens(&tokenizer) as u64;
                if estimated > u64::from(model.max_input_tokens) {
                    warn!(
                        model = %model.name,
                        estimated,
                        max = model.max_input_tokens,
                        "Conversation likely exceeds the model's input window"
                    );
                }
                let first_user = conversation
                    .first_user_text()
                    .map(|text| tokenizer.count_tokens(text) as u64);
                let filler = self.padding_for(
                    model,
                    options,
                    &tokenizer,
                    first_user,
                    conversation.padding_memo_mut(),
                )?;
                let response = self
                    .run(model, options, conversation, filler, ledger, false)
                    .await?;
                if response.outcome == FinalOutcome::Answered {
                    conversation.append(ChatMessage::assistant(response.text.clone()));
                }
                Ok(response)
            }
        }
    }

    /// Effective tier for `model`: resolve the range, apply size restrictions,
    /// then validate against the catalog.
    ///
    /// With `nearest_on_mismatch` a disallowed tier maps to the closest
    /// allowed one instead of failing (used for escalated attempts).
    pub fn effective_tier(
        &self,
        model: &ModelRecord,
        spec: ReasoningSpec,
        options: &RequestOptions,
        instruction_length: usize,
        nearest_on_mismatch: bool,
    ) -> Result<ReasoningTier> {
        let resolved = resolve_effective(spec, instruction_length, &self.config.reasoning);
        let tier = apply_restrictions(
            resolved,
            model.size_tier(),
            options.restrict_high_reasoning,
            options.restrict_medium_reasoning,
        );
        if model.supports_reasoning(tier) {
            return Ok(tier);
        }
        if nearest_on_mismatch {
            if let Some(nearest) = model.nearest_allowed_tier(tier) {
                debug!(model = %model.name, requested = %tier, used = %nearest, "Mapped reasoning tier");
                return Ok(nearest);
            }
        }
        Err(LlmError::UnsupportedReasoningTier {
            model: model.name.clone(),
            tier: tier.to_string(),
        })
    }

    fn check_model(&self, model: &ModelRecord, verbosity: Option<Verbosity>) -> Result<()> {
        if !self.transport.supports_family(model.family) {
            return Err(LlmError::NotSupported(format!(
                "{} models through the '{}' transport",
                model.family,
                self.transport.name()
            )));
        }
        if let Some(v) = verbosity {
            if !model.supports_verbosity(v) {
                return Err(LlmError::InvalidArgument(format!(
                    "model '{}' does not accept verbosity {:?}",
                    model.name, v
                )));
            }
        }
        Ok(())
    }

    /// Tokenizer matching the model's encoding, cached per model name.
    async fn tokenizer_for(&self, model: &str) -> Arc<Tokenizer> {
        if let Some(tokenizer) = self.tokenizers.read().await.get(model) {
            return Arc::clone(tokenizer);
        }
        let mut tokenizers = self.tokenizers.write().await;
        Arc::clone(
            tokenizers
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(Tokenizer::for_model(model))),
        )
    }

    /// Tokens of the reusable prefix: rated instruction plus tool schemas.
    fn baseline_tokens(&self, options: &RequestOptions, tokenizer: &Tokenizer) -> Result<u64> {
        let instruction = self.instruction(options, None, options.quality.is_some());
        let mut tokens = tokenizer.count_tokens(&instruction);
        if !options.tools.is_empty() {
            let schema = serde_json::to_string(&options.tools)?;
            tokens += tokenizer.count_tokens(&schema);
        }
        Ok(tokens as u64)
    }

    /// Padding for this call group. A conversation profile without an
    /// opening message size takes `first_user_tokens`.
    fn padding_for(
        &self,
        model: &ModelRecord,
        options: &RequestOptions,
        tokenizer: &Tokenizer,
        first_user_tokens: Option<u64>,
        memo: &mut PaddingMemo,
    ) -> Result<Option<String>> {
        let Some(plan) = &options.padding else {
            return Ok(None);
        };
        if memo.is_evaluated() {
            return Ok(memo.padding_text().map(str::to_string));
        }
        let conversation = plan.conversation.clone().map(|mut profile| {
            if profile.first_user_message_tokens.is_none() {
                profile.first_user_message_tokens = first_user_tokens;
            }
            profile
        });
        let params = PaddingParams {
            enabled: true,
            expected_calls: plan.expected_calls,
            baseline_tokens: self.baseline_tokens(options, tokenizer)?,
            pooled: options.cache_pool_key.is_some(),
            conversation,
        };
        resolve_padding(model, &params, &self.config.padding, memo)
    }

    /// System instruction as sent: filler first so it stays in the cached prefix.
    fn instruction(&self, options: &RequestOptions, filler: Option<&str>, rate: bool) -> String {
        let end_marker = options.quality.as_ref().and_then(|q| q.end_marker.as_deref());
        let body = if rate {
            with_rating_instruction(&options.system_instruction, end_marker)
        } else {
            options.system_instruction.clone()
        };
        match filler {
            Some(filler) => format!("{}\n\n{}", filler, body),
            None => body,
        }
    }

    async fn run(
        &self,
        model: &ModelRecord,
        options: &RequestOptions,
        conversation: &mut Conversation,
        filler: Option<String>,
        ledger: &mut UsageLedger,
        user_tags_stripped: bool,
    ) -> Result<EconomizerResponse> {
        let instruction_length = options.system_instruction.chars().count()
            + conversation
                .last_user_text()
                .map_or(0, |text| text.chars().count());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.default_timeout());
        let mark = conversation.len();

        let tiers = |target: &ModelRecord, spec: ReasoningSpec, escalated: bool| {
            self.effective_tier(target, spec, options, instruction_length, escalated)
        };

        let mut machine = QualityMachine::new(options.quality.clone());
        let mut settings = machine.start(AttemptSettings {
            model: model.name.clone(),
            reasoning: options.reasoning,
            output_restriction: options.output_restriction,
            reasoning_restriction: options.reasoning_restriction,
            rate: false,
            escalated: false,
        });
        let mut attempts = 0;

        loop {
            let target = self.catalog.get(&settings.model)?;
            let tier = tiers(target, settings.reasoning, settings.escalated)?;
            let mut request = ProviderRequest {
                model: settings.model.clone(),
                system_instruction: self.instruction(options, filler.as_deref(), settings.rate),
                messages: Vec::new(),
                reasoning: tier,
                verbosity: options.verbosity.filter(|v| target.supports_verbosity(*v)),
                output_restriction: settings.output_restriction,
                reasoning_restriction: settings.reasoning_restriction,
                tools: options.tools.clone(),
                billing_mode: options.billing_mode,
                cache_pool_key: options.cache_pool_key.clone(),
            };
            attempts += 1;
            info!(
                model = %request.model,
                reasoning = %tier,
                attempt = attempts,
                rated = settings.rate,
                "Sending request"
            );

            let outcome = run_function_loop(
                self.transport.as_ref(),
                self.functions.as_deref(),
                &mut request,
                conversation,
                ledger,
                self.config.function_loop.max_rounds,
                timeout,
            )
            .await?;

            match machine.on_response(&self.catalog, &tiers, &settings, &outcome.response)? {
                Step::Retry(next) => {
                    conversation.truncate(mark);
                    settings = next;
                }
                Step::Finish(finish) => {
                    return Ok(EconomizerResponse {
                        text: finish.text,
                        outcome: finish.outcome.into(),
                        rating: finish.rating,
                        escalation: finish.escalation,
                        escalation_performed: finish.escalation_performed,
                        user_tags_stripped,
                        truncation_recovery_attempted: machine.recovery_attempted(),
                        model: settings.model,
                        reasoning: tier,
                        attempts,
                        padded: filler.is_some(),
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Economizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Economizer")
            .field("transport", &self.transport.name())
            .field("models", &self.catalog.models().len())
            .field("config", &self.config)
            .finish()
    }
}
