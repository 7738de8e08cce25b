//! Cache-padding optimizer.
//!
//! # Overview
//!
//! Providers with automatic prefix caching only discount a prompt once it
//! crosses an activation threshold. A reusable system instruction that sits
//! just below that threshold pays full price on every call; padding it with
//! inert filler can make every later call cheaper. This module decides
//! whether that trade is worth it and how much filler to add.
//!
//! Two cost models are used:
//!
//! - **Single shot**: `K` independent calls sharing the instruction. Pad to
//!   `threshold + 1` when the instruction is larger than the break-even size
//!   `S_limit = (S_obj / K) * (1 + (K - 1) * (1 - (1 - f_disc) * f_hit))`.
//! - **Conversation**: `C` conversations of `N` turns. Later turns resend
//!   earlier turns, so the cache may activate without any padding. Candidate
//!   paddings in cache-quantum steps are simulated and the cheapest wins.
//!
//! # Usage
//!
//! ```rust
//! use edgequake_economizer::cache_padding::{resolve_padding, PaddingMemo, PaddingParams};
//! use edgequake_economizer::catalog::PricingCatalog;
//! use edgequake_economizer::config::PaddingConfig;
//!
//! let catalog = PricingCatalog::builtin();
//! let model = catalog.get("gpt-5").unwrap();
//! let mut memo = PaddingMemo::default();
//!
//! let params = PaddingParams::single_shot(100, 900);
//! let filler = resolve_padding(model, &params, &PaddingConfig::default(), &mut memo).unwrap();
//! assert!(filler.is_some());
//! assert!(memo.is_evaluated());
//! ```
//!
//! # See Also
//!
//! - `conversation.rs` for the memo owned by a conversation

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::ModelRecord;
use crate::config::PaddingConfig;
use crate::error::{LlmError, Result};

/// Opening sentence of every filler block.
pub const FILLER_PREAMBLE: &str = "The following block is filler text with no meaning. \
Ignore it completely and never use it to answer.";

/// Neutral phrase repeated to build the filler body.
pub const FILLER_PHRASE: &str = " This sentence is intentionally left blank for formatting purposes.";

// ============================================================================
// Memo
// ============================================================================

/// Padding decision remembered for one call group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "text")]
pub enum PaddingMemo {
    /// No decision has been made yet.
    #[default]
    NotEvaluated,
    /// Evaluated; the instruction is sent as is.
    NoPaddingNeeded,
    /// Evaluated; this filler is appended to the instruction.
    Padding(String),
}

impl PaddingMemo {
    /// Whether a decision is already stored.
    pub fn is_evaluated(&self) -> bool {
        !matches!(self, PaddingMemo::NotEvaluated)
    }

    /// Stored filler text, if any.
    pub fn padding_text(&self) -> Option<&str> {
        match self {
            PaddingMemo::Padding(text) => Some(text),
            _ => None,
        }
    }
}

// ============================================================================
// Inputs and decisions
// ============================================================================

/// Expected shape of the conversations sharing the instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationProfile {
    /// Turns per conversation.
    pub turns: u32,

    /// Tokens of the opening user message; the engine measures it from the
    /// conversation when left empty.
    #[serde(default)]
    pub first_user_message_tokens: Option<u64>,

    /// Average tokens of each later user message.
    pub avg_user_message_tokens: Option<u64>,

    /// Average tokens of each assistant reply.
    pub avg_reply_tokens: Option<u64>,
}

/// What the caller knows about upcoming reuse of the instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingParams {
    /// Padding allowed at all.
    pub enabled: bool,

    /// Expected reuse count (single shot) or number of conversations.
    pub expected_calls: u32,

    /// Instruction, function and file tokens before padding.
    pub baseline_tokens: u64,

    /// Requests share a cache pool key.
    #[serde(default)]
    pub pooled: bool,

    /// Present when the instruction opens multi-turn conversations.
    #[serde(default)]
    pub conversation: Option<ConversationProfile>,
}

impl PaddingParams {
    /// Enabled single-shot parameters.
    pub fn single_shot(expected_calls: u32, baseline_tokens: u64) -> Self {
        Self {
            enabled: true,
            expected_calls,
            baseline_tokens,
            pooled: false,
            conversation: None,
        }
    }

    /// Disabled padding.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            expected_calls: 1,
            baseline_tokens: 0,
            pooled: false,
            conversation: None,
        }
    }

    pub fn with_pool_key(mut self, pooled: bool) -> Self {
        self.pooled = pooled;
        self
    }

    pub fn with_conversation(mut self, profile: ConversationProfile) -> Self {
        self.conversation = Some(profile);
        self
    }
}

/// Why no filler is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoPaddingReason {
    Disabled,
    NoCacheThreshold,
    InsufficientSaving,
    AlreadyAboveThreshold,
    NotWorthIt,
}

/// Outcome of one evaluation, before filler text is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaddingDecision {
    NoPadding(NoPaddingReason),
    Pad { tokens: u64 },
}

// ============================================================================
// Evaluation
// ============================================================================

/// Decide padding without touching any memo.
pub fn evaluate(
    model: &ModelRecord,
    params: &PaddingParams,
    config: &PaddingConfig,
) -> Result<PaddingDecision> {
    if !params.enabled {
        return Ok(PaddingDecision::NoPadding(NoPaddingReason::Disabled));
    }
    validate(params)?;

    let Some(threshold) = model.cache_activation_threshold else {
        return Ok(PaddingDecision::NoPadding(NoPaddingReason::NoCacheThreshold));
    };
    let ratio = model.cache_price_ratio();
    if 1.0 - ratio <= config.min_cache_saving {
        return Ok(PaddingDecision::NoPadding(NoPaddingReason::InsufficientSaving));
    }
    let threshold = u64::from(threshold);
    if params.baseline_tokens >= threshold {
        return Ok(PaddingDecision::NoPadding(NoPaddingReason::AlreadyAboveThreshold));
    }

    let hit = model.hit_rate(params.pooled);
    match &params.conversation {
        None => Ok(single_shot(params, threshold, ratio, hit)),
        Some(profile) => conversation(params, profile, threshold, ratio, hit, config),
    }
}

fn validate(params: &PaddingParams) -> Result<()> {
    if params.expected_calls == 0 {
        return Err(LlmError::InvalidArgument(
            "expected reuse count must be positive".to_string(),
        ));
    }
    if let Some(profile) = &params.conversation {
        if profile.turns == 0 {
            return Err(LlmError::InvalidArgument(
                "conversation turn count must be positive".to_string(),
            ));
        }
        if profile.first_user_message_tokens.is_none() {
            return Err(LlmError::InvalidArgument(
                "opening user message tokens are required".to_string(),
            ));
        }
        if profile.avg_user_message_tokens.is_none() || profile.avg_reply_tokens.is_none() {
            return Err(LlmError::MissingAverageLengths(
                "average user message and reply tokens are required".to_string(),
            ));
        }
    }
    Ok(())
}

/// Instruction size above which padding to `target` pays off over `calls` reuses.
pub fn break_even_size(target: u64, calls: u32, cache_price_ratio: f64, hit_rate: f64) -> f64 {
    let k = f64::from(calls);
    let later_call_factor = 1.0 - (1.0 - cache_price_ratio) * hit_rate;
    (target as f64 / k) * (1.0 + (k - 1.0) * later_call_factor)
}

fn single_shot(params: &PaddingParams, threshold: u64, ratio: f64, hit: f64) -> PaddingDecision {
    let target = threshold + 1;
    let limit = break_even_size(target, params.expected_calls, ratio, hit);
    debug!(
        baseline = params.baseline_tokens,
        limit,
        calls = params.expected_calls,
        "Single-shot padding break-even"
    );
    if params.baseline_tokens as f64 > limit {
        PaddingDecision::Pad {
            tokens: target - params.baseline_tokens,
        }
    } else {
        PaddingDecision::NoPadding(NoPaddingReason::NotWorthIt)
    }
}

/// Shape of one simulated conversation.
#[derive(Debug, Clone, Copy)]
struct Simulation {
    threshold: u64,
    quantum: u64,
    turns: u64,
    first_user: u64,
    per_turn_growth: u64,
    /// Price of one cache-eligible token relative to a full-price token.
    blended_rate: f64,
}

impl Simulation {
    fn cached_prefix(&self, prefix: u64) -> u64 {
        (prefix / self.quantum) * self.quantum
    }

    /// Relative input cost of one conversation with baseline `base`.
    fn conversation_cost(&self, base: u64, warm_start: bool) -> f64 {
        let mut cost = 0.0;
        let mut previous: Option<u64> = None;
        for turn in 0..self.turns {
            let size = base + self.first_user + turn * self.per_turn_growth;
            let cached = match previous {
                Some(prev) if prev >= self.threshold => self.cached_prefix(prev),
                None if warm_start && base >= self.threshold => self.cached_prefix(base),
                _ => 0,
            }
            .min(size);
            cost += cached as f64 * self.blended_rate + (size - cached) as f64;
            previous = Some(size);
        }
        cost
    }

    /// Relative input cost of `conversations` conversations.
    fn total_cost(&self, base: u64, conversations: u32) -> f64 {
        let first = self.conversation_cost(base, false);
        let rest = self.conversation_cost(base, true);
        first + f64::from(conversations.saturating_sub(1)) * rest
    }
}

fn conversation(
    params: &PaddingParams,
    profile: &ConversationProfile,
    threshold: u64,
    ratio: f64,
    hit: f64,
    config: &PaddingConfig,
) -> Result<PaddingDecision> {
    let (Some(first_user), Some(avg_user), Some(avg_reply)) = (
        profile.first_user_message_tokens,
        profile.avg_user_message_tokens,
        profile.avg_reply_tokens,
    ) else {
        return Err(LlmError::MissingAverageLengths(
            "average user message and reply tokens are required".to_string(),
        ));
    };

    let quantum = u64::from(config.cache_quantum_tokens);
    let simulation = Simulation {
        threshold,
        quantum,
        turns: u64::from(profile.turns),
        first_user,
        per_turn_growth: avg_user + avg_reply,
        blended_rate: hit * ratio + (1.0 - hit),
    };

    let gap = threshold + 1 - params.baseline_tokens;
    let candidates = gap.div_ceil(quantum);

    let mut best_padding = 0;
    let mut best_cost = simulation.total_cost(params.baseline_tokens, params.expected_calls);
    for step in 1..=candidates {
        let padding = step * quantum;
        let cost = simulation.total_cost(params.baseline_tokens + padding, params.expected_calls);
        if cost < best_cost {
            best_cost = cost;
            best_padding = padding;
        }
    }

    debug!(
        baseline = params.baseline_tokens,
        candidates,
        best_padding,
        best_cost,
        "Conversation padding search"
    );

    Ok(if best_padding == 0 {
        PaddingDecision::NoPadding(NoPaddingReason::NotWorthIt)
    } else {
        PaddingDecision::Pad {
            tokens: best_padding,
        }
    })
}

// ============================================================================
// Filler
// ============================================================================

/// Filler text worth at least `tokens` tokens under a conservative ratio.
pub fn build_filler(tokens: u64, config: &PaddingConfig) -> String {
    let target_chars = (tokens as f64 * config.safe_chars_per_token).ceil() as usize;
    let mut filler = String::with_capacity(target_chars + FILLER_PHRASE.len());
    filler.push_str(FILLER_PREAMBLE);
    while filler.len() < target_chars {
        filler.push_str(FILLER_PHRASE);
    }
    filler
}

/// Decide padding once per call group and remember the result.
///
/// A memo that is already evaluated is returned as is; disabled padding
/// returns `None` without touching the memo.
pub fn resolve_padding(
    model: &ModelRecord,
    params: &PaddingParams,
    config: &PaddingConfig,
    memo: &mut PaddingMemo,
) -> Result<Option<String>> {
    if !params.enabled {
        return Ok(None);
    }
    if memo.is_evaluated() {
        return Ok(memo.padding_text().map(str::to_string));
    }

    match evaluate(model, params, config)? {
        PaddingDecision::Pad { tokens } => {
            info!(model = %model.name, tokens, "Padding instruction to activate cache");
            let filler = build_filler(tokens, config);
            *memo = PaddingMemo::Padding(filler.clone());
            Ok(Some(filler))
        }
        PaddingDecision::NoPadding(reason) => {
            debug!(model = %model.name, ?reason, "No instruction padding");
            *memo = PaddingMemo::NoPaddingNeeded;
            Ok(None)
        }
    }
}
