//! Quality-escalation state machine.
//!
//! # Overview
//!
//! The first attempt asks the model to rate its own answer with one of three
//! tags. A rating asking for a better model re-issues the request once
//! against an escalated model and/or reasoning tier. A truncated answer from
//! a small model gets one retry with looser token restrictions.
//!
//! ```text
//!  Initial ──► AwaitingRating ──rating>0──► Escalating ──► Done
//!                   │    ▲                                  ▲
//!          ceiling  │    │ retry                            │
//!                   ▼    │                                  │
//!            RecoveringTruncation ──────no loosening────────┘
//! ```
//!
//! The machine only decides. Sending requests, recording usage and rolling
//! back conversation items belongs to [`crate::engine::Economizer`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{ModelRecord, PricingCatalog, SizeTier};
use crate::error::Result;
use crate::reasoning::{compute_escalated_tier, ReasoningSpec, ReasoningTier};
use crate::traits::{ProviderResponse, TokenRestriction, TransportOutcome};

// ============================================================================
// Rating tags
// ============================================================================

/// The answer is good enough.
pub const TAG_ADEQUATE: &str = "[[rating:adequate]]";
/// A larger model would answer noticeably better.
pub const TAG_BETTER_MODEL: &str = "[[rating:better-model]]";
/// A much larger model is needed.
pub const TAG_MUCH_BETTER_MODEL: &str = "[[rating:much-better-model]]";

const TAGS: [(&str, usize); 3] = [
    (TAG_ADEQUATE, 0),
    (TAG_BETTER_MODEL, 1),
    (TAG_MUCH_BETTER_MODEL, 2),
];

/// Instruction appended to the system instruction on rated attempts.
pub const RATING_INSTRUCTION: &str = "After your answer, judge whether a more capable model \
would have answered better and append exactly one of these tags on its own line: \
[[rating:adequate]] if your answer is complete and correct, \
[[rating:better-model]] if a larger model would answer noticeably better, \
[[rating:much-better-model]] if the task clearly exceeds your abilities.";

/// Shown instead of the answer when the call ran out of time.
pub const TIMEOUT_APOLOGY: &str =
    "Sorry, the answer took too long to generate. Please try again in a moment.";

/// Shown instead of the answer when it was cut at the output ceiling.
pub const TRUNCATION_APOLOGY: &str =
    "Sorry, the answer was too long to complete. Please ask a more specific question.";

/// Insert the rating instruction before `end_marker`, or append it.
pub fn with_rating_instruction(instruction: &str, end_marker: Option<&str>) -> String {
    if let Some(marker) = end_marker.filter(|m| !m.is_empty()) {
        if let Some(pos) = instruction.rfind(marker) {
            let (head, tail) = instruction.split_at(pos);
            return format!("{}\n\n{}\n\n{}", head.trim_end(), RATING_INSTRUCTION, tail);
        }
    }
    if instruction.is_empty() {
        RATING_INSTRUCTION.to_string()
    } else {
        format!("{}\n\n{}", instruction, RATING_INSTRUCTION)
    }
}

/// Remove every rating tag (any case), returning the text and the steps of
/// the last tag found.
pub fn strip_rating_tags(text: &str) -> (String, Option<usize>) {
    let lower = text.to_ascii_lowercase();
    let mut matches: Vec<(usize, usize, usize)> = Vec::new();
    for (tag, steps) in TAGS {
        let mut from = 0;
        while let Some(found) = lower[from..].find(tag) {
            let start = from + found;
            matches.push((start, start + tag.len(), steps));
            from = start + tag.len();
        }
    }
    if matches.is_empty() {
        return (text.to_string(), None);
    }
    matches.sort_unstable();

    let mut cleaned = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, _) in &matches {
        cleaned.push_str(&text[cursor..*start]);
        cursor = *end;
    }
    cleaned.push_str(&text[cursor..]);

    let last = matches.last().map(|(_, _, steps)| *steps);
    (cleaned.trim().to_string(), last)
}

/// Whether the text carries any rating tag.
pub fn contains_rating_tag(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    TAGS.iter().any(|(tag, _)| lower.contains(tag))
}

// ============================================================================
// Outcomes
// ============================================================================

/// Self-rating read from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RatingOutcome {
    /// Tag found; steps requested (0, 1 or 2).
    Rated { steps: usize },
    /// Completed normally without a tag. Informational only.
    NoSelfRating,
    /// Adaptive quality was off.
    NotRequested,
}

/// What the escalation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Escalation {
    #[default]
    None,
    Model { steps: usize },
    Reasoning { steps: usize },
    ModelAndReasoning { model_steps: usize, reasoning_steps: usize },
}

/// Caller limits on escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityOptions {
    /// Model sizes the retry may climb (0 to 2).
    pub max_model_steps: usize,

    /// Reasoning tiers the retry may climb (0 to 2).
    pub max_reasoning_steps: usize,

    /// Marker the rating instruction is inserted before.
    #[serde(default)]
    pub end_marker: Option<String>,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            max_model_steps: 1,
            max_reasoning_steps: 1,
            end_marker: None,
        }
    }
}

/// Settings of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSettings {
    pub model: String,
    pub reasoning: ReasoningSpec,
    pub output_restriction: Option<TokenRestriction>,
    pub reasoning_restriction: Option<TokenRestriction>,
    /// Whether the rating instruction is included.
    pub rate: bool,
    /// Set on the escalated attempt; tier mismatches map to the nearest tier.
    pub escalated: bool,
}

/// States of one quality-managed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityState {
    Initial,
    AwaitingRating,
    Escalating,
    RecoveringTruncation,
    Done,
}

/// Final decision on a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    /// Answer with rating tags stripped, or the apology text.
    pub text: String,
    pub outcome: TransportOutcome,
    pub rating: RatingOutcome,
    pub escalation: Escalation,
    /// Whether a second, escalated call was actually made.
    pub escalation_performed: bool,
}

/// Tier actually sent for `(model, spec, escalated)`, restrictions included.
pub type TierResolver<'a> = &'a dyn Fn(&ModelRecord, ReasoningSpec, bool) -> Result<ReasoningTier>;

/// Next move after a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Retry(AttemptSettings),
    Finish(Finish),
}

// ============================================================================
// Machine
// ============================================================================

/// Decides retries for one call.
#[derive(Debug, Clone)]
pub struct QualityMachine {
    state: QualityState,
    options: Option<QualityOptions>,
    rating: RatingOutcome,
    escalation: Escalation,
    escalation_performed: bool,
    recovery_attempted: bool,
}

impl QualityMachine {
    /// `None` disables self-rating and escalation; truncation recovery still applies.
    pub fn new(options: Option<QualityOptions>) -> Self {
        let rating = if options.is_some() {
            RatingOutcome::NoSelfRating
        } else {
            RatingOutcome::NotRequested
        };
        Self {
            state: QualityState::Initial,
            options,
            rating,
            escalation: Escalation::None,
            escalation_performed: false,
            recovery_attempted: false,
        }
    }

    pub fn state(&self) -> QualityState {
        self.state
    }

    pub fn recovery_attempted(&self) -> bool {
        self.recovery_attempted
    }

    /// Settings of the first attempt; moves to `AwaitingRating`.
    pub fn start(&mut self, first: AttemptSettings) -> AttemptSettings {
        self.state = QualityState::AwaitingRating;
        AttemptSettings {
            rate: self.options.is_some(),
            escalated: false,
            ..first
        }
    }

    /// React to the response of the attempt made with `current`.
    ///
    /// `tiers` must resolve reasoning exactly as the sender does, so that an
    /// escalation that would send the same model and tier is skipped.
    pub fn on_response(
        &mut self,
        catalog: &PricingCatalog,
        tiers: TierResolver<'_>,
        current: &AttemptSettings,
        response: &ProviderResponse,
    ) -> Result<Step> {
        let (text, tag) = strip_rating_tags(&response.text);

        match response.outcome {
            TransportOutcome::TimedOut => {
                warn!(model = %current.model, "Request timed out");
                return Ok(self.finish(TIMEOUT_APOLOGY.to_string(), TransportOutcome::TimedOut));
            }
            TransportOutcome::Aborted => {
                warn!(model = %current.model, "Request aborted");
                return Ok(self.finish(text, TransportOutcome::Aborted));
            }
            TransportOutcome::OutputCeilingReached => {
                if let Some(retry) = self.plan_recovery(catalog, current)? {
                    return Ok(Step::Retry(retry));
                }
                warn!(model = %current.model, "Output ceiling reached, no recovery left");
                self.escalation = Escalation::None;
                return Ok(self.finish(
                    TRUNCATION_APOLOGY.to_string(),
                    TransportOutcome::OutputCeilingReached,
                ));
            }
            TransportOutcome::Completed => {}
        }

        if self.escalation_performed || !current.rate {
            return Ok(self.finish(text, TransportOutcome::Completed));
        }

        let Some(steps) = tag else {
            debug!(model = %current.model, "No self-rating in response");
            self.rating = RatingOutcome::NoSelfRating;
            return Ok(self.finish(text, TransportOutcome::Completed));
        };
        self.rating = RatingOutcome::Rated { steps };
        if steps == 0 {
            return Ok(self.finish(text, TransportOutcome::Completed));
        }

        match self.plan_escalation(catalog, tiers, current, steps)? {
            Some(next) => {
                self.state = QualityState::Escalating;
                self.escalation_performed = true;
                info!(
                    from = %current.model,
                    to = %next.model,
                    reasoning = ?next.reasoning,
                    steps,
                    "Escalating after self-rating"
                );
                Ok(Step::Retry(next))
            }
            None => {
                info!(model = %current.model, steps, "Escalation capped, keeping first answer");
                Ok(self.finish(text, TransportOutcome::Completed))
            }
        }
    }

    fn finish(&mut self, text: String, outcome: TransportOutcome) -> Step {
        self.state = QualityState::Done;
        Step::Finish(Finish {
            text,
            outcome,
            rating: self.rating,
            escalation: self.escalation,
            escalation_performed: self.escalation_performed,
        })
    }

    /// Escalated settings, or `None` when capping leaves nothing to change.
    fn plan_escalation(
        &mut self,
        catalog: &PricingCatalog,
        tiers: TierResolver<'_>,
        current: &AttemptSettings,
        steps: usize,
    ) -> Result<Option<AttemptSettings>> {
        let Some(options) = &self.options else {
            return Ok(None);
        };
        let model_steps = steps.min(options.max_model_steps);
        let reasoning_steps = steps.min(options.max_reasoning_steps);

        let source = catalog.get(&current.model)?;
        let target = catalog.escalation_target(&current.model, model_steps)?;
        let mut reasoning = if reasoning_steps > 0 {
            compute_escalated_tier(current.reasoning, reasoning_steps, target.has_very_high_tier())
        } else {
            current.reasoning
        };
        // A target that accepts none of the escalated tiers keeps the old spec.
        if !reasoning.tiers().into_iter().any(|t| target.supports_reasoning(t)) {
            reasoning = current.reasoning;
        }

        let sent_tier = tiers(source, current.reasoning, current.escalated)?;
        let target_tier = tiers(target, reasoning, true)?;
        let model_changed = target.name != source.name;
        // Tier moves forced by a model change alone are not reasoning steps.
        let reasoning_changed = target_tier != sent_tier && reasoning_steps > 0;
        self.escalation = match (model_changed, reasoning_changed) {
            (false, false) => return Ok(None),
            (true, false) => Escalation::Model { steps: model_steps },
            (false, true) => Escalation::Reasoning {
                steps: reasoning_steps,
            },
            (true, true) => Escalation::ModelAndReasoning {
                model_steps,
                reasoning_steps,
            },
        };

        Ok(Some(AttemptSettings {
            model: target.name.clone(),
            reasoning,
            output_restriction: current.output_restriction,
            reasoning_restriction: current.reasoning_restriction,
            rate: false,
            escalated: true,
        }))
    }

    /// Loosened settings for one truncation retry, if allowed.
    fn plan_recovery(
        &mut self,
        catalog: &PricingCatalog,
        current: &AttemptSettings,
    ) -> Result<Option<AttemptSettings>> {
        if self.recovery_attempted {
            return Ok(None);
        }
        let size = catalog.get(&current.model)?.size_tier();
        if !matches!(size, SizeTier::Small | SizeTier::VerySmall) {
            return Ok(None);
        }

        let output = current.output_restriction.and_then(TokenRestriction::loosen);
        let reasoning = current.reasoning_restriction.and_then(TokenRestriction::loosen);
        if output.is_none() && reasoning.is_none() {
            return Ok(None);
        }

        self.recovery_attempted = true;
        self.state = QualityState::RecoveringTruncation;
        info!(
            model = %current.model,
            ?output,
            ?reasoning,
            "Retrying truncated answer with looser restrictions"
        );
        Ok(Some(AttemptSettings {
            output_restriction: output.or(current.output_restriction),
            reasoning_restriction: reasoning.or(current.reasoning_restriction),
            ..current.clone()
        }))
    }
}
