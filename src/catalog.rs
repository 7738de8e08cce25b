//! Pricing Catalog
//!
//! This module holds the immutable table of model records the engine prices
//! and plans against: per-category unit prices, cache behaviour, batch
//! discounts, size lineage and the reasoning/verbosity settings each model
//! accepts.
//!
//! # Overview
//!
//! The catalog is built once at startup and injected into the engine as an
//! `Arc<PricingCatalog>`. It is never mutated afterwards, so one catalog can
//! serve any number of independent conversations concurrently.
//!
//! Sources, in order of preference:
//! 1. [`PricingCatalog::from_file`] / [`PricingCatalog::from_toml`] for a
//!    recalibrated table
//! 2. [`PricingCatalog::builtin`] for the bundled defaults
//! 3. [`PricingCatalog::new`] for synthetic test tables
//!
//! # Size lineage
//!
//! Each record lists up to three *ancestors*: progressively larger models of
//! the same family. The size tier is derived from that list and never stored:
//!
//! | Ancestors | Size tier |
//! |-----------|-----------|
//! | 0 | `Large` |
//! | 1 | `Medium` |
//! | 2 | `Small` |
//! | 3 | `VerySmall` |
//!
//! # Example Configuration
//!
//! ```toml
//! [[models]]
//! name = "gpt-5-mini"
//! family = "openai"
//! input_per_million = 0.25
//! cached_input_per_million = 0.025
//! output_per_million = 2.0
//! reasoning_output_per_million = 2.0
//! cache_activation_threshold = 1024
//! uses_extended_cache = true
//! max_input_tokens = 272000
//! cache_hit_rate = 0.5
//! cache_hit_rate_with_pool_key = 0.85
//! ancestors = ["gpt-5"]
//! allowed_reasoning = ["none", "low", "medium", "high"]
//! allowed_verbosity = ["low", "medium", "high"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{LlmError, Result};
use crate::reasoning::ReasoningTier;

// ============================================================================
// Enumerations
// ============================================================================

/// Provider family; selects pricing and transport behaviour variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// OpenAI and OpenAI-compatible APIs.
    #[default]
    OpenAI,
    /// Anthropic Claude (manual cache writes, retention windows).
    Anthropic,
    /// Google Gemini (hourly-billed explicit cache storage).
    Gemini,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::OpenAI => write!(f, "openai"),
            ModelFamily::Anthropic => write!(f, "anthropic"),
            ModelFamily::Gemini => write!(f, "gemini"),
        }
    }
}

/// Relative capability rank of a model within its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeTier {
    VerySmall,
    Small,
    Medium,
    Large,
}

impl SizeTier {
    /// Size tier implied by the number of larger siblings.
    pub fn from_ancestor_count(count: usize) -> Self {
        match count {
            0 => SizeTier::Large,
            1 => SizeTier::Medium,
            2 => SizeTier::Small,
            _ => SizeTier::VerySmall,
        }
    }
}

/// Answer verbosity requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

// ============================================================================
// Model Record
// ============================================================================

/// Fractions taken off the real-time price in batch mode (0.5 = half price).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchDiscount {
    /// Applies to non-cached input and all output tokens.
    #[serde(default)]
    pub io: f64,

    /// Applies to cached-input reads.
    #[serde(default)]
    pub cached_read: f64,

    /// Applies to manual cache writes.
    #[serde(default)]
    pub cache_write: f64,
}

/// One model in the catalog. Prices are USD per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model identifier sent to the provider.
    pub name: String,

    /// Provider family.
    #[serde(default)]
    pub family: ModelFamily,

    /// Non-cached input price.
    pub input_per_million: f64,

    /// Cached-input read price.
    pub cached_input_per_million: f64,

    /// Visible (non-reasoning) output price.
    pub output_per_million: f64,

    /// Hidden reasoning output price.
    pub reasoning_output_per_million: f64,

    /// Manual cache write price for a 5-minute retention window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_5m_per_million: Option<f64>,

    /// Manual cache write price for a 60-minute retention window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_60m_per_million: Option<f64>,

    /// Cache storage price per million tokens per hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_storage_per_million_hour: Option<f64>,

    /// Token count at which automatic prefix caching starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_activation_threshold: Option<u32>,

    /// Whether cached prefixes survive for hours instead of minutes.
    #[serde(default)]
    pub uses_extended_cache: bool,

    /// Maximum input tokens per request.
    pub max_input_tokens: u32,

    /// Batch-mode discounts.
    #[serde(default)]
    pub batch_discount: BatchDiscount,

    /// Probability that an eligible prefix is served from cache.
    #[serde(default)]
    pub cache_hit_rate: f64,

    /// Hit probability when requests share a cache pool key.
    #[serde(default)]
    pub cache_hit_rate_with_pool_key: f64,

    /// Progressively larger models of the same family, nearest first.
    #[serde(default)]
    pub ancestors: Vec<String>,

    /// Effective reasoning tiers the model accepts.
    #[serde(default = "default_reasoning")]
    pub allowed_reasoning: Vec<ReasoningTier>,

    /// Verbosity levels the model accepts; empty means no verbosity control.
    #[serde(default)]
    pub allowed_verbosity: Vec<Verbosity>,
}

fn default_reasoning() -> Vec<ReasoningTier> {
    vec![ReasoningTier::None]
}

impl ModelRecord {
    /// Size tier derived from the ancestor chain.
    pub fn size_tier(&self) -> SizeTier {
        SizeTier::from_ancestor_count(self.ancestors.len())
    }

    /// Cached read price as a fraction of the full input price.
    ///
    /// Returns 1.0 (no saving) for models without a positive input price.
    pub fn cache_price_ratio(&self) -> f64 {
        if self.input_per_million <= 0.0 {
            1.0
        } else {
            self.cached_input_per_million / self.input_per_million
        }
    }

    /// Cache hit probability, with or without a pool key.
    pub fn hit_rate(&self, pooled: bool) -> f64 {
        if pooled {
            self.cache_hit_rate_with_pool_key
        } else {
            self.cache_hit_rate
        }
    }

    /// Whether the effective tier is accepted by this model.
    pub fn supports_reasoning(&self, tier: ReasoningTier) -> bool {
        self.allowed_reasoning.contains(&tier)
    }

    /// Whether the model exposes the top reasoning tier.
    pub fn has_very_high_tier(&self) -> bool {
        self.supports_reasoning(ReasoningTier::VeryHigh)
    }

    /// Allowed tier closest to `tier`, preferring the higher one on ties.
    pub fn nearest_allowed_tier(&self, tier: ReasoningTier) -> Option<ReasoningTier> {
        self.allowed_reasoning
            .iter()
            .copied()
            .min_by_key(|allowed| {
                let distance = allowed.index().abs_diff(tier.index());
                (distance, std::cmp::Reverse(allowed.index()))
            })
    }

    /// Whether verbosity can be requested, and at this level.
    pub fn supports_verbosity(&self, verbosity: Verbosity) -> bool {
        self.allowed_verbosity.contains(&verbosity)
    }

    /// Whether caching must be paid for explicitly.
    pub fn requires_manual_cache_write(&self) -> bool {
        self.cache_write_5m_per_million.is_some()
            || self.cache_write_60m_per_million.is_some()
            || self.cache_storage_per_million_hour.is_some()
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Immutable, explicitly constructed table of model records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingCatalog {
    #[serde(default)]
    models: Vec<ModelRecord>,
}

impl PricingCatalog {
    /// Build a catalog from records, validating lineage and prices.
    pub fn new(models: Vec<ModelRecord>) -> Result<Self> {
        let catalog = Self { models };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LlmError::ConfigError(format!(
                "Failed to read catalog {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a catalog from TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let catalog: Self =
            toml::from_str(toml_str).map_err(|e| LlmError::ConfigError(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Serialize the catalog to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LlmError::ConfigError(e.to_string()))
    }

    /// Look up a model by exact name.
    pub fn get(&self, name: &str) -> Result<&ModelRecord> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| LlmError::UnknownModel(name.to_string()))
    }

    /// All records, in declaration order.
    pub fn models(&self) -> &[ModelRecord] {
        &self.models
    }

    /// Model reached by escalating `steps` sizes up the ancestor chain.
    ///
    /// Escalating past the largest available ancestor silently stops there;
    /// zero steps, or a model with no ancestors, returns the model itself.
    pub fn escalation_target(&self, name: &str, steps: usize) -> Result<&ModelRecord> {
        let model = self.get(name)?;
        let reachable = steps.min(model.ancestors.len());
        if reachable == 0 {
            return Ok(model);
        }
        self.get(&model.ancestors[reachable - 1])
    }

    /// Validate the catalog.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(LlmError::ConfigError(format!(
                    "Duplicate model name: '{}'",
                    model.name
                )));
            }
        }

        for model in &self.models {
            if model.ancestors.len() > 3 {
                return Err(LlmError::ConfigError(format!(
                    "Model '{}' lists {} ancestors (at most 3)",
                    model.name,
                    model.ancestors.len()
                )));
            }
            for ancestor in &model.ancestors {
                if !seen.contains(ancestor.as_str()) {
                    return Err(LlmError::ConfigError(format!(
                        "Model '{}' names unknown ancestor '{}'",
                        model.name, ancestor
                    )));
                }
            }
            if model.cached_input_per_million > model.input_per_million {
                return Err(LlmError::ConfigError(format!(
                    "Model '{}' prices cached input above regular input",
                    model.name
                )));
            }
            for rate in [model.cache_hit_rate, model.cache_hit_rate_with_pool_key] {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(LlmError::ConfigError(format!(
                        "Model '{}' has cache hit rate {} outside [0, 1]",
                        model.name, rate
                    )));
                }
            }
            if model.allowed_reasoning.is_empty() {
                return Err(LlmError::ConfigError(format!(
                    "Model '{}' allows no reasoning tier",
                    model.name
                )));
            }
        }

        Ok(())
    }

    /// Bundled price table (USD per million tokens).
    pub fn builtin() -> Self {
        use ReasoningTier as R;
        let thinking = vec![R::None, R::Low, R::Medium, R::High];
        let verbosity = vec![Verbosity::Low, Verbosity::Medium, Verbosity::High];
        let openai_batch = BatchDiscount {
            io: 0.5,
            cached_read: 0.5,
            cache_write: 0.0,
        };
        let half_off = BatchDiscount {
            io: 0.5,
            cached_read: 0.5,
            cache_write: 0.5,
        };

        let openai = |name: &str, input: f64, cached: f64, output: f64| ModelRecord {
            name: name.to_string(),
            family: ModelFamily::OpenAI,
            input_per_million: input,
            cached_input_per_million: cached,
            output_per_million: output,
            reasoning_output_per_million: output,
            cache_write_5m_per_million: None,
            cache_write_60m_per_million: None,
            cache_storage_per_million_hour: None,
            cache_activation_threshold: Some(1024),
            uses_extended_cache: true,
            max_input_tokens: 272_000,
            batch_discount: openai_batch,
            cache_hit_rate: 0.5,
            cache_hit_rate_with_pool_key: 0.85,
            ancestors: Vec::new(),
            allowed_reasoning: thinking.clone(),
            allowed_verbosity: verbosity.clone(),
        };

        let anthropic = |name: &str, input: f64, output: f64| ModelRecord {
            name: name.to_string(),
            family: ModelFamily::Anthropic,
            input_per_million: input,
            cached_input_per_million: input * 0.1,
            output_per_million: output,
            reasoning_output_per_million: output,
            cache_write_5m_per_million: Some(input * 1.25),
            cache_write_60m_per_million: Some(input * 2.0),
            cache_storage_per_million_hour: None,
            cache_activation_threshold: None,
            uses_extended_cache: false,
            max_input_tokens: 200_000,
            batch_discount: half_off,
            cache_hit_rate: 0.95,
            cache_hit_rate_with_pool_key: 0.95,
            ancestors: Vec::new(),
            allowed_reasoning: thinking.clone(),
            allowed_verbosity: Vec::new(),
        };

        let gemini = |name: &str, input: f64, output: f64, storage: f64, threshold: u32| {
            ModelRecord {
                name: name.to_string(),
                family: ModelFamily::Gemini,
                input_per_million: input,
                cached_input_per_million: input * 0.1,
                output_per_million: output,
                reasoning_output_per_million: output,
                cache_write_5m_per_million: None,
                cache_write_60m_per_million: None,
                cache_storage_per_million_hour: Some(storage),
                cache_activation_threshold: Some(threshold),
                uses_extended_cache: false,
                max_input_tokens: 1_048_576,
                batch_discount: half_off,
                cache_hit_rate: 0.4,
                cache_hit_rate_with_pool_key: 0.4,
                ancestors: Vec::new(),
                allowed_reasoning: thinking.clone(),
                allowed_verbosity: Vec::new(),
            }
        };

        let with_ancestors = |mut record: ModelRecord, ancestors: &[&str]| {
            record.ancestors = ancestors.iter().map(|a| a.to_string()).collect();
            record
        };

        let mut gpt_5_pro = openai("gpt-5-pro", 15.0, 15.0, 120.0);
        gpt_5_pro.cache_activation_threshold = None;
        gpt_5_pro.allowed_reasoning = vec![R::High];
        gpt_5_pro.allowed_verbosity = Vec::new();

        let mut gpt_41 = openai("gpt-4.1", 2.0, 0.5, 8.0);
        gpt_41.allowed_reasoning = vec![R::None];
        gpt_41.allowed_verbosity = Vec::new();
        gpt_41.uses_extended_cache = false;
        gpt_41.max_input_tokens = 1_047_576;
        let mut gpt_41_mini = gpt_41.clone();
        gpt_41_mini.name = "gpt-4.1-mini".to_string();
        gpt_41_mini.input_per_million = 0.4;
        gpt_41_mini.cached_input_per_million = 0.1;
        gpt_41_mini.output_per_million = 1.6;
        gpt_41_mini.reasoning_output_per_million = 1.6;
        let mut gpt_41_nano = gpt_41.clone();
        gpt_41_nano.name = "gpt-4.1-nano".to_string();
        gpt_41_nano.input_per_million = 0.1;
        gpt_41_nano.cached_input_per_million = 0.025;
        gpt_41_nano.output_per_million = 0.4;
        gpt_41_nano.reasoning_output_per_million = 0.4;

        Self {
            models: vec![
                gpt_5_pro,
                with_ancestors(openai("gpt-5", 1.25, 0.125, 10.0), &["gpt-5-pro"]),
                with_ancestors(
                    openai("gpt-5-mini", 0.25, 0.025, 2.0),
                    &["gpt-5", "gpt-5-pro"],
                ),
                with_ancestors(
                    openai("gpt-5-nano", 0.05, 0.005, 0.4),
                    &["gpt-5-mini", "gpt-5", "gpt-5-pro"],
                ),
                gpt_41,
                with_ancestors(gpt_41_mini, &["gpt-4.1"]),
                with_ancestors(gpt_41_nano, &["gpt-4.1-mini", "gpt-4.1"]),
                anthropic("claude-opus-4-1", 15.0, 75.0),
                with_ancestors(anthropic("claude-sonnet-4-5", 3.0, 15.0), &["claude-opus-4-1"]),
                with_ancestors(
                    anthropic("claude-haiku-4-5", 1.0, 5.0),
                    &["claude-sonnet-4-5", "claude-opus-4-1"],
                ),
                gemini("gemini-2.5-pro", 1.25, 10.0, 4.5, 2048),
                with_ancestors(
                    gemini("gemini-2.5-flash", 0.3, 2.5, 1.0, 1024),
                    &["gemini-2.5-pro"],
                ),
                with_ancestors(
                    gemini("gemini-2.5-flash-lite", 0.1, 0.4, 1.0, 1024),
                    &["gemini-2.5-flash", "gemini-2.5-pro"],
                ),
            ],
        }
    }
}
