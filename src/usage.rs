//! Usage Ledger
//!
//! Token usage per request and its conversion to money.
//!
//! # Overview
//!
//! A [`UsageRecord`] captures the raw token counters one request/response
//! pair produced for a single model and billing mode. Records with the same
//! [`UsageKey`] can be summed; the [`UsageLedger`] aggregates them across a
//! conversation or batch and renders the human-readable cost report.
//!
//! # Usage
//!
//! ```rust
//! use edgequake_economizer::catalog::PricingCatalog;
//! use edgequake_economizer::usage::{BillingMode, UsageLedger, UsageRecord};
//!
//! let catalog = PricingCatalog::builtin();
//! let mut ledger = UsageLedger::new();
//!
//! let usage = UsageRecord::new("gpt-5", BillingMode::RealTime)
//!     .with_input(12_000, 8_000)
//!     .with_output(900, 400);
//! ledger.record(usage).unwrap();
//!
//! println!("{}", ledger.report(&catalog).unwrap());
//! ```
//!
//! # See Also
//!
//! - `catalog.rs` for unit prices and batch discounts
//! - `function_loop.rs` for per-round ledger labels

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::{ModelFamily, ModelRecord, PricingCatalog};
use crate::error::{LlmError, Result};

const PER_MILLION: f64 = 1_000_000.0;

// ============================================================================
// Keys
// ============================================================================

/// Real-time or deferred (discounted) processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BillingMode {
    #[default]
    RealTime,
    Batch,
}

impl fmt::Display for BillingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingMode::RealTime => write!(f, "real-time"),
            BillingMode::Batch => write!(f, "batch"),
        }
    }
}

/// Retention window of a manual cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheRetention {
    #[default]
    None,
    FiveMinutes,
    SixtyMinutes,
}

impl CacheRetention {
    /// Window length in minutes (0, 5 or 60).
    pub fn minutes(self) -> u32 {
        match self {
            CacheRetention::None => 0,
            CacheRetention::FiveMinutes => 5,
            CacheRetention::SixtyMinutes => 60,
        }
    }

    /// Parse a window length; only 0, 5 and 60 are valid.
    pub fn from_minutes(minutes: u32) -> Result<Self> {
        match minutes {
            0 => Ok(CacheRetention::None),
            5 => Ok(CacheRetention::FiveMinutes),
            60 => Ok(CacheRetention::SixtyMinutes),
            other => Err(LlmError::InvalidArgument(format!(
                "cache retention must be 0, 5 or 60 minutes, got {}",
                other
            ))),
        }
    }
}

/// Grouping key: records may only be summed when these match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub model: String,
    pub billing_mode: BillingMode,
    pub retention: CacheRetention,
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.model, self.billing_mode)?;
        if self.retention != CacheRetention::None {
            write!(f, " [cache {}m]", self.retention.minutes())?;
        }
        Ok(())
    }
}

// ============================================================================
// Usage Record
// ============================================================================

/// Token counters for one model/billing-mode combination.
///
/// Split counters (non-cached input, non-reasoning output) are derived from
/// the raw totals and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub billing_mode: BillingMode,

    /// All input tokens, cached or not.
    pub input_tokens: u64,

    /// Input tokens served from cache.
    pub cached_input_tokens: u64,

    /// All output tokens, visible or reasoning.
    pub output_tokens: u64,

    /// Hidden reasoning tokens included in `output_tokens`.
    pub reasoning_tokens: u64,

    /// Tokens written to a manual cache.
    pub cache_write_tokens: u64,

    pub cache_retention: CacheRetention,
}

impl UsageRecord {
    /// Create an empty record.
    pub fn new(model: impl Into<String>, billing_mode: BillingMode) -> Self {
        Self {
            model: model.into(),
            billing_mode,
            input_tokens: 0,
            cached_input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            cache_write_tokens: 0,
            cache_retention: CacheRetention::None,
        }
    }

    /// Set total and cached input tokens.
    pub fn with_input(mut self, total: u64, cached: u64) -> Self {
        self.input_tokens = total;
        self.cached_input_tokens = cached;
        self
    }

    /// Set total and reasoning output tokens.
    pub fn with_output(mut self, total: u64, reasoning: u64) -> Self {
        self.output_tokens = total;
        self.reasoning_tokens = reasoning;
        self
    }

    /// Set manual cache write tokens and their retention window.
    pub fn with_cache_write(mut self, tokens: u64, retention: CacheRetention) -> Self {
        self.cache_write_tokens = tokens;
        self.cache_retention = retention;
        self
    }

    /// Grouping key of this record.
    pub fn key(&self) -> UsageKey {
        UsageKey {
            model: self.model.clone(),
            billing_mode: self.billing_mode,
            retention: self.cache_retention,
        }
    }

    /// Input tokens billed at the full rate.
    pub fn non_cached_input_tokens(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_input_tokens)
    }

    /// Visible output tokens.
    pub fn non_reasoning_output_tokens(&self) -> u64 {
        self.output_tokens.saturating_sub(self.reasoning_tokens)
    }

    /// Check that split counters fit inside their totals.
    pub fn validate(&self) -> Result<()> {
        if self.cached_input_tokens > self.input_tokens {
            return Err(LlmError::InvalidArgument(format!(
                "cached input ({}) exceeds total input ({}) for {}",
                self.cached_input_tokens, self.input_tokens, self.model
            )));
        }
        if self.reasoning_tokens > self.output_tokens {
            return Err(LlmError::InvalidArgument(format!(
                "reasoning output ({}) exceeds total output ({}) for {}",
                self.reasoning_tokens, self.output_tokens, self.model
            )));
        }
        Ok(())
    }

    /// Sum two records with the same grouping key.
    pub fn checked_add(&self, other: &UsageRecord) -> Result<UsageRecord> {
        let (left, right) = (self.key(), other.key());
        if left != right {
            return Err(LlmError::UsageKeyMismatch {
                left: left.to_string(),
                right: right.to_string(),
            });
        }
        Ok(UsageRecord {
            model: self.model.clone(),
            billing_mode: self.billing_mode,
            input_tokens: self.input_tokens + other.input_tokens,
            cached_input_tokens: self.cached_input_tokens + other.cached_input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            reasoning_tokens: self.reasoning_tokens + other.reasoning_tokens,
            cache_write_tokens: self.cache_write_tokens + other.cache_write_tokens,
            cache_retention: self.cache_retention,
        })
    }

    /// Monetary cost of this record.
    pub fn cost(&self, catalog: &PricingCatalog) -> Result<f64> {
        Ok(self.breakdown(catalog)?.total())
    }

    /// Cost split by token category.
    pub fn breakdown(&self, catalog: &PricingCatalog) -> Result<CostBreakdown> {
        self.validate()?;
        let model = catalog.get(&self.model)?;
        let batch = self.billing_mode == BillingMode::Batch;
        let factor = |discount: f64| if batch { 1.0 - discount } else { 1.0 };
        let io = factor(model.batch_discount.io);

        Ok(CostBreakdown {
            non_cached_input: priced(self.non_cached_input_tokens(), model.input_per_million) * io,
            cached_input: priced(self.cached_input_tokens, model.cached_input_per_million)
                * factor(model.batch_discount.cached_read),
            output: priced(self.non_reasoning_output_tokens(), model.output_per_million) * io,
            reasoning_output: priced(self.reasoning_tokens, model.reasoning_output_per_million)
                * io,
            cache_write: self.cache_write_cost(model)? * factor(model.batch_discount.cache_write),
        })
    }

    fn cache_write_cost(&self, model: &ModelRecord) -> Result<f64> {
        if self.cache_write_tokens == 0 {
            return Ok(0.0);
        }
        match model.family {
            ModelFamily::Anthropic => {
                let price = match self.cache_retention {
                    CacheRetention::FiveMinutes => model.cache_write_5m_per_million,
                    CacheRetention::SixtyMinutes => model.cache_write_60m_per_million,
                    CacheRetention::None => None,
                };
                price
                    .map(|p| priced(self.cache_write_tokens, p))
                    .ok_or_else(|| {
                        LlmError::InvalidArgument(format!(
                            "model {} has no cache write price for a {}-minute window",
                            model.name,
                            self.cache_retention.minutes()
                        ))
                    })
            }
            ModelFamily::Gemini => {
                let storage = model.cache_storage_per_million_hour.ok_or_else(|| {
                    LlmError::InvalidArgument(format!(
                        "model {} has no cache storage price",
                        model.name
                    ))
                })?;
                let hours = f64::from(self.cache_retention.minutes()) / 60.0;
                Ok(priced(self.cache_write_tokens, model.input_per_million)
                    + priced(self.cache_write_tokens, storage) * hours)
            }
            ModelFamily::OpenAI => Err(LlmError::InvalidArgument(format!(
                "model {} does not support manual cache writes",
                model.name
            ))),
        }
    }
}

fn priced(tokens: u64, per_million: f64) -> f64 {
    tokens as f64 * per_million / PER_MILLION
}

/// Cost of one record split by category (USD).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub non_cached_input: f64,
    pub cached_input: f64,
    pub output: f64,
    pub reasoning_output: f64,
    pub cache_write: f64,
}

impl CostBreakdown {
    /// Sum of all categories.
    pub fn total(&self) -> f64 {
        self.non_cached_input + self.cached_input + self.output + self.reasoning_output
            + self.cache_write
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Keyed collection of usage records across a conversation or batch.
///
/// Entries are labelled. Under one label, records are summed per grouping
/// key, so a label can hold several records (e.g. the same round billed in
/// real-time in one call and in batch in another).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLedger {
    entries: BTreeMap<String, Vec<UsageRecord>>,
}

impl UsageLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage under its grouping key label.
    pub fn record(&mut self, usage: UsageRecord) -> Result<()> {
        let label = usage.key().to_string();
        self.record_as(label, usage)
    }

    /// Record usage under an explicit label (e.g. `gpt-5-2` for round 2).
    ///
    /// Fails only when the record itself is inconsistent.
    pub fn record_as(&mut self, label: impl Into<String>, usage: UsageRecord) -> Result<()> {
        usage.validate()?;
        let records = self.entries.entry(label.into()).or_default();
        let key = usage.key();
        match records.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => *existing = existing.checked_add(&usage)?,
            None => records.push(usage),
        }
        Ok(())
    }

    /// Fold another ledger into this one.
    pub fn merge(&mut self, other: &UsageLedger) -> Result<()> {
        for (label, usage) in other.entries() {
            self.record_as(label, usage.clone())?;
        }
        Ok(())
    }

    /// Entries by label, one per grouping key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &UsageRecord)> {
        self.entries
            .iter()
            .flat_map(|(label, records)| records.iter().map(move |usage| (label.as_str(), usage)))
    }

    /// First record stored under a label.
    pub fn get(&self, label: &str) -> Option<&UsageRecord> {
        self.entries.get(label).and_then(|records| records.first())
    }

    /// Record stored under a label for one grouping key.
    pub fn get_keyed(&self, label: &str, key: &UsageKey) -> Option<&UsageRecord> {
        self.entries
            .get(label)
            .and_then(|records| records.iter().find(|usage| usage.key() == *key))
    }

    /// Number of entries (label and grouping key pairs).
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.entries.values().flatten()
    }

    /// Total input tokens across all entries.
    pub fn total_input_tokens(&self) -> u64 {
        self.records().map(|u| u.input_tokens).sum()
    }

    /// Total cached input tokens across all entries.
    pub fn total_cached_input_tokens(&self) -> u64 {
        self.records().map(|u| u.cached_input_tokens).sum()
    }

    /// Total output tokens across all entries.
    pub fn total_output_tokens(&self) -> u64 {
        self.records().map(|u| u.output_tokens).sum()
    }

    /// Fraction of input tokens served from cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let input = self.total_input_tokens();
        if input == 0 {
            0.0
        } else {
            self.total_cached_input_tokens() as f64 / input as f64
        }
    }

    /// Grand total cost.
    pub fn total_cost(&self, catalog: &PricingCatalog) -> Result<f64> {
        self.records().map(|u| u.cost(catalog)).sum()
    }

    /// Render the human-readable ledger: label, category, tokens, cost, total.
    pub fn report(&self, catalog: &PricingCatalog) -> Result<String> {
        let mut out = String::new();
        let mut grand_total = 0.0;

        for (label, usage) in self.entries() {
            let costs = usage.breakdown(catalog)?;
            let key = usage.key().to_string();
            if key == label {
                out.push_str(&format!("{}\n", label));
            } else {
                out.push_str(&format!("{}: {}\n", label, key));
            }
            let rows = [
                ("non-cached input", usage.non_cached_input_tokens(), costs.non_cached_input),
                ("cached input", usage.cached_input_tokens, costs.cached_input),
                ("output", usage.non_reasoning_output_tokens(), costs.output),
                ("reasoning output", usage.reasoning_tokens, costs.reasoning_output),
                ("cache write", usage.cache_write_tokens, costs.cache_write),
            ];
            for (category, tokens, cost) in rows {
                if tokens == 0 {
                    continue;
                }
                out.push_str(&report_row(category, &format_tokens(tokens), cost));
            }
            out.push_str(&report_row("subtotal", "", costs.total()));
            grand_total += costs.total();
        }

        out.push_str(&format!("Total: {}\n", format_cost(grand_total)));
        Ok(out)
    }
}

fn report_row(category: &str, tokens: &str, cost: f64) -> String {
    format!("  {:<18} {:>10} {:>12}\n", category, tokens, format_cost(cost))
}

/// Format cost in a human-readable way.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.6}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}

/// Format token count with K/M suffixes.
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{}", tokens)
    }
}
