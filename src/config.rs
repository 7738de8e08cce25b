//! Engine Configuration
//!
//! Tunable constants of the decision engine. These values were calibrated
//! against observed provider behaviour and are expected to drift, so they
//! live in a TOML file rather than in code.
//!
//! # Configuration File Location
//!
//! The config file is loaded from (in order of priority):
//! 1. `EDGEQUAKE_ECONOMIZER_CONFIG` environment variable
//! 2. `./economizer.toml` (current working directory)
//! 3. `~/.edgequake/economizer.toml` (user config)
//! 4. Built-in default configuration
//!
//! # Example Configuration
//!
//! ```toml
//! default_timeout_secs = 120
//!
//! [reasoning]
//! short_instruction_chars = 750
//! long_instruction_chars = 2400
//!
//! [padding]
//! min_cache_saving = 0.10
//! safe_chars_per_token = 6.0
//! cache_quantum_tokens = 128
//!
//! [function_loop]
//! max_rounds = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{LlmError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "EDGEQUAKE_ECONOMIZER_CONFIG";

// ============================================================================
// Sections
// ============================================================================

/// Character counts at which adaptive reasoning ranges switch tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningThresholds {
    /// Below this length the lowest tier of a range is used.
    #[serde(default = "default_short_instruction_chars")]
    pub short_instruction_chars: usize,

    /// At or above this length the highest tier of a three-tier range is used.
    #[serde(default = "default_long_instruction_chars")]
    pub long_instruction_chars: usize,
}

fn default_short_instruction_chars() -> usize {
    750
}

fn default_long_instruction_chars() -> usize {
    2400
}

impl Default for ReasoningThresholds {
    fn default() -> Self {
        Self {
            short_instruction_chars: default_short_instruction_chars(),
            long_instruction_chars: default_long_instruction_chars(),
        }
    }
}

/// Cache-padding optimizer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingConfig {
    /// Minimum fraction saved on cached reads for padding to be considered.
    #[serde(default = "default_min_cache_saving")]
    pub min_cache_saving: f64,

    /// Characters of filler emitted per token requested.
    ///
    /// Higher than real text so the provider's count clears the threshold.
    #[serde(default = "default_safe_chars_per_token")]
    pub safe_chars_per_token: f64,

    /// Granularity of provider cache storage, in tokens.
    #[serde(default = "default_cache_quantum_tokens")]
    pub cache_quantum_tokens: u32,
}

fn default_min_cache_saving() -> f64 {
    0.10
}

fn default_safe_chars_per_token() -> f64 {
    6.0
}

fn default_cache_quantum_tokens() -> u32 {
    128
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            min_cache_saving: default_min_cache_saving(),
            safe_chars_per_token: default_safe_chars_per_token(),
            cache_quantum_tokens: default_cache_quantum_tokens(),
        }
    }
}

/// Function-call loop limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLoopConfig {
    /// Maximum model round-trips that may request tools.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_max_rounds() -> usize {
    5
}

impl Default for FunctionLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-call timeout applied when the request does not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default)]
    pub reasoning: ReasoningThresholds,

    #[serde(default)]
    pub padding: PaddingConfig,

    #[serde(default)]
    pub function_loop: FunctionLoopConfig,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            reasoning: ReasoningThresholds::default(),
            padding: PaddingConfig::default(),
            function_loop: FunctionLoopConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default locations.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&path).exists() {
                debug!(path = %path, "Loading economizer config from env");
                return Self::from_file(&path);
            }
        }

        let local_path = Path::new("economizer.toml");
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".edgequake").join("economizer.toml");
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LlmError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| LlmError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LlmError::ConfigError(e.to_string()))
    }

    /// Default per-call timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reasoning.short_instruction_chars >= self.reasoning.long_instruction_chars {
            return Err(LlmError::ConfigError(format!(
                "short_instruction_chars ({}) must be below long_instruction_chars ({})",
                self.reasoning.short_instruction_chars, self.reasoning.long_instruction_chars
            )));
        }
        if !(0.0..1.0).contains(&self.padding.min_cache_saving) {
            return Err(LlmError::ConfigError(format!(
                "min_cache_saving must be in [0, 1), got {}",
                self.padding.min_cache_saving
            )));
        }
        if self.padding.safe_chars_per_token <= 0.0 {
            return Err(LlmError::ConfigError(
                "safe_chars_per_token must be positive".to_string(),
            ));
        }
        if self.padding.cache_quantum_tokens == 0 {
            return Err(LlmError::ConfigError(
                "cache_quantum_tokens must be positive".to_string(),
            ));
        }
        if self.function_loop.max_rounds == 0 {
            return Err(LlmError::ConfigError(
                "function_loop.max_rounds must be positive".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(LlmError::ConfigError(
                "default_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
