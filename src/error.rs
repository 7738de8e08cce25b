//! Economizer error types.
//!
//! # Error Handling Philosophy
//!
//! Errors should be:
//! 1. **Actionable**: Tell the caller what to fix, not just what went wrong
//! 2. **Specific**: Include relevant context (model name, tier, limits)
//! 3. **Final**: Anything recoverable is a result value, not an error
//!
//! # Common Errors and Solutions
//!
//! | Error | Cause | Solution |
//! |-------|-------|----------|
//! | `InvalidArgument` | Zero reuse count, negative estimate | Fix the caller input |
//! | `MissingAverageLengths` | Conversation padding without averages | Provide average message sizes |
//! | `UnknownModel` | Name not in the pricing catalog | Add the model or fix the name |
//! | `UnsupportedReasoningTier` | Tier not allowed for the model | Pick an allowed tier or restriction |
//! | `ProtectedTokenInConversation` | Rating tag typed by the user inside a conversation | Remove the tag from the message |
//! | `MaxFunctionIterationsExceeded` | Model kept calling tools | Raise the cap or fix the tools |
//!
//! Truncated output, timeouts and missing self-ratings are deliberately not in
//! this enum: the engine reports them as [`crate::engine::FinalOutcome`] and
//! [`crate::quality::RatingOutcome`] values.

use thiserror::Error;

/// Result type for economizer operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while deciding, issuing or pricing a request.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Bad caller input (zero/negative counts, out-of-range fractions).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Conversation padding requested without average message lengths.
    #[error("Missing average message lengths: {0}")]
    MissingAverageLengths(String),

    /// Model name is not present in the pricing catalog.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The effective reasoning tier is not allowed for this model.
    #[error("Reasoning tier '{tier}' is not supported by model '{model}'")]
    UnsupportedReasoningTier { model: String, tier: String },

    /// A self-rating tag was found in a user message of an open conversation.
    #[error("Protected self-rating token found in a conversation message")]
    ProtectedTokenInConversation,

    /// The function-call loop did not settle within its round budget.
    #[error("Maximum function iterations exceeded ({max} rounds)")]
    MaxFunctionIterationsExceeded { max: usize },

    /// Two usage records with different grouping keys were summed.
    #[error("Cannot sum usage records with different keys: {left} vs {right}")]
    UsageKeyMismatch { left: String, right: String },

    /// Provider family has no transport implementation yet.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Failure surfaced by the transport collaborator.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl LlmError {
    /// Get a plain-text description of the error suitable for end users.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_economizer::LlmError;
    ///
    /// let error = LlmError::UnknownModel("gpt-9".to_string());
    /// assert!(error.user_description().contains("gpt-9"));
    /// ```
    pub fn user_description(&self) -> String {
        match self {
            Self::InvalidArgument(msg) => format!("Invalid request: {}. Check your parameters.", msg),
            Self::MissingAverageLengths(msg) => format!(
                "Cannot plan cache padding for a conversation without average message lengths ({}).",
                msg
            ),
            Self::UnknownModel(model) => {
                format!("Model '{}' is not in the pricing catalog.", model)
            }
            Self::UnsupportedReasoningTier { model, tier } => {
                format!("Model '{}' does not accept reasoning tier '{}'.", model, tier)
            }
            Self::ProtectedTokenInConversation => {
                "Your message contains a reserved quality tag. Please remove it and try again."
                    .to_string()
            }
            Self::MaxFunctionIterationsExceeded { max } => format!(
                "The model kept requesting tools after {} rounds and was stopped.",
                max
            ),
            Self::UsageKeyMismatch { .. } => {
                "Usage records for different models or billing modes cannot be combined."
                    .to_string()
            }
            Self::NotSupported(feature) => format!("'{}' is not supported yet.", feature),
            Self::ConfigError(msg) => format!("Configuration error: {}.", msg),
            Self::SerializationError(_) => {
                "Failed to parse structured data. This may be a temporary issue.".to_string()
            }
            Self::TransportError(msg) => format!("The provider request failed: {}", msg),
        }
    }

    /// Check if this error came from caller input rather than the provider.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::MissingAverageLengths(_)
                | Self::UnknownModel(_)
                | Self::UnsupportedReasoningTier { .. }
                | Self::ProtectedTokenInConversation
                | Self::UsageKeyMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = LlmError::InvalidArgument("reuse count must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid argument: reuse count must be positive"
        );

        let error = LlmError::UnknownModel("gpt-9".to_string());
        assert_eq!(error.to_string(), "Unknown model: gpt-9");
    }

    #[test]
    fn test_unsupported_tier_display() {
        let error = LlmError::UnsupportedReasoningTier {
            model: "gpt-4.1".to_string(),
            tier: "high".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Reasoning tier 'high' is not supported by model 'gpt-4.1'"
        );
    }

    #[test]
    fn test_max_iterations_display() {
        let error = LlmError::MaxFunctionIterationsExceeded { max: 5 };
        assert_eq!(error.to_string(), "Maximum function iterations exceeded (5 rounds)");
        assert!(error.user_description().contains("5 rounds"));
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: LlmError = json_err.into();
        assert!(matches!(error, LlmError::SerializationError(_)));
        assert!(error.user_description().contains("parse"));
    }

    #[test]
    fn test_caller_errors() {
        assert!(LlmError::InvalidArgument("x".to_string()).is_caller_error());
        assert!(LlmError::ProtectedTokenInConversation.is_caller_error());
        assert!(!LlmError::TransportError("reset".to_string()).is_caller_error());
        assert!(!LlmError::MaxFunctionIterationsExceeded { max: 5 }.is_caller_error());
    }

    #[test]
    fn test_user_description_protected_token() {
        let desc = LlmError::ProtectedTokenInConversation.user_description();
        assert!(desc.contains("reserved quality tag"));
    }
}
