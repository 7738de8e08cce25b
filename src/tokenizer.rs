//! Token estimation for instruction sizing and conversation accounting.
//!
//! Provider token counts are only known after a call. Before the call the
//! engine needs an estimate of the reusable instruction size (for padding)
//! and of the conversation so far; both come from tiktoken encodings.

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::traits::ChatMessage;

/// Framing tokens a chat API adds around each message.
pub const TOKENS_PER_MESSAGE: usize = 4;

/// Tokenizer for estimating token counts before a request is sent.
pub struct Tokenizer {
    encoder: CoreBPE,
    model: String,
}

impl Tokenizer {
    /// Create a tokenizer for a specific model.
    ///
    /// Current OpenAI models use o200k; everything else falls back to
    /// cl100k, which is close enough for estimation purposes.
    pub fn for_model(model: &str) -> Self {
        let encoder = match model {
            m if m.contains("gpt-5")
                || m.contains("gpt-4o")
                || m.contains("gpt-4.1")
                || m.contains("o1")
                || m.contains("o3") =>
            {
                o200k_base().expect("Failed to load o200k tokenizer")
            }
            _ => cl100k_base().expect("Failed to load cl100k tokenizer"),
        };

        Self {
            encoder,
            model: model.to_string(),
        }
    }

    /// Create a default tokenizer using cl100k_base.
    pub fn default_tokenizer() -> Self {
        Self {
            encoder: cl100k_base().expect("Failed to load cl100k tokenizer"),
            model: "default".to_string(),
        }
    }

    /// Count the number of tokens in the text.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }

    /// Estimate the input tokens of a message list, framing included.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let tool_args: usize = m
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| self.count_tokens(&call.function.arguments))
                    .sum();
                TOKENS_PER_MESSAGE + self.count_tokens(&m.content) + tool_args
            })
            .sum()
    }

    /// Get the model this tokenizer is configured for.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::default_tokenizer()
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("model", &self.model).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counting() {
        let tokenizer = Tokenizer::default_tokenizer();
        let text = "Hello, world!";
        let count = tokenizer.count_tokens(text);
        assert!(count > 0);
        assert!(count < text.len());
    }

    #[test]
    fn test_empty_string() {
        let tokenizer = Tokenizer::default_tokenizer();
        assert_eq!(tokenizer.count_tokens(""), 0);
        assert_eq!(tokenizer.count_messages(&[]), 0);
    }

    #[test]
    fn test_for_model_gpt5() {
        let t = Tokenizer::for_model("gpt-5-mini");
        assert_eq!(t.model(), "gpt-5-mini");
        assert!(t.count_tokens("Hello") > 0);
    }

    #[test]
    fn test_for_model_unknown_falls_back() {
        let t = Tokenizer::for_model("claude-haiku-4-5");
        assert!(t.count_tokens("Hello") > 0);
    }

    #[test]
    fn test_count_messages_adds_framing() {
        let tokenizer = Tokenizer::default();
        let messages = vec![ChatMessage::user("Hello"), ChatMessage::assistant("Hi there")];
        let content = tokenizer.count_tokens("Hello") + tokenizer.count_tokens("Hi there");
        assert_eq!(
            tokenizer.count_messages(&messages),
            content + 2 * TOKENS_PER_MESSAGE
        );
    }
}
