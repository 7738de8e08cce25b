//! Minimal conversation object.
//!
//! A [`Conversation`] is mutated in place by every turn and owns the padding
//! memo for its call group. It is not meant to be shared between concurrent
//! calls; the engine takes it by `&mut`.

use serde::{Deserialize, Serialize};

use crate::cache_padding::PaddingMemo;
use crate::tokenizer::Tokenizer;
use crate::traits::{ChatMessage, ChatRole};

/// Ordered conversation items plus the padding decision for this group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,

    #[serde(default)]
    padding: PaddingMemo,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item.
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Text of the first user message.
    pub fn first_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }

    /// Text of the most recent user message.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }

    /// Estimated input tokens of all items.
    pub fn estimate_total_tokens(&self, tokenizer: &Tokenizer) -> usize {
        tokenizer.count_messages(&self.messages)
    }

    /// Drop items appended after `len`; used to roll back a retried turn.
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Padding decision shared by every turn of this conversation.
    pub fn padding_memo(&self) -> &PaddingMemo {
        &self.padding
    }

    pub fn padding_memo_mut(&mut self) -> &mut PaddingMemo {
        &mut self.padding
    }
}
