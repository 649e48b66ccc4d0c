//! The chat-platform boundary as the core consumes it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub thread_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    /// Transport-specific parse mode label (e.g. "MarkdownV2"). `None`
    /// sends plain text.
    pub parse_mode: Option<String>,
}

impl SendOptions {
    pub fn in_thread(thread_id: Option<i64>) -> Self {
        Self {
            thread_id,
            ..Default::default()
        }
    }

    pub fn without_thread(&self) -> Self {
        Self {
            thread_id: None,
            reply_to_message_id: self.reply_to_message_id,
            parse_mode: self.parse_mode.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<Button>>,
}

impl InlineKeyboard {
    pub fn row(buttons: Vec<Button>) -> Self {
        Self {
            rows: vec![buttons],
        }
    }
}

/// Everything the core asks of a chat platform. Optional capabilities
/// default to `Unsupported`; callers degrade gracefully.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a text message, returning its message id.
    async fn send_text(&self, chat_id: i64, text: &str, opts: &SendOptions) -> Result<i64>;

    /// Edit a previously sent message. Implementations surface the
    /// platform's "not modified" as `TransportError::NotModified`.
    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()>;

    /// Post a message with an inline keyboard, returning its message id.
    async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &InlineKeyboard,
        opts: &SendOptions,
    ) -> Result<i64>;

    /// Progressive pre-send draft surface. Optional.
    async fn send_draft(
        &self,
        _chat_id: i64,
        _draft_id: &str,
        _text: &str,
        _opts: &SendOptions,
    ) -> Result<()> {
        Err(TransportError::Unsupported)
    }

    fn supports_drafts(&self) -> bool {
        false
    }

    /// Create a forum topic, returning its thread id. Optional.
    async fn create_forum_topic(&self, _chat_id: i64, _name: &str) -> Result<i64> {
        Err(TransportError::Unsupported)
    }

    /// Rename a forum topic. Optional.
    async fn edit_forum_topic(&self, _chat_id: i64, _thread_id: i64, _name: &str) -> Result<()> {
        Err(TransportError::Unsupported)
    }

    /// Acknowledge a button callback, optionally with a toast text.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
