//! Thin HTTP client for the chat platform's bot API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::types::{ChatTransport, InlineKeyboard, SendOptions};

pub struct BotClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

/// One raw polled update. The payload is passed through to the ingestion
/// pipeline untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct PolledUpdate {
    pub update_id: i64,
    #[serde(flatten)]
    pub rest: serde_json::Value,
}

impl PolledUpdate {
    pub fn into_payload(self) -> serde_json::Value {
        let mut payload = self.rest;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("update_id".into(), json!(self.update_id));
        }
        payload
    }
}

impl BotClient {
    pub fn new(token: &str, api_base: Option<&str>) -> Self {
        let api_base = api_base.unwrap_or("https://api.telegram.org");
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{api_base}/bot{token}"),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        debug!(method, "bot API call");
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !envelope.ok {
            let description = envelope.description.unwrap_or_default();
            return Err(classify_api_error(status, description));
        }
        envelope.result.ok_or_else(|| TransportError::Api {
            status,
            message: "ok response with no result".into(),
        })
    }

    /// Long-poll for updates. Used in polling run mode only.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<PolledUpdate>> {
        self.call(
            "getUpdates",
            json!({ "offset": offset, "timeout": timeout_secs }),
        )
        .await
    }

    /// Webhook management for run-mode switches.
    pub async fn delete_webhook(&self) -> Result<bool> {
        self.call("deleteWebhook", json!({})).await
    }

    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<bool> {
        let mut body = json!({ "url": url });
        if let Some(secret) = secret {
            body["secret_token"] = json!(secret);
        }
        self.call("setWebhook", body).await
    }

    /// Liveness probe used by the polling bootstrap.
    pub async fn get_me(&self) -> Result<serde_json::Value> {
        self.call("getMe", json!({})).await
    }
}

/// The platform reports errors as free-text descriptions; the two we must
/// react to get typed variants.
fn classify_api_error(status: u16, description: String) -> TransportError {
    let lower = description.to_lowercase();
    if lower.contains("message thread not found") {
        return TransportError::ThreadNotFound;
    }
    if lower.contains("message is not modified") {
        return TransportError::NotModified;
    }
    TransportError::Api {
        status,
        message: description,
    }
}

fn keyboard_json(keyboard: &InlineKeyboard) -> serde_json::Value {
    json!({
        "inline_keyboard": keyboard
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    })
}

#[async_trait]
impl ChatTransport for BotClient {
    async fn send_text(&self, chat_id: i64, text: &str, opts: &SendOptions) -> Result<i64> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(thread_id) = opts.thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        if let Some(reply_to) = opts.reply_to_message_id {
            body["reply_to_message_id"] = json!(reply_to);
        }
        if let Some(mode) = &opts.parse_mode {
            body["parse_mode"] = json!(mode);
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if let Some(kb) = keyboard {
            body["reply_markup"] = keyboard_json(kb);
        }
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &InlineKeyboard,
        opts: &SendOptions,
    ) -> Result<i64> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": keyboard_json(keyboard),
        });
        if let Some(thread_id) = opts.thread_id {
            body["message_thread_id"] = json!(thread_id);
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn create_forum_topic(&self, chat_id: i64, name: &str) -> Result<i64> {
        let topic: ForumTopic = self
            .call("createForumTopic", json!({ "chat_id": chat_id, "name": name }))
            .await?;
        Ok(topic.message_thread_id)
    }

    async fn edit_forum_topic(&self, chat_id: i64, thread_id: i64, name: &str) -> Result<()> {
        let _: bool = self
            .call(
                "editForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id, "name": name }),
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_not_found_is_classified() {
        let err = classify_api_error(400, "Bad Request: message thread not found".into());
        assert!(matches!(err, TransportError::ThreadNotFound));
    }

    #[test]
    fn not_modified_is_classified() {
        let err = classify_api_error(400, "Bad Request: message is not modified".into());
        assert!(matches!(err, TransportError::NotModified));
    }

    #[test]
    fn other_errors_keep_status() {
        let err = classify_api_error(403, "Forbidden: bot was blocked".into());
        match err {
            TransportError::Api { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("blocked"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn polled_update_rebuilds_payload() {
        let raw = serde_json::json!({
            "update_id": 42,
            "message": { "text": "hi" }
        });
        let polled: PolledUpdate = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(polled.update_id, 42);
        assert_eq!(polled.into_payload(), raw);
    }
}
