//! Anthropic Messages API provider.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::types::{MessagePart, Role};

use crate::provider::{
    LlmProvider, ProviderError, ProviderMessage, ProviderRequest, StopReason, StreamEvent,
};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        req: &ProviderRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, "sending streaming request");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_sse(resp, tx).await
    }
}

fn build_request_body(req: &ProviderRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": req.model,
        "system": req.system,
        "max_tokens": req.max_tokens,
        "messages": to_api_messages(&req.messages),
        "stream": true,
    });
    if !req.tools.is_empty() {
        body["tools"] = serde_json::json!(req
            .tools
            .iter()
            .map(|t| serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>());
    }
    body
}

/// Convert stored messages to API content blocks. Tool results and
/// approval responses are user-role `tool_result` blocks; consecutive
/// same-role messages are merged because the API requires alternation.
fn to_api_messages(messages: &[ProviderMessage]) -> Vec<serde_json::Value> {
    let mut out: Vec<(String, Vec<serde_json::Value>)> = Vec::new();

    for message in messages {
        let (role, blocks) = match message.role {
            Role::Assistant => ("assistant", assistant_blocks(&message.parts)),
            Role::System => continue, // system text travels separately
            Role::User | Role::Tool => ("user", user_blocks(&message.parts)),
        };
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => {
                last_blocks.extend(blocks);
            }
            _ => out.push((role.to_string(), blocks)),
        }
    }

    out.into_iter()
        .map(|(role, content)| serde_json::json!({ "role": role, "content": content }))
        .collect()
}

fn assistant_blocks(parts: &[MessagePart]) -> Vec<serde_json::Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => {
                Some(serde_json::json!({ "type": "text", "text": text }))
            }
            // Both executed and approval-gated calls replay as the
            // model's own tool_use blocks.
            MessagePart::ToolCall { id, name, input }
            | MessagePart::ToolApprovalRequest { id, name, input } => Some(serde_json::json!({
                "type": "tool_use", "id": id, "name": name, "input": input,
            })),
            _ => None,
        })
        .collect()
}

fn user_blocks(parts: &[MessagePart]) -> Vec<serde_json::Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => {
                Some(serde_json::json!({ "type": "text", "text": text }))
            }
            MessagePart::ToolResult {
                id,
                output,
                is_error,
                ..
            } => Some(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": output.to_string(),
                "is_error": is_error,
            })),
            MessagePart::ToolApprovalResponse { id, approved } => {
                // An approved-and-executed call already carries a real
                // tool_result in the same message; emitting a second one
                // for the same id would be rejected by the API.
                let has_result = parts.iter().any(|p| {
                    matches!(p, MessagePart::ToolResult { id: rid, .. } if rid == id)
                });
                if has_result {
                    return None;
                }
                let content = if *approved {
                    "The user approved this action."
                } else {
                    "The user denied this action. Do not retry it."
                };
                Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": content,
                }))
            }
            _ => None,
        })
        .collect()
}

/// Parse the SSE byte stream, forwarding events until `message_stop`.
async fn process_sse(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<(), ProviderError> {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    let mut current_block_type = String::new();
    let mut tool_use_id = String::new();
    let mut tool_use_name = String::new();
    let mut tool_use_input_json = String::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| ProviderError::Aborted(e.to_string()))?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event_type) = line.strip_prefix("event: ") {
                current_event = event_type.to_string();
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            match current_event.as_str() {
                "content_block_start" => {
                    if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                        current_block_type = start.content_block.block_type.clone();
                        if current_block_type == "tool_use" {
                            tool_use_id = start.content_block.id.unwrap_or_default();
                            tool_use_name = start.content_block.name.unwrap_or_default();
                            tool_use_input_json.clear();
                        }
                    }
                }
                "content_block_delta" => {
                    if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                        match delta.delta.delta_type.as_str() {
                            "text_delta" => {
                                if let Some(text) = delta.delta.text {
                                    if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                            "input_json_delta" => {
                                if let Some(partial) = delta.delta.partial_json {
                                    tool_use_input_json.push_str(&partial);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "content_block_stop" => {
                    if current_block_type == "tool_use" {
                        let input = serde_json::from_str(&tool_use_input_json)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                        let event = StreamEvent::ToolUse {
                            id: std::mem::take(&mut tool_use_id),
                            name: std::mem::take(&mut tool_use_name),
                            input,
                        };
                        tool_use_input_json.clear();
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    current_block_type.clear();
                }
                "message_delta" => {
                    if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                        stop_reason = match delta.delta.stop_reason.as_deref() {
                            Some("tool_use") => StopReason::ToolUse,
                            Some("max_tokens") => StopReason::MaxTokens,
                            _ => StopReason::EndTurn,
                        };
                    }
                }
                "error" => {
                    warn!(data, "stream error event");
                    return Err(ProviderError::Aborted(data.to_string()));
                }
                _ => {}
            }
        }

        line_buf = remainder;
    }

    let _ = tx.send(StreamEvent::Done { stop_reason }).await;
    Ok(())
}

// SSE data shapes (deserialization only).

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}
