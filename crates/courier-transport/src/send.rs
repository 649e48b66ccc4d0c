//! Sending helpers shared by every caller of the transport.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use courier_core::chunk::split_message;

use crate::error::{Result, TransportError};
use crate::types::{ChatTransport, SendOptions};

/// Small gap between consecutive chunks so the platform's flood control
/// stays quiet.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Send `text` in 4096-char chunks, with the thread-not-found fallback:
/// if the transport reports a missing thread and a thread id was given,
/// the send is retried without it. Returns the id of the last message.
pub async fn send_text_chunked(
    transport: &Arc<dyn ChatTransport>,
    chat_id: i64,
    text: &str,
    opts: &SendOptions,
) -> Result<Option<i64>> {
    let chunks = split_message(text);
    let mut last_id = None;

    for (i, chunk) in chunks.iter().enumerate() {
        let sent = match transport.send_text(chat_id, chunk, opts).await {
            Err(TransportError::ThreadNotFound) if opts.thread_id.is_some() => {
                warn!(chat_id, "thread missing, retrying send without thread id");
                transport
                    .send_text(chat_id, chunk, &opts.without_thread())
                    .await
            }
            other => other,
        }?;
        last_id = Some(sent);

        if i + 1 < chunks.len() {
            tokio::time::sleep(INTER_CHUNK_DELAY).await;
        }
    }
    Ok(last_id)
}

/// Edit a message, swallowing the harmless "not modified" rejection.
pub async fn edit_text_quiet(
    transport: &Arc<dyn ChatTransport>,
    chat_id: i64,
    message_id: i64,
    text: &str,
    keyboard: Option<&crate::types::InlineKeyboard>,
) -> Result<()> {
    match transport.edit_text(chat_id, message_id, text, keyboard).await {
        Err(TransportError::NotModified) => Ok(()),
        other => other,
    }
}
