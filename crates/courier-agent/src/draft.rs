//! Draft sink: the transport's live-draft surface, as the executor sees it.

use async_trait::async_trait;

/// Receives text deltas during streaming. Implementations own their own
/// error containment; a failing draft surface must never fail the turn.
#[async_trait]
pub trait DraftSink: Send + Sync {
    /// One incremental text delta, in emission order.
    async fn push_delta(&self, text: &str);

    /// Stream finished. `final_text` is the complete response when known.
    /// Returns whether the draft surface displayed anything.
    async fn finish(&self, final_text: Option<&str>) -> bool;
}

/// Satisfies transports without a draft surface.
pub struct NoopDraftSink;

#[async_trait]
impl DraftSink for NoopDraftSink {
    async fn push_delta(&self, _text: &str) {}

    async fn finish(&self, _final_text: Option<&str>) -> bool {
        false
    }
}
