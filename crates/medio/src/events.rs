//! Session events surfaced to the embedding player.

use std::sync::Arc;

/// Edge-triggered notifications a session emits while downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Buffered bytes climbed above the low waterline; playback can start
    /// or resume. Carries the buffered byte count at the crossing.
    AboveLowWaterline(u64),
    /// Buffered bytes dropped back under the low waterline.
    BelowLowWaterline(u64),
    /// A request kept failing with a client-side error past the retry
    /// escalation threshold. Carries the raw [`ClientErrorCode`] value.
    ///
    /// [`ClientErrorCode`]: crate::error::ClientErrorCode
    ClientError(i32),
    /// A request kept failing with an HTTP error status past the retry
    /// escalation threshold. Carries the status code.
    ServerError(i32),
}

/// Event callback, injected at construction and never reassigned.
pub type EventSink = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

/// An [`EventSink`] that drops everything, for sessions without a listener.
pub fn null_sink() -> EventSink {
    Arc::new(|_| {})
}
