//! Streaming media download engine.
//!
//! Feeds a player from HTTP media sources through a bounded in-memory
//! ring buffer. Two source kinds are supported:
//!
//! - [`HlsMediaDownloader`]: HLS playlists (master or media, live or
//!   VOD), fragments fetched whole-file in playlist order.
//! - [`HttpMediaDownloader`]: progressive files, fetched in bounded
//!   range chunks with low-waterline buffering events.
//!
//! Both implement [`MediaDownload`], the blocking player-facing
//! contract. [`DownloadMonitor`] wraps either one and adds a watchdog:
//! stall detection and throttled retries for failed requests.
//!
//! Everything runs on dedicated worker threads; the consumer calls
//! `read`/`seek` from its own thread and blocks briefly in the ring
//! buffer when data is not yet available.

pub mod buffer;
pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod hls;
pub mod http;
pub mod monitor;
pub mod net;
pub mod queue;
pub mod request;
pub mod task;

pub use buffer::RingBuffer;
pub use config::EngineConfig;
pub use downloader::{Downloader, DownloaderState, PausedDownloader};
pub use error::{ClientErrorCode, DownloadError, Result};
pub use events::{DownloadEvent, EventSink, null_sink};
pub use hls::HlsMediaDownloader;
pub use http::HttpMediaDownloader;
pub use monitor::DownloadMonitor;
pub use net::{HttpNetworkClient, NetworkClient, TransferSink};
pub use request::{DownloadRequest, DownloadStatus, HeaderInfo, StatusCallback};

use std::sync::Arc;

/// Result of one blocking read from a media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    pub bytes_read: usize,
    /// `true` once the source is fully downloaded *and* drained; the
    /// player treats this as end of stream.
    pub is_eos: bool,
}

/// Whether byte-offset seeking is meaningful for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seekable {
    Seekable,
    /// Live or chunked sources with no stable byte mapping.
    Unseekable,
    /// No session open yet; seekability is not known.
    Invalid,
}

/// Player-facing contract of a media download session.
///
/// All methods are callable from any thread; `read` blocks briefly when
/// the buffer is empty and data is still expected.
pub trait MediaDownload: Send + Sync {
    /// Starts the session against `url`. Spawns the worker loops.
    fn open(&self, url: &str) -> Result<()>;

    /// Tears the session down, waking anything blocked on its buffers.
    fn close(&self);

    /// Suspends downloading without dropping buffered data.
    fn pause(&self);

    /// Resumes a paused session.
    fn resume(&self);

    /// Copies buffered media bytes into `buf`.
    fn read(&self, buf: &mut [u8]) -> ReadOutcome;

    /// Repositions the stream at absolute byte `offset`. In-window seeks
    /// are served from the buffer; otherwise the source refetches.
    /// Returns `false` when the source cannot seek there.
    fn seek(&self, offset: u64) -> bool;

    /// Total length in bytes, 0 when unknown.
    fn content_length(&self) -> u64;

    /// Total duration in seconds, negative when unknown or live.
    fn duration(&self) -> f64;

    fn seekable(&self) -> Seekable;

    /// Re-arms a failed request for another attempt. Called by the
    /// monitor's retry loop.
    fn retry(&self, request: &Arc<DownloadRequest>);
}
