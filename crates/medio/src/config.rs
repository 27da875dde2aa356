use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Chunk size for ranged progressive downloads.
pub const PER_REQUEST_SIZE: usize = 48 * 1024;

/// Bound on the downloader's pending-request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 50;

/// Bound on the HLS seen-fragment set.
pub const SEEN_FRAGMENT_CAPACITY: usize = 512;

/// Default ring buffer capacity shared by producer loops and the reader.
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Tunables for a download session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring buffer capacity in bytes.
    pub ring_capacity: usize,

    /// Chunk size for ranged requests.
    pub per_request_size: usize,

    /// Bound on the downloader's pending-request queue.
    pub request_queue_capacity: usize,

    /// How often a live media playlist is refreshed.
    pub playlist_refresh_interval: Duration,

    /// Watchdog tick period.
    pub watchdog_interval: Duration,

    /// How long reads may be absent during playback before the watchdog
    /// pauses downloading.
    pub stall_timeout: Duration,

    /// Retry count past which a request's failure is surfaced as a
    /// one-shot client/server error event. Retries continue regardless.
    pub retry_escalation_threshold: u32,

    /// Fraction of the ring capacity treated as the low waterline for
    /// buffering events.
    pub low_waterline_ratio: f64,

    /// How many reader wake-ups a read waits through on an empty buffer
    /// before returning 0 bytes.
    pub read_wait_cycles: u32,

    /// Maximum time to wait for response headers on a new request.
    pub header_timeout: Duration,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,

    /// Maximum time between received data chunks.
    pub read_timeout: Duration,

    /// User agent string sent with every request.
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            per_request_size: PER_REQUEST_SIZE,
            request_queue_capacity: REQUEST_QUEUE_CAPACITY,
            playlist_refresh_interval: Duration::from_secs(5),
            watchdog_interval: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(60),
            retry_escalation_threshold: 10,
            low_waterline_ratio: 0.10,
            read_wait_cycles: 10,
            header_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl EngineConfig {
    /// Low waterline in bytes for the configured ring capacity.
    pub fn low_waterline_bytes(&self) -> u64 {
        (self.ring_capacity as f64 * self.low_waterline_ratio) as u64
    }
}
