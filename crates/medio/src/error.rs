//! Error types for the download engine.

use thiserror::Error;

/// Coarse transport-level error classes, stored atomically on a request
/// so the retry monitor can decide whether another attempt makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClientErrorCode {
    /// No client-side error recorded.
    Ok = 0,
    /// The request or connection timed out.
    Timeout = 1,
    /// A non-retryable client failure (bad URL, redirect loop, TLS setup).
    NotRetry = 2,
    /// Any other transport failure (reset connections, DNS flakes).
    Unknown = 3,
}

impl ClientErrorCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ClientErrorCode::Ok,
            1 => ClientErrorCode::Timeout,
            2 => ClientErrorCode::NotRetry,
            _ => ClientErrorCode::Unknown,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether a request that failed with this code is worth retrying.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ClientErrorCode::Ok | ClientErrorCode::NotRetry)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme `{scheme}`")]
    UnsupportedScheme { scheme: String },

    #[error("server responded with HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("transport error ({code:?}): {reason}")]
    Transport {
        code: ClientErrorCode,
        reason: String,
    },

    #[error("timed out waiting for response headers")]
    HeaderTimeout,

    #[error("download request queue is full")]
    QueueFull,

    #[error("component is closed or inactive")]
    Inactive,

    #[error("playlist error: {0}")]
    Playlist(#[from] m3u8::PlaylistError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        DownloadError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(code: ClientErrorCode, reason: impl Into<String>) -> Self {
        DownloadError::Transport {
            code,
            reason: reason.into(),
        }
    }

    /// Whether the failure is transient enough that the monitor should
    /// schedule a retry for the affected request.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status } => *status >= 500 || *status == 429,
            DownloadError::Transport { code, .. } => code.is_retryable(),
            DownloadError::HeaderTimeout => true,
            DownloadError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
