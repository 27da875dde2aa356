//! Transport layer: the [`NetworkClient`] trait and its `reqwest`-backed
//! implementation.

use std::io::Read;

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use tracing::{debug, trace};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{ClientErrorCode, DownloadError, Result};

const BODY_CHUNK_SIZE: usize = 8 * 1024;

/// Receives the pieces of one transfer as they arrive off the wire.
pub trait TransferSink {
    /// One response header. Called before any body bytes.
    fn on_header(&mut self, name: &str, value: &str);

    /// All headers delivered; `status` is the response status code.
    fn on_headers_complete(&mut self, status: u16);

    /// A body chunk. Return `false` to abort the transfer (the
    /// destination went inactive); the transfer then ends without error.
    fn on_body(&mut self, data: &[u8]) -> bool;
}

/// Blocking byte-range transport.
///
/// One client instance belongs to one download loop; `request_data` is
/// called from that loop's thread and streams the response through the
/// sink before returning.
pub trait NetworkClient: Send {
    /// Binds the client to `url`. Validates scheme; no I/O happens here.
    fn open(&mut self, url: &str) -> Result<()>;

    /// Fetches bytes from the bound URL.
    ///
    /// `start_pos < 0` requests the whole resource with no `Range`
    /// header. Otherwise a `Range` header is sent; `len == 0` means
    /// open-ended (`bytes=start-`), else exactly `len` bytes
    /// (`bytes=start-(start+len-1)`).
    fn request_data(&mut self, start_pos: i64, len: usize, sink: &mut dyn TransferSink)
    -> Result<()>;

    /// Unbinds the client and releases the connection.
    fn close(&mut self);
}

/// [`NetworkClient`] over `reqwest::blocking`.
pub struct HttpNetworkClient {
    client: Client,
    url: Option<Url>,
}

impl HttpNetworkClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| DownloadError::transport(ClientErrorCode::NotRetry, e.to_string()))?;
        Ok(Self { client, url: None })
    }
}

impl NetworkClient for HttpNetworkClient {
    fn open(&mut self, url: &str) -> Result<()> {
        let parsed =
            Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(DownloadError::UnsupportedScheme {
                    scheme: scheme.to_string(),
                });
            }
        }
        trace!(url = %parsed, "transport bound");
        self.url = Some(parsed);
        Ok(())
    }

    fn request_data(
        &mut self,
        start_pos: i64,
        len: usize,
        sink: &mut dyn TransferSink,
    ) -> Result<()> {
        let url = self.url.clone().ok_or(DownloadError::Inactive)?;

        let mut request = self.client.get(url.clone());
        if start_pos >= 0 {
            let range = if len == 0 {
                format!("bytes={start_pos}-")
            } else {
                format!("bytes={}-{}", start_pos, start_pos as u64 + len as u64 - 1)
            };
            if let Ok(value) = HeaderValue::from_str(&range) {
                request = request.header(header::RANGE, value);
            }
        }

        let mut response = request.send().map_err(classify_reqwest_error)?;
        let status = response.status();
        debug!(url = %url, start_pos, len, status = status.as_u16(), "range request");
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
            });
        }

        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                sink.on_header(name.as_str(), value);
            }
        }
        sink.on_headers_complete(status.as_u16());

        let mut chunk = [0u8; BODY_CHUNK_SIZE];
        loop {
            let n = response
                .read(&mut chunk)
                .map_err(|e| classify_io_error(&e))?;
            if n == 0 {
                break;
            }
            if !sink.on_body(&chunk[..n]) {
                trace!(url = %url, "transfer aborted by sink");
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.url = None;
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> DownloadError {
    let code = if e.is_timeout() {
        ClientErrorCode::Timeout
    } else if e.is_connect() {
        // refused/reset connections are worth another attempt
        ClientErrorCode::Unknown
    } else if e.is_builder() || e.is_redirect() {
        ClientErrorCode::NotRetry
    } else {
        ClientErrorCode::Unknown
    };
    DownloadError::transport(code, e.to_string())
}

fn classify_io_error(e: &std::io::Error) -> DownloadError {
    let code = match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ClientErrorCode::Timeout,
        _ => ClientErrorCode::Unknown,
    };
    DownloadError::transport(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_unsupported_schemes() {
        let mut client = HttpNetworkClient::new(&EngineConfig::default()).unwrap();
        assert!(matches!(
            client.open("ftp://example.com/file"),
            Err(DownloadError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            client.open("not a url"),
            Err(DownloadError::InvalidUrl { .. })
        ));
        assert!(client.open("https://example.com/file").is_ok());
    }

    #[test]
    fn request_without_open_fails() {
        struct NullSink;
        impl TransferSink for NullSink {
            fn on_header(&mut self, _: &str, _: &str) {}
            fn on_headers_complete(&mut self, _: u16) {}
            fn on_body(&mut self, _: &[u8]) -> bool {
                true
            }
        }
        let mut client = HttpNetworkClient::new(&EngineConfig::default()).unwrap();
        assert!(matches!(
            client.request_data(0, 16, &mut NullSink),
            Err(DownloadError::Inactive)
        ));
    }
}
