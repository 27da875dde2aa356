//! Progressive HTTP media session: one file fetched in bounded range
//! chunks into the ring buffer, with low-waterline buffering events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::buffer::RingBuffer;
use crate::config::EngineConfig;
use crate::downloader::Downloader;
use crate::error::{DownloadError, Result};
use crate::events::{DownloadEvent, EventSink};
use crate::net::NetworkClient;
use crate::request::{DownloadRequest, StatusCallback};
use crate::{MediaDownload, ReadOutcome, Seekable};

type RequestSlot = Arc<Mutex<Option<Arc<DownloadRequest>>>>;

/// Edge-triggered buffering notifications.
///
/// The upward threshold is the low waterline, raised to half the file
/// length when that is larger (small files should be mostly buffered
/// before playback starts) and capped at the ring capacity so it stays
/// reachable. `AboveLowWaterline` fires on the upward crossing,
/// `BelowLowWaterline` on the next downward crossing of the low line,
/// and the two alternate from there.
struct Waterline {
    buffer: Arc<RingBuffer>,
    events: EventSink,
    low_bytes: u64,
    file_len: AtomicU64,
    request: RequestSlot,
    above: AtomicBool,
}

impl Waterline {
    fn high_bytes(&self) -> u64 {
        let mut high = self.low_bytes;
        let file_len = self.file_len.load(Ordering::Acquire);
        if file_len > 0 {
            high = high
                .max(file_len / 2)
                .min(self.buffer.capacity() as u64);
        }
        high.max(1)
    }

    fn update(&self) {
        if self.file_len.load(Ordering::Acquire) == 0 {
            let header = self
                .request
                .lock()
                .as_ref()
                .and_then(|r| r.header().get());
            if let Some(header) = header {
                self.file_len.store(header.total_len(), Ordering::Release);
            }
        }

        let buffered = self.buffer.size() as u64;
        if !self.above.load(Ordering::Acquire) {
            if buffered >= self.high_bytes() {
                self.above.store(true, Ordering::Release);
                debug!(buffered, "buffer rose above low waterline");
                (self.events)(DownloadEvent::AboveLowWaterline(buffered));
            }
        } else if buffered < self.low_bytes {
            self.above.store(false, Ordering::Release);
            debug!(buffered, "buffer fell below low waterline");
            (self.events)(DownloadEvent::BelowLowWaterline(buffered));
        }
    }
}

/// [`MediaDownload`] over a single progressive HTTP file.
pub struct HttpMediaDownloader {
    downloader: Downloader,
    buffer: Arc<RingBuffer>,
    request: RequestSlot,
    waterline: Arc<Waterline>,
    status: StatusCallback,
    header_timeout: std::time::Duration,
    read_wait_cycles: u32,
}

impl HttpMediaDownloader {
    pub fn new(
        config: &EngineConfig,
        events: EventSink,
        status: StatusCallback,
        client: Box<dyn NetworkClient>,
    ) -> Arc<Self> {
        let buffer = Arc::new(RingBuffer::new(config.ring_capacity));
        let request: RequestSlot = Arc::new(Mutex::new(None));
        let waterline = Arc::new(Waterline {
            buffer: Arc::clone(&buffer),
            events,
            low_bytes: config.low_waterline_bytes().max(1),
            file_len: AtomicU64::new(0),
            request: Arc::clone(&request),
            above: AtomicBool::new(false),
        });

        Arc::new(Self {
            downloader: Downloader::new(client, config),
            buffer,
            request,
            waterline,
            status,
            header_timeout: config.header_timeout,
            read_wait_cycles: config.read_wait_cycles,
        })
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    fn current(&self) -> Option<Arc<DownloadRequest>> {
        self.request.lock().clone()
    }
}

impl MediaDownload for HttpMediaDownloader {
    fn open(&self, url: &str) -> Result<()> {
        let buffer = Arc::clone(&self.buffer);
        let waterline = Arc::clone(&self.waterline);
        let request = DownloadRequest::new(
            url,
            false,
            Box::new(move |offset, data| {
                // ranged transfers report absolute file offsets, which
                // are exactly the stream offsets the buffer tracks
                let accepted = buffer.write(data, offset);
                if accepted {
                    waterline.update();
                }
                accepted
            }),
            Arc::clone(&self.status),
        );

        *self.request.lock() = Some(Arc::clone(&request));
        if !self.downloader.download(request, None) {
            // the request queue was deactivated by a close
            *self.request.lock() = None;
            return Err(DownloadError::Inactive);
        }
        self.downloader.start()?;
        info!(url = %url, "http session opened");
        Ok(())
    }

    fn close(&self) {
        self.buffer.set_active(false);
        self.downloader.stop();
        *self.request.lock() = None;
        info!("http session closed");
    }

    fn pause(&self) {
        drop(self.downloader.pause());
    }

    fn resume(&self) {
        self.downloader.resume();
    }

    fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        let bytes_read = self.buffer.read(buf, self.read_wait_cycles);
        self.waterline.update();
        let is_eos = self
            .current()
            .map(|r| r.is_eos())
            .unwrap_or(false)
            && self.buffer.is_empty();
        ReadOutcome { bytes_read, is_eos }
    }

    fn seek(&self, offset: u64) -> bool {
        if self.buffer.seek(offset) {
            trace!(offset, "seek served from buffer");
            self.waterline.update();
            return true;
        }
        if self.seekable() == Seekable::Unseekable {
            return false;
        }

        // out of window: drop the buffer and refetch from `offset`
        let guard = self.downloader.pause();
        self.buffer.set_active(false);
        let repositioned = guard.seek(offset).is_ok();
        self.buffer.set_active(true);
        guard.resume();
        debug!(offset, repositioned, "seek outside buffered window");
        repositioned
    }

    fn content_length(&self) -> u64 {
        self.current()
            .and_then(|r| r.wait_header(self.header_timeout).ok())
            .map(|h| h.total_len())
            .unwrap_or(0)
    }

    fn duration(&self) -> f64 {
        // a raw byte stream carries no timing information
        -1.0
    }

    fn seekable(&self) -> Seekable {
        let Some(request) = self.current() else {
            return Seekable::Invalid;
        };
        let chunked = request
            .header()
            .get()
            .map(|h| h.is_chunked)
            .unwrap_or(false);
        if chunked {
            Seekable::Unseekable
        } else {
            Seekable::Seekable
        }
    }

    fn retry(&self, request: &Arc<DownloadRequest>) {
        let guard = self.downloader.pause();
        if !guard.retry(request) {
            trace!(url = %request.url(), "stale retry dropped");
        }
        guard.resume();
    }
}
