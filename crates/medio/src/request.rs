//! Download requests and their shared, atomically-updated state.
//!
//! A [`DownloadRequest`] is created by a media downloader, enqueued on
//! the [`Downloader`], and then mutated concurrently: the download loop
//! advances the cursor as bytes arrive, the monitor bumps retry counts,
//! and the consumer thread inspects progress. All shared fields are
//! atomics or condvar-protected slots so no lock ordering spans threads.
//!
//! [`Downloader`]: crate::downloader::Downloader

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ClientErrorCode, DownloadError, Result};

/// Response metadata recorded once per request when headers arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderInfo {
    pub content_type: String,
    /// `Content-Length` of this response (for a ranged response, the
    /// length of the range, not the file).
    pub content_len: u64,
    /// Total file length, from `Content-Range` when the server honors
    /// range requests, else from `Content-Length` on a full response.
    /// Zero when unknown (chunked transfer).
    pub file_content_len: u64,
    /// Whether the response used chunked transfer encoding. Chunked
    /// sources have unknown length and are unseekable.
    pub is_chunked: bool,
}

impl HeaderInfo {
    /// Best-known total stream length; zero when unknown.
    pub fn total_len(&self) -> u64 {
        if self.file_content_len > 0 {
            self.file_content_len
        } else {
            self.content_len
        }
    }
}

/// A write-once, condvar-backed slot.
///
/// The download loop publishes [`HeaderInfo`] here exactly once per
/// request; consumer threads block in [`wait`] instead of polling.
///
/// [`wait`]: OnceSlot::wait
pub struct OnceSlot<T: Clone> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> OnceSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Publishes `value` if the slot is still empty; later calls are
    /// ignored so the first writer wins.
    pub fn set(&self, value: T) {
        let mut slot = self.value.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.cond.notify_all();
        }
    }

    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until the slot is filled or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock();
        while slot.is_none() {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

impl<T: Clone> Default for OnceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcomes reported through a request's status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// The request finished: all expected bytes were delivered.
    Finished,
    /// A transfer attempt failed partway; the request's error fields
    /// say why and the monitor decides whether to retry.
    PartialDownload,
}

/// Sink for received bytes: `(stream_offset_hint, data) -> accepted`.
/// Returning `false` aborts the in-flight transfer (the destination went
/// inactive).
pub type SaveDataFn = Box<dyn FnMut(u64, &[u8]) -> bool + Send>;

/// Status callback, injected at construction and never reassigned.
pub type StatusCallback = Arc<dyn Fn(&Arc<DownloadRequest>, DownloadStatus) + Send + Sync>;

/// One logical download: a URL plus a live cursor into it.
pub struct DownloadRequest {
    url: String,
    /// Whole-file requests stream the entire resource in one transfer
    /// (HLS fragments); otherwise the loop issues bounded range chunks.
    whole_file: bool,
    /// Next byte offset to request. Only moves forward during normal
    /// transfer; rewritten by the paused-seek path.
    start_pos: AtomicU64,
    /// Size of the next range chunk. Starts at 1 so the first response
    /// cheaply reveals headers and total length.
    request_size: AtomicUsize,
    retry_times: AtomicU32,
    eos: AtomicBool,
    client_error: AtomicI32,
    server_error: AtomicI32,
    /// Set once the escalation event for this request has fired.
    escalated: AtomicBool,
    header: OnceSlot<HeaderInfo>,
    save_data: Mutex<SaveDataFn>,
    status: StatusCallback,
}

impl DownloadRequest {
    pub fn new(
        url: impl Into<String>,
        whole_file: bool,
        save_data: SaveDataFn,
        status: StatusCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            whole_file,
            start_pos: AtomicU64::new(0),
            request_size: AtomicUsize::new(1),
            retry_times: AtomicU32::new(0),
            eos: AtomicBool::new(false),
            client_error: AtomicI32::new(ClientErrorCode::Ok.as_raw()),
            server_error: AtomicI32::new(0),
            escalated: AtomicBool::new(false),
            header: OnceSlot::new(),
            save_data: Mutex::new(save_data),
            status,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_whole_file(&self) -> bool {
        self.whole_file
    }

    pub fn start_pos(&self) -> u64 {
        self.start_pos.load(Ordering::Acquire)
    }

    pub fn set_start_pos(&self, pos: u64) {
        self.start_pos.store(pos, Ordering::Release);
    }

    pub fn advance(&self, bytes: u64) {
        self.start_pos.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn request_size(&self) -> usize {
        self.request_size.load(Ordering::Acquire)
    }

    pub fn set_request_size(&self, size: usize) {
        self.request_size.store(size, Ordering::Release);
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times.load(Ordering::Acquire)
    }

    pub fn bump_retry(&self) -> u32 {
        self.retry_times.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_retries(&self) {
        self.retry_times.store(0, Ordering::Release);
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    pub fn set_eos(&self, eos: bool) {
        self.eos.store(eos, Ordering::Release);
    }

    pub fn client_error(&self) -> ClientErrorCode {
        ClientErrorCode::from_raw(self.client_error.load(Ordering::Acquire))
    }

    pub fn set_client_error(&self, code: ClientErrorCode) {
        self.client_error.store(code.as_raw(), Ordering::Release);
    }

    /// HTTP error status of the last failed attempt, 0 when none.
    pub fn server_error(&self) -> i32 {
        self.server_error.load(Ordering::Acquire)
    }

    pub fn set_server_error(&self, status: i32) {
        self.server_error.store(status, Ordering::Release);
    }

    pub fn clear_errors(&self) {
        self.set_client_error(ClientErrorCode::Ok);
        self.set_server_error(0);
    }

    /// Marks the escalation event fired; returns `true` only for the
    /// first caller.
    pub fn mark_escalated(&self) -> bool {
        !self.escalated.swap(true, Ordering::AcqRel)
    }

    pub fn header(&self) -> &OnceSlot<HeaderInfo> {
        &self.header
    }

    /// Waits for response headers, mapping a miss to [`DownloadError::HeaderTimeout`].
    pub fn wait_header(&self, timeout: Duration) -> Result<HeaderInfo> {
        self.header.wait(timeout).ok_or(DownloadError::HeaderTimeout)
    }

    /// Delivers received bytes to the request's sink. `offset` is the
    /// position of `data[0]` within this request's resource.
    pub fn save(&self, offset: u64, data: &[u8]) -> bool {
        (self.save_data.lock())(offset, data)
    }

    pub fn notify_status(self: &Arc<Self>, status: DownloadStatus) {
        (self.status)(self, status);
    }

    /// Identity used for retry deduplication.
    pub fn identity(&self) -> (String, u64) {
        (self.url.clone(), self.start_pos())
    }
}

impl std::fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("url", &self.url)
            .field("whole_file", &self.whole_file)
            .field("start_pos", &self.start_pos())
            .field("request_size", &self.request_size())
            .field("retry_times", &self.retry_times())
            .field("eos", &self.is_eos())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn noop_request() -> Arc<DownloadRequest> {
        DownloadRequest::new(
            "http://example.com/file.bin",
            false,
            Box::new(|_, _| true),
            Arc::new(|_, _| {}),
        )
    }

    #[test]
    fn cursor_starts_at_probe_size() {
        let req = noop_request();
        assert_eq!(req.start_pos(), 0);
        assert_eq!(req.request_size(), 1);
        assert!(!req.is_eos());
    }

    #[test]
    fn once_slot_first_writer_wins() {
        let slot = OnceSlot::new();
        slot.set(HeaderInfo {
            content_len: 10,
            ..Default::default()
        });
        slot.set(HeaderInfo {
            content_len: 99,
            ..Default::default()
        });
        assert_eq!(slot.get().unwrap().content_len, 10);
    }

    #[test]
    fn once_slot_wait_times_out_when_empty() {
        let slot: OnceSlot<HeaderInfo> = OnceSlot::new();
        assert!(slot.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn once_slot_wait_wakes_on_set() {
        let slot = Arc::new(OnceSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        slot.set(HeaderInfo {
            content_len: 7,
            ..Default::default()
        });
        assert_eq!(waiter.join().unwrap().unwrap().content_len, 7);
    }

    #[test]
    fn header_total_len_prefers_file_length() {
        let ranged = HeaderInfo {
            content_len: 100,
            file_content_len: 5000,
            ..Default::default()
        };
        assert_eq!(ranged.total_len(), 5000);

        let plain = HeaderInfo {
            content_len: 100,
            ..Default::default()
        };
        assert_eq!(plain.total_len(), 100);
    }

    #[test]
    fn escalation_fires_once() {
        let req = noop_request();
        assert!(req.mark_escalated());
        assert!(!req.mark_escalated());
    }

    #[test]
    fn retry_counter() {
        let req = noop_request();
        assert_eq!(req.bump_retry(), 1);
        assert_eq!(req.bump_retry(), 2);
        req.reset_retries();
        assert_eq!(req.retry_times(), 0);
    }
}
