//! The download loop: pulls queued requests and drives byte-range
//! transfers against a [`NetworkClient`] on a dedicated thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{ClientErrorCode, DownloadError, Result};
use crate::net::{NetworkClient, TransferSink};
use crate::queue::BlockingQueue;
use crate::request::{DownloadRequest, DownloadStatus, HeaderInfo};
use crate::task::{TaskLoop, Tick};

/// How long one tick waits for a queued request before yielding.
const QUEUE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderState {
    /// Not started or stopped.
    Idle,
    Downloading,
    Paused,
}

struct Core {
    client: Mutex<Box<dyn NetworkClient>>,
    queue: BlockingQueue<Arc<DownloadRequest>>,
    current: Mutex<Option<Arc<DownloadRequest>>>,
    /// When set, the next tick pops a fresh request instead of continuing
    /// the current one.
    start_next: AtomicBool,
    /// Distinguishes the loop parking itself on an empty queue from an
    /// explicit pause, so enqueueing can wake it back up.
    idle_paused: AtomicBool,
    /// Bumped by every paused-guard seek or retry. The tick snapshots it
    /// before a transfer and discards its own post-transfer bookkeeping
    /// when a guard operation has repositioned the request in between.
    generation: AtomicU64,
    state: Mutex<DownloaderState>,
    per_request_size: usize,
}

impl Core {
    fn set_state(&self, state: DownloaderState) {
        *self.state.lock() = state;
    }

    fn tick(self: &Arc<Self>) -> Tick {
        if self.start_next.load(Ordering::Acquire) {
            // pop and publish under the current-request lock, so drained
            // checks never see an empty queue with a finished current
            let popped = {
                let mut current = self.current.lock();
                let popped = self.queue.try_pop();
                if let Some(request) = &popped {
                    request.set_start_pos(0);
                    request.set_request_size(1);
                    request.reset_retries();
                    request.set_eos(false);
                    *current = Some(Arc::clone(request));
                    self.start_next.store(false, Ordering::Release);
                }
                popped
            };
            let Some(request) = popped else {
                if !self.queue.is_active() {
                    return Tick::Stop;
                }
                self.queue.wait_nonempty(QUEUE_POLL);
                return Tick::Continue;
            };

            {
                let mut client = self.client.lock();
                client.close();
                if let Err(e) = client.open(request.url()) {
                    warn!(url = %request.url(), error = %e, "failed to bind transport");
                    record_failure(&request, &e);
                    request.notify_status(DownloadStatus::PartialDownload);
                    self.set_state(DownloaderState::Paused);
                    return Tick::Pause;
                }
            }
            debug!(url = %request.url(), whole_file = request.is_whole_file(), "starting request");
        }

        let current = self.current.lock().clone();
        let Some(request) = current else {
            self.start_next.store(true, Ordering::Release);
            return Tick::Continue;
        };
        if request.is_eos() {
            self.start_next.store(true, Ordering::Release);
            return Tick::Continue;
        }

        let mut sink = RequestSink::new(&request);
        let (generation, result) = {
            // cursor reads and the transfer share the transport lock
            // scope, so a guard seek cannot land between them
            let mut client = self.client.lock();
            let generation = self.generation.load(Ordering::Acquire);
            let (start, len) = if request.is_whole_file() {
                // whole-file transfers carry no range; a resumed one
                // re-requests open-ended from the cursor
                if request.start_pos() == 0 {
                    (-1i64, 0usize)
                } else {
                    (request.start_pos() as i64, 0)
                }
            } else {
                (request.start_pos() as i64, request.request_size())
            };
            (generation, client.request_data(start, len, &mut sink))
        };

        // bookkeeping runs under the current-request lock so guard
        // operations serialize against it; a generation bump since the
        // snapshot means a guard already repositioned the request and
        // this transfer's verdict no longer applies
        let _current = self.current.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return Tick::Pause;
        }

        match result {
            Ok(()) => {
                if sink.aborted {
                    // destination went inactive mid-transfer; park and let
                    // the owner reconfigure before resuming
                    self.set_state(DownloaderState::Paused);
                    return Tick::Pause;
                }
                request.reset_retries();
                request.clear_errors();

                let total = request.header().get().map(|h| h.total_len()).unwrap_or(0);
                let finished = request.is_whole_file()
                    || total == 0
                    || request.start_pos() >= total;
                if finished {
                    debug!(url = %request.url(), bytes = request.start_pos(), "request finished");
                    request.set_eos(true);
                    request.notify_status(DownloadStatus::Finished);
                    self.start_next.store(true, Ordering::Release);
                    if self.queue.is_empty() {
                        self.idle_paused.store(true, Ordering::Release);
                        self.set_state(DownloaderState::Paused);
                        return Tick::Pause;
                    }
                } else {
                    let remaining = (total - request.start_pos()) as usize;
                    request.set_request_size(remaining.min(self.per_request_size));
                }
                Tick::Continue
            }
            Err(e) => {
                warn!(
                    url = %request.url(),
                    start_pos = request.start_pos(),
                    retry_times = request.retry_times(),
                    error = %e,
                    "transfer failed"
                );
                record_failure(&request, &e);
                request.notify_status(DownloadStatus::PartialDownload);
                self.set_state(DownloaderState::Paused);
                Tick::Pause
            }
        }
    }
}

fn record_failure(request: &Arc<DownloadRequest>, error: &DownloadError) {
    match error {
        DownloadError::HttpStatus { status } => request.set_server_error(*status as i32),
        DownloadError::Transport { code, .. } => request.set_client_error(*code),
        DownloadError::HeaderTimeout => request.set_client_error(ClientErrorCode::Timeout),
        _ => request.set_client_error(ClientErrorCode::Unknown),
    }
}

/// Streams one transfer into the request: headers into the set-once
/// slot, body bytes through the save callback with the cursor advancing
/// behind them.
struct RequestSink<'a> {
    request: &'a Arc<DownloadRequest>,
    header: HeaderInfo,
    aborted: bool,
}

impl<'a> RequestSink<'a> {
    fn new(request: &'a Arc<DownloadRequest>) -> Self {
        Self {
            request,
            header: HeaderInfo::default(),
            aborted: false,
        }
    }
}

impl TransferSink for RequestSink<'_> {
    fn on_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("content-type") {
            self.header.content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("content-length") {
            self.header.content_len = value.trim().parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                self.header.is_chunked = true;
            }
        } else if name.eq_ignore_ascii_case("content-range") {
            if let Some(total) = parse_content_range_total(value) {
                self.header.file_content_len = total;
            }
        }
    }

    fn on_headers_complete(&mut self, status: u16) {
        // a 200 means the server ignored the range and is sending the
        // whole resource, so Content-Length is the file length
        if status == 200 && !self.header.is_chunked && self.header.file_content_len == 0 {
            self.header.file_content_len = self.header.content_len;
        }
        self.request.header().set(self.header.clone());
    }

    fn on_body(&mut self, data: &[u8]) -> bool {
        let offset = self.request.start_pos();
        if !self.request.save(offset, data) {
            self.aborted = true;
            return false;
        }
        self.request.advance(data.len() as u64);
        true
    }
}

/// Total length out of `Content-Range: bytes 0-499/1234`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Owns the download loop thread, its request queue, and the transport.
///
/// One `Downloader` serves one media source. Requests are processed in
/// FIFO order; ranged requests advance in bounded chunks, whole-file
/// requests stream in a single transfer. A failed transfer records its
/// error on the request, reports `PartialDownload`, and pauses the loop;
/// nothing is retried here (that is the monitor's job).
pub struct Downloader {
    core: Arc<Core>,
    task: Mutex<Option<TaskLoop>>,
}

impl Downloader {
    pub fn new(client: Box<dyn NetworkClient>, config: &EngineConfig) -> Self {
        Self {
            core: Arc::new(Core {
                client: Mutex::new(client),
                queue: BlockingQueue::new(config.request_queue_capacity),
                current: Mutex::new(None),
                start_next: AtomicBool::new(true),
                idle_paused: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state: Mutex::new(DownloaderState::Idle),
                per_request_size: config.per_request_size,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawns (or resumes) the loop thread.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_none() {
            let core = Arc::clone(&self.core);
            *task = Some(TaskLoop::spawn("medio-download", move || core.tick())?);
        }
        if let Some(task) = task.as_ref() {
            task.resume();
        }
        self.core.idle_paused.store(false, Ordering::Release);
        self.core.set_state(DownloaderState::Downloading);
        Ok(())
    }

    /// Enqueues a request, blocking up to `timeout` when the queue is
    /// full (`None` blocks indefinitely). Returns `false` if the request
    /// was not accepted. Wakes the loop if it had parked on an empty
    /// queue.
    pub fn download(&self, request: Arc<DownloadRequest>, timeout: Option<Duration>) -> bool {
        let accepted = self.core.queue.push(request, timeout);
        if accepted {
            self.kick();
        }
        accepted
    }

    fn kick(&self) {
        if self.core.idle_paused.swap(false, Ordering::AcqRel) {
            if let Some(task) = self.task.lock().as_ref() {
                task.resume();
                self.core.set_state(DownloaderState::Downloading);
            }
        }
    }

    /// Pauses the loop and returns a guard through which seek and retry
    /// (which require a quiescent loop) are expressed. The guard does not
    /// auto-resume; call [`resume`] when done.
    ///
    /// [`resume`]: Downloader::resume
    pub fn pause(&self) -> PausedDownloader<'_> {
        if let Some(task) = self.task.lock().as_ref() {
            task.pause();
        }
        self.core.idle_paused.store(false, Ordering::Release);
        self.core.set_state(DownloaderState::Paused);
        PausedDownloader { downloader: self }
    }

    /// Rebinds the transport to the current request and restarts the loop.
    pub fn resume(&self) {
        let current = self.core.current.lock().clone();
        if let Some(request) = current {
            let mut client = self.core.client.lock();
            if let Err(e) = client.open(request.url()) {
                warn!(url = %request.url(), error = %e, "failed to rebind transport on resume");
            }
        }
        if let Some(task) = self.task.lock().as_ref() {
            task.resume();
        }
        self.core.idle_paused.store(false, Ordering::Release);
        self.core.set_state(DownloaderState::Downloading);
    }

    /// Tears the loop down. The owner must deactivate any destination
    /// buffer first so an in-flight transfer can back out.
    pub fn stop(&self) {
        self.core.queue.deactivate();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        self.core.client.lock().close();
        *self.core.current.lock() = None;
        self.core.set_state(DownloaderState::Idle);
    }

    /// Drops the current request (if any) so the next tick pops a fresh
    /// one, even if the dropped request never finished. Used by owners
    /// that supersede a failed request instead of retrying it.
    pub fn abandon_current(&self) {
        *self.core.current.lock() = None;
        self.core.start_next.store(true, Ordering::Release);
    }

    pub fn state(&self) -> DownloaderState {
        *self.core.state.lock()
    }

    pub fn current_request(&self) -> Option<Arc<DownloadRequest>> {
        self.core.current.lock().clone()
    }

    /// Whether everything queued has been fully transferred.
    pub fn is_drained(&self) -> bool {
        self.core.queue.is_empty()
            && self
                .core
                .current
                .lock()
                .as_ref()
                .map(|r| r.is_eos())
                .unwrap_or(true)
    }
}

/// Operations that are only sound while the download loop is paused.
///
/// Obtained from [`Downloader::pause`]; the borrow keeps the guard from
/// outliving the downloader, and taking the transport lock inside each
/// operation waits out any transfer that was still in flight when the
/// pause was requested. Each operation also bumps the request
/// generation, which makes the loop discard the bookkeeping of a
/// transfer that finished while the operation was waiting.
pub struct PausedDownloader<'a> {
    downloader: &'a Downloader,
}

impl PausedDownloader<'_> {
    /// Repositions the current request at `offset` (clamped into the
    /// known file length) so the next transfer continues from there. The
    /// caller is responsible for clearing/repositioning the destination
    /// buffer.
    pub fn seek(&self, offset: u64) -> Result<()> {
        let core = &self.downloader.core;
        let _transport = core.client.lock();
        let current = core.current.lock();
        let Some(request) = current.as_ref() else {
            return Err(DownloadError::Inactive);
        };

        let total = request.header().get().map(|h| h.total_len()).unwrap_or(0);
        let target = if total > 0 {
            offset.min(total.saturating_sub(1))
        } else {
            offset
        };
        request.set_start_pos(target);
        if total > 0 {
            request.set_request_size(((total - target) as usize).min(core.per_request_size));
        } else {
            request.set_request_size(core.per_request_size);
        }
        request.set_eos(false);
        request.clear_errors();
        // reuse the current request on the next tick
        core.start_next.store(false, Ordering::Release);
        core.generation.fetch_add(1, Ordering::AcqRel);
        debug!(url = %request.url(), offset = target, "request repositioned");
        Ok(())
    }

    /// Re-arms `request` for another attempt if it is still the current
    /// one. Returns `false` when a different request has since started
    /// (the retry is then stale and dropped).
    pub fn retry(&self, request: &Arc<DownloadRequest>) -> bool {
        let core = &self.downloader.core;
        let _transport = core.client.lock();
        let current = core.current.lock();
        let Some(current) = current.as_ref() else {
            return false;
        };
        if !Arc::ptr_eq(current, request) {
            return false;
        }

        let attempts = current.bump_retry();
        current.clear_errors();
        current.set_eos(false);
        core.start_next.store(false, Ordering::Release);
        core.generation.fetch_add(1, Ordering::AcqRel);
        debug!(url = %current.url(), attempts, "request re-armed for retry");
        true
    }

    /// Resumes the download loop.
    pub fn resume(self) {
        self.downloader.resume();
    }
}
