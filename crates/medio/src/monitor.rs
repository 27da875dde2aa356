//! Watchdog decorator around a media download session.
//!
//! The monitor owns the retry policy the download loop deliberately does
//! not have: failed requests reported through the status callback are
//! queued (deduplicated by URL and cursor) and re-armed one per watchdog
//! tick, so a flapping server cannot trigger a retry storm. It also
//! watches the consumer: when playback is active but no reads arrive for
//! the stall timeout, downloading is paused until the next read.
//!
//! Requests that keep failing past the escalation threshold surface a
//! one-shot [`DownloadEvent::ClientError`]/[`ServerError`] so the player
//! can tell the user, while retries keep flowing underneath.
//!
//! [`ServerError`]: DownloadEvent::ServerError

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{DownloadEvent, EventSink};
use crate::request::{DownloadRequest, DownloadStatus, StatusCallback};
use crate::task::{SleepGate, TaskLoop, Tick};
use crate::{MediaDownload, ReadOutcome, Seekable};

struct MonitorCore {
    inner: OnceLock<Arc<dyn MediaDownload>>,
    retry_queue: Mutex<VecDeque<Arc<DownloadRequest>>>,
    /// Identities of requests already queued for retry.
    pending: Mutex<HashSet<(String, u64)>>,
    last_read: Mutex<Instant>,
    playing: AtomicBool,
    stall_paused: AtomicBool,
    events: EventSink,
    gate: SleepGate,
    watchdog_interval: Duration,
    stall_timeout: Duration,
    escalation_threshold: u32,
}

impl MonitorCore {
    /// Failure intake; runs on whichever thread reports the status.
    fn on_status(&self, request: &Arc<DownloadRequest>, status: DownloadStatus) {
        if status != DownloadStatus::PartialDownload {
            return;
        }

        let server = request.server_error();
        let client = request.client_error();
        let retryable = server != 0 || client.is_retryable();
        if !retryable {
            warn!(
                url = %request.url(),
                client_error = ?client,
                "permanent failure, not scheduling a retry"
            );
            return;
        }

        if request.retry_times() >= self.escalation_threshold && request.mark_escalated() {
            warn!(
                url = %request.url(),
                retry_times = request.retry_times(),
                server_error = server,
                "request keeps failing, escalating to the player"
            );
            if server != 0 {
                (self.events)(DownloadEvent::ServerError(server));
            } else {
                (self.events)(DownloadEvent::ClientError(client.as_raw()));
            }
        }

        let key = request.identity();
        let mut pending = self.pending.lock();
        if pending.insert(key) {
            self.retry_queue.lock().push_back(Arc::clone(request));
        } else {
            trace!(url = %request.url(), "retry already queued");
        }
    }

    /// One watchdog cycle: stall check, then at most one retry.
    fn tick(self: &Arc<Self>) -> Tick {
        if !self.gate.sleep(self.watchdog_interval) {
            return Tick::Stop;
        }
        let Some(inner) = self.inner.get() else {
            return Tick::Continue;
        };

        if self.playing.load(Ordering::Acquire) {
            let stalled = self.last_read.lock().elapsed() >= self.stall_timeout;
            if stalled && !self.stall_paused.swap(true, Ordering::AcqRel) {
                warn!("consumer stopped reading, pausing downloads");
                inner.pause();
            }
        }

        let next = self.retry_queue.lock().pop_front();
        if let Some(request) = next {
            self.pending.lock().remove(&request.identity());
            debug!(
                url = %request.url(),
                start_pos = request.start_pos(),
                retry_times = request.retry_times(),
                "re-arming failed request"
            );
            inner.retry(&request);
        }
        Tick::Continue
    }

    /// A consumer touched the stream: refresh the stall clock and undo a
    /// stall pause.
    fn on_consumer_activity(&self) {
        *self.last_read.lock() = Instant::now();
        if self.stall_paused.swap(false, Ordering::AcqRel) {
            if let Some(inner) = self.inner.get() {
                debug!("consumer is back, resuming downloads");
                inner.resume();
            }
        }
    }
}

/// [`MediaDownload`] decorator adding stall detection and retries.
pub struct DownloadMonitor {
    core: Arc<MonitorCore>,
    task: Mutex<Option<TaskLoop>>,
}

impl DownloadMonitor {
    /// Builds the monitored session.
    ///
    /// `build` receives the status callback to wire into every request
    /// the session creates, and returns the session itself; this keeps
    /// the callback constructor-injected on both sides.
    pub fn new<F>(config: &EngineConfig, events: EventSink, build: F) -> Result<Arc<Self>>
    where
        F: FnOnce(StatusCallback) -> Result<Arc<dyn MediaDownload>>,
    {
        let core = Arc::new(MonitorCore {
            inner: OnceLock::new(),
            retry_queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            last_read: Mutex::new(Instant::now()),
            playing: AtomicBool::new(false),
            stall_paused: AtomicBool::new(false),
            events,
            gate: SleepGate::new(),
            watchdog_interval: config.watchdog_interval,
            stall_timeout: config.stall_timeout,
            escalation_threshold: config.retry_escalation_threshold,
        });

        let status: StatusCallback = {
            let core = Arc::clone(&core);
            Arc::new(move |request, status| core.on_status(request, status))
        };
        let inner = build(status)?;
        let _ = core.inner.set(inner);

        Ok(Arc::new(Self {
            core,
            task: Mutex::new(None),
        }))
    }
}

impl MediaDownload for DownloadMonitor {
    fn open(&self, url: &str) -> Result<()> {
        let Some(inner) = self.core.inner.get() else {
            return Err(crate::DownloadError::Inactive);
        };
        inner.open(url)?;

        *self.core.last_read.lock() = Instant::now();
        self.core.playing.store(true, Ordering::Release);

        let mut task = self.task.lock();
        if task.is_none() {
            let core = Arc::clone(&self.core);
            *task = Some(TaskLoop::spawn("medio-watchdog", move || core.tick())?);
        }
        if let Some(task) = task.as_ref() {
            task.resume();
        }
        Ok(())
    }

    fn close(&self) {
        self.core.playing.store(false, Ordering::Release);
        self.core.gate.cancel();
        if let Some(mut task) = self.task.lock().take() {
            task.stop();
        }
        self.core.retry_queue.lock().clear();
        self.core.pending.lock().clear();
        if let Some(inner) = self.core.inner.get() {
            inner.close();
        }
    }

    fn pause(&self) {
        // explicit pause: the stall guard stands down
        self.core.playing.store(false, Ordering::Release);
        if let Some(inner) = self.core.inner.get() {
            inner.pause();
        }
    }

    fn resume(&self) {
        *self.core.last_read.lock() = Instant::now();
        self.core.stall_paused.store(false, Ordering::Release);
        self.core.playing.store(true, Ordering::Release);
        if let Some(inner) = self.core.inner.get() {
            inner.resume();
        }
    }

    fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        self.core.on_consumer_activity();
        match self.core.inner.get() {
            Some(inner) => inner.read(buf),
            None => ReadOutcome::default(),
        }
    }

    fn seek(&self, offset: u64) -> bool {
        self.core.on_consumer_activity();
        self.core
            .inner
            .get()
            .map(|inner| inner.seek(offset))
            .unwrap_or(false)
    }

    fn content_length(&self) -> u64 {
        self.core
            .inner
            .get()
            .map(|inner| inner.content_length())
            .unwrap_or(0)
    }

    fn duration(&self) -> f64 {
        self.core
            .inner
            .get()
            .map(|inner| inner.duration())
            .unwrap_or(-1.0)
    }

    fn seekable(&self) -> Seekable {
        self.core
            .inner
            .get()
            .map(|inner| inner.seekable())
            .unwrap_or(Seekable::Invalid)
    }

    fn retry(&self, request: &Arc<DownloadRequest>) {
        if let Some(inner) = self.core.inner.get() {
            inner.retry(request);
        }
    }
}
