//! HLS media session: fragments from the playlist feed a shared ring
//! buffer through one download loop, in playlist order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use m3u8::Fragment;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::buffer::RingBuffer;
use crate::config::EngineConfig;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::hls::playlist_fetcher::{PlaylistChangeHandler, PlaylistFetcher};
use crate::net::NetworkClient;
use crate::request::{DownloadRequest, StatusCallback};
use crate::task::{SleepGate, TaskLoop, Tick};
use crate::{MediaDownload, ReadOutcome, Seekable};

/// Feeder poll period when no fragment is pending.
const FEED_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Bounded remember-set of fragment URIs already dispatched, so repeated
/// playlist emissions never enqueue a fragment twice. Oldest entries are
/// evicted first; live playlists do not re-announce old fragments, so
/// eviction cannot cause re-downloads in practice.
struct SeenSet {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` when `uri` was not seen before.
    fn insert(&mut self, uri: &str) -> bool {
        if self.set.contains(uri) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(uri.to_string());
        self.set.insert(uri.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct HlsCore {
    downloader: Downloader,
    buffer: Arc<RingBuffer>,
    /// Fragment URIs waiting to be dispatched, already deduplicated.
    pending: Mutex<VecDeque<String>>,
    seen: Mutex<SeenSet>,
    /// Cumulative stream offset of the next byte the download loop will
    /// deliver; the ring buffer adopts it as media origin after a clear.
    session_offset: Arc<AtomicU64>,
    status: StatusCallback,
    gate: SleepGate,
    closed: AtomicBool,
    /// A fragment has been popped from `pending` but not yet handed to
    /// the downloader; readers must not conclude EOS in that window.
    dispatching: AtomicBool,
}

impl HlsCore {
    /// Fragment feeder: dispatches one pending fragment per tick.
    fn tick(self: &Arc<Self>) -> Tick {
        if self.closed.load(Ordering::Acquire) {
            return Tick::Stop;
        }

        let next = {
            let mut pending = self.pending.lock();
            let next = pending.pop_front();
            if next.is_some() {
                self.dispatching.store(true, Ordering::Release);
            }
            next
        };
        let Some(uri) = next else {
            if !self.gate.sleep(FEED_IDLE_WAIT) {
                return Tick::Stop;
            }
            return Tick::Continue;
        };

        let buffer = Arc::clone(&self.buffer);
        let offset = Arc::clone(&self.session_offset);
        let request = DownloadRequest::new(
            uri.clone(),
            true,
            Box::new(move |_, data| {
                let at = offset.fetch_add(data.len() as u64, Ordering::AcqRel);
                buffer.write(data, at)
            }),
            Arc::clone(&self.status),
        );

        if !self.downloader.download(request, Some(FEED_IDLE_WAIT)) {
            // request queue full or closing; try again next tick
            trace!(uri = %uri, "fragment dispatch deferred");
            self.pending.lock().push_front(uri);
        } else {
            debug!(uri = %uri, "fragment dispatched");
        }
        self.dispatching.store(false, Ordering::Release);
        Tick::Continue
    }
}

/// Funnels playlist change notifications into the pending queue.
struct FragmentFeed {
    core: Arc<HlsCore>,
}

impl PlaylistChangeHandler for FragmentFeed {
    fn on_fragments(&self, fragments: &[Fragment]) {
        let mut seen = self.core.seen.lock();
        let mut pending = self.core.pending.lock();
        let mut added = 0usize;
        for fragment in fragments {
            if seen.insert(&fragment.uri) {
                pending.push_back(fragment.uri.clone());
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, total_seen = seen.len(), "new fragments queued");
        }
    }
}

/// [`MediaDownload`] over an HLS playlist.
pub struct HlsMediaDownloader {
    core: Arc<HlsCore>,
    fetcher: PlaylistFetcher,
    feeder: Mutex<Option<TaskLoop>>,
}

impl HlsMediaDownloader {
    /// `media_client` carries fragment traffic, `playlist_client`
    /// manifest traffic; `status` is wired through to every fragment
    /// request (the monitor's failure intake).
    pub fn new(
        config: &EngineConfig,
        status: StatusCallback,
        media_client: Box<dyn NetworkClient>,
        playlist_client: Box<dyn NetworkClient>,
    ) -> Arc<Self> {
        let core = Arc::new(HlsCore {
            downloader: Downloader::new(media_client, config),
            buffer: Arc::new(RingBuffer::new(config.ring_capacity)),
            pending: Mutex::new(VecDeque::new()),
            seen: Mutex::new(SeenSet::new(crate::config::SEEN_FRAGMENT_CAPACITY)),
            session_offset: Arc::new(AtomicU64::new(0)),
            status,
            gate: SleepGate::new(),
            closed: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
        });

        let fetcher = PlaylistFetcher::new(
            config,
            playlist_client,
            Arc::new(FragmentFeed {
                core: Arc::clone(&core),
            }),
        );

        Arc::new(Self {
            core,
            fetcher,
            feeder: Mutex::new(None),
        })
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.core.buffer
    }
}

impl MediaDownload for HlsMediaDownloader {
    fn open(&self, url: &str) -> Result<()> {
        self.core.downloader.start()?;

        {
            let mut feeder = self.feeder.lock();
            if feeder.is_none() {
                let core = Arc::clone(&self.core);
                *feeder = Some(TaskLoop::spawn("medio-hls-feed", move || core.tick())?);
            }
            if let Some(feeder) = feeder.as_ref() {
                feeder.resume();
            }
        }

        self.fetcher.open(url)?;
        info!(url = %url, "hls session opened");
        Ok(())
    }

    fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
        self.core.gate.cancel();
        self.fetcher.stop();
        if let Some(mut feeder) = self.feeder.lock().take() {
            feeder.stop();
        }
        // wake any writer blocked on a full ring so the loop can exit
        self.core.buffer.set_active(false);
        self.core.downloader.stop();
        info!("hls session closed");
    }

    fn pause(&self) {
        drop(self.core.downloader.pause());
    }

    fn resume(&self) {
        self.core.downloader.resume();
    }

    fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        let wait_cycles = if self.fetcher.is_live() { 1 } else { 4 };
        let bytes_read = self.core.buffer.read(buf, wait_cycles);
        // the handoff check runs under the pending lock: the feeder sets
        // `dispatching` under that same lock before popping, so a false
        // value observed here means any popped fragment has already
        // reached the downloader queue and `is_drained` will see it
        let drained = !self.fetcher.is_live()
            && {
                let pending = self.core.pending.lock();
                pending.is_empty() && !self.core.dispatching.load(Ordering::Acquire)
            }
            && self.core.downloader.is_drained()
            && self.core.buffer.is_empty();
        ReadOutcome {
            bytes_read,
            is_eos: bytes_read == 0 && drained,
        }
    }

    fn seek(&self, offset: u64) -> bool {
        if self.core.buffer.seek(offset) {
            return true;
        }
        // outside the buffered window: drop the buffer and continue from
        // `offset` within the fragment currently being transferred
        let guard = self.core.downloader.pause();
        self.core.buffer.set_active(false);
        let repositioned = guard.seek(offset).is_ok();
        self.core.buffer.set_active(true);
        if repositioned {
            self.core.session_offset.store(offset, Ordering::Release);
        }
        guard.resume();
        repositioned
    }

    fn content_length(&self) -> u64 {
        // fragment lengths are not known up front
        0
    }

    fn duration(&self) -> f64 {
        self.fetcher.duration()
    }

    fn seekable(&self) -> Seekable {
        self.fetcher.seekable()
    }

    fn retry(&self, request: &Arc<DownloadRequest>) {
        let guard = self.core.downloader.pause();
        if !guard.retry(request) {
            trace!(url = %request.url(), "stale fragment retry dropped");
        }
        guard.resume();
    }
}
