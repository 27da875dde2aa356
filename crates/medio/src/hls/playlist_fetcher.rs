//! Playlist (manifest) fetching and live refresh.
//!
//! The fetcher owns its own [`Downloader`] so manifest traffic never
//! competes with media traffic for the transport. After the first
//! successful parse it runs a refresh loop for live playlists, pushing
//! the updated fragment list to a [`PlaylistChangeHandler`] whenever the
//! body actually changed, and parking itself once the stream turns VOD.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use m3u8::{Fragment, MasterPlaylist, Playlist};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Seekable;
use crate::config::EngineConfig;
use crate::downloader::Downloader;
use crate::error::{ClientErrorCode, DownloadError, Result};
use crate::net::NetworkClient;
use crate::request::{DownloadRequest, DownloadStatus, OnceSlot};
use crate::task::{SleepGate, TaskLoop, Tick};

/// Receives the full ordered fragment list each time the playlist
/// changes (including the initial parse).
pub trait PlaylistChangeHandler: Send + Sync {
    fn on_fragments(&self, fragments: &[Fragment]);
}

struct FetcherCore {
    downloader: Downloader,
    master: Mutex<Option<MasterPlaylist>>,
    handler: Arc<dyn PlaylistChangeHandler>,
    gate: SleepGate,
    refresh_interval: Duration,
    fetch_timeout: Duration,
}

impl FetcherCore {
    /// One blocking manifest fetch through the owned download loop.
    fn fetch_body(&self, url: &str) -> Result<String> {
        // a previously failed fetch leaves its request parked; drop it
        self.downloader.abandon_current();

        let body = Arc::new(Mutex::new(BytesMut::new()));
        let done: Arc<OnceSlot<DownloadStatus>> = Arc::new(OnceSlot::new());

        let request = DownloadRequest::new(
            url,
            true,
            Box::new({
                let body = Arc::clone(&body);
                move |_, data| {
                    body.lock().extend_from_slice(data);
                    true
                }
            }),
            Arc::new({
                let done = Arc::clone(&done);
                move |_, status| done.set(status)
            }),
        );

        if !self.downloader.download(Arc::clone(&request), Some(self.fetch_timeout)) {
            return Err(DownloadError::QueueFull);
        }
        self.downloader.start()?;

        match done.wait(self.fetch_timeout) {
            Some(DownloadStatus::Finished) => {
                let bytes = std::mem::take(&mut *body.lock()).freeze();
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(DownloadStatus::PartialDownload) => {
                let status = request.server_error();
                if status > 0 {
                    Err(DownloadError::HttpStatus {
                        status: status as u16,
                    })
                } else {
                    Err(DownloadError::transport(
                        request.client_error(),
                        "playlist fetch failed",
                    ))
                }
            }
            None => Err(DownloadError::transport(
                ClientErrorCode::Timeout,
                "playlist fetch timed out",
            )),
        }
    }

    /// One refresh cycle; runs on the refresh loop thread.
    fn tick(self: &Arc<Self>) -> Tick {
        if !self.gate.sleep(self.refresh_interval) {
            return Tick::Stop;
        }

        let url = {
            let guard = self.master.lock();
            let Some(master) = guard.as_ref() else {
                return Tick::Pause;
            };
            master.default_variant().stream.url().to_string()
        };

        let body = match self.fetch_body(&url) {
            Ok(body) => body,
            Err(e) if e.is_retryable() => {
                // transient; the next cycle tries again
                warn!(url = %url, error = %e, "playlist refresh failed");
                return Tick::Continue;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "playlist gone, stopping refresh");
                return Tick::Pause;
            }
        };

        let (fragments, live) = {
            let mut guard = self.master.lock();
            let Some(master) = guard.as_mut() else {
                return Tick::Pause;
            };
            let stream = &mut master.default_variant_mut().stream;
            match stream.update(&body) {
                Ok(true) => (Some(stream.fragments().to_vec()), stream.is_live()),
                Ok(false) => (None, stream.is_live()),
                Err(e) => {
                    warn!(url = %url, error = %e, "refreshed playlist failed to parse");
                    (None, true)
                }
            }
        };

        if let Some(fragments) = fragments {
            debug!(url = %url, fragments = fragments.len(), "playlist changed");
            self.handler.on_fragments(&fragments);
        }
        if !live {
            info!(url = %url, "live playlist ended, stopping refresh");
            return Tick::Pause;
        }
        Tick::Continue
    }
}

/// Fetches and keeps a playlist current.
pub struct PlaylistFetcher {
    core: Arc<FetcherCore>,
    task: Mutex<Option<TaskLoop>>,
}

impl PlaylistFetcher {
    pub fn new(
        config: &EngineConfig,
        client: Box<dyn NetworkClient>,
        handler: Arc<dyn PlaylistChangeHandler>,
    ) -> Self {
        Self {
            core: Arc::new(FetcherCore {
                downloader: Downloader::new(client, config),
                master: Mutex::new(None),
                handler,
                gate: SleepGate::new(),
                refresh_interval: config.playlist_refresh_interval,
                fetch_timeout: config.connect_timeout + config.read_timeout,
            }),
            task: Mutex::new(None),
        }
    }

    /// Fetches and parses the manifest at `url`, resolving a master
    /// playlist to its default variant, emits the initial fragment list,
    /// and starts the refresh loop when the playlist is live.
    pub fn open(&self, url: &str) -> Result<()> {
        let body = self.core.fetch_body(url)?;
        let mut master = match Playlist::parse(url, &body)? {
            Playlist::Media(media) => MasterPlaylist::from_media(media),
            Playlist::Master(master) => master,
        };

        if !master.is_simple() {
            let variant_url = master.default_variant().uri.clone();
            debug!(master = %url, variant = %variant_url, "resolving master playlist");
            let variant_body = self.core.fetch_body(&variant_url)?;
            master.default_variant_mut().stream.update(&variant_body)?;
        }

        let stream = &master.default_variant().stream;
        let live = stream.is_live();
        info!(
            url = %url,
            fragments = stream.fragments().len(),
            live,
            "playlist opened"
        );
        self.core.handler.on_fragments(stream.fragments());
        *self.core.master.lock() = Some(master);

        let mut task = self.task.lock();
        if task.is_none() {
            let core = Arc::clone(&self.core);
            *task = Some(TaskLoop::spawn("medio-playlist", move || core.tick())?);
        }
        if live {
            if let Some(task) = task.as_ref() {
                task.resume();
            }
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.core
            .master
            .lock()
            .as_ref()
            .map(|m| m.default_variant().stream.is_live())
            .unwrap_or(true)
    }

    /// Total duration in seconds; negative while live or unopened.
    pub fn duration(&self) -> f64 {
        let guard = self.core.master.lock();
        match guard.as_ref() {
            Some(master) if !master.default_variant().stream.is_live() => {
                master.default_variant().stream.duration()
            }
            _ => -1.0,
        }
    }

    pub fn seekable(&self) -> Seekable {
        let guard = self.core.master.lock();
        match guard.as_ref() {
            None => Seekable::Invalid,
            Some(master) if master.default_variant().stream.is_live() => Seekable::Unseekable,
            Some(_) => Seekable::Seekable,
        }
    }

    pub fn stop(&self) {
        self.core.gate.cancel();
        if let Some(mut task) = self.task.lock().take() {
            task.stop();
        }
        self.core.downloader.stop();
    }
}
