//! HLS source: playlist fetching/refresh plus fragment downloading.

pub mod media_downloader;
pub mod playlist_fetcher;

pub use media_downloader::HlsMediaDownloader;
pub use playlist_fetcher::{PlaylistChangeHandler, PlaylistFetcher};
