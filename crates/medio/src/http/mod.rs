//! Progressive HTTP source.

pub mod media_downloader;

pub use media_downloader::HttpMediaDownloader;
