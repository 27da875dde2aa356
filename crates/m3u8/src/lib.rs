//! M3U8 playlist parsing.
//!
//! This crate covers the subset of HLS playlists a streaming download
//! engine needs: media playlists (segment lists with `#EXTINF` entries)
//! and master playlists (`#EXT-X-STREAM-INF` variant lists). Parsing is
//! line-oriented and lossy for tags the engine does not act on.

pub mod playlist;
pub mod tag;

pub use playlist::{Fragment, MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
pub use tag::{AttributeListTag, RegularTag, SingleValueTag, Tag, parse_tags};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("not an M3U8 playlist: missing #EXTM3U header")]
    MissingHeader,

    #[error("playlist contains neither #EXTINF nor #EXT-X-STREAM-INF")]
    UnknownPlaylistKind,

    #[error("master playlist has no usable variant streams")]
    NoVariants,
}
