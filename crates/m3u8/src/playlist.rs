//! Media and master playlist models.

use tracing::{debug, trace, warn};
use url::Url;

use crate::PlaylistError;
use crate::tag::{AttributeListTag, RegularTag, SingleValueTag, Tag, parse_tags};

/// One media fragment from a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Absolute URI, resolved against the playlist location.
    pub uri: String,
    pub title: String,
    /// Duration in seconds, from `#EXTINF`.
    pub duration: f64,
    /// Media sequence number.
    pub sequence: u64,
    /// Whether a `#EXT-X-DISCONTINUITY` immediately precedes this fragment.
    pub discontinuity: bool,
}

/// A media playlist: an ordered fragment list plus liveness metadata.
///
/// The playlist is created empty from its URL and filled by [`update`],
/// which can be called repeatedly with refreshed bodies. Each update
/// replaces the fragment list wholesale; callers diff by sequence number
/// or URI.
///
/// [`update`]: MediaPlaylist::update
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    url: String,
    fragments: Vec<Fragment>,
    live: bool,
    target_duration: f64,
    media_sequence: u64,
    version: u32,
    last_body: Option<String>,
}

impl MediaPlaylist {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fragments: Vec::new(),
            live: true,
            target_duration: 0.0,
            media_sequence: 0,
            version: 1,
            last_body: None,
        }
    }

    /// Parses `text` and replaces this playlist's contents.
    ///
    /// Returns `Ok(false)` without reparsing when `text` is byte-identical
    /// to the previous update (the common case for an unchanged live
    /// playlist between refreshes).
    pub fn update(&mut self, text: &str) -> Result<bool, PlaylistError> {
        if self.last_body.as_deref() == Some(text) {
            trace!(url = %self.url, "playlist body unchanged, skipping parse");
            return Ok(false);
        }

        if !text.trim_start().starts_with("#EXTM3U") {
            return Err(PlaylistError::MissingHeader);
        }

        let tags = parse_tags(text);
        let base = Url::parse(&self.url).ok();

        let mut fragments = Vec::new();
        let mut live = true;
        let mut target_duration = 0.0f64;
        let mut media_sequence = 0u64;
        let mut version = 1u32;

        let mut pending_duration = 0.0f64;
        let mut pending_title = String::new();
        let mut pending_discontinuity = false;

        for tag in &tags {
            match tag {
                Tag::SingleValue(SingleValueTag::TargetDuration, v) => {
                    target_duration = v.trim().parse().unwrap_or(0.0);
                }
                Tag::SingleValue(SingleValueTag::MediaSequence, v) => {
                    media_sequence = v.trim().parse().unwrap_or(0);
                }
                Tag::SingleValue(SingleValueTag::Version, v) => {
                    version = v.trim().parse().unwrap_or(1);
                }
                Tag::SingleValue(SingleValueTag::PlaylistType, v) => {
                    if v.trim().eq_ignore_ascii_case("VOD") {
                        live = false;
                    }
                }
                Tag::Regular(RegularTag::EndList) => live = false,
                Tag::Regular(RegularTag::Discontinuity) => pending_discontinuity = true,
                Tag::ExtInf { duration, title } => {
                    pending_duration = *duration;
                    pending_title = title.clone();
                }
                Tag::Uri(uri) => {
                    let sequence = media_sequence + fragments.len() as u64;
                    fragments.push(Fragment {
                        uri: resolve_uri(base.as_ref(), uri),
                        title: std::mem::take(&mut pending_title),
                        duration: pending_duration,
                        sequence,
                        discontinuity: pending_discontinuity,
                    });
                    pending_duration = 0.0;
                    pending_discontinuity = false;
                }
                _ => {}
            }
        }

        debug!(
            url = %self.url,
            fragments = fragments.len(),
            live,
            media_sequence,
            "playlist updated"
        );

        self.fragments = fragments;
        self.live = live;
        self.target_duration = target_duration;
        self.media_sequence = media_sequence;
        self.version = version;
        self.last_body = Some(text.to_string());
        Ok(true)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// `true` until an `#EXT-X-ENDLIST` or `#EXT-X-PLAYLIST-TYPE:VOD` is seen.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn target_duration(&self) -> f64 {
        self.target_duration
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Total duration in seconds; meaningless for live playlists.
    pub fn duration(&self) -> f64 {
        self.fragments.iter().map(|f| f.duration).sum()
    }
}

/// One `#EXT-X-STREAM-INF` entry of a master playlist.
#[derive(Debug, Clone)]
pub struct VariantStream {
    pub uri: String,
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub resolution: Option<String>,
    /// The variant's media playlist; empty until fetched and updated.
    pub stream: MediaPlaylist,
}

/// A master playlist: one or more variant streams.
///
/// A simple media playlist is represented as a single-variant master
/// whose variant URL is the playlist URL itself, so callers can treat
/// both shapes uniformly.
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    variants: Vec<VariantStream>,
    simple: bool,
}

impl MasterPlaylist {
    /// Wraps an already-parsed media playlist as a single-variant master.
    pub fn from_media(media: MediaPlaylist) -> Self {
        let uri = media.url().to_string();
        Self {
            variants: vec![VariantStream {
                uri,
                bandwidth: 0,
                codecs: None,
                resolution: None,
                stream: media,
            }],
            simple: true,
        }
    }

    /// Whether this master wraps a plain media playlist.
    pub fn is_simple(&self) -> bool {
        self.simple
    }

    pub fn variants(&self) -> &[VariantStream] {
        &self.variants
    }

    pub fn variants_mut(&mut self) -> &mut [VariantStream] {
        &mut self.variants
    }

    /// The variant a session plays by default (the first listed).
    pub fn default_variant(&self) -> &VariantStream {
        &self.variants[0]
    }

    pub fn default_variant_mut(&mut self) -> &mut VariantStream {
        &mut self.variants[0]
    }
}

/// A parsed playlist body, classified as media or master.
#[derive(Debug, Clone)]
pub enum Playlist {
    Media(MediaPlaylist),
    Master(MasterPlaylist),
}

impl Playlist {
    /// Parses `text` fetched from `url` and classifies it.
    ///
    /// Presence of `#EXTINF` wins: a body carrying both `#EXTINF` and
    /// `#EXT-X-STREAM-INF` is treated as a media playlist. A body with
    /// neither is an error.
    pub fn parse(url: &str, text: &str) -> Result<Playlist, PlaylistError> {
        if !text.trim_start().starts_with("#EXTM3U") {
            return Err(PlaylistError::MissingHeader);
        }

        if text.contains("#EXTINF") {
            let mut media = MediaPlaylist::new(url);
            media.update(text)?;
            return Ok(Playlist::Media(media));
        }

        if !text.contains("#EXT-X-STREAM-INF") {
            return Err(PlaylistError::UnknownPlaylistKind);
        }

        let tags = parse_tags(text);
        let base = Url::parse(url).ok();
        let mut variants = Vec::new();

        for tag in &tags {
            let Tag::Attributes(AttributeListTag::StreamInf, attrs) = tag else {
                continue;
            };
            let Some(uri) = attr(attrs, "URI") else {
                warn!(url = %url, "#EXT-X-STREAM-INF without a following URI line, skipping");
                continue;
            };
            let resolved = resolve_uri(base.as_ref(), uri);
            variants.push(VariantStream {
                stream: MediaPlaylist::new(resolved.clone()),
                uri: resolved,
                bandwidth: attr(attrs, "BANDWIDTH")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                codecs: attr(attrs, "CODECS").map(str::to_string),
                resolution: attr(attrs, "RESOLUTION").map(str::to_string),
            });
        }

        if variants.is_empty() {
            return Err(PlaylistError::NoVariants);
        }

        Ok(Playlist::Master(MasterPlaylist {
            variants,
            simple: false,
        }))
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Resolves `uri` against `base`; already-absolute URIs pass through, and
/// an unparseable base degrades to the raw URI rather than failing the
/// whole playlist.
fn resolve_uri(base: Option<&Url>, uri: &str) -> String {
    if Url::parse(uri).is_ok() {
        return uri.to_string();
    }
    match base.and_then(|b| b.join(uri).ok()) {
        Some(joined) => joined.to_string(),
        None => {
            trace!(uri = %uri, "no usable base URL, keeping URI as-is");
            uri.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXTINF:9.009,one\n\
seg7.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXTINF:9.009,two\n\
seg8.ts\n";

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n\
hi/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=400000\n\
lo/index.m3u8\n";

    #[test]
    fn classifies_media_playlist() {
        let playlist = Playlist::parse("http://example.com/a/index.m3u8", MEDIA).unwrap();
        assert!(matches!(playlist, Playlist::Media(_)));
    }

    #[test]
    fn classifies_master_playlist() {
        let playlist = Playlist::parse("http://example.com/master.m3u8", MASTER).unwrap();
        let Playlist::Master(master) = playlist else {
            panic!("expected master");
        };
        assert!(!master.is_simple());
        assert_eq!(master.variants().len(), 2);
        assert_eq!(
            master.default_variant().uri,
            "http://example.com/hi/index.m3u8"
        );
        assert_eq!(master.default_variant().bandwidth, 1_280_000);
    }

    #[test]
    fn extinf_wins_over_stream_inf() {
        let both = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nx.m3u8\n#EXTINF:4.0,\nseg.ts\n";
        let playlist = Playlist::parse("http://example.com/p.m3u8", both).unwrap();
        assert!(matches!(playlist, Playlist::Media(_)));
    }

    #[test]
    fn neither_kind_is_an_error() {
        let err = Playlist::parse("http://example.com/p.m3u8", "#EXTM3U\n#EXT-X-VERSION:3\n")
            .unwrap_err();
        assert!(matches!(err, PlaylistError::UnknownPlaylistKind));
    }

    #[test]
    fn missing_header_is_an_error() {
        let mut media = MediaPlaylist::new("http://example.com/p.m3u8");
        assert!(matches!(
            media.update("#EXTINF:4.0,\nseg.ts\n"),
            Err(PlaylistError::MissingHeader)
        ));
    }

    #[test]
    fn fragments_are_sequenced_from_media_sequence() {
        let mut media = MediaPlaylist::new("http://example.com/a/index.m3u8");
        assert!(media.update(MEDIA).unwrap());
        let frags = media.fragments();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].sequence, 7);
        assert_eq!(frags[1].sequence, 8);
        assert_eq!(frags[0].uri, "http://example.com/a/seg7.ts");
        assert!(!frags[0].discontinuity);
        assert!(frags[1].discontinuity);
        assert_eq!(frags[0].title, "one");
    }

    #[test]
    fn identical_body_update_is_a_noop() {
        let mut media = MediaPlaylist::new("http://example.com/a/index.m3u8");
        assert!(media.update(MEDIA).unwrap());
        assert!(!media.update(MEDIA).unwrap());
        assert_eq!(media.fragments().len(), 2);
    }

    #[test]
    fn live_until_endlist() {
        let mut media = MediaPlaylist::new("http://example.com/a/index.m3u8");
        media.update(MEDIA).unwrap();
        assert!(media.is_live());

        let ended = format!("{MEDIA}#EXT-X-ENDLIST\n");
        assert!(media.update(&ended).unwrap());
        assert!(!media.is_live());
    }

    #[test]
    fn vod_playlist_type_ends_liveness() {
        let body = "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4.0,\nseg.ts\n";
        let mut media = MediaPlaylist::new("http://example.com/p.m3u8");
        media.update(body).unwrap();
        assert!(!media.is_live());
    }

    #[test]
    fn duration_sums_fragment_durations() {
        let mut media = MediaPlaylist::new("http://example.com/a/index.m3u8");
        media.update(MEDIA).unwrap();
        assert!((media.duration() - 18.018).abs() < 1e-9);
    }

    #[test]
    fn relative_uris_resolve_against_playlist_location() {
        let body = "#EXTM3U\n#EXTINF:4.0,\n../other/seg.ts\n";
        let mut media = MediaPlaylist::new("http://example.com/a/b/index.m3u8");
        media.update(body).unwrap();
        assert_eq!(media.fragments()[0].uri, "http://example.com/a/other/seg.ts");
    }

    #[test]
    fn absolute_fragment_uris_pass_through() {
        let body = "#EXTM3U\n#EXTINF:4.0,\nhttp://cdn.example.com/seg.ts\n";
        let mut media = MediaPlaylist::new("http://example.com/index.m3u8");
        media.update(body).unwrap();
        assert_eq!(media.fragments()[0].uri, "http://cdn.example.com/seg.ts");
    }

    #[test]
    fn simple_master_wraps_media() {
        let mut media = MediaPlaylist::new("http://example.com/index.m3u8");
        media.update(MEDIA).unwrap();
        let master = MasterPlaylist::from_media(media);
        assert!(master.is_simple());
        assert_eq!(master.variants().len(), 1);
        assert_eq!(master.default_variant().uri, "http://example.com/index.m3u8");
        assert_eq!(master.default_variant().stream.fragments().len(), 2);
    }
}
