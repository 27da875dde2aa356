//! Line-level tag tokenizer.
//!
//! A playlist body is split into a transient list of [`Tag`]s, which the
//! [`crate::playlist`] layer folds into a media or master playlist. Tags
//! come in a handful of shapes: bare markers, `NAME:value` pairs,
//! `NAME:KEY=VALUE,...` attribute lists, and the special `#EXTINF`
//! duration/title pair. Bare URI lines become tags too, so downstream
//! code never has to re-walk the text.

use tracing::warn;

/// Marker tags that carry no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegularTag {
    Discontinuity,
    EndList,
    IFramesOnly,
    IndependentSegments,
}

/// Tags of the form `#EXT-X-NAME:<value>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleValueTag {
    Version,
    TargetDuration,
    MediaSequence,
    DiscontinuitySequence,
    PlaylistType,
    ByteRange,
    ProgramDateTime,
}

/// Tags of the form `#EXT-X-NAME:KEY=VALUE,KEY=VALUE,...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeListTag {
    Key,
    SessionKey,
    Map,
    Media,
    Start,
    StreamInf,
    IFrameStreamInf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Regular(RegularTag),
    SingleValue(SingleValueTag, String),
    Attributes(AttributeListTag, Vec<(String, String)>),
    /// `#EXTINF:<duration>,<title>`.
    ExtInf { duration: f64, title: String },
    /// A bare URI line (fragment or variant location).
    Uri(String),
    /// An `#EXT...` tag the parser does not model; kept for diagnostics.
    Unknown { name: String, value: String },
}

/// Splits `text` into tags, one per meaningful line.
///
/// Comment lines (starting with `#` but not `#EXT`) and blank lines are
/// skipped. A bare line directly following an `#EXT-X-STREAM-INF` tag is
/// merged into that tag as its `URI` attribute; any other bare line
/// becomes [`Tag::Uri`].
pub fn parse_tags(text: &str) -> Vec<Tag> {
    let mut tags = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            if rest.starts_with("EXT") {
                tags.push(parse_ext_tag(line));
            }
            // plain comment, ignored
            continue;
        }

        // Bare line: a variant URI completes the preceding STREAM-INF tag,
        // anything else is a fragment URI.
        match tags.last_mut() {
            Some(Tag::Attributes(AttributeListTag::StreamInf, attrs))
                if !attrs.iter().any(|(k, _)| k == "URI") =>
            {
                attrs.push(("URI".to_string(), line.to_string()));
            }
            _ => tags.push(Tag::Uri(line.to_string())),
        }
    }

    tags
}

fn parse_ext_tag(line: &str) -> Tag {
    let (name, value) = match line.split_once(':') {
        Some((n, v)) => (n, v),
        None => (line, ""),
    };

    match name {
        "#EXT-X-DISCONTINUITY" => Tag::Regular(RegularTag::Discontinuity),
        "#EXT-X-ENDLIST" => Tag::Regular(RegularTag::EndList),
        "#EXT-X-I-FRAMES-ONLY" => Tag::Regular(RegularTag::IFramesOnly),
        "#EXT-X-INDEPENDENT-SEGMENTS" => Tag::Regular(RegularTag::IndependentSegments),

        "#EXT-X-VERSION" => Tag::SingleValue(SingleValueTag::Version, value.to_string()),
        "#EXT-X-TARGETDURATION" => {
            Tag::SingleValue(SingleValueTag::TargetDuration, value.to_string())
        }
        "#EXT-X-MEDIA-SEQUENCE" => {
            Tag::SingleValue(SingleValueTag::MediaSequence, value.to_string())
        }
        "#EXT-X-DISCONTINUITY-SEQUENCE" => {
            Tag::SingleValue(SingleValueTag::DiscontinuitySequence, value.to_string())
        }
        "#EXT-X-PLAYLIST-TYPE" => {
            Tag::SingleValue(SingleValueTag::PlaylistType, value.to_string())
        }
        "#EXT-X-BYTERANGE" => Tag::SingleValue(SingleValueTag::ByteRange, value.to_string()),
        "#EXT-X-PROGRAM-DATE-TIME" => {
            Tag::SingleValue(SingleValueTag::ProgramDateTime, value.to_string())
        }

        "#EXT-X-KEY" => Tag::Attributes(AttributeListTag::Key, split_attributes(value)),
        "#EXT-X-SESSION-KEY" => {
            Tag::Attributes(AttributeListTag::SessionKey, split_attributes(value))
        }
        "#EXT-X-MAP" => Tag::Attributes(AttributeListTag::Map, split_attributes(value)),
        "#EXT-X-MEDIA" => Tag::Attributes(AttributeListTag::Media, split_attributes(value)),
        "#EXT-X-START" => Tag::Attributes(AttributeListTag::Start, split_attributes(value)),
        "#EXT-X-STREAM-INF" => {
            Tag::Attributes(AttributeListTag::StreamInf, split_attributes(value))
        }
        "#EXT-X-I-FRAME-STREAM-INF" => {
            Tag::Attributes(AttributeListTag::IFrameStreamInf, split_attributes(value))
        }

        "#EXTINF" => parse_extinf(value),
        "#EXTM3U" => Tag::Unknown {
            name: name.to_string(),
            value: String::new(),
        },

        _ => Tag::Unknown {
            name: name.to_string(),
            value: value.to_string(),
        },
    }
}

fn parse_extinf(value: &str) -> Tag {
    let (duration_str, title) = match value.split_once(',') {
        Some((d, t)) => (d, t),
        None => (value, ""),
    };
    let duration = match duration_str.trim().parse::<f64>() {
        Ok(d) => d,
        Err(_) => {
            warn!(value = %value, "malformed #EXTINF duration, treating as 0");
            0.0
        }
    };
    Tag::ExtInf {
        duration,
        title: title.trim().to_string(),
    }
}

/// Splits an attribute list on commas, respecting double-quoted values
/// (quoted values may contain commas, e.g. `CODECS="avc1.4d401f,mp4a.40.2"`).
/// Surrounding quotes are stripped from values.
pub fn split_attributes(value: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                push_attribute(&mut attrs, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push_attribute(&mut attrs, &current);

    attrs
}

fn push_attribute(attrs: &mut Vec<(String, String)>, piece: &str) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    match piece.split_once('=') {
        Some((key, value)) => {
            let value = value.trim().trim_matches('"');
            attrs.push((key.trim().to_string(), value.to_string()));
        }
        None => {
            // valueless entry, keep the key so callers can still see it
            attrs.push((piece.to_string(), String::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_attribute_values() {
        let attrs = split_attributes(
            r#"BANDWIDTH=1280000,CODECS="avc1.4d401f,mp4a.40.2",RESOLUTION=1280x720"#,
        );
        assert_eq!(
            attrs,
            vec![
                ("BANDWIDTH".to_string(), "1280000".to_string()),
                ("CODECS".to_string(), "avc1.4d401f,mp4a.40.2".to_string()),
                ("RESOLUTION".to_string(), "1280x720".to_string()),
            ]
        );
    }

    #[test]
    fn merges_uri_line_into_stream_inf() {
        let tags = parse_tags(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow/index.m3u8\n",
        );
        let stream_inf = tags
            .iter()
            .find_map(|t| match t {
                Tag::Attributes(AttributeListTag::StreamInf, attrs) => Some(attrs),
                _ => None,
            })
            .unwrap();
        assert!(
            stream_inf
                .iter()
                .any(|(k, v)| k == "URI" && v == "low/index.m3u8")
        );
        // the URI line must not also show up as a fragment
        assert!(!tags.iter().any(|t| matches!(t, Tag::Uri(_))));
    }

    #[test]
    fn bare_line_without_stream_inf_is_a_fragment_uri() {
        let tags = parse_tags("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n");
        assert!(
            tags.iter()
                .any(|t| matches!(t, Tag::Uri(u) if u == "seg0.ts"))
        );
    }

    #[test]
    fn extinf_parses_duration_and_title() {
        let tags = parse_tags("#EXTINF:9.009,first segment\n");
        assert_eq!(
            tags[0],
            Tag::ExtInf {
                duration: 9.009,
                title: "first segment".to_string()
            }
        );
    }

    #[test]
    fn malformed_extinf_duration_defaults_to_zero() {
        let tags = parse_tags("#EXTINF:abc,oops\n");
        assert_eq!(
            tags[0],
            Tag::ExtInf {
                duration: 0.0,
                title: "oops".to_string()
            }
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let tags = parse_tags("# just a comment\n\n#EXT-X-ENDLIST\n");
        assert_eq!(tags, vec![Tag::Regular(RegularTag::EndList)]);
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let tags = parse_tags("#EXTM3U\r\n#EXT-X-TARGETDURATION:10\r\nseg.ts\r\n");
        assert!(tags.iter().any(
            |t| matches!(t, Tag::SingleValue(SingleValueTag::TargetDuration, v) if v == "10")
        ));
        assert!(tags.iter().any(|t| matches!(t, Tag::Uri(u) if u == "seg.ts")));
    }
}
