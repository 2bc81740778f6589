//! Line-oriented HLS media-playlist parser.
//!
//! Only the subset needed to normalize a media playlist into pieces is
//! understood: `#EXTINF` durations, `#EXT-X-BYTERANGE` addressing and
//! segment URI lines (resolved against the playlist URL). Unknown tags are
//! skipped; structural errors are reported as manifest-parse failures.

use regex::Regex;
use url::Url;

use super::{HlsPlaylist, MediaSegment};
use crate::error::{EngineError, EngineResult};

/// Parse one media playlist.
///
/// `base` is the playlist's own URL, used to resolve relative segment URIs.
/// A `#EXT-X-BYTERANGE` tag without an explicit `@offset` continues from
/// the end of the previous segment's range, per the playlist format.
/// Mixed byte-range and whole-segment addressing is rejected: piece
/// construction assumes the flag is uniform across a playlist.
pub fn parse_media_playlist(text: &str, base: &Url) -> EngineResult<HlsPlaylist> {
    let extinf = Regex::new(r"^#EXTINF:([0-9]+(?:\.[0-9]+)?)").expect("static regex");
    let byterange = Regex::new(r"^#EXT-X-BYTERANGE:([0-9]+)(?:@([0-9]+))?").expect("static regex");

    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;
    let mut pending_range: Option<(u64, u64)> = None;
    let mut previous_range_end: Option<u64> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#EXTINF") {
            let caps = extinf
                .captures(line)
                .ok_or_else(|| EngineError::ManifestParse(format!("bad EXTINF duration: {line}")))?;
            let duration = caps[1]
                .parse::<f64>()
                .map_err(|_| EngineError::ManifestParse(format!("bad EXTINF duration: {line}")))?;
            pending_duration = Some(duration);
            continue;
        }
        if line.starts_with("#EXT-X-BYTERANGE") {
            let caps = byterange
                .captures(line)
                .ok_or_else(|| EngineError::ManifestParse(format!("bad byte range: {line}")))?;
            let length = caps[1]
                .parse::<u64>()
                .map_err(|_| EngineError::ManifestParse(format!("bad byte range: {line}")))?;
            let offset = match caps.get(2) {
                Some(explicit) => explicit.as_str().parse::<u64>().map_err(|_| {
                    EngineError::ManifestParse(format!("bad byte range offset: {line}"))
                })?,
                None => previous_range_end.ok_or_else(|| {
                    EngineError::ManifestParse(
                        "byte range without offset has no predecessor".to_string(),
                    )
                })?,
            };
            pending_range = Some((offset, length));
            continue;
        }
        if line.starts_with('#') {
            // Header, ENDLIST and every other tag: not needed for piece
            // construction.
            continue;
        }

        // A URI line closes the pending segment.
        let url = base
            .join(line)
            .map_err(|e| EngineError::ManifestParse(format!("bad segment uri {line}: {e}")))?;
        let duration = pending_duration.take().unwrap_or(0.0);
        let byte_range = pending_range.take();
        previous_range_end = byte_range.map(|(offset, length)| offset + length);
        segments.push(MediaSegment {
            url,
            duration,
            byte_range,
        });
    }

    if segments.is_empty() {
        return Err(EngineError::ManifestParse(
            "playlist contains no media segments".to_string(),
        ));
    }

    let ranged = segments.iter().filter(|s| s.byte_range.is_some()).count();
    if ranged != 0 && ranged != segments.len() {
        return Err(EngineError::ManifestParse(
            "playlist mixes byte-range and whole-segment addressing".to_string(),
        ));
    }

    Ok(HlsPlaylist {
        has_byte_range: ranged != 0,
        segments,
    })
}
