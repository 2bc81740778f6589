//! Adaptive-media playlist model.
//!
//! The parser in [`parser`] turns raw playlist text into an ordered
//! [`HlsPlaylist`]; the manifest normalizer in the engine turns playlists
//! into pieces. DASH manifests arrive pre-resolved as segment URL lists and
//! bypass the parser entirely.

mod parser;

pub use parser::parse_media_playlist;

use url::Url;

/// One media segment of a playlist, in playback order.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub url: Url,
    /// Seconds of media in this segment.
    pub duration: f64,
    /// `(offset, length)` within the shared resource for byte-range
    /// addressed playlists.
    pub byte_range: Option<(u64, u64)>,
}

/// Ordered segment list parsed from one media playlist.
#[derive(Debug, Clone, Default)]
pub struct HlsPlaylist {
    pub segments: Vec<MediaSegment>,
    /// Whether segments address byte ranges of a shared resource. Uniform
    /// across the playlist; mixed addressing is rejected by the parser.
    pub has_byte_range: bool,
}

impl HlsPlaylist {
    /// Sum of segment durations.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Container format guessed from the final segment URL's extension
    /// (lowercase, with the leading dot), before any bytes are downloaded.
    pub fn container_format(&self) -> String {
        let Some(last) = self.segments.last() else {
            return String::new();
        };
        extension_of(&crate::piece::segment_file_name(last.url.as_str()))
    }
}

/// Lowercase file extension including the leading dot, or empty.
pub fn extension_of(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(idx) if idx + 1 < file_name.len() => file_name[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Guess the output container extension for a download.
///
/// Muxed downloads pass `audio = None` and get the video format as-is.
/// Demuxed downloads combine both guesses: transport-stream or raw-AAC
/// tracks force `.ts`, matching MP4-family tracks produce `.mp4`, and
/// anything mismatched falls back to `.mkv` so the muxer can cope.
pub fn guess_target_extension(video: &str, audio: Option<&str>) -> String {
    let fallback = ".ts";
    match audio {
        None => {
            if video.is_empty() {
                fallback.to_string()
            } else {
                video.to_string()
            }
        }
        Some(audio) => {
            let v = video.trim_start_matches('.');
            let a = audio.trim_start_matches('.');
            if v == "ts" || a == "ts" || a == "aac" {
                return fallback.to_string();
            }
            let mp4_family = |ext: &str| matches!(ext, "mp4" | "m4s" | "m4v" | "m4a" | "mov");
            if mp4_family(v) && mp4_family(a) {
                return ".mp4".to_string();
            }
            if !video.is_empty() && video == audio {
                return video.to_string();
            }
            ".mkv".to_string()
        }
    }
}

/// Swap `file_name`'s extension for `ext` (which includes the dot).
pub fn replace_extension(file_name: &str, ext: &str) -> String {
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };
    format!("{stem}{ext}")
}
