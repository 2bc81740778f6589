//! Per-download aggregate state and its persistence.
//!
//! One `DownloadState` exists per user-visible download entry. It is
//! created on first request (before any manifest is fetched), filled in by
//! the manifest normalizer, updated by the orchestrator, and kept on disk
//! as a small JSON record inside the download's temp directory through the
//! crash-safe store. The record is retained after completion and removed
//! only when the user deletes the entry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::http::BasicAuth;
use crate::io;
use crate::piece::StreamKind;

/// File name of the state record inside the temp directory.
pub const STATE_FILE: &str = "state.json";

/// File name (base) of the dual-slot piece-list snapshot.
pub const SNAPSHOT_FILE: &str = "chunks.db";

/// What kind of source a download was created from. Selects the manifest
/// normalization strategy; the orchestrator and worker are written once
/// against the shared piece shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SourceKind {
    /// Plain HTTP resource, split into ranged pieces when possible.
    Http { url: String },
    /// Single HLS playlist carrying both audio and video.
    HlsMuxed { playlist_url: String },
    /// Separate video and audio HLS playlists.
    HlsDemuxed { video_url: String, audio_url: String },
    /// DASH source with segment URLs already resolved (captured upstream;
    /// MPD parsing is not this engine's concern).
    Dash {
        video_segments: Vec<String>,
        audio_segments: Vec<String>,
        duration: f64,
    },
}

impl SourceKind {
    /// Whether audio and video arrive as two independently addressed
    /// streams.
    pub fn is_demuxed(&self) -> bool {
        matches!(self, SourceKind::HlsDemuxed { .. })
            || matches!(self, SourceKind::Dash { audio_segments, .. } if !audio_segments.is_empty())
    }
}

/// Freshness snapshot of one remote stream, recorded on the first
/// successful connect and compared on resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamValidation {
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Aggregate state of one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    /// Primary key, stable for the lifetime of the download.
    pub id: String,
    pub source: SourceKind,
    pub temp_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Output file name; its extension is re-derived once the container
    /// format is known.
    pub target_file: String,

    pub headers: Vec<(String, String)>,
    pub cookies: Option<String>,
    pub auth: Option<BasicAuth>,
    pub proxy: Option<String>,

    /// Total size; `None` until resolvable (unknown-length adaptive
    /// streams are common).
    pub file_size: Option<u64>,
    /// Total media duration in seconds (adaptive media only).
    pub duration: f64,
    pub demuxed: bool,
    pub video_piece_count: usize,
    pub audio_piece_count: usize,
    /// Container extension guesses, with leading dot.
    pub video_format: Option<String>,
    pub audio_format: Option<String>,

    pub video_validation: StreamValidation,
    pub audio_validation: StreamValidation,

    /// Set once finalization has completed.
    pub completed: bool,
}

impl DownloadState {
    pub fn new(
        id: impl Into<String>,
        source: SourceKind,
        temp_dir: PathBuf,
        target_dir: PathBuf,
        target_file: impl Into<String>,
    ) -> Self {
        let demuxed = source.is_demuxed();
        Self {
            id: id.into(),
            source,
            temp_dir,
            target_dir,
            target_file: target_file.into(),
            headers: Vec::new(),
            cookies: None,
            auth: None,
            proxy: None,
            file_size: None,
            duration: 0.0,
            demuxed,
            video_piece_count: 0,
            audio_piece_count: 0,
            video_format: None,
            audio_format: None,
            video_validation: StreamValidation::default(),
            audio_validation: StreamValidation::default(),
            completed: false,
        }
    }

    pub fn validation(&self, stream: StreamKind) -> &StreamValidation {
        match stream {
            StreamKind::Primary => &self.video_validation,
            StreamKind::Secondary => &self.audio_validation,
        }
    }

    pub fn validation_mut(&mut self, stream: StreamKind) -> &mut StreamValidation {
        match stream {
            StreamKind::Primary => &mut self.video_validation,
            StreamKind::Secondary => &mut self.audio_validation,
        }
    }

    /// Absolute path of the finalized output file.
    pub fn target_path(&self) -> PathBuf {
        self.target_dir.join(&self.target_file)
    }

    /// Persist this record through the crash-safe small-record store.
    pub fn save(&self) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Persistence(format!("encoding state: {e}")))?;
        io::write_text(&self.temp_dir, STATE_FILE, &json)?;
        Ok(())
    }

    /// Load the record from a download's temp directory. Missing or
    /// unreadable state is fatal for a resume attempt.
    pub fn load(temp_dir: &Path) -> EngineResult<Self> {
        let json = io::read_text(temp_dir, STATE_FILE)?.ok_or_else(|| {
            EngineError::Persistence(format!("no state record in {}", temp_dir.display()))
        })?;
        serde_json::from_str(&json)
            .map_err(|e| EngineError::Persistence(format!("decoding state: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state(temp_dir: PathBuf) -> DownloadState {
        let mut state = DownloadState::new(
            "dl-1",
            SourceKind::HlsDemuxed {
                video_url: "http://m.example/v.m3u8".into(),
                audio_url: "http://m.example/a.m3u8".into(),
            },
            temp_dir,
            PathBuf::from("/downloads"),
            "movie.ts",
        );
        state.duration = 120.5;
        state.video_piece_count = 5;
        state.audio_piece_count = 3;
        state
    }

    #[test]
    fn test_demuxed_flag_follows_source() {
        let dir = TempDir::new().unwrap();
        let state = sample_state(dir.path().to_path_buf());
        assert!(state.demuxed);

        let plain = DownloadState::new(
            "dl-2",
            SourceKind::Http {
                url: "http://f.example/a.bin".into(),
            },
            dir.path().to_path_buf(),
            PathBuf::from("/downloads"),
            "a.bin",
        );
        assert!(!plain.demuxed);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut state = sample_state(dir.path().to_path_buf());
        state.video_validation.size = Some(1000);
        state.save().unwrap();

        let loaded = DownloadState::load(dir.path()).unwrap();
        assert_eq!(loaded.id, "dl-1");
        assert_eq!(loaded.video_piece_count, 5);
        assert_eq!(loaded.video_validation.size, Some(1000));
        assert_eq!(loaded.source, state.source);
    }

    #[test]
    fn test_load_missing_state_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let err = DownloadState::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
    }

    #[test]
    fn test_dash_with_audio_is_demuxed() {
        let source = SourceKind::Dash {
            video_segments: vec!["http://d.example/v1.m4s".into()],
            audio_segments: vec!["http://d.example/a1.m4s".into()],
            duration: 60.0,
        };
        assert!(source.is_demuxed());

        let video_only = SourceKind::Dash {
            video_segments: vec!["http://d.example/v1.m4s".into()],
            audio_segments: vec![],
            duration: 60.0,
        };
        assert!(!video_only.is_demuxed());
    }
}
