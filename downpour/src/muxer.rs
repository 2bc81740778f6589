//! Finalizer seam.
//!
//! When every piece of a download has finished, the orchestrator hands the
//! ordered per-stream temp files to a [`Muxer`] together with the target
//! path. Combining demuxed audio and video into one container is delegated
//! to an external processor behind this trait; the built-in
//! [`ConcatMuxer`] covers the single-stream cases (plain HTTP, muxed HLS)
//! by plain concatenation.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::piece::StreamKind;

/// Finished temp files of one stream, in assembly order.
#[derive(Debug, Clone)]
pub struct StreamFiles {
    pub kind: StreamKind,
    pub files: Vec<PathBuf>,
}

/// Combines finished piece files into the user-visible output file.
pub trait Muxer: Send + Sync {
    fn mux(&self, streams: &[StreamFiles], target: &Path) -> EngineResult<()>;
}

/// Concatenates a single stream's pieces into the target file.
///
/// Sufficient for every non-demuxed download: ranged pieces and media
/// segments are contiguous in assembly order. Demuxed downloads need an
/// external container muxer and are rejected here.
#[derive(Debug, Default)]
pub struct ConcatMuxer;

impl Muxer for ConcatMuxer {
    fn mux(&self, streams: &[StreamFiles], target: &Path) -> EngineResult<()> {
        if streams.len() != 1 {
            return Err(EngineError::Generic(
                "demuxed streams require an external muxer".to_string(),
            ));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(target)?);
        for file in &streams[0].files {
            let mut reader = File::open(file)?;
            std::io::copy(&mut reader, &mut writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_concat_joins_pieces_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("1_a");
        let b = dir.path().join("1_b");
        fs::write(&a, b"hello ").unwrap();
        fs::write(&b, b"world").unwrap();

        let target = dir.path().join("out/movie.ts");
        let streams = [StreamFiles {
            kind: StreamKind::Primary,
            files: vec![a, b],
        }];
        ConcatMuxer.mux(&streams, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"hello world");
    }

    #[test]
    fn test_concat_rejects_demuxed_input() {
        let dir = TempDir::new().unwrap();
        let streams = [
            StreamFiles {
                kind: StreamKind::Primary,
                files: vec![],
            },
            StreamFiles {
                kind: StreamKind::Secondary,
                files: vec![],
            },
        ];
        let err = ConcatMuxer
            .mux(&streams, &dir.path().join("out.mkv"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Generic);
    }

    #[test]
    fn test_concat_is_idempotent() {
        // Finalization may be re-attempted after a crash; rewriting the
        // target must produce identical content.
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("1_a");
        fs::write(&a, b"data").unwrap();
        let target = dir.path().join("out.bin");
        let streams = [StreamFiles {
            kind: StreamKind::Primary,
            files: vec![a],
        }];

        ConcatMuxer.mux(&streams, &target).unwrap();
        ConcatMuxer.mux(&streams, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"data");
    }
}
