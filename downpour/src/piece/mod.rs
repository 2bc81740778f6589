//! Piece model shared by every downloader variant.
//!
//! A piece is the atomic unit of transfer: a byte range or a whole media
//! segment fetched by one worker. Plain HTTP downloads, muxed/demuxed HLS
//! and DASH all normalize into the same piece shape, so the worker pool and
//! the snapshot format are written once.
//!
//! State machine:
//!
//! ```text
//! Ready ──(worker claims)──► Connecting ──(headers ok)──► Downloading ──► Finished
//!                 │                 │
//!                 └────────────────►└──(network/server error)──► Failed ──(retry pass)──► Ready
//! ```
//!
//! Snapshots only ever record `Ready`/`Finished`/`Failed`; a piece captured
//! mid-`Downloading` is demoted to `Ready` on restore with its partial byte
//! count preserved, so the worker resumes the range request instead of
//! restarting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a derived piece file name component.
const MAX_FILE_NAME_LEN: usize = 120;

/// Lifecycle state of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceState {
    Ready,
    Connecting,
    Downloading,
    Finished,
    Failed,
}

/// Which logical track a piece belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Video, or the only track of a non-multiplexed download.
    Primary,
    /// Audio track of a demuxed download.
    Secondary,
}

impl StreamKind {
    /// Temp-file name prefix for this stream.
    pub fn prefix(self) -> &'static str {
        match self {
            StreamKind::Primary => "1_",
            StreamKind::Secondary => "2_",
        }
    }
}

/// The atomic unit of transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    /// Stable identifier, also the key into the temp-file map.
    pub id: Uuid,
    /// URL to fetch.
    pub uri: String,
    /// Start of this piece's range within the source resource.
    pub offset: u64,
    /// Range length; `None` until probed (whole segments, unknown-length
    /// resources).
    pub length: Option<u64>,
    pub stream: StreamKind,
    /// Seconds of media represented by this piece (adaptive media only).
    pub duration: Option<f64>,
    /// Bytes persisted to this piece's temp file so far.
    pub downloaded: u64,
    pub state: PieceState,
}

impl Piece {
    pub fn new(
        uri: impl Into<String>,
        offset: u64,
        length: Option<u64>,
        stream: StreamKind,
        duration: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            offset,
            length,
            stream,
            duration,
            downloaded: 0,
            state: PieceState::Ready,
        }
    }

    /// Bytes still missing, when the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.downloaded))
    }

    pub fn is_finished(&self) -> bool {
        self.state == PieceState::Finished
    }

    /// A piece absorbed into its predecessor by coalescing: finished with a
    /// zero-length range and no bytes of its own.
    pub fn is_absorbed(&self) -> bool {
        self.is_finished() && self.length == Some(0) && self.downloaded == 0
    }

    /// Derived temp-file name: stream prefix, piece id, then the sanitized
    /// base name of the source segment. Recomputed identically on restore.
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}",
            self.stream.prefix(),
            self.id,
            sanitize_file_name(&segment_file_name(&self.uri))
        )
    }
}

/// Last path component of a segment URL, without query or fragment.
pub fn segment_file_name(uri: &str) -> String {
    let name = url::Url::parse(uri)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from))
        })
        .unwrap_or_default();
    if name.is_empty() {
        "segment".to_string()
    } else {
        name
    }
}

/// Replace characters that are illegal in file names and bound the length.
pub fn sanitize_file_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    if cleaned.len() > MAX_FILE_NAME_LEN {
        let mut end = MAX_FILE_NAME_LEN;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }
    cleaned
}

/// Mapping from piece id to absolute temp-file path.
///
/// Never persisted: rebuilt from the piece list so it can never drift out
/// of sync with it.
#[derive(Debug, Clone, Default)]
pub struct PieceFileMap {
    map: HashMap<Uuid, PathBuf>,
}

impl PieceFileMap {
    pub fn build(temp_dir: &Path, pieces: &[Piece]) -> Self {
        let map = pieces
            .iter()
            .map(|p| (p.id, temp_dir.join(p.file_name())))
            .collect();
        Self { map }
    }

    pub fn get(&self, id: Uuid) -> Option<&PathBuf> {
        self.map.get(&id)
    }
}

/// The orchestrator's view of all pieces of one download, mutated under a
/// single per-download lock.
#[derive(Debug, Default)]
pub struct PieceTable {
    pieces: Vec<Piece>,
}

impl PieceTable {
    pub fn new(pieces: Vec<Piece>) -> Self {
        Self { pieces }
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn get(&self, id: Uuid) -> Option<&Piece> {
        self.pieces.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Piece> {
        self.pieces.iter_mut().find(|p| p.id == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Piece> {
        self.pieces.iter_mut()
    }

    /// Claim the first `Ready` piece in list order, marking it `Connecting`.
    /// List order is the normalizer's scheduling order (demuxed pieces are
    /// interleaved there).
    pub fn claim_next_ready(&mut self) -> Option<Uuid> {
        let piece = self.pieces.iter_mut().find(|p| p.state == PieceState::Ready)?;
        piece.state = PieceState::Connecting;
        Some(piece.id)
    }

    pub fn count_state(&self, state: PieceState) -> usize {
        self.pieces.iter().filter(|p| p.state == state).count()
    }

    pub fn all_finished(&self) -> bool {
        !self.pieces.is_empty() && self.pieces.iter().all(|p| p.is_finished())
    }

    /// Sum of per-piece byte counters.
    pub fn total_downloaded(&self) -> u64 {
        self.pieces.iter().map(|p| p.downloaded).sum()
    }

    /// Total size of the download, known only once every piece's length has
    /// been resolved.
    pub fn resolved_total(&self) -> Option<u64> {
        self.pieces.iter().map(|p| p.length).sum()
    }

    /// Re-arm every failed piece for another attempt, keeping partial
    /// bytes. Returns how many pieces were re-armed.
    pub fn rearm_failed(&mut self) -> usize {
        let mut count = 0;
        for piece in &mut self.pieces {
            if piece.state == PieceState::Failed {
                piece.state = PieceState::Ready;
                count += 1;
            }
        }
        count
    }

    /// Demote in-flight states after a restore: a piece recorded
    /// mid-transfer resumes as `Ready` with its byte count preserved.
    pub fn demote_in_flight(&mut self) {
        for piece in &mut self.pieces {
            if matches!(piece.state, PieceState::Connecting | PieceState::Downloading) {
                piece.state = PieceState::Ready;
            }
        }
    }

    /// Merge the adjacent piece into `id`'s range so the worker can keep
    /// its connection open across the boundary.
    ///
    /// The candidate must be the contiguous next range of the same resource
    /// and stream, still `Ready`, with a known length no larger than
    /// `max_bytes`. The absorbed piece is marked finished with a
    /// zero-length range so assembly order is preserved.
    pub fn coalesce_adjacent(&mut self, id: Uuid, max_bytes: u64) -> bool {
        let Some(current) = self.get(id) else {
            return false;
        };
        let Some(current_len) = current.length else {
            return false;
        };
        let boundary = current.offset + current_len;
        let (uri, stream) = (current.uri.clone(), current.stream);

        let candidate = self.pieces.iter_mut().find(|p| {
            p.state == PieceState::Ready
                && p.stream == stream
                && p.uri == uri
                && p.offset == boundary
                && matches!(p.length, Some(len) if len > 0 && len <= max_bytes)
        });
        let Some(next) = candidate else {
            return false;
        };
        let extra = next.length.unwrap_or(0);
        next.length = Some(0);
        next.downloaded = 0;
        next.state = PieceState::Finished;

        let current = self.get_mut(id).expect("piece vanished during coalesce");
        current.length = Some(current_len + extra);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranged_piece(offset: u64, length: u64) -> Piece {
        Piece::new(
            "http://cdn.example/media.ts",
            offset,
            Some(length),
            StreamKind::Primary,
            None,
        )
    }

    #[test]
    fn test_piece_new_starts_ready() {
        let piece = ranged_piece(0, 100);
        assert_eq!(piece.state, PieceState::Ready);
        assert_eq!(piece.downloaded, 0);
        assert_eq!(piece.remaining(), Some(100));
    }

    #[test]
    fn test_file_name_uses_stream_prefix_and_segment_name() {
        let piece = Piece::new(
            "http://cdn.example/path/seg001.ts?token=abc",
            0,
            None,
            StreamKind::Secondary,
            Some(4.0),
        );
        let name = piece.file_name();
        assert!(name.starts_with("2_"));
        assert!(name.ends_with("seg001.ts"));
    }

    #[test]
    fn test_segment_file_name_fallback() {
        assert_eq!(segment_file_name("http://cdn.example/"), "segment");
        assert_eq!(segment_file_name("not a url"), "segment");
    }

    #[test]
    fn test_sanitize_file_name_replaces_illegal_chars() {
        assert_eq!(sanitize_file_name("a/b:c*d?.ts"), "a_b_c_d_.ts");
    }

    #[test]
    fn test_file_map_rebuild_is_deterministic() {
        let pieces = vec![ranged_piece(0, 10), ranged_piece(10, 10)];
        let dir = Path::new("/tmp/dl");
        let map1 = PieceFileMap::build(dir, &pieces);
        let map2 = PieceFileMap::build(dir, &pieces);
        for piece in &pieces {
            assert_eq!(map1.get(piece.id), map2.get(piece.id));
        }
    }

    #[test]
    fn test_claim_next_ready_marks_connecting() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 10), ranged_piece(10, 10)]);
        let first = table.claim_next_ready().unwrap();
        assert_eq!(table.get(first).unwrap().state, PieceState::Connecting);
        assert_eq!(first, table.pieces()[0].id);

        let second = table.claim_next_ready().unwrap();
        assert_ne!(first, second);
        assert!(table.claim_next_ready().is_none());
    }

    #[test]
    fn test_rearm_failed_keeps_partial_bytes() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100)]);
        let id = table.pieces()[0].id;
        {
            let piece = table.get_mut(id).unwrap();
            piece.downloaded = 40;
            piece.state = PieceState::Failed;
        }
        assert_eq!(table.rearm_failed(), 1);
        let piece = table.get(id).unwrap();
        assert_eq!(piece.state, PieceState::Ready);
        assert_eq!(piece.downloaded, 40);
    }

    #[test]
    fn test_demote_in_flight() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100), ranged_piece(100, 100)]);
        let id = table.claim_next_ready().unwrap();
        table.get_mut(id).unwrap().state = PieceState::Downloading;

        table.demote_in_flight();
        assert_eq!(table.count_state(PieceState::Ready), 2);
    }

    #[test]
    fn test_resolved_total_requires_all_lengths() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100)]);
        assert_eq!(table.resolved_total(), Some(100));

        table.pieces.push(Piece::new(
            "http://cdn.example/seg.ts",
            0,
            None,
            StreamKind::Primary,
            None,
        ));
        assert_eq!(table.resolved_total(), None);
    }

    #[test]
    fn test_coalesce_merges_contiguous_ready_piece() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100), ranged_piece(100, 50)]);
        let (first, second) = (table.pieces()[0].id, table.pieces()[1].id);

        assert!(table.coalesce_adjacent(first, 64));
        assert_eq!(table.get(first).unwrap().length, Some(150));

        let absorbed = table.get(second).unwrap();
        assert!(absorbed.is_absorbed());
    }

    #[test]
    fn test_coalesce_respects_max_byte_bound() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100), ranged_piece(100, 50)]);
        let first = table.pieces()[0].id;

        // Next piece is 50 bytes; a 49-byte cap must refuse the merge.
        assert!(!table.coalesce_adjacent(first, 49));
        assert_eq!(table.get(first).unwrap().length, Some(100));
    }

    #[test]
    fn test_coalesce_requires_contiguity_and_same_uri() {
        let mut table = PieceTable::new(vec![ranged_piece(0, 100), ranged_piece(150, 50)]);
        let first = table.pieces()[0].id;
        assert!(!table.coalesce_adjacent(first, 1024));

        let mut other_uri = PieceTable::new(vec![
            ranged_piece(0, 100),
            Piece::new(
                "http://cdn.example/other.ts",
                100,
                Some(50),
                StreamKind::Primary,
                None,
            ),
        ]);
        let first = other_uri.pieces()[0].id;
        assert!(!other_uri.coalesce_adjacent(first, 1024));
    }

    #[test]
    fn test_snapshot_codec_roundtrip() {
        let pieces = vec![ranged_piece(0, 100), ranged_piece(100, 50)];
        let bytes = bincode::serialize(&pieces).unwrap();
        let decoded: Vec<Piece> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, pieces[0].id);
        assert_eq!(decoded[1].offset, 100);
    }
}
