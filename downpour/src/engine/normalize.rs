//! Manifest normalization strategies.
//!
//! Every source kind is reduced to the same ordered piece list consumed by
//! the worker pool: plain HTTP resources are split into ranged pieces when
//! the server cooperates, HLS playlists are fetched and parsed (muxed, or
//! video/audio probed in parallel), and DASH sources arrive with their
//! segment URLs already resolved. The strict failure policy applies across
//! the board: a download is never started in a partially understood state.

use std::sync::{Arc, Mutex as StdMutex};
use std::thread;

use tracing::{debug, info};
use url::Url;

use super::Shared;
use crate::error::{EngineError, EngineResult};
use crate::hls::{self, parse_media_playlist, HlsPlaylist};
use crate::http::fetch_text;
use crate::piece::{sanitize_file_name, segment_file_name, Piece, StreamKind};
use crate::state::SourceKind;
use crate::sync::Latch;

impl Shared {
    /// Produce the initial piece list for a new download, filling in the
    /// derived state fields (piece counts, duration, formats, target file
    /// extension) as a side effect.
    pub(super) fn normalize(&self) -> EngineResult<Vec<Piece>> {
        let source = self.state.lock().source.clone();
        match source {
            SourceKind::Http { url } => self.normalize_http(&url),
            SourceKind::HlsMuxed { playlist_url } => self.normalize_hls_muxed(&playlist_url),
            SourceKind::HlsDemuxed {
                video_url,
                audio_url,
            } => self.normalize_hls_demuxed(&video_url, &audio_url),
            SourceKind::Dash {
                video_segments,
                audio_segments,
                duration,
            } => self.normalize_dash(&video_segments, &audio_segments, duration),
        }
    }

    /// Fetch every manifest in parallel, one thread per URL, joined through
    /// a breakable countdown latch so a stop request unblocks the waiter
    /// even while a fetch is still in flight.
    ///
    /// Failure policy: the first non-OK HTTP status observed classifies the
    /// whole probe; errors without a status collapse into a generic
    /// manifest-fetch failure.
    fn probe_manifests(&self, urls: &[String]) -> EngineResult<Vec<String>> {
        let latch = Arc::new(Latch::new(urls.len()));
        *self.probe_latch.lock() = Some(Arc::clone(&latch));
        let results: Arc<StdMutex<Vec<Option<EngineResult<String>>>>> =
            Arc::new(StdMutex::new((0..urls.len()).map(|_| None).collect()));

        for (index, url) in urls.iter().enumerate() {
            let ctx = self.request_context_for(url);
            let client = Arc::clone(&self.client);
            let cancel = self.cancel.clone();
            let results = Arc::clone(&results);
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                let result = match cancel.check() {
                    Ok(()) => fetch_text(client.as_ref(), &ctx),
                    Err(e) => Err(e),
                };
                results.lock().expect("probe results poisoned")[index] = Some(result);
                latch.count_down();
            });
        }

        let completed = latch.wait();
        *self.probe_latch.lock() = None;
        self.cancel.check()?;
        if !completed {
            return Err(EngineError::Cancelled);
        }

        let results = std::mem::take(&mut *results.lock().expect("probe results poisoned"));
        let mut texts = Vec::with_capacity(results.len());
        let mut status_error: Option<u16> = None;
        let mut failed = false;
        for slot in results {
            match slot {
                Some(Ok(text)) => texts.push(text),
                Some(Err(EngineError::HttpStatus(code))) => {
                    status_error.get_or_insert(code);
                    failed = true;
                    texts.push(String::new());
                }
                Some(Err(e)) => {
                    debug!(error = %e, "manifest fetch failed");
                    failed = true;
                    texts.push(String::new());
                }
                None => {
                    failed = true;
                    texts.push(String::new());
                }
            }
        }
        if let Some(code) = status_error {
            return Err(EngineError::HttpStatus(code));
        }
        if failed {
            return Err(EngineError::Generic("unable to download manifest".to_string()));
        }
        Ok(texts)
    }

    fn normalize_http(&self, url: &str) -> EngineResult<Vec<Piece>> {
        let probe = self.client.probe(&self.request_context_for(url))?;
        self.cancel.check()?;
        if !(200..300).contains(&probe.status) {
            return Err(EngineError::HttpStatus(probe.status));
        }

        let pieces = match (probe.accept_ranges, probe.length) {
            (true, Some(length)) if length >= self.config.min_split_size => {
                let min_split = self.config.min_split_size.max(1);
                let count = self
                    .config
                    .max_parallel
                    .min((length / min_split) as usize)
                    .max(1);
                let piece_size = length / count as u64;
                (0..count)
                    .map(|i| {
                        let offset = i as u64 * piece_size;
                        let piece_length = if i == count - 1 {
                            length - offset
                        } else {
                            piece_size
                        };
                        Piece::new(url, offset, Some(piece_length), StreamKind::Primary, None)
                    })
                    .collect()
            }
            _ => vec![Piece::new(url, 0, probe.length, StreamKind::Primary, None)],
        };

        let mut state = self.state.lock();
        state.file_size = probe.length;
        state.video_piece_count = pieces.len();
        // A plain resource is a single remote entity; record its freshness
        // for resume validation right away.
        let validation = state.validation_mut(StreamKind::Primary);
        validation.size = probe.length;
        validation.last_modified = probe.last_modified;
        if state.target_file.is_empty() {
            state.target_file = sanitize_file_name(&segment_file_name(url));
        }
        info!(
            pieces = pieces.len(),
            size = ?probe.length,
            ranged = probe.accept_ranges,
            "normalized plain HTTP download"
        );
        Ok(pieces)
    }

    fn normalize_hls_muxed(&self, playlist_url: &str) -> EngineResult<Vec<Piece>> {
        let base = parse_manifest_url(playlist_url)?;
        let texts = self.probe_manifests(&[playlist_url.to_string()])?;
        let playlist = parse_media_playlist(&texts[0], &base)?;

        let format = playlist.container_format();
        let pieces = playlist_pieces(&playlist, StreamKind::Primary);

        let mut state = self.state.lock();
        state.file_size = None;
        state.duration = playlist.total_duration();
        state.video_piece_count = pieces.len();
        state.video_format = Some(format.clone());
        state.target_file = hls::replace_extension(
            non_empty_or(&state.target_file, "video"),
            &hls::guess_target_extension(&format, None),
        );
        info!(
            pieces = pieces.len(),
            duration = state.duration,
            format = %format,
            "normalized muxed HLS download"
        );
        Ok(pieces)
    }

    fn normalize_hls_demuxed(&self, video_url: &str, audio_url: &str) -> EngineResult<Vec<Piece>> {
        let video_base = parse_manifest_url(video_url)?;
        let audio_base = parse_manifest_url(audio_url)?;
        let texts = self.probe_manifests(&[video_url.to_string(), audio_url.to_string()])?;
        let video = parse_media_playlist(&texts[0], &video_base)?;
        let audio = parse_media_playlist(&texts[1], &audio_base)?;

        let video_pieces = playlist_pieces(&video, StreamKind::Primary);
        let audio_pieces = playlist_pieces(&audio, StreamKind::Secondary);
        let video_format = video.container_format();
        let audio_format = audio.container_format();

        let mut state = self.state.lock();
        state.file_size = None;
        state.duration = video.total_duration().max(audio.total_duration());
        state.video_piece_count = video_pieces.len();
        state.audio_piece_count = audio_pieces.len();
        state.video_format = Some(video_format.clone());
        state.audio_format = Some(audio_format.clone());
        state.target_file = hls::replace_extension(
            non_empty_or(&state.target_file, "video"),
            &hls::guess_target_extension(&video_format, Some(&audio_format)),
        );
        info!(
            video_pieces = video_pieces.len(),
            audio_pieces = audio_pieces.len(),
            duration = state.duration,
            "normalized demuxed HLS download"
        );
        Ok(interleave(video_pieces, audio_pieces))
    }

    fn normalize_dash(
        &self,
        video_segments: &[String],
        audio_segments: &[String],
        duration: f64,
    ) -> EngineResult<Vec<Piece>> {
        if video_segments.is_empty() {
            return Err(EngineError::ManifestParse(
                "DASH source has no video segments".to_string(),
            ));
        }
        let video_pieces: Vec<Piece> = video_segments
            .iter()
            .map(|url| Piece::new(url.clone(), 0, None, StreamKind::Primary, None))
            .collect();
        let audio_pieces: Vec<Piece> = audio_segments
            .iter()
            .map(|url| Piece::new(url.clone(), 0, None, StreamKind::Secondary, None))
            .collect();

        let video_format = hls::extension_of(&segment_file_name(
            video_segments.last().expect("checked non-empty"),
        ));
        let audio_format = audio_segments
            .last()
            .map(|url| hls::extension_of(&segment_file_name(url)));

        let mut state = self.state.lock();
        state.file_size = None;
        state.duration = duration;
        state.video_piece_count = video_pieces.len();
        state.audio_piece_count = audio_pieces.len();
        state.video_format = Some(video_format.clone());
        state.audio_format = audio_format.clone();
        state.target_file = hls::replace_extension(
            non_empty_or(&state.target_file, "video"),
            &hls::guess_target_extension(&video_format, audio_format.as_deref()),
        );
        info!(
            video_pieces = video_pieces.len(),
            audio_pieces = audio_pieces.len(),
            duration,
            "normalized DASH download"
        );
        Ok(interleave(video_pieces, audio_pieces))
    }
}

fn parse_manifest_url(url: &str) -> EngineResult<Url> {
    Url::parse(url).map_err(|e| EngineError::ManifestParse(format!("bad manifest url {url}: {e}")))
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn playlist_pieces(playlist: &HlsPlaylist, stream: StreamKind) -> Vec<Piece> {
    playlist
        .segments
        .iter()
        .map(|segment| {
            let (offset, length) = match segment.byte_range {
                Some((offset, length)) => (offset, Some(length)),
                None => (0, None),
            };
            Piece::new(
                segment.url.as_str(),
                offset,
                length,
                stream,
                Some(segment.duration),
            )
        })
        .collect()
}

/// Pairwise interleave up to the shorter list, remainder appended.
///
/// This spreads early worker attention across both tracks so neither
/// starves; it is a scheduling hint only and implies nothing about the
/// order pieces finish in.
fn interleave(video: Vec<Piece>, audio: Vec<Piece>) -> Vec<Piece> {
    let mut pieces = Vec::with_capacity(video.len() + audio.len());
    let common = video.len().min(audio.len());
    let mut video = video.into_iter();
    let mut audio = audio.into_iter();
    for _ in 0..common {
        pieces.push(video.next().expect("bounded by common length"));
        pieces.push(audio.next().expect("bounded by common length"));
    }
    pieces.extend(video);
    pieces.extend(audio);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(stream: StreamKind, tag: usize) -> Piece {
        Piece::new(
            format!("http://m.example/{stream:?}/{tag}.ts"),
            0,
            None,
            stream,
            Some(4.0),
        )
    }

    #[test]
    fn test_interleave_pairs_then_remainder() {
        let video: Vec<Piece> = (0..5).map(|i| piece(StreamKind::Primary, i)).collect();
        let audio: Vec<Piece> = (0..3).map(|i| piece(StreamKind::Secondary, i)).collect();
        let video_ids: Vec<_> = video.iter().map(|p| p.id).collect();
        let audio_ids: Vec<_> = audio.iter().map(|p| p.id).collect();

        let pieces = interleave(video, audio);
        assert_eq!(pieces.len(), 8);

        // Three video/audio pairs for indices 0-2, then the remaining
        // video pieces 3-4 appended.
        let expected_streams = [
            StreamKind::Primary,
            StreamKind::Secondary,
            StreamKind::Primary,
            StreamKind::Secondary,
            StreamKind::Primary,
            StreamKind::Secondary,
            StreamKind::Primary,
            StreamKind::Primary,
        ];
        for (piece, expected) in pieces.iter().zip(expected_streams) {
            assert_eq!(piece.stream, expected);
        }
        assert_eq!(pieces[0].id, video_ids[0]);
        assert_eq!(pieces[1].id, audio_ids[0]);
        assert_eq!(pieces[5].id, audio_ids[2]);
        assert_eq!(pieces[6].id, video_ids[3]);
        assert_eq!(pieces[7].id, video_ids[4]);
    }

    #[test]
    fn test_interleave_empty_audio_keeps_video_order() {
        let video: Vec<Piece> = (0..3).map(|i| piece(StreamKind::Primary, i)).collect();
        let ids: Vec<_> = video.iter().map(|p| p.id).collect();
        let pieces = interleave(video, Vec::new());
        assert_eq!(pieces.iter().map(|p| p.id).collect::<Vec<_>>(), ids);
    }
}
