//! Piece download worker.
//!
//! One worker owns a single piece's HTTP lifecycle: range request,
//! validation of what the server actually honored, streaming the body to
//! the piece's temp file, adjacent-piece coalescing and cooperative
//! throttling/cancellation. Everything a worker needs from the rest of the
//! engine goes through the [`PieceCallback`] contract, which is the seam at
//! which plain HTTP, demuxed HLS and DASH downloads all look identical.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::http::{ByteRange, HttpClient, ProbeResult, RequestContext};
use crate::piece::{Piece, StreamKind};
use crate::sync::CancelToken;

/// Read/write buffer size while streaming (64 KiB).
pub const BUFFER_SIZE: usize = 64 * 1024;

/// The orchestrator-side contract consumed by piece workers.
///
/// Downloader variants differ only in how they produce pieces; through this
/// trait every variant services its workers the same way.
pub trait PieceCallback: Send + Sync {
    /// Whether no piece of `stream` has connected yet in the lifetime of
    /// this download (including previous sessions).
    fn is_first_request(&self, stream: StreamKind) -> bool;

    /// Resume validation: has the remote resource mutated since the last
    /// successfully written byte of `stream`?
    fn resource_changed(
        &self,
        stream: StreamKind,
        length: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
    ) -> bool;

    fn piece(&self, id: Uuid) -> Option<Piece>;
    fn piece_file(&self, id: Uuid) -> Option<PathBuf>;

    /// Per-piece request context; pieces of one download may carry
    /// different effective headers.
    fn request_context(&self, id: Uuid) -> Option<RequestContext>;

    /// The worker resolved the effective range/length for a piece.
    fn piece_connected(&self, id: Uuid, probe: &ProbeResult);

    /// Incremental progress, aggregated across all pieces.
    fn bytes_downloaded(&self, id: Uuid, bytes: u64);

    /// Ask to keep the current connection open across the piece boundary
    /// into the adjacent contiguous piece, extending this piece by at most
    /// `max_bytes`. Returns whether the merge happened.
    fn coalesce_with_next(&self, id: Uuid, max_bytes: u64) -> bool;

    fn piece_failed(&self, id: Uuid, kind: ErrorKind);
    fn piece_finished(&self, id: Uuid);

    /// Cooperative yield point enforcing the shared speed limit.
    fn throttle(&self);

    /// Whether a redirect that lands on a text page may be saved as file
    /// content.
    fn text_redirect_allowed(&self) -> bool;
}

/// Runs one piece to completion or classified failure.
pub struct PieceWorker {
    callback: Arc<dyn PieceCallback>,
    client: Arc<dyn HttpClient>,
    cancel: CancelToken,
    coalesce_max: u64,
}

impl PieceWorker {
    pub fn new(
        callback: Arc<dyn PieceCallback>,
        client: Arc<dyn HttpClient>,
        cancel: CancelToken,
        coalesce_max: u64,
    ) -> Self {
        Self {
            callback,
            client,
            cancel,
            coalesce_max,
        }
    }

    /// Drive the piece and report the outcome through the callback.
    ///
    /// Cancellation is not a piece failure: the piece is left where it was
    /// and the orchestrator demotes it for the snapshot.
    pub fn run(&self, id: Uuid) {
        match self.download(id) {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                debug!(piece = %id, "piece download cancelled");
            }
            Err(e) => {
                warn!(piece = %id, error = %e, "piece download failed");
                self.callback.piece_failed(id, e.kind());
            }
        }
    }

    fn download(&self, id: Uuid) -> EngineResult<()> {
        self.cancel.check()?;
        let piece = self
            .callback
            .piece(id)
            .ok_or_else(|| EngineError::Generic(format!("unknown piece {id}")))?;
        if matches!(piece.length, Some(length) if piece.downloaded >= length) {
            self.callback.piece_finished(id);
            return Ok(());
        }
        let path = self
            .callback
            .piece_file(id)
            .ok_or_else(|| EngineError::Generic(format!("no temp file for piece {id}")))?;
        let ctx = self
            .callback
            .request_context(id)
            .ok_or_else(|| EngineError::Generic(format!("no request context for piece {id}")))?;

        // Resume position: never trust the counter past what actually
        // reached the disk.
        let mut resume_from = piece.downloaded;
        if resume_from > 0 {
            let on_disk = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if on_disk < resume_from {
                debug!(piece = %id, counter = resume_from, on_disk, "partial tail lost, rewinding");
                resume_from = on_disk;
            }
        }

        let wants_range = piece.offset > 0 || piece.length.is_some() || resume_from > 0;
        let range = wants_range.then(|| ByteRange {
            start: piece.offset + resume_from,
            end: None,
        });
        let response = self.client.get(&ctx, range)?;
        self.cancel.check()?;

        if !response.is_success() {
            return Err(EngineError::HttpStatus(response.status));
        }
        if wants_range && response.status != 206 && piece.offset + resume_from > 0 {
            if piece.offset > 0 {
                // A mid-resource piece cannot be satisfied by a full-body
                // response.
                return Err(EngineError::HttpStatus(response.status));
            }
            debug!(piece = %id, "server ignored resume range, restarting from zero");
            resume_from = 0;
        }

        // CDN failure mode: a redirect that lands on an HTML/text error
        // page pretending to be the resource.
        if response.final_url != ctx.url {
            if let Some(content_type) = &response.content_type {
                if content_type.starts_with("text/") && !self.callback.text_redirect_allowed() {
                    return Err(EngineError::TextRedirect);
                }
            }
        }

        let observed_total = match response.status {
            206 => response
                .content_length
                .map(|length| piece.offset + resume_from + length),
            _ => response.content_length,
        };
        if !self.callback.is_first_request(piece.stream)
            && self
                .callback
                .resource_changed(piece.stream, observed_total, response.last_modified)
        {
            return Err(EngineError::ContentChanged);
        }

        self.callback.piece_connected(id, &response.probe(resume_from));
        let mut piece = self
            .callback
            .piece(id)
            .ok_or_else(|| EngineError::Generic(format!("piece {id} vanished after connect")))?;

        let file = if resume_from > 0 {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(resume_from)?;
            file.seek(SeekFrom::End(0))?;
            file
        } else {
            File::create(&path)?
        };
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let mut body = response.body;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut written = resume_from;

        loop {
            self.cancel.check()?;
            let to_read = match piece.length {
                Some(length) => {
                    let remaining = length.saturating_sub(written);
                    if remaining == 0 {
                        // Piece boundary reached on an open-ended range:
                        // the connection can service the adjacent piece.
                        if self.callback.coalesce_with_next(id, self.coalesce_max) {
                            piece = self.callback.piece(id).ok_or_else(|| {
                                EngineError::Generic(format!("piece {id} vanished during coalesce"))
                            })?;
                            continue;
                        }
                        break;
                    }
                    remaining.min(BUFFER_SIZE as u64) as usize
                }
                None => BUFFER_SIZE,
            };

            let read = body
                .read(&mut buffer[..to_read])
                .map_err(|e| EngineError::Network(format!("reading response body: {e}")))?;
            if read == 0 {
                if matches!(piece.length, Some(length) if written < length) {
                    return Err(EngineError::Network(
                        "connection closed before piece completed".to_string(),
                    ));
                }
                break;
            }

            writer.write_all(&buffer[..read])?;
            written += read as u64;
            self.callback.bytes_downloaded(id, read as u64);
            self.callback.throttle();
        }

        writer.flush()?;
        self.callback.piece_finished(id);
        Ok(())
    }
}
