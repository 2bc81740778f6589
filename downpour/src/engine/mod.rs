//! Download orchestrator.
//!
//! The [`Downloader`] owns the piece list and the temp-file map, runs a
//! bounded pool of OS worker threads against `Ready` pieces, aggregates
//! byte progress, drives periodic snapshotting through the crash-safe
//! store, and hands finished per-stream files to the [`Muxer`] collaborator
//! once every piece is done. On restart, [`Downloader::restore`] reloads
//! the last valid snapshot and resumes only unfinished pieces.
//!
//! Shared-resource discipline: one `parking_lot::Mutex` around the piece
//! table per download (snapshotting reads under the same lock), atomic
//! aggregate counters for progress, and a single shared speed limiter
//! consulted by every worker. Cancellation is cooperative and never
//! invalidates the last successful snapshot.

mod normalize;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::{DownloadEvent, EventPublisher};
use crate::http::{BasicAuth, HttpClient, ProbeResult, RequestContext};
use crate::io;
use crate::muxer::{Muxer, StreamFiles};
use crate::piece::{sanitize_file_name, Piece, PieceFileMap, PieceState, PieceTable, StreamKind};
use crate::state::{DownloadState, SourceKind, StreamValidation, SNAPSHOT_FILE};
use crate::sync::{CancelToken, Latch};
use crate::throttle::SpeedLimiter;
use crate::worker::{PieceCallback, PieceWorker};

/// Minimum interval between progress events.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a caller provides to create a new download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: SourceKind,
    /// Suggested output file name; may be empty (derived from the source)
    /// and has its extension re-derived for adaptive media.
    pub file_name: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Option<String>,
    pub auth: Option<BasicAuth>,
    pub proxy: Option<String>,
}

impl DownloadRequest {
    pub fn new(source: SourceKind) -> Self {
        Self {
            source,
            file_name: String::new(),
            headers: Vec::new(),
            cookies: None,
            auth: None,
            proxy: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }
}

/// Handle to one download. Cloning is cheap; all clones drive the same
/// download, so `stop` can be called from a signal handler while `start`
/// blocks on another thread.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader").finish_non_exhaustive()
    }
}

impl Downloader {
    /// Create a new download. The temp directory and the initial state
    /// record are created immediately; no manifest is fetched until
    /// [`Downloader::start`].
    pub fn new(
        config: EngineConfig,
        request: DownloadRequest,
        client: Arc<dyn HttpClient>,
        muxer: Arc<dyn Muxer>,
    ) -> EngineResult<Self> {
        let id = Uuid::new_v4().to_string();
        let temp_dir = config.temp_dir.join(&id);
        fs::create_dir_all(&temp_dir)?;

        let mut state = DownloadState::new(
            &id,
            request.source,
            temp_dir,
            config.target_dir.clone(),
            sanitize_file_name(&request.file_name),
        );
        state.headers = request.headers;
        state.cookies = request.cookies;
        state.auth = request.auth;
        state.proxy = request.proxy;
        state.save()?;

        info!(download = %id, "created download");
        Ok(Self {
            shared: Arc::new(Shared::new(config, state, PieceTable::default(), client, muxer)),
        })
    }

    /// Reload a download from its temp directory.
    ///
    /// A failed snapshot read is fatal for the resume attempt: without a
    /// valid piece list there is no safe state to resume from.
    pub fn restore(
        config: EngineConfig,
        temp_dir: &Path,
        client: Arc<dyn HttpClient>,
        muxer: Arc<dyn Muxer>,
    ) -> EngineResult<Self> {
        let state = DownloadState::load(temp_dir)?;
        let payload = io::read_framed(temp_dir, SNAPSHOT_FILE)?.ok_or_else(|| {
            EngineError::Persistence(format!(
                "no valid piece snapshot in {}",
                temp_dir.display()
            ))
        })?;
        let pieces: Vec<Piece> = bincode::deserialize(&payload)
            .map_err(|e| EngineError::Persistence(format!("decoding piece snapshot: {e}")))?;

        let mut table = PieceTable::new(pieces);
        // A restore begins a new download attempt: in-flight pieces resume
        // as ready, and pieces that exhausted the previous attempt's retry
        // budget get a fresh one.
        table.demote_in_flight();
        table.rearm_failed();

        // Reconcile byte counters with what actually reached the disk; a
        // crash can lose a partially flushed tail.
        let file_map = PieceFileMap::build(&state.temp_dir, table.pieces());
        for piece in table.iter_mut() {
            if piece.downloaded == 0 || piece.is_absorbed() {
                continue;
            }
            let on_disk = file_map
                .get(piece.id)
                .and_then(|path| fs::metadata(path).ok())
                .map(|m| m.len())
                .unwrap_or(0);
            if on_disk < piece.downloaded {
                debug!(piece = %piece.id, counter = piece.downloaded, on_disk, "rewinding piece to on-disk bytes");
                piece.downloaded = on_disk;
                if piece.state == PieceState::Finished {
                    piece.state = PieceState::Ready;
                }
            }
        }

        let finished = table.count_state(PieceState::Finished);
        info!(
            download = %state.id,
            pieces = table.len(),
            finished,
            "restored download from snapshot"
        );
        Ok(Self {
            shared: Arc::new(Shared::new(config, state, table, client, muxer)),
        })
    }

    pub fn id(&self) -> String {
        self.shared.id.clone()
    }

    /// Subscribe to the download's event channel.
    pub fn subscribe(&self) -> Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Current aggregate progress as `(downloaded, total)`.
    pub fn progress(&self) -> (u64, Option<u64>) {
        (
            self.shared.downloaded.load(Ordering::SeqCst),
            self.shared.state.lock().file_size,
        )
    }

    /// Run the download to completion, failure or cancellation. Blocks the
    /// calling thread; progress is observable through [`subscribe`].
    ///
    /// [`subscribe`]: Downloader::subscribe
    pub fn start(&self) -> EngineResult<()> {
        let result = self.shared.run();
        match &result {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                self.shared.events.publish(DownloadEvent::Cancelled {
                    id: self.shared.id.clone(),
                });
            }
            Err(e) => {
                self.shared.events.publish(DownloadEvent::Failed {
                    id: self.shared.id.clone(),
                    kind: e.kind(),
                });
            }
        }
        result
    }

    /// Signal cancellation to the probe threads and every active worker.
    /// Safe to call from any thread; `start` returns once workers unwind.
    pub fn stop(&self) {
        info!(download = %self.shared.id, "stop requested");
        self.shared.cancel.cancel();
        if let Some(latch) = self.shared.probe_latch.lock().as_ref() {
            latch.break_latch();
        }
    }

    /// Remove the download entirely: temp files and persisted records.
    /// Distinct from completion, which retains the state record. Call
    /// after `start` has returned.
    pub fn delete(&self) -> EngineResult<()> {
        self.stop();
        let temp_dir = self.shared.state.lock().temp_dir.clone();
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        info!(download = %self.shared.id, "deleted download");
        Ok(())
    }
}

/// State shared between the orchestrator and its worker threads. Also the
/// [`PieceCallback`] implementation handed to workers.
struct Shared {
    id: String,
    config: EngineConfig,
    client: Arc<dyn HttpClient>,
    muxer: Arc<dyn Muxer>,

    state: Mutex<DownloadState>,
    pieces: Mutex<PieceTable>,
    file_map: Mutex<PieceFileMap>,
    /// Pieces whose stream was reset while their worker was still in
    /// flight; reports from those workers are ignored and the piece is
    /// re-armed once the worker has released it.
    revoked: Mutex<HashSet<Uuid>>,

    limiter: SpeedLimiter,
    cancel: CancelToken,
    events: EventPublisher,
    probe_latch: Mutex<Option<Arc<Latch>>>,

    downloaded: AtomicU64,
    last_snapshot: Mutex<Instant>,
    last_progress_event: Mutex<Instant>,
    last_error: Mutex<Option<ErrorKind>>,
}

impl Shared {
    fn new(
        config: EngineConfig,
        state: DownloadState,
        pieces: PieceTable,
        client: Arc<dyn HttpClient>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        let downloaded = pieces.total_downloaded();
        let file_map = PieceFileMap::build(&state.temp_dir, pieces.pieces());
        let limiter = SpeedLimiter::new(config.speed_limit);
        Self {
            id: state.id.clone(),
            config,
            client,
            muxer,
            state: Mutex::new(state),
            pieces: Mutex::new(pieces),
            file_map: Mutex::new(file_map),
            revoked: Mutex::new(HashSet::new()),
            limiter,
            cancel: CancelToken::new(),
            events: EventPublisher::new(),
            probe_latch: Mutex::new(None),
            downloaded: AtomicU64::new(downloaded),
            last_snapshot: Mutex::new(Instant::now()),
            last_progress_event: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
        }
    }

    fn run(self: &Arc<Self>) -> EngineResult<()> {
        self.events.publish(DownloadEvent::Started {
            id: self.id.clone(),
        });

        if self.pieces.lock().is_empty() {
            let pieces = self.normalize()?;
            let temp_dir = {
                let state = self.state.lock();
                state.temp_dir.clone()
            };
            *self.file_map.lock() = PieceFileMap::build(&temp_dir, &pieces);
            *self.pieces.lock() = PieceTable::new(pieces);
            self.state.lock().save()?;
            // The initial snapshot must exist before any worker runs; a
            // failure here aborts while no partial state exists yet.
            let payload = bincode::serialize(self.pieces.lock().pieces())
                .map_err(|e| EngineError::Persistence(format!("encoding snapshot: {e}")))?;
            io::write_framed(&temp_dir, SNAPSHOT_FILE, &payload)?;
        }

        if self.pieces.lock().all_finished() {
            // Crash-after-complete recovery: everything was downloaded but
            // finalization never ran (or never finished).
            return self.finalize();
        }

        self.run_pool();

        if self.cancel.is_cancelled() {
            self.pieces.lock().demote_in_flight();
            self.snapshot(true);
            return Err(EngineError::Cancelled);
        }

        if self.pieces.lock().all_finished() {
            self.finalize()
        } else {
            self.snapshot(true);
            let kind = self.last_error.lock().unwrap_or(ErrorKind::Generic);
            Err(error_from_kind(kind))
        }
    }

    /// Run the bounded worker pool until no piece is ready, re-arming
    /// failed pieces between passes while the retry budget lasts.
    fn run_pool(self: &Arc<Self>) {
        let mut retries_used = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let ready = self.pieces.lock().count_state(PieceState::Ready);
            if ready > 0 {
                let workers = ready.min(self.config.max_parallel.max(1));
                debug!(workers, ready, "spawning worker pool");
                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        let shared = Arc::clone(self);
                        thread::spawn(move || shared.worker_loop())
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
                continue;
            }
            let failed = self.pieces.lock().count_state(PieceState::Failed);
            if failed > 0 && retries_used < self.config.max_retries {
                retries_used += 1;
                let rearmed = self.pieces.lock().rearm_failed();
                info!(attempt = retries_used, rearmed, "retrying failed pieces");
                continue;
            }
            break;
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let worker = PieceWorker::new(
            Arc::clone(&self) as Arc<dyn PieceCallback>,
            Arc::clone(&self.client),
            self.cancel.clone(),
            self.config.coalesce_max,
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let claimed = self.pieces.lock().claim_next_ready();
            let Some(id) = claimed else {
                break;
            };
            worker.run(id);
            self.release(id);
        }
    }

    /// Called when a worker is done with a piece, successful or not. If the
    /// piece was revoked mid-flight by a stream reset, it is only now safe
    /// to re-arm it from zero (no writer left).
    fn release(&self, id: Uuid) {
        let path = {
            let mut pieces = self.pieces.lock();
            let mut revoked = self.revoked.lock();
            if !revoked.remove(&id) {
                return;
            }
            if let Some(piece) = pieces.get_mut(id) {
                piece.downloaded = 0;
                piece.state = PieceState::Ready;
            }
            self.file_map.lock().get(id).cloned()
        };
        if let Some(path) = path {
            let _ = fs::remove_file(path);
        }
    }

    /// Restart every piece of `stream` from offset zero after a server
    /// content change, so the output never mixes bytes of two different
    /// remote versions.
    fn reset_stream_for(&self, id: Uuid) {
        let mut to_delete = Vec::new();
        let stream = {
            let mut pieces = self.pieces.lock();
            let mut revoked = self.revoked.lock();
            let Some(stream) = pieces.get(id).map(|p| p.stream) else {
                return;
            };
            for piece in pieces.iter_mut().filter(|p| p.stream == stream) {
                self.downloaded.fetch_sub(piece.downloaded, Ordering::SeqCst);
                if matches!(piece.state, PieceState::Connecting | PieceState::Downloading)
                    && piece.id != id
                {
                    // Another worker still owns this piece; freeze its
                    // reports and re-arm it on release.
                    revoked.insert(piece.id);
                    continue;
                }
                if piece.is_absorbed() {
                    piece.downloaded = 0;
                    continue;
                }
                piece.downloaded = 0;
                piece.state = PieceState::Ready;
                to_delete.push(piece.id);
            }
            let mut state = self.state.lock();
            *state.validation_mut(stream) = StreamValidation::default();
            if let Err(e) = state.save() {
                warn!(error = %e, "state save failed after stream reset");
            }
            stream
        };
        warn!(?stream, "server content changed, restarting stream from zero");
        {
            let file_map = self.file_map.lock();
            for id in to_delete {
                if let Some(path) = file_map.get(id) {
                    let _ = fs::remove_file(path);
                }
            }
        }
        self.snapshot(true);
    }

    /// Persist the piece list through the dual-slot store. Interval-gated
    /// unless `force`d; a failed write is logged and the previous snapshot
    /// stays in place.
    fn snapshot(&self, force: bool) {
        {
            let mut last = self.last_snapshot.lock();
            if !force && last.elapsed() < self.config.snapshot_interval {
                return;
            }
            *last = Instant::now();
        }
        let (payload, temp_dir) = {
            let pieces = self.pieces.lock();
            let mut list = pieces.pieces().to_vec();
            // Snapshots only ever record Ready/Finished/Failed; in-flight
            // pieces resume as Ready with their partial byte count.
            for piece in &mut list {
                if matches!(piece.state, PieceState::Connecting | PieceState::Downloading) {
                    piece.state = PieceState::Ready;
                }
            }
            (bincode::serialize(&list), self.state.lock().temp_dir.clone())
        };
        match payload {
            Ok(bytes) => {
                if let Err(e) = io::write_framed(&temp_dir, SNAPSHOT_FILE, &bytes) {
                    warn!(error = %e, "snapshot write failed; continuing with in-memory state");
                }
            }
            Err(e) => warn!(error = %e, "snapshot encoding failed"),
        }
    }

    fn maybe_emit_progress(&self) {
        {
            let mut last = self.last_progress_event.lock();
            if last.elapsed() < PROGRESS_EVENT_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        self.emit_progress();
    }

    fn emit_progress(&self) {
        self.events.publish(DownloadEvent::Progress {
            id: self.id.clone(),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            total: self.state.lock().file_size,
        });
    }

    fn request_context_for(&self, url: &str) -> RequestContext {
        let state = self.state.lock();
        RequestContext {
            url: url.to_string(),
            headers: state.headers.clone(),
            cookies: state.cookies.clone(),
            auth: state.auth.clone(),
        }
    }

    /// Hand the ordered per-stream finished files to the muxer, then mark
    /// the download complete. Re-attempted on restart if a crash lands
    /// between all-pieces-finished and here.
    fn finalize(&self) -> EngineResult<()> {
        let (streams, target) = {
            let pieces = self.pieces.lock();
            let file_map = self.file_map.lock();
            let state = self.state.lock();
            let mut primary = Vec::new();
            let mut secondary = Vec::new();
            for piece in pieces.pieces() {
                if piece.is_absorbed() {
                    continue;
                }
                let path = file_map.get(piece.id).cloned().ok_or_else(|| {
                    EngineError::Generic(format!("no temp file mapped for piece {}", piece.id))
                })?;
                match piece.stream {
                    StreamKind::Primary => primary.push(path),
                    StreamKind::Secondary => secondary.push(path),
                }
            }
            let mut streams = vec![StreamFiles {
                kind: StreamKind::Primary,
                files: primary,
            }];
            if state.demuxed {
                streams.push(StreamFiles {
                    kind: StreamKind::Secondary,
                    files: secondary,
                });
            }
            (streams, state.target_path())
        };

        info!(target = %target.display(), "finalizing download");
        self.muxer.mux(&streams, &target)?;

        {
            let mut state = self.state.lock();
            state.completed = true;
            if let Err(e) = state.save() {
                warn!(error = %e, "state save failed after finalization");
            }
        }
        self.snapshot(true);
        self.emit_progress();
        self.events.publish(DownloadEvent::Finished {
            id: self.id.clone(),
            target,
        });
        Ok(())
    }
}

impl PieceCallback for Shared {
    fn is_first_request(&self, stream: StreamKind) -> bool {
        *self.state.lock().validation(stream) == StreamValidation::default()
    }

    fn resource_changed(
        &self,
        stream: StreamKind,
        length: Option<u64>,
        last_modified: Option<DateTime<Utc>>,
    ) -> bool {
        let state = self.state.lock();
        let stored = state.validation(stream);
        if let (Some(stored), Some(observed)) = (stored.last_modified, last_modified) {
            if stored != observed {
                return true;
            }
        }
        if let (Some(stored), Some(observed)) = (stored.size, length) {
            if stored != observed {
                return true;
            }
        }
        false
    }

    fn piece(&self, id: Uuid) -> Option<Piece> {
        self.pieces.lock().get(id).cloned()
    }

    fn piece_file(&self, id: Uuid) -> Option<PathBuf> {
        self.file_map.lock().get(id).cloned()
    }

    fn request_context(&self, id: Uuid) -> Option<RequestContext> {
        let url = self.pieces.lock().get(id)?.uri.clone();
        Some(self.request_context_for(&url))
    }

    fn piece_connected(&self, id: Uuid, probe: &ProbeResult) {
        let (stream, resource_total, single_resource) = {
            let mut pieces = self.pieces.lock();
            if self.revoked.lock().contains(&id) {
                return;
            }
            let Some(piece) = pieces.get_mut(id) else {
                return;
            };
            piece.state = PieceState::Downloading;
            if probe.resume_offset < piece.downloaded {
                let lost = piece.downloaded - probe.resume_offset;
                piece.downloaded = probe.resume_offset;
                self.downloaded.fetch_sub(lost, Ordering::SeqCst);
            }
            if piece.length.is_none() {
                if let Some(length) = probe.length {
                    piece.length = Some(probe.resume_offset + length);
                }
            }
            let resource_total = match probe.status {
                206 => probe
                    .length
                    .map(|length| piece.offset + probe.resume_offset + length),
                _ => probe.length,
            };
            let stream = piece.stream;
            let uri = piece.uri.clone();
            let single_resource = pieces
                .pieces()
                .iter()
                .filter(|p| p.stream == stream)
                .all(|p| p.uri == uri);
            (stream, resource_total, single_resource)
        };

        let total = self.pieces.lock().resolved_total();
        let mut state = self.state.lock();
        state.file_size = total;
        // Freshness is only meaningful when the whole stream is one remote
        // resource (plain HTTP pieces, byte-range playlists).
        if single_resource {
            let validation = state.validation_mut(stream);
            if *validation == StreamValidation::default() {
                validation.size = resource_total;
                validation.last_modified = probe.last_modified;
                if let Err(e) = state.save() {
                    warn!(error = %e, "state save failed after first connect");
                }
            }
        }
    }

    fn bytes_downloaded(&self, id: Uuid, bytes: u64) {
        {
            let mut pieces = self.pieces.lock();
            if self.revoked.lock().contains(&id) {
                return;
            }
            let Some(piece) = pieces.get_mut(id) else {
                return;
            };
            piece.downloaded += bytes;
        }
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
        self.limiter.record(bytes);
        self.maybe_emit_progress();
        self.snapshot(false);
    }

    fn coalesce_with_next(&self, id: Uuid, max_bytes: u64) -> bool {
        let mut pieces = self.pieces.lock();
        if self.revoked.lock().contains(&id) {
            return false;
        }
        pieces.coalesce_adjacent(id, max_bytes)
    }

    fn piece_failed(&self, id: Uuid, kind: ErrorKind) {
        {
            let mut pieces = self.pieces.lock();
            if self.revoked.lock().contains(&id) {
                return;
            }
            if kind != ErrorKind::ContentChanged {
                if let Some(piece) = pieces.get_mut(id) {
                    piece.state = PieceState::Failed;
                }
            }
        }
        if kind == ErrorKind::ContentChanged {
            self.reset_stream_for(id);
            return;
        }
        self.last_error.lock().get_or_insert(kind);
        self.snapshot(true);
    }

    fn piece_finished(&self, id: Uuid) {
        {
            let mut pieces = self.pieces.lock();
            if self.revoked.lock().contains(&id) {
                return;
            }
            if let Some(piece) = pieces.get_mut(id) {
                if piece.length.is_none() {
                    piece.length = Some(piece.downloaded);
                }
                piece.state = PieceState::Finished;
            }
        }
        debug!(piece = %id, "piece finished");
        self.maybe_emit_progress();
        self.snapshot(true);
    }

    fn throttle(&self) {
        self.limiter.pause_if_needed();
    }

    fn text_redirect_allowed(&self) -> bool {
        self.config.allow_text_redirect
    }
}

fn error_from_kind(kind: ErrorKind) -> EngineError {
    match kind {
        ErrorKind::Network => EngineError::Network("piece download failed".to_string()),
        ErrorKind::HttpStatus(code) => EngineError::HttpStatus(code),
        ErrorKind::ContentChanged => EngineError::ContentChanged,
        ErrorKind::ManifestParse => EngineError::ManifestParse("manifest rejected".to_string()),
        ErrorKind::TextRedirect => EngineError::TextRedirect,
        ErrorKind::Persistence => EngineError::Persistence("snapshot failure".to_string()),
        ErrorKind::Io => EngineError::Generic("local i/o failure".to_string()),
        ErrorKind::Cancelled => EngineError::Cancelled,
        ErrorKind::Generic => EngineError::Generic("download failed".to_string()),
    }
}
