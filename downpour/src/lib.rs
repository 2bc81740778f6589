//! Downpour - segmented, resumable, multi-source download engine.
//!
//! The engine splits a remote resource (a plain HTTP file, or an HLS/DASH
//! adaptive-media stream) into independently fetchable pieces, downloads
//! them concurrently on a bounded pool of worker threads, tracks partial
//! progress durably so a killed process loses no completed work, and hands
//! the finished pieces to a finalizer that assembles the output file.
//!
//! The main entry point is [`engine::Downloader`]; collaborators (HTTP
//! transport, muxer) are injected at construction so nothing here depends
//! on a concrete transport or a UI toolkit.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hls;
pub mod http;
pub mod io;
pub mod muxer;
pub mod piece;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod throttle;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{DownloadRequest, Downloader};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::DownloadEvent;
pub use http::{HttpClient, ReqwestClient};
pub use muxer::{ConcatMuxer, Muxer};
pub use state::SourceKind;
