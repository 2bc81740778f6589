//! Command-line front end for the downpour engine.
//!
//! Thin glue only: argument parsing, config loading, Ctrl-C wiring and
//! progress rendering. All download behavior lives in the `downpour`
//! library.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::debug;

use downpour::error::{EngineError, EngineResult};
use downpour::{
    ConcatMuxer, DownloadRequest, Downloader, EngineConfig, ReqwestClient, SourceKind,
};

#[derive(Parser, Debug)]
#[command(
    name = "downpour",
    version,
    about = "Segmented, resumable downloads for plain HTTP and adaptive media"
)]
struct Cli {
    /// URL of a plain HTTP resource to download.
    url: Option<String>,

    /// Muxed HLS media playlist URL.
    #[arg(long, conflicts_with = "url")]
    hls: Option<String>,

    /// Demuxed HLS video playlist URL (pair with --audio).
    #[arg(long, conflicts_with_all = ["url", "hls"], requires = "audio")]
    video: Option<String>,

    /// Demuxed HLS audio playlist URL.
    #[arg(long, requires = "video")]
    audio: Option<String>,

    /// Resume a previous download from its temp directory.
    #[arg(long, value_name = "DIR", conflicts_with_all = ["url", "hls", "video", "audio"])]
    resume: Option<PathBuf>,

    /// Output file name (extension may be adjusted for adaptive media).
    #[arg(short, long)]
    output: Option<String>,

    /// Number of concurrent piece workers.
    #[arg(long)]
    workers: Option<usize>,

    /// Global speed limit in KiB/s.
    #[arg(long)]
    limit: Option<u64>,

    /// Extra request header as `Name: value`. Repeatable.
    #[arg(long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// HTTP/HTTPS proxy URL.
    #[arg(long)]
    proxy: Option<String>,

    /// Config file (INI). Defaults to the user config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the rolling log file.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = downpour::telemetry::init(cli.log_dir.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("downpour: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> EngineResult<()> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| dirs::config_dir().map(|dir| dir.join("downpour/downpour.ini")));
    let mut config = match config_path {
        Some(path) => EngineConfig::load_ini(&path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_max_parallel(workers);
    }
    if let Some(limit) = cli.limit {
        config = config.with_speed_limit(Some(limit * 1024));
    }
    debug!(?config, "effective configuration");

    let client = Arc::new(ReqwestClient::new(&config, cli.proxy.as_deref())?);
    let muxer = Arc::new(ConcatMuxer);

    let downloader = match &cli.resume {
        Some(dir) => Downloader::restore(config, dir, client, muxer)?,
        None => {
            let mut request =
                DownloadRequest::new(source_from_args(&cli)?).with_file_name(
                    cli.output.clone().unwrap_or_default(),
                );
            request.headers = parse_headers(&cli.headers)?;
            request.proxy = cli.proxy.clone();
            Downloader::new(config, request, client, muxer)?
        }
    };
    eprintln!("download id: {} (resume with --resume)", downloader.id());

    let events = downloader.subscribe();
    let stopper = downloader.clone();
    ctrlc::set_handler(move || stopper.stop())
        .map_err(|e| EngineError::Generic(format!("installing signal handler: {e}")))?;

    let renderer = thread::spawn(move || progress::render(events));
    let result = downloader.start();
    let _ = renderer.join();
    result
}

fn source_from_args(cli: &Cli) -> EngineResult<SourceKind> {
    if let Some(url) = &cli.url {
        return Ok(SourceKind::Http { url: url.clone() });
    }
    if let Some(playlist_url) = &cli.hls {
        return Ok(SourceKind::HlsMuxed {
            playlist_url: playlist_url.clone(),
        });
    }
    if let (Some(video_url), Some(audio_url)) = (&cli.video, &cli.audio) {
        return Ok(SourceKind::HlsDemuxed {
            video_url: video_url.clone(),
            audio_url: audio_url.clone(),
        });
    }
    Err(EngineError::Generic(
        "nothing to download: pass a URL, --hls, or --video/--audio".to_string(),
    ))
}

fn parse_headers(raw: &[String]) -> EngineResult<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| {
                    EngineError::Generic(format!("malformed header (want `Name: value`): {header}"))
                })
        })
        .collect()
}
