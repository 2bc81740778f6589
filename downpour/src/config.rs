//! Engine configuration.
//!
//! `EngineConfig` is the collaborator bundle injected into every download at
//! construction; nothing in the engine reaches into process-wide state. An
//! optional INI file can override the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;

use crate::error::{EngineError, EngineResult};

/// Default number of concurrent piece workers.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Default orchestrator-owned retry budget per download.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default ceiling for extending a connection past a piece boundary when
/// coalescing adjacent pieces (256 KiB).
pub const DEFAULT_COALESCE_MAX: u64 = 256 * 1024;

/// Plain HTTP resources below this size are downloaded as a single piece
/// (1 MiB).
pub const DEFAULT_MIN_SPLIT_SIZE: u64 = 1024 * 1024;

/// Default total request timeout in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// Configuration injected into the orchestrator at download construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Parent directory for per-download temp directories.
    pub temp_dir: PathBuf,
    /// Directory for finalized output files.
    pub target_dir: PathBuf,
    /// Worker pool size.
    pub max_parallel: usize,
    /// Retry passes before a download is declared failed.
    pub max_retries: usize,
    /// Global speed cap in bytes per second; `None` disables throttling.
    pub speed_limit: Option<u64>,
    /// Minimum interval between piece-list snapshots driven by progress.
    pub snapshot_interval: Duration,
    /// Byte bound on adjacent-piece coalescing.
    pub coalesce_max: u64,
    /// Plain HTTP resources below this size stay a single piece.
    pub min_split_size: u64,
    pub connect_timeout: Duration,
    /// Total per-request timeout; `None` disables it.
    pub read_timeout: Option<Duration>,
    pub user_agent: String,
    /// Whether a redirect that lands on a text page may be saved as file
    /// content instead of being treated as a failure.
    pub allow_text_redirect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let downloads = dirs::download_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            temp_dir: std::env::temp_dir().join("downpour"),
            target_dir: downloads,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries: DEFAULT_MAX_RETRIES,
            speed_limit: None,
            snapshot_interval: Duration::from_secs(2),
            coalesce_max: DEFAULT_COALESCE_MAX,
            min_split_size: DEFAULT_MIN_SPLIT_SIZE,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Some(Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS)),
            user_agent: concat!("downpour/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_text_redirect: false,
        }
    }
}

impl EngineConfig {
    /// Set the worker pool size (minimum 1).
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Set the global speed cap in bytes per second.
    pub fn with_speed_limit(mut self, limit: Option<u64>) -> Self {
        self.speed_limit = limit;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Load overrides from an INI config file on top of the defaults.
    ///
    /// Recognized keys, all optional:
    ///
    /// ```ini
    /// [engine]
    /// temp_dir = /var/tmp/downpour
    /// target_dir = /home/user/Downloads
    /// max_parallel = 8
    /// max_retries = 3
    /// speed_limit_kib = 0        ; 0 disables the cap
    /// snapshot_interval_secs = 2
    /// coalesce_max_kib = 256
    /// min_split_kib = 1024
    ///
    /// [network]
    /// connect_timeout_secs = 30
    /// read_timeout_secs = 300    ; 0 disables the timeout
    /// user_agent = downpour/0.2
    /// allow_text_redirect = false
    /// ```
    pub fn load_ini(path: &Path) -> EngineResult<Self> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| EngineError::Generic(format!("reading config {}: {e}", path.display())))?;

        if let Some(section) = ini.section(Some("engine")) {
            if let Some(dir) = section.get("temp_dir") {
                config.temp_dir = PathBuf::from(dir);
            }
            if let Some(dir) = section.get("target_dir") {
                config.target_dir = PathBuf::from(dir);
            }
            if let Some(n) = parse_key(section.get("max_parallel"), path, "max_parallel")? {
                config.max_parallel = 1usize.max(n);
            }
            if let Some(n) = parse_key(section.get("max_retries"), path, "max_retries")? {
                config.max_retries = n;
            }
            if let Some(kib) = parse_key::<u64>(section.get("speed_limit_kib"), path, "speed_limit_kib")? {
                config.speed_limit = (kib > 0).then_some(kib * 1024);
            }
            if let Some(secs) =
                parse_key::<u64>(section.get("snapshot_interval_secs"), path, "snapshot_interval_secs")?
            {
                config.snapshot_interval = Duration::from_secs(secs);
            }
            if let Some(kib) = parse_key::<u64>(section.get("coalesce_max_kib"), path, "coalesce_max_kib")? {
                config.coalesce_max = kib * 1024;
            }
            if let Some(kib) = parse_key::<u64>(section.get("min_split_kib"), path, "min_split_kib")? {
                config.min_split_size = kib * 1024;
            }
        }

        if let Some(section) = ini.section(Some("network")) {
            if let Some(secs) =
                parse_key::<u64>(section.get("connect_timeout_secs"), path, "connect_timeout_secs")?
            {
                config.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_key::<u64>(section.get("read_timeout_secs"), path, "read_timeout_secs")? {
                config.read_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(agent) = section.get("user_agent") {
                config.user_agent = agent.to_string();
            }
            if let Some(flag) = section.get("allow_text_redirect") {
                config.allow_text_redirect = flag.eq_ignore_ascii_case("true") || flag == "1";
            }
        }

        Ok(config)
    }
}

fn parse_key<T: std::str::FromStr>(
    value: Option<&str>,
    path: &Path,
    key: &str,
) -> EngineResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            EngineError::Generic(format!(
                "invalid value for {key} in {}: {raw}",
                path.display()
            ))
        }),
    }
}
