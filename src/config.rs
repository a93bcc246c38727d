use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBackend {
    Meili,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub backend: SearchBackend,
    pub url: String,
    pub api_key: Option<String>,
    pub index: String,
    pub max_total_hits: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub previews_root: PathBuf,
    pub max_dimension: u32,
    pub quality: u8,
    pub check_rounds: u32,
    pub check_delay: Duration,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub filesystem_root: PathBuf,
    pub exclude_paths: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub db_path: String,
    pub search: SearchConfig,
    pub coordination_backend: CoordinationBackend,
    pub previews: PreviewConfig,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub lease_duration: Duration,
    pub scan_checkpoint_every: u64,
    pub reindex_chunk_size: usize,
    pub reindex_delay: Duration,
    pub defer_delay: Duration,
    pub exiftool_path: String,
    pub probe_timeout: Duration,
    pub async_search_chunk_size: usize,
    pub async_search_chunks_per_run: usize,
    pub nightly_scan_at: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filesystem_root: PathBuf::from("./data/originals"),
            exclude_paths: Vec::new(),
            allowed_extensions: ["jpg", "jpeg", "png", "webp", "tif", "tiff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            db_path: "./data/database/pixdex.db".to_string(),
            search: SearchConfig {
                backend: SearchBackend::Meili,
                url: "http://localhost:7700".to_string(),
                api_key: None,
                index: "files".to_string(),
                max_total_hits: 100_000,
                timeout: Duration::from_secs(10),
            },
            coordination_backend: CoordinationBackend::Sqlite,
            previews: PreviewConfig {
                previews_root: PathBuf::from("./data/previews"),
                max_dimension: 800,
                quality: 80,
                check_rounds: 3,
                check_delay: Duration::from_secs(60),
                ffmpeg_path: "ffmpeg".to_string(),
            },
            workers: num_cpus::get().max(1),
            max_attempts: 3,
            retry_delay: Duration::from_secs(30),
            lease_duration: Duration::from_secs(30 * 60),
            scan_checkpoint_every: 500,
            reindex_chunk_size: 2000,
            reindex_delay: Duration::from_secs(300),
            defer_delay: Duration::from_secs(30),
            exiftool_path: "exiftool".to_string(),
            probe_timeout: Duration::from_secs(10),
            async_search_chunk_size: 1000,
            async_search_chunks_per_run: 5,
            nightly_scan_at: Some("00:00".to_string()),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let allowed_extensions = match env::var("PIXDEX_ALLOWED_EXTENSIONS") {
            Ok(raw) => split_list(&raw)
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            Err(_) => defaults.allowed_extensions,
        };

        let search_backend = match env::var("PIXDEX_SEARCH_BACKEND").as_deref() {
            Ok("memory") => SearchBackend::Memory,
            Ok("meili") | Err(_) => SearchBackend::Meili,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "PIXDEX_SEARCH_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let coordination_backend = match env::var("PIXDEX_COORDINATION_BACKEND").as_deref() {
            Ok("memory") => CoordinationBackend::Memory,
            Ok("sqlite") | Err(_) => CoordinationBackend::Sqlite,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "PIXDEX_COORDINATION_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            filesystem_root: env::var("PIXDEX_FILESYSTEM_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.filesystem_root),
            exclude_paths: env::var("PIXDEX_EXCLUDE_PATHS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            allowed_extensions,
            db_path: env::var("PIXDEX_DB_PATH").unwrap_or(defaults.db_path),
            search: SearchConfig {
                backend: search_backend,
                url: env::var("PIXDEX_MEILI_URL").unwrap_or(defaults.search.url),
                api_key: env::var("PIXDEX_MEILI_KEY").ok().filter(|k| !k.is_empty()),
                index: env::var("PIXDEX_MEILI_INDEX").unwrap_or(defaults.search.index),
                max_total_hits: parse_var(
                    "PIXDEX_MEILI_MAX_TOTAL_HITS",
                    defaults.search.max_total_hits,
                )?,
                timeout: seconds_var("PIXDEX_MEILI_TIMEOUT_SECONDS", defaults.search.timeout)?,
            },
            coordination_backend,
            previews: PreviewConfig {
                previews_root: env::var("PIXDEX_PREVIEWS_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.previews.previews_root),
                max_dimension: parse_var(
                    "PIXDEX_PREVIEW_MAX_DIMENSION",
                    defaults.previews.max_dimension,
                )?,
                quality: parse_var("PIXDEX_PREVIEW_QUALITY", defaults.previews.quality)?,
                check_rounds: parse_var(
                    "PIXDEX_PREVIEW_CHECK_ROUNDS",
                    defaults.previews.check_rounds,
                )?,
                check_delay: seconds_var(
                    "PIXDEX_PREVIEW_CHECK_DELAY_SECONDS",
                    defaults.previews.check_delay,
                )?,
                ffmpeg_path: env::var("PIXDEX_FFMPEG_PATH")
                    .unwrap_or(defaults.previews.ffmpeg_path),
            },
            workers: parse_var("PIXDEX_WORKERS", defaults.workers)?.max(1),
            max_attempts: parse_var("PIXDEX_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            retry_delay: seconds_var("PIXDEX_RETRY_DELAY_SECONDS", defaults.retry_delay)?,
            lease_duration: seconds_var("PIXDEX_LEASE_SECONDS", defaults.lease_duration)?,
            scan_checkpoint_every: parse_var(
                "PIXDEX_SCAN_CHECKPOINT_EVERY",
                defaults.scan_checkpoint_every,
            )?
            .max(1),
            reindex_chunk_size: parse_var(
                "PIXDEX_REINDEX_CHUNK_SIZE",
                defaults.reindex_chunk_size,
            )?
            .max(1),
            reindex_delay: seconds_var("PIXDEX_REINDEX_DELAY_SECONDS", defaults.reindex_delay)?,
            defer_delay: seconds_var("PIXDEX_DEFER_SECONDS", defaults.defer_delay)?,
            exiftool_path: env::var("PIXDEX_EXIFTOOL_PATH").unwrap_or(defaults.exiftool_path),
            probe_timeout: seconds_var("PIXDEX_PROBE_TIMEOUT_SECONDS", defaults.probe_timeout)?,
            async_search_chunk_size: parse_var(
                "PIXDEX_ASYNC_SEARCH_CHUNK_SIZE",
                defaults.async_search_chunk_size,
            )?
            .max(1),
            async_search_chunks_per_run: parse_var(
                "PIXDEX_ASYNC_SEARCH_CHUNKS_PER_RUN",
                defaults.async_search_chunks_per_run,
            )?
            .max(1),
            nightly_scan_at: match env::var("PIXDEX_NIGHTLY_SCAN_AT") {
                Ok(value) if value.trim().is_empty() => None,
                Ok(value) => Some(value.trim().to_string()),
                Err(_) => defaults.nightly_scan_at,
            },
        })
    }
}

/// Splits a `;` or `,` separated list, dropping empty items.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn seconds_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}
