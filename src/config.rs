use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use tracing::warn;
use uuid::Uuid;

use crate::{dedup_lock::LockKeyPolicy, selection::SelectionPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub work_root: PathBuf,
    pub blob_root: PathBuf,
    pub public_base_url: String,
    pub link_secret: String,
    pub link_secret_is_fallback: bool,
    pub link_ttl: Duration,
    pub database_path: Option<PathBuf>,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub lock_ttl: Duration,
    pub lock_key_policy: LockKeyPolicy,
    pub lock_retry: Duration,
    pub selection: SelectionPolicy,
    pub stage_timeout: Option<Duration>,
    pub event_retention: Duration,
    pub ffmpeg_bin: String,
    pub ytdlp_bin: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|value| !value.is_empty())
        };
        let seconds = |key: &str, default: u64| {
            Duration::from_secs(parse_or(var(key), default))
        };

        let bind_addr = var("VIDFETCH_BIND_ADDR")
            .and_then(|raw| raw.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) =
            resolve_secret(&var, "VIDFETCH_API_KEY", "VIDFETCH_API_KEY_FILE");
        let (link_secret, link_secret_is_fallback) =
            resolve_secret(&var, "VIDFETCH_LINK_SECRET", "VIDFETCH_LINK_SECRET_FILE");

        let lock_key_policy = match var("VIDFETCH_LOCK_KEY") {
            Some(raw) => raw
                .parse::<LockKeyPolicy>()
                .context("Invalid VIDFETCH_LOCK_KEY")?,
            None => LockKeyPolicy::TaskId,
        };

        let progressive_resolutions = var("VIDFETCH_PROGRESSIVE_RESOLUTIONS")
            .unwrap_or_else(|| "360p".to_string())
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect();
        // Set but empty means "no preference".
        let preferred_container = match lookup("VIDFETCH_PREFERRED_CONTAINER") {
            Some(raw) => Some(raw.trim().to_ascii_lowercase()).filter(|value| !value.is_empty()),
            None => Some("mp4".to_string()),
        };

        let stage_timeout = var("VIDFETCH_STAGE_TIMEOUT_SECONDS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            work_root: PathBuf::from(var("VIDFETCH_WORK_ROOT").unwrap_or_else(|| "/tmp/vidfetch".to_string())),
            blob_root: PathBuf::from(var("VIDFETCH_BLOB_ROOT").unwrap_or_else(|| "/data/blobs".to_string())),
            public_base_url: var("VIDFETCH_PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            link_secret,
            link_secret_is_fallback,
            link_ttl: seconds("VIDFETCH_LINK_TTL_SECONDS", 60 * 60),
            database_path: var("VIDFETCH_DATABASE_PATH").map(PathBuf::from),
            queue_capacity: parse_or(var("VIDFETCH_QUEUE_CAPACITY"), 128usize).max(1),
            worker_count: parse_or(var("VIDFETCH_WORKER_COUNT"), 4usize).max(1),
            lock_ttl: seconds("VIDFETCH_LOCK_TTL_SECONDS", 2 * 60 * 60),
            lock_key_policy,
            lock_retry: seconds("VIDFETCH_LOCK_RETRY_SECONDS", 30),
            selection: SelectionPolicy {
                progressive_resolutions,
                preferred_container,
            },
            stage_timeout,
            event_retention: seconds("VIDFETCH_EVENT_RETENTION_SECONDS", 10 * 60),
            ffmpeg_bin: var("VIDFETCH_FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ytdlp_bin: var("VIDFETCH_YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
        })
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.parse::<T>().ok()).unwrap_or(default)
}

fn resolve_secret(
    var: &impl Fn(&str) -> Option<String>,
    value_key: &str,
    file_key: &str,
) -> (String, bool) {
    if let Some(value) = var(value_key) {
        return (value, false);
    }

    if let Some(path) = var(file_key) {
        match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => return (raw.trim().to_string(), false),
            Ok(_) => warn!("{file_key} is empty: {path}. Falling back to generated value."),
            Err(err) => {
                warn!("Failed reading {file_key} at {path}: {err}. Falling back to generated value.")
            }
        }
    } else {
        warn!("{value_key} not set. Falling back to generated value.");
    }

    (format!("fallback-{}", Uuid::new_v4()), true)
}
