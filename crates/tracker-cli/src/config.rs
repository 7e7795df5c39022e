//! `[settings]` config loading: a missing or malformed config file is not
//! fatal, it just logs a warning and falls back to the hardcoded defaults
//! below.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_PORT: u16 = 42070;
const DEFAULT_DEBUG: bool = false;
const DEFAULT_DB_PATH: &str = "tracker.db";
const DEFAULT_KEEPALIVE_TIMEOUT: i64 = 5 * 60;
const DEFAULT_BROADCAST_THREAD_COUNT: usize = 4;
const DEFAULT_MAX_TRACKER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
struct Settings {
    server_port: u16,
    debug_mode: bool,
    db_path: PathBuf,
    keepalive_timeout: i64,
    broadcast_thread_count: usize,
    max_tracker_failures: u32,
}

/// Resolved settings, always present regardless of whether the config file
/// parsed — the fallback defaults live here, not scattered at call sites.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub server_port: u16,
    pub debug_mode: bool,
    pub db_path: PathBuf,
    pub keepalive_timeout: i64,
    pub broadcast_thread_count: usize,
    pub max_tracker_failures: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_PORT,
            debug_mode: DEFAULT_DEBUG,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            broadcast_thread_count: DEFAULT_BROADCAST_THREAD_COUNT,
            max_tracker_failures: DEFAULT_MAX_TRACKER_FAILURES,
        }
    }
}

impl TrackerConfig {
    /// Loads `[settings]` from `path`. Any failure to read or parse it (file
    /// missing, bad TOML, missing/mistyped key) logs a warning and returns
    /// the defaults, rather than failing startup.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded settings from config file");
                config
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "could not load config file, using defaults");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: ConfigFile = toml::from_str(&raw)?;
        Ok(Self {
            server_port: parsed.settings.server_port,
            debug_mode: parsed.settings.debug_mode,
            db_path: parsed.settings.db_path,
            keepalive_timeout: parsed.settings.keepalive_timeout,
            broadcast_thread_count: parsed.settings.broadcast_thread_count,
            max_tracker_failures: parsed.settings.max_tracker_failures,
        })
    }
}
