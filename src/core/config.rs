//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::errors::{MirrorError, Result};

/// Smallest chunk the streamer may be configured with.
pub const MIN_STREAMING_CHUNK_SIZE: u64 = 4 * 1024;
/// Largest chunk; bounded by the transport frame limit.
pub const MAX_STREAMING_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Full content mirror configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub copy: CopyConfig,
    pub content_server: ContentServerConfig,
    pub backup_server: BackupServerConfig,
    pub index: IndexConfig,
    pub telemetry: TelemetryConfig,
    pub paths: PathsConfig,
}

/// Copy protocol knobs shared by both peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CopyConfig {
    /// Upper bound on contents simultaneously admitted (awaiting ack or streaming).
    pub max_copy_streams: usize,
    /// Acks older than this are ignored by the copy server.
    pub ack_timeout_secs: u64,
    /// Admitted contents with no progress for this long are reclaimed.
    pub local_timeout_secs: u64,
    /// Period of the timeout sweep.
    pub sweep_interval_secs: u64,
    pub streaming_chunk_size: u64,
}

/// Content server daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContentServerConfig {
    pub monitoring_paths: Vec<PathBuf>,
    pub local_content_data_path: PathBuf,
    pub data_port: u16,
    pub files_port: u16,
    /// Server name recorded in every instance this host indexes.
    pub server_name: String,
}

/// Backup server daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupServerConfig {
    pub content_server_hostname: String,
    pub content_server_data_port: u16,
    pub content_server_files_port: u16,
    pub backup_destination_folder: PathBuf,
    pub backup_check_delay_secs: u64,
    pub local_content_data_path: PathBuf,
    pub server_name: String,
}

/// Indexer behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub scan_interval_secs: u64,
    pub data_flush_delay_secs: u64,
    /// Regular expressions matched against full paths; matches are skipped.
    pub exclude_patterns: Vec<String>,
    /// Write flushed index files gzip-compressed.
    pub gzip: bool,
}

/// Periodic state-file writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub state_write_interval_secs: u64,
}

/// Filesystem paths used by cmir.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub tmp_path: PathBuf,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            max_copy_streams: 5,
            ack_timeout_secs: 5,
            local_timeout_secs: 60,
            sweep_interval_secs: 10,
            streaming_chunk_size: 2 * 1024 * 1024,
        }
    }
}

impl CopyConfig {
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub const fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ContentServerConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            monitoring_paths: Vec::new(),
            local_content_data_path: data.join("content_server.data"),
            data_port: 3333,
            files_port: 4444,
            server_name: default_server_name(),
        }
    }
}

impl Default for BackupServerConfig {
    fn default() -> Self {
        let data = data_dir();
        Self {
            content_server_hostname: "localhost".to_string(),
            content_server_data_port: 3333,
            content_server_files_port: 4444,
            backup_destination_folder: data.join("backup"),
            backup_check_delay_secs: 5,
            local_content_data_path: data.join("backup_server.data"),
            server_name: default_server_name(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 10,
            data_flush_delay_secs: 300,
            exclude_patterns: Vec::new(),
            gzip: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            state_write_interval_secs: 30,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = home_dir();
        let data = data_dir();
        Self {
            config_file: home_dir.join(".config").join("cmir").join("config.toml"),
            state_file: data.join("state.json"),
            jsonl_log: data.join("activity.jsonl"),
            tmp_path: data.join("tmp"),
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            warn!("HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

fn data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("cmir")
}

/// Host name used as the default server name.
pub fn default_server_name() -> String {
    env_var("HOSTNAME")
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| MirrorError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(MirrorError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the start event.
    ///
    /// FNV-1a keeps the value stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // copy
        set_usize(&mut lookup, "CMIR_COPY_MAX_COPY_STREAMS", &mut self.copy.max_copy_streams)?;
        set_u64(&mut lookup, "CMIR_COPY_ACK_TIMEOUT_SECS", &mut self.copy.ack_timeout_secs)?;
        set_u64(
            &mut lookup,
            "CMIR_COPY_LOCAL_TIMEOUT_SECS",
            &mut self.copy.local_timeout_secs,
        )?;
        set_u64(
            &mut lookup,
            "CMIR_COPY_SWEEP_INTERVAL_SECS",
            &mut self.copy.sweep_interval_secs,
        )?;
        set_u64(
            &mut lookup,
            "CMIR_COPY_STREAMING_CHUNK_SIZE",
            &mut self.copy.streaming_chunk_size,
        )?;

        // content server
        set_u16(&mut lookup, "CMIR_CONTENT_SERVER_DATA_PORT", &mut self.content_server.data_port)?;
        set_u16(
            &mut lookup,
            "CMIR_CONTENT_SERVER_FILES_PORT",
            &mut self.content_server.files_port,
        )?;
        set_string(
            &mut lookup,
            "CMIR_CONTENT_SERVER_NAME",
            &mut self.content_server.server_name,
        );
        if let Some(raw) = lookup("CMIR_CONTENT_SERVER_MONITORING_PATHS") {
            self.content_server.monitoring_paths = env::split_paths(&raw).collect();
        }

        // backup server
        set_string(
            &mut lookup,
            "CMIR_BACKUP_SERVER_CONTENT_SERVER_HOSTNAME",
            &mut self.backup_server.content_server_hostname,
        );
        set_u16(
            &mut lookup,
            "CMIR_BACKUP_SERVER_CONTENT_SERVER_DATA_PORT",
            &mut self.backup_server.content_server_data_port,
        )?;
        set_u16(
            &mut lookup,
            "CMIR_BACKUP_SERVER_CONTENT_SERVER_FILES_PORT",
            &mut self.backup_server.content_server_files_port,
        )?;
        if let Some(raw) = lookup("CMIR_BACKUP_SERVER_DESTINATION_FOLDER") {
            self.backup_server.backup_destination_folder = PathBuf::from(raw);
        }
        set_u64(
            &mut lookup,
            "CMIR_BACKUP_SERVER_CHECK_DELAY_SECS",
            &mut self.backup_server.backup_check_delay_secs,
        )?;

        // index
        set_u64(&mut lookup, "CMIR_INDEX_SCAN_INTERVAL_SECS", &mut self.index.scan_interval_secs)?;
        set_u64(
            &mut lookup,
            "CMIR_INDEX_DATA_FLUSH_DELAY_SECS",
            &mut self.index.data_flush_delay_secs,
        )?;
        if let Some(raw) = lookup("CMIR_INDEX_GZIP") {
            self.index.gzip = parse_env_bool("CMIR_INDEX_GZIP", &raw)?;
        }

        // telemetry
        set_u64(
            &mut lookup,
            "CMIR_TELEMETRY_STATE_WRITE_INTERVAL_SECS",
            &mut self.telemetry.state_write_interval_secs,
        )?;

        // paths
        if let Some(raw) = lookup("CMIR_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CMIR_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Strip trailing slashes so prefix comparisons line up.
    fn normalize_paths(&mut self) {
        for path in &mut self.content_server.monitoring_paths {
            strip_trailing_slash(path);
        }
        strip_trailing_slash(&mut self.backup_server.backup_destination_folder);
    }

    fn validate(&self) -> Result<()> {
        if self.copy.max_copy_streams == 0 {
            return Err(MirrorError::InvalidConfig {
                details: "copy.max_copy_streams must be >= 1".to_string(),
            });
        }

        for (name, val) in [
            ("copy.ack_timeout_secs", self.copy.ack_timeout_secs),
            ("copy.local_timeout_secs", self.copy.local_timeout_secs),
            ("copy.sweep_interval_secs", self.copy.sweep_interval_secs),
            ("index.scan_interval_secs", self.index.scan_interval_secs),
            ("index.data_flush_delay_secs", self.index.data_flush_delay_secs),
            (
                "backup_server.backup_check_delay_secs",
                self.backup_server.backup_check_delay_secs,
            ),
            (
                "telemetry.state_write_interval_secs",
                self.telemetry.state_write_interval_secs,
            ),
        ] {
            if val == 0 {
                return Err(MirrorError::InvalidConfig {
                    details: format!("{name} must be > 0"),
                });
            }
        }

        if !(MIN_STREAMING_CHUNK_SIZE..=MAX_STREAMING_CHUNK_SIZE)
            .contains(&self.copy.streaming_chunk_size)
        {
            return Err(MirrorError::InvalidConfig {
                details: format!(
                    "copy.streaming_chunk_size must be in [{MIN_STREAMING_CHUNK_SIZE}, {MAX_STREAMING_CHUNK_SIZE}], got {}",
                    self.copy.streaming_chunk_size
                ),
            });
        }

        if self.content_server.data_port == self.content_server.files_port
            && self.content_server.data_port != 0
        {
            return Err(MirrorError::InvalidConfig {
                details: "content_server.data_port and files_port must differ".to_string(),
            });
        }

        for (name, value) in [
            ("content_server.server_name", &self.content_server.server_name),
            ("backup_server.server_name", &self.backup_server.server_name),
        ] {
            if value.trim().is_empty() || value.contains(['\n', '\r']) {
                return Err(MirrorError::InvalidConfig {
                    details: format!("{name} must be a non-empty single line"),
                });
            }
        }

        for pattern in &self.index.exclude_patterns {
            regex::Regex::new(pattern).map_err(|error| MirrorError::InvalidConfig {
                details: format!("index.exclude_patterns entry {pattern:?}: {error}"),
            })?;
        }

        Ok(())
    }
}

fn strip_trailing_slash(path: &mut PathBuf) {
    let s = path.to_string_lossy();
    if s.len() > 1
        && let Some(stripped) = s.strip_suffix('/')
    {
        *path = PathBuf::from(stripped);
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_string<F>(lookup: &mut F, name: &str, slot: &mut String)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw;
    }
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_u16<F>(lookup: &mut F, name: &str, slot: &mut u16) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| MirrorError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    parse_env::<bool>(name, raw)
}
