//! Daemon state file for CLI consumption.
//!
//! Written atomically (write to `.tmp`, then `rename()`) every
//! `state_write_interval_secs` so `cmir status` always reads a consistent
//! snapshot of the process variables.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::errors::{MirrorError, Result};
use crate::daemon::context::ProcessContext;

/// A state file older than this is reported as stale.
pub const STATE_STALE_THRESHOLD_SECS: u64 = 90;

/// Top-level content of `state.json`.
///
/// Every field defaults so that files written by older or newer daemons
/// still parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: String,
    pub pid: u32,
    pub role: String,
    pub server_name: String,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub last_updated: String,
    pub vars: BTreeMap<String, i64>,
    pub dropped_log_events: u64,
}

impl DaemonState {
    /// Seconds since `last_updated`, when it parses.
    pub fn age_secs(&self) -> Option<i64> {
        let updated = chrono::DateTime::parse_from_rfc3339(&self.last_updated).ok()?;
        Some(
            chrono::Utc::now()
                .signed_duration_since(updated)
                .num_seconds(),
        )
    }

    pub fn is_stale(&self) -> bool {
        #[allow(clippy::cast_possible_wrap)]
        self.age_secs()
            .is_some_and(|age| age > STATE_STALE_THRESHOLD_SECS as i64)
    }
}

/// Periodic writer owned by a daemon's main loop.
pub struct StateWriter {
    path: PathBuf,
    role: &'static str,
    server_name: String,
    start_time: Instant,
    started_at_iso: String,
    write_interval: Duration,
    last_write: Option<Instant>,
}

impl StateWriter {
    pub fn new(
        path: PathBuf,
        role: &'static str,
        server_name: impl Into<String>,
        write_interval: Duration,
    ) -> Self {
        Self {
            path,
            role,
            server_name: server_name.into(),
            start_time: Instant::now(),
            started_at_iso: now_iso(),
            write_interval,
            last_write: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Write the state file when the interval has elapsed.
    pub fn maybe_write(&mut self, ctx: &ProcessContext) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_write
            && now.duration_since(last) < self.write_interval
        {
            return false;
        }
        // Failed writes also wait a full interval before retrying.
        self.last_write = Some(now);
        match write_state_atomic(&self.path, &self.build(ctx)) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to write state file");
                false
            }
        }
    }

    fn build(&self, ctx: &ProcessContext) -> DaemonState {
        DaemonState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            role: self.role.to_string(),
            server_name: self.server_name.clone(),
            started_at: self.started_at_iso.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            last_updated: now_iso(),
            vars: ctx.vars.snapshot(),
            dropped_log_events: ctx.activity.dropped_events(),
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Write `state` to `path` through a `.tmp` sibling and `rename()`.
pub fn write_state_atomic(path: &Path, state: &DaemonState) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(state)?;

    let result = (|| -> std::io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(MirrorError::io(path, e));
    }
    Ok(())
}

/// Read a state file written by [`write_state_atomic`].
pub fn read_state(path: &Path) -> Result<DaemonState> {
    let raw = fs::read_to_string(path).map_err(|e| MirrorError::io(path, e))?;
    let state: DaemonState = serde_json::from_str(&raw)?;
    if state.is_stale() {
        warn!(
            path = %path.display(),
            age_secs = state.age_secs().unwrap_or_default(),
            "state file is stale; daemon may be stopped"
        );
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::context::vars;

    #[test]
    fn writer_records_process_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("state.json");
        let ctx = ProcessContext::detached();
        ctx.vars.set(vars::CONTENTS_UNDER_COPY, 3);
        ctx.vars.inc(vars::NUM_FILES_RECEIVED, 7);

        let mut writer = StateWriter::new(path.clone(), "backup_server", "bk1", Duration::from_secs(30));
        assert!(writer.maybe_write(&ctx));

        let state = read_state(&path).unwrap();
        assert_eq!(state.role, "backup_server");
        assert_eq!(state.server_name, "bk1");
        assert_eq!(state.pid, std::process::id());
        assert_eq!(state.vars[vars::CONTENTS_UNDER_COPY], 3);
        assert_eq!(state.vars[vars::NUM_FILES_RECEIVED], 7);
        assert!(!state.is_stale());
    }

    #[test]
    fn writer_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProcessContext::detached();
        let mut writer = StateWriter::new(
            dir.path().join("state.json"),
            "content_server",
            "cs1",
            Duration::from_secs(3600),
        );
        assert!(writer.maybe_write(&ctx));
        assert!(!writer.maybe_write(&ctx));
    }

    #[test]
    fn atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_state_atomic(&path, &DaemonState::default()).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let err = read_state(&path).unwrap_err();
        assert_eq!(err.code(), "CMR-2101");
    }

    #[test]
    fn missing_state_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_state(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), "CMR-3002");
    }

    #[test]
    fn unknown_fields_are_ignored_and_old_files_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"version":"0.1.0","pid":42,"last_updated":"2001-01-01T00:00:00Z","future":1}"#,
        )
        .unwrap();
        let state = read_state(&path).unwrap();
        assert_eq!(state.pid, 42);
        assert!(state.vars.is_empty());
        assert!(state.is_stale());
    }
}
