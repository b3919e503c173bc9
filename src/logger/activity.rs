//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Every other thread sends
//! [`ActivityEvent`]s through a bounded crossbeam channel with `try_send`, so
//! protocol loops are never blocked by logging back-pressure.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{MirrorError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;
const RECOVERY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Events recorded in the activity log.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    ServerStarted {
        role: String,
        version: String,
        config_hash: String,
    },
    ServerStopped {
        role: String,
        reason: String,
        uptime_secs: u64,
    },
    CopyRequested {
        contents: usize,
        instances: usize,
    },
    CopyStarted {
        checksum: String,
        path: String,
    },
    FileReceived {
        checksum: String,
        path: String,
        size: u64,
    },
    CopyAborted {
        checksum: String,
        reason: String,
    },
    CopyTimedOut {
        checksum: String,
    },
    IndexFlushed {
        path: String,
        contents: usize,
        duration_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Asks the logger thread to flush and exit.
    Shutdown,
}

/// Cloneable sending side of the activity logger.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Non-blocking; a full channel drops the event and counts it.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// A handle with no logger thread behind it; events are discarded.
    pub fn disabled() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    pub fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread. It runs until `shutdown()` or until every
/// handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("cmir-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| MirrorError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    loop {
        let event = match rx.recv_timeout(RECOVERY_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                jsonl.try_recover();
                jsonl.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{lost} activity events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&to_log_entry(&event));
    }

    jsonl.flush();
    jsonl.fsync();
}

fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::ServerStarted {
            role,
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::ServerStart, Severity::Info);
            e.role = Some(role.clone());
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e
        }
        ActivityEvent::ServerStopped {
            role,
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::ServerStop, Severity::Info);
            e.role = Some(role.clone());
            e.details = Some(format!("reason={reason} uptime_secs={uptime_secs}"));
            e
        }
        ActivityEvent::CopyRequested {
            contents,
            instances,
        } => {
            let mut e = LogEntry::new(EventType::CopyRequested, Severity::Info);
            e.count = Some(*contents as u64);
            e.details = Some(format!("instances={instances}"));
            e
        }
        ActivityEvent::CopyStarted { checksum, path } => {
            let mut e = LogEntry::new(EventType::CopyStarted, Severity::Info);
            e.checksum = Some(checksum.clone());
            e.path = Some(path.clone());
            e
        }
        ActivityEvent::FileReceived {
            checksum,
            path,
            size,
        } => {
            let mut e = LogEntry::new(EventType::FileReceived, Severity::Info);
            e.checksum = Some(checksum.clone());
            e.path = Some(path.clone());
            e.size = Some(*size);
            e
        }
        ActivityEvent::CopyAborted { checksum, reason } => {
            let mut e = LogEntry::new(EventType::CopyAborted, Severity::Warning);
            e.checksum = Some(checksum.clone());
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::CopyTimedOut { checksum } => {
            let mut e = LogEntry::new(EventType::CopyTimedOut, Severity::Warning);
            e.checksum = Some(checksum.clone());
            e
        }
        ActivityEvent::IndexFlushed {
            path,
            contents,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::IndexFlushed, Severity::Info);
            e.path = Some(path.clone());
            e.count = Some(*contents as u64);
            e.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::ServerStop, Severity::Info),
    }
}
