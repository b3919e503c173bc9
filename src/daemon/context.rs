//! Explicitly constructed process context handed to every component.
//!
//! Holds the named process variables (gauges and counters surfaced in the
//! state file) and the activity logger handle. Nothing here is global.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Well-known process variable names.
pub mod vars {
    pub const CONTENTS_UNDER_COPY: &str = "contents under copy";
    pub const CONTENTS_TO_COPY_QUEUE: &str = "contents to copy queue";
    pub const COPY_FILE_QUEUE_SIZE: &str = "copy file queue size";
    pub const FILE_COPY_CLIENT_QUEUE: &str = "file copy client queue";
    pub const NUM_FILES_RECEIVED: &str = "num_files_received";
    pub const NUM_COPY_REQUESTS: &str = "num_copy_requests";
    pub const NUM_ABORTED_COPIES: &str = "num_aborted_copies";
    pub const NUM_TIMED_OUT_COPIES: &str = "num_timed_out_copies";
    pub const LOCAL_CONTENTS: &str = "local contents";
    pub const REMOTE_CONTENTS: &str = "remote contents";
    pub const PROTOCOL_ERRORS: &str = "protocol errors";
}

/// Thread-safe map of named integer variables.
#[derive(Debug, Default)]
pub struct ProcessVars {
    values: Mutex<BTreeMap<String, i64>>,
}

impl ProcessVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: i64) {
        self.values.lock().insert(name.to_string(), value);
    }

    /// Add `delta` to a variable (missing variables start at 0).
    pub fn inc(&self, name: &str, delta: i64) {
        *self.values.lock().entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values.lock().clone()
    }
}

/// Shared handles for one running process.
#[derive(Clone)]
pub struct ProcessContext {
    pub vars: Arc<ProcessVars>,
    pub activity: ActivityLoggerHandle,
}

impl ProcessContext {
    pub fn new(activity: ActivityLoggerHandle) -> Self {
        Self {
            vars: Arc::new(ProcessVars::new()),
            activity,
        }
    }

    /// Context whose activity events go nowhere.
    pub fn detached() -> Self {
        Self::new(ActivityLoggerHandle::disabled())
    }

    pub fn record(&self, event: ActivityEvent) {
        self.activity.send(event);
    }
}
