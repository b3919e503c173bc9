//! Periodic re-indexing with shallow reuse and delayed persistence.
//!
//! Each pass indexes the monitored roots against the previous pass, pushes
//! the resulting snapshot to the output channel and, once `flush_delay` has
//! elapsed since the last write, persists it to `data_path`.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::content::content_data::ContentData;
use crate::content::format::{FileCompression, IndexFormat, WriteOptions};
use crate::core::errors::{MirrorError, Result};
use crate::core::paths::index_path_string;
use crate::daemon::context::ProcessContext;
use crate::indexer::walker::{IndexReport, IndexerConfig, index_tree};
use crate::logger::activity::ActivityEvent;

const SLEEP_STEP: Duration = Duration::from_millis(200);

pub struct QueueIndexer {
    config: IndexerConfig,
    data_path: PathBuf,
    scan_interval: Duration,
    flush_delay: Duration,
    write_options: WriteOptions,
    output: Sender<ContentData>,
    ctx: ProcessContext,
}

impl QueueIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IndexerConfig,
        data_path: impl Into<PathBuf>,
        scan_interval: Duration,
        flush_delay: Duration,
        gzip: bool,
        output: Sender<ContentData>,
        ctx: ProcessContext,
    ) -> Self {
        let compression = if gzip {
            FileCompression::Gzip
        } else {
            FileCompression::ByExtension
        };
        Self {
            config,
            data_path: data_path.into(),
            scan_interval,
            flush_delay,
            write_options: WriteOptions {
                format: IndexFormat::Canonical,
                compression,
            },
            output,
            ctx,
        }
    }

    /// Index persisted by an earlier run, or empty if there is none.
    ///
    /// An unreadable file is not fatal: the next pass hashes everything.
    pub fn load_previous(&self) -> ContentData {
        if !self.data_path.exists() {
            return ContentData::new();
        }
        match ContentData::from_file(&self.data_path) {
            Ok(previous) => {
                info!(
                    path = %self.data_path.display(),
                    contents = previous.contents_size(),
                    "loaded previous index"
                );
                previous
            }
            Err(e) => {
                warn!(path = %self.data_path.display(), error = %e, "ignoring unreadable index");
                ContentData::new()
            }
        }
    }

    pub fn scan_once(&self, previous: &ContentData) -> (ContentData, IndexReport) {
        let started = Instant::now();
        let (index, report) = index_tree(&self.config, Some(previous));
        debug!(
            hashed = report.hashed,
            reused = report.reused,
            failed = report.failed.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "index pass complete"
        );
        (index, report)
    }

    /// Persist `index` atomically and record the flush.
    pub fn flush(&self, index: &ContentData) -> Result<()> {
        let started = Instant::now();
        index.to_file_with(&self.data_path, self.write_options)?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            path = %self.data_path.display(),
            contents = index.contents_size(),
            duration_ms,
            "index flushed"
        );
        self.ctx.record(ActivityEvent::IndexFlushed {
            path: index_path_string(&self.data_path),
            contents: index.contents_size(),
            duration_ms,
        });
        Ok(())
    }

    /// Loop until `shutdown` is set or the output receiver is dropped.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cmir-indexer".to_string())
            .spawn(move || self.run(&shutdown))
            .map_err(|e| MirrorError::Runtime {
                details: format!("failed to spawn indexer: {e}"),
            })
    }

    fn run(&self, shutdown: &AtomicBool) {
        let mut current = self.load_previous();
        let mut last_flush: Option<Instant> = None;
        while !shutdown.load(Ordering::Relaxed) {
            let (snapshot, _) = self.scan_once(&current);
            if last_flush.is_none_or(|at| at.elapsed() >= self.flush_delay) {
                match self.flush(&snapshot) {
                    Ok(()) => last_flush = Some(Instant::now()),
                    Err(e) => warn!(error = %e, code = e.code(), "index flush failed"),
                }
            }
            if self.output.send(snapshot.clone()).is_err() {
                debug!("index consumer gone; stopping indexer");
                break;
            }
            current = snapshot;
            sleep_unless_stopped(shutdown, self.scan_interval);
        }
        // Persist the latest pass so the next start can reuse it.
        if let Err(e) = self.flush(&current) {
            warn!(error = %e, "final index flush failed");
        }
    }
}

fn sleep_unless_stopped(shutdown: &AtomicBool, total: Duration) {
    let mut left = total;
    while !left.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = left.min(SLEEP_STEP);
        thread::sleep(step);
        left -= step;
    }
}
