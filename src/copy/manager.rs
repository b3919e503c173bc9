//! Copy admission control and reclamation.
//!
//! At most `max_copy_streams` checksums are admitted at once (awaiting the
//! peer's ack or streaming); the rest wait in FIFO order. Every way out of
//! the admitted set (completion, abort, negative or stale ack, timeout)
//! goes through the same reclamation step that promotes waiting contents
//! into the freed slots.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::content::content_data::Checksum;
use crate::copy::messages::ServerEvent;
use crate::copy::streamer::Streamer;
use crate::core::errors::{MirrorError, Result};
use crate::daemon::context::{ProcessContext, vars};
use crate::logger::activity::ActivityEvent;

/// Result of [`CopyManager::add_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Slot taken; an ack request was queued.
    Started,
    /// No free slot; queued behind the others.
    Queued,
    /// Already waiting or under copy; nothing changed.
    AlreadyTracked,
}

/// Where a checksum is in the copy life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Idle,
    Waiting,
    AwaitingAck,
    Streaming,
}

#[derive(Debug)]
struct UnderCopy {
    path: PathBuf,
    acked: bool,
    /// Admission time; the local timeout counts from here whatever the
    /// streaming progress.
    since: Instant,
}

#[derive(Debug, Default)]
struct ManagerState {
    under_copy: HashMap<Checksum, UnderCopy>,
    waiting: HashSet<Checksum>,
    waiting_queue: VecDeque<(Checksum, PathBuf)>,
}

pub struct CopyManager {
    state: Mutex<ManagerState>,
    events: Sender<ServerEvent>,
    streamer: Arc<dyn Streamer>,
    max_copy_streams: usize,
    local_timeout: Duration,
    ctx: ProcessContext,
}

impl CopyManager {
    pub fn new(
        events: Sender<ServerEvent>,
        streamer: Arc<dyn Streamer>,
        max_copy_streams: usize,
        local_timeout: Duration,
        ctx: ProcessContext,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            events,
            streamer,
            max_copy_streams: max_copy_streams.max(1),
            local_timeout,
            ctx,
        }
    }

    /// Admit a content for copy, or queue it when every slot is busy.
    pub fn add_content(&self, checksum: &str, path: &Path) -> Admission {
        let mut state = self.state.lock();
        if state.under_copy.contains_key(checksum) {
            debug!(checksum, "content is being copied, skipping");
            return Admission::AlreadyTracked;
        }
        if state.waiting.contains(checksum) {
            debug!(checksum, "content already waiting, skipping");
            return Admission::AlreadyTracked;
        }

        let admission = if state.under_copy.len() < self.max_copy_streams {
            self.admit(&mut state, checksum.to_string(), path.to_path_buf(), Instant::now());
            Admission::Started
        } else {
            debug!(checksum, "no free copy slot, queueing");
            state.waiting.insert(checksum.to_string());
            state
                .waiting_queue
                .push_back((checksum.to_string(), path.to_path_buf()));
            Admission::Queued
        };
        self.publish(&state);
        admission
    }

    /// The peer confirmed it needs `checksum`: start streaming it.
    ///
    /// Returns `false` when the checksum is not awaiting an ack.
    pub fn receive_ack(&self, checksum: &str) -> bool {
        let path = {
            let mut state = self.state.lock();
            match state.under_copy.get_mut(checksum) {
                Some(record) if !record.acked => {
                    record.acked = true;
                    record.path.clone()
                }
                Some(_) => {
                    warn!(checksum, "content already acked");
                    return false;
                }
                None => {
                    warn!(checksum, "ack for content that was aborted or already copied");
                    return false;
                }
            }
        };
        info!(checksum, path = %path.display(), "streaming to backup server");
        self.ctx.record(ActivityEvent::CopyStarted {
            checksum: checksum.to_string(),
            path: path.display().to_string(),
        });
        self.streamer.start_streaming(checksum, &path);
        true
    }

    /// Stop tracking `checksum` in any state and hand its slot to the
    /// oldest waiting content.
    pub fn remove_content(&self, checksum: &str) {
        let mut state = self.state.lock();
        let was_admitted = state.under_copy.remove(checksum).is_some();
        if state.waiting.remove(checksum) {
            state.waiting_queue.retain(|(queued, _)| queued != checksum);
        }
        debug!(checksum, was_admitted, "content removed from copy tracking");
        self.promote(&mut state, Instant::now());
        self.publish(&state);
    }

    pub fn sweep_timeouts(&self) -> Vec<Checksum> {
        self.sweep_timeouts_at(Instant::now())
    }

    /// Reclaim every content admitted longer than the local timeout ago as
    /// of `now`, acked or not. Returns the reclaimed checksums.
    pub fn sweep_timeouts_at(&self, now: Instant) -> Vec<Checksum> {
        let expired: Vec<Checksum> = {
            let mut state = self.state.lock();
            let expired: Vec<Checksum> = state
                .under_copy
                .iter()
                .filter(|(_, record)| now.saturating_duration_since(record.since) > self.local_timeout)
                .map(|(checksum, _)| checksum.clone())
                .collect();
            for checksum in &expired {
                state.under_copy.remove(checksum);
            }
            if !expired.is_empty() {
                self.promote(&mut state, now);
                self.publish(&state);
            }
            expired
        };

        for checksum in &expired {
            warn!(checksum = %checksum, "content timed out on copy process");
            self.streamer.abort_streaming(checksum);
            self.ctx.vars.inc(vars::NUM_TIMED_OUT_COPIES, 1);
            self.ctx.record(ActivityEvent::CopyTimedOut {
                checksum: checksum.clone(),
            });
        }
        expired
    }

    pub fn state(&self, checksum: &str) -> CopyState {
        let state = self.state.lock();
        match state.under_copy.get(checksum) {
            Some(record) if record.acked => CopyState::Streaming,
            Some(_) => CopyState::AwaitingAck,
            None if state.waiting.contains(checksum) => CopyState::Waiting,
            None => CopyState::Idle,
        }
    }

    pub fn under_copy_count(&self) -> usize {
        self.state.lock().under_copy.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting_queue.len()
    }

    fn admit(&self, state: &mut ManagerState, checksum: Checksum, path: PathBuf, now: Instant) {
        state.under_copy.insert(
            checksum.clone(),
            UnderCopy {
                path,
                acked: false,
                since: now,
            },
        );
        if self.events.send(ServerEvent::SendAck(checksum)).is_err() {
            warn!("copy server queue closed; ack request dropped");
        }
    }

    fn promote(&self, state: &mut ManagerState, now: Instant) {
        while state.under_copy.len() < self.max_copy_streams {
            let Some((checksum, path)) = state.waiting_queue.pop_front() else {
                break;
            };
            state.waiting.remove(&checksum);
            debug!(checksum = %checksum, "promoting waiting content");
            self.admit(state, checksum, path, now);
        }
    }

    fn publish(&self, state: &ManagerState) {
        let pv = &self.ctx.vars;
        pv.set(vars::CONTENTS_UNDER_COPY, len_as_i64(state.under_copy.len()));
        pv.set(vars::CONTENTS_TO_COPY_QUEUE, len_as_i64(state.waiting_queue.len()));
        pv.set(vars::COPY_FILE_QUEUE_SIZE, len_as_i64(self.events.len()));
    }
}

pub(crate) fn len_as_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Run [`CopyManager::sweep_timeouts`] every `interval` until `shutdown`.
pub fn spawn_timeout_sweep(
    manager: Arc<CopyManager>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("cmir-copy-sweep".to_string())
        .spawn(move || {
            let step = Duration::from_millis(200).min(interval);
            let mut elapsed = Duration::ZERO;
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(step);
                elapsed += step;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    let reclaimed = manager.sweep_timeouts();
                    if !reclaimed.is_empty() {
                        info!(count = reclaimed.len(), "reclaimed timed out copies");
                    }
                }
            }
        })
        .map_err(|e| MirrorError::Runtime {
            details: format!("failed to spawn copy sweep: {e}"),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, unbounded};

    /// Streamer that records every call.
    #[derive(Default)]
    pub(crate) struct RecordingStreamer {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl Streamer for RecordingStreamer {
        fn start_streaming(&self, checksum: &str, path: &Path) {
            self.calls
                .lock()
                .push(format!("start {checksum} {}", path.display()));
        }
        fn abort_streaming(&self, checksum: &str) {
            self.calls.lock().push(format!("abort {checksum}"));
        }
        fn reset_streaming(&self, checksum: &str, offset: u64) {
            self.calls.lock().push(format!("reset {checksum} {offset}"));
        }
        fn copy_another_chunk(&self, checksum: &str) {
            self.calls.lock().push(format!("next {checksum}"));
        }
    }

    fn manager(max: usize) -> (CopyManager, Receiver<ServerEvent>, Arc<RecordingStreamer>) {
        let (tx, rx) = unbounded();
        let streamer = Arc::new(RecordingStreamer::default());
        let manager = CopyManager::new(
            tx,
            Arc::clone(&streamer) as Arc<dyn Streamer>,
            max,
            Duration::from_secs(60),
            ProcessContext::detached(),
        );
        (manager, rx, streamer)
    }

    fn acks(rx: &Receiver<ServerEvent>) -> Vec<String> {
        rx.try_iter()
            .map(|event| match event {
                ServerEvent::SendAck(checksum) => checksum,
                other => panic!("unexpected event {other:?}"),
            })
            .collect()
    }

    #[test]
    fn sixth_content_waits_then_gets_promoted() {
        let (manager, rx, _) = manager(5);
        for i in 0..6 {
            let expected = if i < 5 {
                Admission::Started
            } else {
                Admission::Queued
            };
            assert_eq!(manager.add_content(&format!("c{i}"), Path::new("/f")), expected);
        }
        assert_eq!(acks(&rx), vec!["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(manager.state("c5"), CopyState::Waiting);

        manager.remove_content("c2");
        assert_eq!(acks(&rx), vec!["c5"]);
        assert_eq!(manager.state("c5"), CopyState::AwaitingAck);
        assert_eq!(manager.state("c2"), CopyState::Idle);
        assert_eq!(manager.under_copy_count(), 5);
        assert_eq!(manager.waiting_count(), 0);
    }

    #[test]
    fn duplicates_are_ignored() {
        let (manager, rx, _) = manager(1);
        assert_eq!(manager.add_content("a", Path::new("/a")), Admission::Started);
        assert_eq!(manager.add_content("b", Path::new("/b")), Admission::Queued);
        assert_eq!(manager.add_content("a", Path::new("/a2")), Admission::AlreadyTracked);
        assert_eq!(manager.add_content("b", Path::new("/b2")), Admission::AlreadyTracked);
        assert_eq!(acks(&rx), vec!["a"]);
        assert_eq!(manager.waiting_count(), 1);
    }

    #[test]
    fn ack_starts_streaming_once() {
        let (manager, _rx, streamer) = manager(2);
        manager.add_content("a", Path::new("/data/a"));
        assert!(manager.receive_ack("a"));
        assert_eq!(manager.state("a"), CopyState::Streaming);
        assert!(!manager.receive_ack("a"));
        assert!(!manager.receive_ack("unknown"));
        assert_eq!(*streamer.calls.lock(), vec!["start a /data/a".to_string()]);
    }

    #[test]
    fn removing_a_waiting_content_drops_it_from_the_queue() {
        let (manager, rx, _) = manager(1);
        manager.add_content("a", Path::new("/a"));
        manager.add_content("b", Path::new("/b"));
        manager.add_content("c", Path::new("/c"));
        manager.remove_content("b");
        assert_eq!(manager.state("b"), CopyState::Idle);
        // Slot still held by "a": nothing promoted.
        assert_eq!(acks(&rx), vec!["a"]);
        manager.remove_content("a");
        assert_eq!(acks(&rx), vec!["c"]);
    }

    #[test]
    fn timeout_sweep_aborts_and_promotes() {
        let (manager, rx, streamer) = manager(1);
        manager.add_content("stuck", Path::new("/s"));
        manager.add_content("next", Path::new("/n"));
        assert_eq!(acks(&rx), vec!["stuck"]);

        assert!(manager.sweep_timeouts_at(Instant::now()).is_empty());
        let reclaimed = manager.sweep_timeouts_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(reclaimed, vec!["stuck".to_string()]);
        assert_eq!(manager.state("stuck"), CopyState::Idle);
        assert_eq!(manager.state("next"), CopyState::AwaitingAck);
        assert_eq!(acks(&rx), vec!["next"]);
        assert_eq!(*streamer.calls.lock(), vec!["abort stuck".to_string()]);
    }

    #[test]
    fn streaming_content_times_out_from_admission() {
        let (manager, rx, streamer) = manager(1);
        let start = Instant::now();
        manager.add_content("a", Path::new("/a"));
        manager.add_content("b", Path::new("/b"));
        assert!(manager.receive_ack("a"));
        assert_eq!(manager.state("a"), CopyState::Streaming);
        assert_eq!(acks(&rx), vec!["a"]);

        assert!(manager.sweep_timeouts_at(start + Duration::from_secs(59)).is_empty());
        assert_eq!(
            manager.sweep_timeouts_at(start + Duration::from_secs(61)),
            vec!["a".to_string()]
        );
        assert_eq!(manager.state("a"), CopyState::Idle);
        assert_eq!(manager.state("b"), CopyState::AwaitingAck);
        assert_eq!(acks(&rx), vec!["b"]);
        assert_eq!(
            *streamer.calls.lock(),
            vec!["start a /a".to_string(), "abort a".to_string()]
        );
    }

    #[test]
    fn publishes_slot_counts() {
        let (tx, _rx) = unbounded();
        let ctx = ProcessContext::detached();
        let manager = CopyManager::new(
            tx,
            Arc::new(RecordingStreamer::default()),
            1,
            Duration::from_secs(60),
            ctx.clone(),
        );
        manager.add_content("a", Path::new("/a"));
        manager.add_content("b", Path::new("/b"));
        assert_eq!(ctx.vars.get(vars::CONTENTS_UNDER_COPY), 1);
        assert_eq!(ctx.vars.get(vars::CONTENTS_TO_COPY_QUEUE), 1);
    }
}
