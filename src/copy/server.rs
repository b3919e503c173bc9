//! Sender-side protocol endpoint.
//!
//! A single worker drains the server queue: ack requests queued by the
//! manager, wire messages from the backup peer and chunks produced by the
//! streamer are handled strictly one at a time in arrival order.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::copy::link::PeerLink;
use crate::copy::manager::{CopyManager, CopyState, len_as_i64};
use crate::copy::messages::{ServerEvent, ToBackup, now_timestamp};
use crate::copy::streamer::Streamer;
use crate::core::errors::{MirrorError, Result};
use crate::daemon::context::{ProcessContext, vars};
use crate::logger::activity::ActivityEvent;

const POLL: Duration = Duration::from_millis(200);

pub struct CopyServer {
    link: Arc<dyn PeerLink<ToBackup>>,
    manager: Arc<CopyManager>,
    streamer: Arc<dyn Streamer>,
    ack_timeout_secs: i64,
    ctx: ProcessContext,
}

impl CopyServer {
    pub fn new(
        link: Arc<dyn PeerLink<ToBackup>>,
        manager: Arc<CopyManager>,
        streamer: Arc<dyn Streamer>,
        ack_timeout: Duration,
        ctx: ProcessContext,
    ) -> Self {
        Self {
            link,
            manager,
            streamer,
            ack_timeout_secs: i64::try_from(ack_timeout.as_secs()).unwrap_or(i64::MAX),
            ctx,
        }
    }

    pub fn manager(&self) -> &Arc<CopyManager> {
        &self.manager
    }

    /// Drain `events` on a dedicated thread until `shutdown` is set or every
    /// sender is gone.
    pub fn spawn(self, events: Receiver<ServerEvent>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cmir-copy-server".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match events.recv_timeout(POLL) {
                        Ok(event) => {
                            self.ctx
                                .vars
                                .set(vars::COPY_FILE_QUEUE_SIZE, len_as_i64(events.len()));
                            self.handle(event);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("copy server loop stopped");
            })
            .map_err(|e| MirrorError::Runtime {
                details: format!("failed to spawn copy server: {e}"),
            })
    }

    pub fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::SendAck(checksum) => {
                debug!(checksum = %checksum, "requesting ack");
                self.send(&ToBackup::AckRequest {
                    checksum,
                    timestamp: now_timestamp(),
                });
            }
            ServerEvent::Copy(diff) => {
                info!(
                    contents = diff.contents_size(),
                    instances = diff.instances_size(),
                    "copy requested by backup server"
                );
                self.ctx.vars.inc(vars::NUM_COPY_REQUESTS, 1);
                self.ctx.record(ActivityEvent::CopyRequested {
                    contents: diff.contents_size(),
                    instances: diff.instances_size(),
                });
                for instance in diff.instances() {
                    self.manager
                        .add_content(&instance.checksum, Path::new(&instance.path));
                }
            }
            ServerEvent::Ack {
                timestamp,
                need_copy,
                checksum,
            } => {
                // The timestamp comes from this server's own ack request.
                let age = now_timestamp() - timestamp;
                if !need_copy {
                    debug!(checksum = %checksum, "peer already has content");
                    self.manager.remove_content(&checksum);
                } else if age < self.ack_timeout_secs {
                    self.manager.receive_ack(&checksum);
                } else {
                    debug!(checksum = %checksum, age, timeout = self.ack_timeout_secs, "ack timed out");
                    self.manager.remove_content(&checksum);
                }
            }
            ServerEvent::CopyChunk(chunk) => {
                let eof = chunk.is_eof();
                let checksum = chunk.checksum.clone();
                if self.manager.state(&checksum) != CopyState::Streaming {
                    debug!(checksum = %checksum, offset = chunk.offset, "chunk for content not streaming, dropped");
                    return;
                }
                debug!(checksum = %checksum, offset = chunk.offset, file_size = chunk.file_size, eof, "sending chunk");
                self.send(&ToBackup::CopyChunk(chunk));
                if eof {
                    self.manager.remove_content(&checksum);
                }
            }
            ServerEvent::CopyChunkFromRemote(checksum) => {
                self.streamer.copy_another_chunk(&checksum);
            }
            ServerEvent::AbortCopy(checksum) => {
                info!(checksum = %checksum, "aborting file copy");
                self.streamer.abort_streaming(&checksum);
                self.manager.remove_content(&checksum);
                self.ctx.vars.inc(vars::NUM_ABORTED_COPIES, 1);
                self.ctx.record(ActivityEvent::CopyAborted {
                    checksum,
                    reason: "abort requested".to_string(),
                });
            }
            ServerEvent::ResetResumeCopy { checksum, offset } => {
                debug!(checksum = %checksum, offset, "resetting copy cursor");
                self.streamer.reset_streaming(&checksum, offset);
            }
        }
    }

    fn send(&self, message: &ToBackup) {
        if let Err(e) = self.link.send(message) {
            warn!(error = %e, "failed to send to backup server");
            self.ctx.vars.inc(vars::PROTOCOL_ERRORS, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::content_data::ContentData;
    use crate::copy::link::ChannelLink;
    use crate::copy::manager::tests::RecordingStreamer;
    use crate::copy::messages::FileChunk;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    struct Harness {
        server: CopyServer,
        events: Receiver<ServerEvent>,
        peer: Receiver<ToBackup>,
        streamer: Arc<RecordingStreamer>,
    }

    fn harness(max: usize) -> Harness {
        let (tx, events) = unbounded();
        let streamer = Arc::new(RecordingStreamer::default());
        let ctx = ProcessContext::detached();
        let manager = Arc::new(CopyManager::new(
            tx,
            Arc::clone(&streamer) as Arc<dyn Streamer>,
            max,
            Duration::from_secs(60),
            ctx.clone(),
        ));
        let (link, peer) = ChannelLink::pair();
        let server = CopyServer::new(
            Arc::new(link),
            manager,
            Arc::clone(&streamer) as Arc<dyn Streamer>,
            Duration::from_secs(5),
            ctx,
        );
        Harness {
            server,
            events,
            peer,
            streamer,
        }
    }

    impl Harness {
        /// Handle queued events until the queue is empty.
        fn drain(&self) {
            while let Ok(event) = self.events.try_recv() {
                self.server.handle(event);
            }
        }
    }

    fn diff(checksums: &[&str]) -> ContentData {
        let mut cd = ContentData::new();
        for checksum in checksums {
            cd.add_instance(*checksum, 1, "cs", "dev", format!("/data/{checksum}"), 1);
        }
        cd
    }

    #[test]
    fn copy_request_turns_into_ack_requests() {
        let h = harness(5);
        h.server.handle(ServerEvent::Copy(diff(&["a", "b"])));
        h.drain();
        let sent: Vec<ToBackup> = h.peer.try_iter().collect();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], ToBackup::AckRequest { checksum, .. } if checksum == "a"));
        assert!(matches!(&sent[1], ToBackup::AckRequest { checksum, .. } if checksum == "b"));
    }

    #[test]
    fn fresh_positive_ack_starts_streaming() {
        let h = harness(5);
        h.server.handle(ServerEvent::Copy(diff(&["a"])));
        h.drain();
        h.server.handle(ServerEvent::Ack {
            timestamp: now_timestamp(),
            need_copy: true,
            checksum: "a".to_string(),
        });
        assert_eq!(h.server.manager().state("a"), CopyState::Streaming);
        assert_eq!(*h.streamer.calls.lock(), vec!["start a /data/a".to_string()]);
    }

    #[test]
    fn stale_or_negative_ack_frees_the_slot() {
        let h = harness(5);
        h.server.handle(ServerEvent::Copy(diff(&["a", "b"])));
        h.drain();
        h.server.handle(ServerEvent::Ack {
            timestamp: now_timestamp() - 60,
            need_copy: true,
            checksum: "a".to_string(),
        });
        h.server.handle(ServerEvent::Ack {
            timestamp: now_timestamp(),
            need_copy: false,
            checksum: "b".to_string(),
        });
        assert_eq!(h.server.manager().state("a"), CopyState::Idle);
        assert_eq!(h.server.manager().state("b"), CopyState::Idle);
        assert!(h.streamer.calls.lock().is_empty());
    }

    #[test]
    fn eof_chunk_is_forwarded_and_releases_slot() {
        let h = harness(1);
        h.server.handle(ServerEvent::Copy(diff(&["a", "b"])));
        h.drain();
        let _ = h.peer.try_iter().count();
        h.server.handle(ServerEvent::Ack {
            timestamp: now_timestamp(),
            need_copy: true,
            checksum: "a".to_string(),
        });
        h.server
            .handle(ServerEvent::CopyChunk(FileChunk::data("a", 0, 1, vec![7], "x".to_string())));
        assert_eq!(h.server.manager().state("b"), CopyState::Waiting);
        h.server.handle(ServerEvent::CopyChunk(FileChunk::eof("a", 1, 1)));
        h.drain();

        let sent: Vec<ToBackup> = h.peer.try_iter().collect();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[1], ToBackup::CopyChunk(chunk) if chunk.is_eof()));
        assert!(matches!(&sent[2], ToBackup::AckRequest { checksum, .. } if checksum == "b"));
        assert_eq!(h.server.manager().state("a"), CopyState::Idle);
    }

    #[test]
    fn peer_requests_reach_the_streamer() {
        let h = harness(5);
        h.server.handle(ServerEvent::Copy(diff(&["a"])));
        h.drain();
        h.server.handle(ServerEvent::CopyChunkFromRemote("a".to_string()));
        h.server.handle(ServerEvent::ResetResumeCopy {
            checksum: "a".to_string(),
            offset: 42,
        });
        h.server.handle(ServerEvent::AbortCopy("a".to_string()));
        assert_eq!(
            *h.streamer.calls.lock(),
            vec![
                "next a".to_string(),
                "reset a 42".to_string(),
                "abort a".to_string()
            ]
        );
        assert_eq!(h.server.manager().state("a"), CopyState::Idle);
    }

    #[test]
    fn chunk_after_timeout_reclaim_is_dropped() {
        let h = harness(1);
        let start = Instant::now();
        h.server.handle(ServerEvent::Copy(diff(&["a"])));
        h.drain();
        h.server.handle(ServerEvent::Ack {
            timestamp: now_timestamp(),
            need_copy: true,
            checksum: "a".to_string(),
        });
        let _ = h.peer.try_iter().count();

        let reclaimed = h.server.manager().sweep_timeouts_at(start + Duration::from_secs(61));
        assert_eq!(reclaimed, vec!["a".to_string()]);
        h.server
            .handle(ServerEvent::CopyChunk(FileChunk::data("a", 0, 2, vec![1], "x".to_string())));
        h.server.handle(ServerEvent::CopyChunk(FileChunk::eof("a", 2, 2)));
        assert_eq!(h.peer.try_iter().count(), 0);
    }

    #[test]
    fn chunk_for_unacked_content_is_dropped() {
        let h = harness(1);
        h.server.handle(ServerEvent::Copy(diff(&["a"])));
        h.drain();
        let _ = h.peer.try_iter().count();
        h.server
            .handle(ServerEvent::CopyChunk(FileChunk::data("a", 0, 1, vec![1], "x".to_string())));
        assert_eq!(h.peer.try_iter().count(), 0);
        assert_eq!(h.server.manager().state("a"), CopyState::AwaitingAck);
    }
}
