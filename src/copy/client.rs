//! Receiver-side protocol endpoint.
//!
//! [`CopyClient`] is the cheap, cloneable request side; [`ClientWorker`]
//! owns the file receiver and drains the client queue, which carries both
//! local requests and messages from the content server, in order.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::content::checksum::validate_checksum;
use crate::content::content_data::{ContentData, Instance};
use crate::content::dynamic::DynamicContentData;
use crate::copy::link::PeerLink;
use crate::copy::manager::len_as_i64;
use crate::copy::messages::{ClientEvent, FileChunk, ToBackup, ToContentServer};
use crate::copy::receiver::{FileReceiver, Receipt};
use crate::core::errors::{MirrorError, Result};
use crate::core::paths::{destination_filename, index_path_string};
use crate::daemon::context::{ProcessContext, vars};
use crate::indexer::walker::{device_id, mod_time_secs};
use crate::logger::activity::ActivityEvent;

const POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct CopyClient {
    queue: Sender<ClientEvent>,
}

impl CopyClient {
    pub fn new(queue: Sender<ClientEvent>) -> Self {
        Self { queue }
    }

    /// Ask the content server to copy every content of `diff`.
    pub fn request_copy(&self, diff: ContentData) {
        self.push(ClientEvent::SendCopy(diff));
    }

    pub fn abort_copy(&self, checksum: &str) {
        self.push(ClientEvent::AbortCopy(checksum.to_string()));
    }

    pub fn reset_copy(&self, checksum: &str, offset: u64) {
        self.push(ClientEvent::ResetResumeCopy {
            checksum: checksum.to_string(),
            offset,
        });
    }

    /// Entry point for messages read from the content server.
    pub fn handle_message(&self, message: ToBackup) {
        self.push(message.into());
    }

    fn push(&self, event: ClientEvent) {
        if self.queue.send(event).is_err() {
            warn!("copy client queue closed; request dropped");
        }
    }
}

pub struct ClientWorker {
    link: Arc<dyn PeerLink<ToContentServer>>,
    receiver: FileReceiver,
    local_index: Arc<DynamicContentData>,
    server_name: String,
    ctx: ProcessContext,
}

impl ClientWorker {
    pub fn new(
        link: Arc<dyn PeerLink<ToContentServer>>,
        destination: impl Into<PathBuf>,
        local_index: Arc<DynamicContentData>,
        server_name: impl Into<String>,
        ctx: ProcessContext,
    ) -> Self {
        Self {
            link,
            receiver: FileReceiver::new(destination),
            local_index,
            server_name: server_name.into(),
            ctx,
        }
    }

    pub fn spawn(mut self, events: Receiver<ClientEvent>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cmir-copy-client".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match events.recv_timeout(POLL) {
                        Ok(event) => {
                            self.ctx
                                .vars
                                .set(vars::FILE_COPY_CLIENT_QUEUE, len_as_i64(events.len()));
                            self.handle(event);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("copy client loop stopped");
            })
            .map_err(|e| MirrorError::Runtime {
                details: format!("failed to spawn copy client: {e}"),
            })
    }

    pub fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::SendCopy(diff) => {
                info!(contents = diff.contents_size(), "requesting copy");
                self.send(&ToContentServer::Copy(diff));
            }
            ClientEvent::CopyChunk(chunk) => self.on_chunk(&chunk),
            ClientEvent::AckRequest {
                checksum,
                timestamp,
            } => {
                let need_copy = match validate_checksum(&checksum) {
                    Ok(()) => !destination_filename(self.receiver.destination(), &checksum).exists(),
                    Err(e) => {
                        warn!(error = %e, "declining ack request");
                        false
                    }
                };
                debug!(checksum = %checksum, timestamp, need_copy, "answering ack request");
                self.send(&ToContentServer::Ack {
                    timestamp,
                    need_copy,
                    checksum,
                });
            }
            ClientEvent::AbortCopy(checksum) => {
                self.receiver.release(&checksum);
                self.send(&ToContentServer::AbortCopy(checksum));
            }
            ClientEvent::ResetResumeCopy { checksum, offset } => {
                self.send(&ToContentServer::ResetResumeCopy { checksum, offset });
            }
        }
    }

    fn on_chunk(&mut self, chunk: &FileChunk) {
        let checksum = chunk.checksum.clone();
        match self.receiver.receive_chunk(chunk) {
            Receipt::Stored => self.send(&ToContentServer::CopyChunkFromRemote(checksum)),
            Receipt::Completed { path, size } => self.done_copy(&checksum, &path, size),
            Receipt::ResetRequested { offset } => {
                debug!(checksum = %checksum, offset, "requesting resend");
                self.send(&ToContentServer::ResetResumeCopy { checksum, offset });
            }
            Receipt::Aborted { reason } => {
                error!(checksum = %checksum, reason = %reason, "receive_chunk failed");
                self.ctx.vars.inc(vars::NUM_ABORTED_COPIES, 1);
                self.ctx.record(ActivityEvent::CopyAborted {
                    checksum: checksum.clone(),
                    reason,
                });
                self.send(&ToContentServer::AbortCopy(checksum));
            }
        }
    }

    /// A content landed: count it and index it as a local instance.
    fn done_copy(&self, checksum: &str, path: &Path, size: u64) {
        self.ctx.vars.inc(vars::NUM_FILES_RECEIVED, 1);
        self.ctx.record(ActivityEvent::FileReceived {
            checksum: checksum.to_string(),
            path: path.display().to_string(),
            size,
        });
        let (device, mod_time) = match fs::metadata(path) {
            Ok(meta) => (device_id(&meta), mod_time_secs(&meta)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "received file vanished");
                return;
            }
        };
        let mut landed = ContentData::new();
        landed.insert(Instance {
            checksum: checksum.to_string(),
            size,
            server: self.server_name.clone(),
            device,
            path: index_path_string(path),
            mod_time,
        });
        self.local_index.update(&landed);
    }

    fn send(&self, message: &ToContentServer) {
        if let Err(e) = self.link.send(message) {
            warn!(error = %e, "failed to send to content server");
            self.ctx.vars.inc(vars::PROTOCOL_ERRORS, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::checksum::bytes_checksum;
    use crate::copy::link::ChannelLink;

    struct Harness {
        _dir: tempfile::TempDir,
        dest: PathBuf,
        worker: ClientWorker,
        peer: Receiver<ToContentServer>,
        local: Arc<DynamicContentData>,
        ctx: ProcessContext,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("backup");
        let (link, peer) = ChannelLink::pair();
        let local = Arc::new(DynamicContentData::new());
        let ctx = ProcessContext::detached();
        let worker = ClientWorker::new(Arc::new(link), &dest, Arc::clone(&local), "bk", ctx.clone());
        Harness {
            _dir: dir,
            dest,
            worker,
            peer,
            local,
            ctx,
        }
    }

    #[test]
    fn ack_request_reports_whether_content_is_needed() {
        let mut h = harness();
        let missing = bytes_checksum(b"missing");
        let present = bytes_checksum(b"present");
        h.worker.handle(ClientEvent::AckRequest {
            checksum: missing.clone(),
            timestamp: 11,
        });
        let existing = destination_filename(&h.dest, &present);
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"present").unwrap();
        h.worker.handle(ClientEvent::AckRequest {
            checksum: present.clone(),
            timestamp: 12,
        });

        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(
            sent,
            vec![
                ToContentServer::Ack {
                    timestamp: 11,
                    need_copy: true,
                    checksum: missing
                },
                ToContentServer::Ack {
                    timestamp: 12,
                    need_copy: false,
                    checksum: present
                },
            ]
        );
    }

    #[test]
    fn malformed_ack_request_is_declined() {
        let mut h = harness();
        h.worker.handle(ClientEvent::AckRequest {
            checksum: "../outside".to_string(),
            timestamp: 3,
        });
        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(
            sent,
            vec![ToContentServer::Ack {
                timestamp: 3,
                need_copy: false,
                checksum: "../outside".to_string()
            }]
        );
    }

    #[test]
    fn malformed_chunk_is_aborted() {
        let mut h = harness();
        h.worker.handle(ClientEvent::CopyChunk(FileChunk::eof("../../etc/passwd", 0, 0)));
        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(sent, vec![ToContentServer::AbortCopy("../../etc/passwd".to_string())]);
        assert_eq!(h.ctx.vars.get(vars::NUM_ABORTED_COPIES), 1);
        assert!(!h.dest.exists());
    }

    #[test]
    fn chunks_are_pulled_until_file_lands() {
        let mut h = harness();
        let body = b"some file body";
        let checksum = bytes_checksum(body);
        h.worker.handle(ClientEvent::CopyChunk(FileChunk::data(
            checksum.clone(),
            0,
            body.len() as u64,
            body.to_vec(),
            bytes_checksum(body),
        )));
        h.worker.handle(ClientEvent::CopyChunk(FileChunk::eof(
            checksum.clone(),
            body.len() as u64,
            body.len() as u64,
        )));

        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(sent, vec![ToContentServer::CopyChunkFromRemote(checksum.clone())]);
        assert_eq!(h.ctx.vars.get(vars::NUM_FILES_RECEIVED), 1);

        let dest = destination_filename(&h.dest, &checksum);
        assert_eq!(fs::read(&dest).unwrap(), body);
        let local = h.local.snapshot();
        assert!(local.content_has_instance(&checksum, "bk", &index_path_string(&dest)));
    }

    #[test]
    fn corrupted_chunk_asks_for_resend() {
        let mut h = harness();
        let checksum = bytes_checksum(b"data");
        h.worker.handle(ClientEvent::CopyChunk(FileChunk::data(
            checksum.clone(),
            0,
            4,
            b"data".to_vec(),
            "not-the-checksum".to_string(),
        )));
        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(
            sent,
            vec![ToContentServer::ResetResumeCopy { checksum, offset: 0 }]
        );
    }

    #[test]
    fn local_requests_are_forwarded() {
        let mut h = harness();
        let (tx, rx) = crossbeam_channel::unbounded();
        let client = CopyClient::new(tx);
        let mut diff = ContentData::new();
        diff.add_instance("a", 1, "cs", "dev", "/a", 1);
        client.request_copy(diff.clone());
        client.abort_copy("a");
        client.reset_copy("a", 9);
        for event in rx.try_iter() {
            h.worker.handle(event);
        }
        let sent: Vec<ToContentServer> = h.peer.try_iter().collect();
        assert_eq!(
            sent,
            vec![
                ToContentServer::Copy(diff),
                ToContentServer::AbortCopy("a".to_string()),
                ToContentServer::ResetResumeCopy {
                    checksum: "a".to_string(),
                    offset: 9
                },
            ]
        );
    }
}
