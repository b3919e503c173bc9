//! Content server daemon: indexes the monitored paths, publishes the index
//! to the backup peer and serves file copies.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::content::content_data::ContentData;
use crate::content::dynamic::DynamicContentData;
use crate::copy::link::PeerLink;
use crate::copy::manager::{CopyManager, len_as_i64, spawn_timeout_sweep};
use crate::copy::messages::{Metadata, ServerEvent, ToBackup, ToContentServer};
use crate::copy::server::CopyServer;
use crate::copy::streamer::{FileStreamer, StreamEvent, Streamer};
use crate::copy::transport::TcpServer;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::context::vars;
use crate::daemon::runtime::DaemonRuntime;
use crate::daemon::signals::SignalHandler;
use crate::indexer::{IndexerConfig, QueueIndexer};

pub const ROLE: &str = "content-server";

const POLL: Duration = Duration::from_millis(200);

pub struct ContentServer {
    runtime: DaemonRuntime,
    local: Arc<DynamicContentData>,
    index_rx: Receiver<ContentData>,
    metadata: TcpServer<Metadata>,
    peer_joined: Arc<AtomicBool>,
    files: Arc<TcpServer<ToBackup>>,
    manager: Arc<CopyManager>,
    streamer_join: JoinHandle<()>,
}

impl ContentServer {
    /// Bind both ports and start every worker. The main loop runs in [`run`](Self::run).
    pub fn start(config: &Config, signals: SignalHandler) -> Result<Self> {
        let cs = &config.content_server;
        let mut runtime = DaemonRuntime::start(config, ROLE, &cs.server_name, signals)?;
        let ctx = runtime.ctx.clone();
        let shutdown = runtime.signals.flag();

        let (events_tx, events_rx) = unbounded::<ServerEvent>();
        let (streamer, streamer_join) = FileStreamer::spawn(
            config.copy.streaming_chunk_size,
            stream_events_to(events_tx.clone()),
        )?;
        let streamer: Arc<dyn Streamer> = Arc::new(streamer);
        let manager = Arc::new(CopyManager::new(
            events_tx.clone(),
            Arc::clone(&streamer),
            config.copy.max_copy_streams,
            config.copy.local_timeout(),
            ctx.clone(),
        ));

        let wire_tx = events_tx;
        let files = Arc::new(TcpServer::<ToBackup>::bind(
            ("0.0.0.0", cs.files_port),
            move |message: ToContentServer| {
                if wire_tx.send(ServerEvent::from(message)).is_err() {
                    debug!("copy server queue closed; message dropped");
                }
            },
            || info!("backup server connected for files"),
        )?);

        let link: Arc<dyn PeerLink<ToBackup>> = Arc::clone(&files) as Arc<dyn PeerLink<ToBackup>>;
        let server = CopyServer::new(
            link,
            Arc::clone(&manager),
            streamer,
            config.copy.ack_timeout(),
            ctx.clone(),
        );
        runtime.adopt("copy-server", server.spawn(events_rx, Arc::clone(&shutdown))?);
        runtime.adopt(
            "copy-sweep",
            spawn_timeout_sweep(Arc::clone(&manager), config.copy.sweep_interval(), Arc::clone(&shutdown))?,
        );

        let (index_tx, index_rx) = unbounded();
        let indexer = QueueIndexer::new(
            IndexerConfig::new(
                cs.monitoring_paths.clone(),
                cs.server_name.clone(),
                &config.index.exclude_patterns,
            )?,
            cs.local_content_data_path.clone(),
            Duration::from_secs(config.index.scan_interval_secs),
            Duration::from_secs(config.index.data_flush_delay_secs),
            config.index.gzip,
            index_tx,
            ctx,
        );
        runtime.adopt("indexer", indexer.spawn(shutdown)?);

        let peer_joined = Arc::new(AtomicBool::new(false));
        let joined = Arc::clone(&peer_joined);
        let metadata = TcpServer::<Metadata>::bind(
            ("0.0.0.0", cs.data_port),
            |(): ()| {},
            move || joined.store(true, Ordering::Relaxed),
        )?;

        Ok(Self {
            runtime,
            local: Arc::new(DynamicContentData::new()),
            index_rx,
            metadata,
            peer_joined,
            files,
            manager,
            streamer_join,
        })
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.metadata.local_addr()
    }

    pub fn files_addr(&self) -> SocketAddr {
        self.files.local_addr()
    }

    pub fn local_index(&self) -> &Arc<DynamicContentData> {
        &self.local
    }

    /// Main loop: install index snapshots and publish them to the peer.
    pub fn run(mut self) {
        let mut reason = "shutdown requested";
        while !self.runtime.should_shutdown() {
            let mut changed = false;
            match self.index_rx.recv_timeout(POLL) {
                Ok(snapshot) => {
                    self.runtime
                        .ctx
                        .vars
                        .set(vars::LOCAL_CONTENTS, len_as_i64(snapshot.contents_size()));
                    if *self.local.snapshot() != snapshot {
                        self.local.replace(snapshot);
                        changed = true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("indexer stopped unexpectedly");
                    reason = "indexer stopped";
                    break;
                }
            }
            let joined = self.peer_joined.swap(false, Ordering::Relaxed);
            if (changed || joined) && self.metadata.is_connected() {
                self.publish();
            }
            self.runtime.tick();
        }
        self.shutdown(reason);
    }

    fn publish(&self) {
        let snapshot = self.local.last_content_data();
        debug!(contents = snapshot.contents_size(), "publishing index");
        if let Err(e) = self.metadata.send(&Metadata::Snapshot(snapshot)) {
            warn!(error = %e, "failed to publish index");
        }
    }

    fn shutdown(self, reason: &str) {
        let Self {
            runtime,
            metadata,
            files,
            manager,
            streamer_join,
            ..
        } = self;
        runtime.finish(reason);
        drop(metadata);
        drop(files);
        // The streamer worker exits once its last handle is gone.
        drop(manager);
        let _ = streamer_join.join();
    }
}

fn stream_events_to(events: Sender<ServerEvent>) -> impl Fn(StreamEvent) + Send + 'static {
    move |event| {
        let next = match event {
            StreamEvent::Chunk(chunk) => ServerEvent::CopyChunk(chunk),
            StreamEvent::Failed { checksum, reason } => {
                warn!(checksum = %checksum, reason = %reason, "streaming failed");
                ServerEvent::AbortCopy(checksum)
            }
        };
        if events.send(next).is_err() {
            debug!("copy server queue closed; stream event dropped");
        }
    }
}

/// Run the content server until SIGINT/SIGTERM.
pub fn run(config: &Config) -> Result<()> {
    let server = ContentServer::start(config, SignalHandler::new())?;
    info!(data = %server.data_addr(), files = %server.files_addr(), "content server ready");
    server.run();
    Ok(())
}
