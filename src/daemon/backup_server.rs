//! Backup server daemon: mirrors the content server's index and pulls every
//! content missing from the backup folder.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::{error, info};

use crate::content::content_data::ContentData;
use crate::content::dynamic::DynamicContentData;
use crate::copy::client::{ClientWorker, CopyClient};
use crate::copy::link::PeerLink;
use crate::copy::manager::len_as_i64;
use crate::copy::messages::{ClientEvent, Metadata, ToBackup, ToContentServer};
use crate::copy::receiver::TMP_DIR_NAME;
use crate::copy::transport::TcpClient;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::comparator::spawn_comparator;
use crate::daemon::context::vars;
use crate::daemon::runtime::DaemonRuntime;
use crate::daemon::signals::SignalHandler;
use crate::indexer::{IndexerConfig, QueueIndexer};

pub const ROLE: &str = "backup-server";

const POLL: Duration = Duration::from_millis(200);

pub struct BackupServer {
    runtime: DaemonRuntime,
    local: Arc<DynamicContentData>,
    remote: Arc<DynamicContentData>,
    index_rx: Receiver<ContentData>,
    client: CopyClient,
    check_delay: Duration,
    metadata: TcpClient<()>,
    files: Arc<TcpClient<ToContentServer>>,
    comparing: bool,
}

impl BackupServer {
    pub fn start(config: &Config, signals: SignalHandler) -> Result<Self> {
        let bs = &config.backup_server;
        let mut runtime = DaemonRuntime::start(config, ROLE, &bs.server_name, signals)?;
        let ctx = runtime.ctx.clone();
        let shutdown = runtime.signals.flag();
        let local = Arc::new(DynamicContentData::new());
        let remote = Arc::new(DynamicContentData::new());

        let (client_tx, client_rx) = unbounded::<ClientEvent>();
        let client = CopyClient::new(client_tx);
        let inbound = client.clone();
        let files = Arc::new(TcpClient::<ToContentServer>::connect(
            format!("{}:{}", bs.content_server_hostname, bs.content_server_files_port),
            move |message: ToBackup| inbound.handle_message(message),
        )?);
        let link: Arc<dyn PeerLink<ToContentServer>> =
            Arc::clone(&files) as Arc<dyn PeerLink<ToContentServer>>;
        let worker = ClientWorker::new(
            link,
            bs.backup_destination_folder.clone(),
            Arc::clone(&local),
            bs.server_name.clone(),
            ctx.clone(),
        );
        runtime.adopt("copy-client", worker.spawn(client_rx, Arc::clone(&shutdown))?);

        let installed = Arc::clone(&remote);
        let remote_ctx = ctx.clone();
        let metadata = TcpClient::<()>::connect(
            format!("{}:{}", bs.content_server_hostname, bs.content_server_data_port),
            move |message: Metadata| match message {
                Metadata::Snapshot(index) => {
                    info!(contents = index.contents_size(), "remote index received");
                    remote_ctx
                        .vars
                        .set(vars::REMOTE_CONTENTS, len_as_i64(index.contents_size()));
                    installed.replace(index);
                }
            },
        )?;

        let (index_tx, index_rx) = unbounded();
        let indexer = QueueIndexer::new(
            IndexerConfig::new(
                vec![bs.backup_destination_folder.clone()],
                bs.server_name.clone(),
                &backup_excludes(&config.index.exclude_patterns),
            )?,
            bs.local_content_data_path.clone(),
            Duration::from_secs(config.index.scan_interval_secs),
            Duration::from_secs(config.index.data_flush_delay_secs),
            config.index.gzip,
            index_tx,
            ctx,
        );
        runtime.adopt("indexer", indexer.spawn(shutdown)?);

        Ok(Self {
            runtime,
            local,
            remote,
            index_rx,
            client,
            check_delay: Duration::from_secs(bs.backup_check_delay_secs.max(1)),
            metadata,
            files,
            comparing: false,
        })
    }

    pub fn local_index(&self) -> &Arc<DynamicContentData> {
        &self.local
    }

    pub fn remote_index(&self) -> &Arc<DynamicContentData> {
        &self.remote
    }

    /// Main loop: install local index snapshots; the comparator starts once
    /// the backup folder has been indexed at least once.
    pub fn run(mut self) {
        let mut reason = "shutdown requested";
        while !self.runtime.should_shutdown() {
            match self.index_rx.recv_timeout(POLL) {
                Ok(snapshot) => {
                    self.runtime
                        .ctx
                        .vars
                        .set(vars::LOCAL_CONTENTS, len_as_i64(snapshot.contents_size()));
                    self.local.replace(snapshot);
                    if !self.comparing && !self.start_comparator() {
                        reason = "comparator failed to start";
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("indexer stopped unexpectedly");
                    reason = "indexer stopped";
                    break;
                }
            }
            self.runtime.tick();
        }
        let Self {
            runtime,
            metadata,
            files,
            ..
        } = self;
        metadata.close();
        files.close();
        runtime.finish(reason);
    }

    fn start_comparator(&mut self) -> bool {
        let spawned = spawn_comparator(
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            self.client.clone(),
            self.check_delay,
            self.runtime.ctx.clone(),
            self.runtime.signals.flag(),
        );
        match spawned {
            Ok(handle) => {
                self.runtime.adopt("comparator", handle);
                self.comparing = true;
                true
            }
            Err(e) => {
                error!(error = %e, "failed to start comparator");
                false
            }
        }
    }
}

/// Configured excludes plus the receiver's partial-file directory.
fn backup_excludes(configured: &[String]) -> Vec<String> {
    let mut patterns = configured.to_vec();
    patterns.push(format!(r"/{}(/|$)", regex::escape(TMP_DIR_NAME)));
    patterns
}

/// Run the backup server until SIGINT/SIGTERM.
pub fn run(config: &Config) -> Result<()> {
    let server = BackupServer::start(config, SignalHandler::new())?;
    info!(
        peer = %config.backup_server.content_server_hostname,
        destination = %config.backup_server.backup_destination_folder.display(),
        "backup server ready"
    );
    server.run();
    Ok(())
}
