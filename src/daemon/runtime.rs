//! Process scaffolding shared by both daemons: activity logger, process
//! context, state file and shutdown sequencing.

#![allow(missing_docs)]

use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::context::ProcessContext;
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler};
use crate::daemon::state::StateWriter;
use crate::logger::activity::{ActivityEvent, ActivityLoggerConfig, spawn_logger};
use crate::logger::jsonl::JsonlConfig;

pub struct DaemonRuntime {
    role: &'static str,
    pub ctx: ProcessContext,
    pub signals: SignalHandler,
    state: StateWriter,
    logger_join: Option<JoinHandle<()>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl DaemonRuntime {
    /// Start the activity logger and record the start event.
    pub fn start(config: &Config, role: &'static str, server_name: &str, signals: SignalHandler) -> Result<Self> {
        let jsonl = JsonlConfig {
            path: config.paths.jsonl_log.clone(),
            ..JsonlConfig::default()
        };
        let (activity, logger_join) = spawn_logger(ActivityLoggerConfig::new(jsonl))?;
        let ctx = ProcessContext::new(activity);

        let config_hash = config.stable_hash().unwrap_or_default();
        info!(role, server = server_name, config_hash = %config_hash, "starting");
        ctx.record(ActivityEvent::ServerStarted {
            role: role.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });

        let state = StateWriter::new(
            config.paths.state_file.clone(),
            role,
            server_name,
            Duration::from_secs(config.telemetry.state_write_interval_secs.max(1)),
        );
        Ok(Self {
            role,
            ctx,
            signals,
            state,
            logger_join: Some(logger_join),
            workers: Vec::new(),
        })
    }

    /// Track a worker thread to be joined on shutdown.
    pub fn adopt(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.workers.push((name, handle));
    }

    /// Periodic housekeeping for the main loop.
    pub fn tick(&mut self) {
        self.state.maybe_write(&self.ctx);
    }

    pub fn should_shutdown(&self) -> bool {
        self.signals.should_shutdown()
    }

    /// Stop every adopted worker, record the stop event and drain the logger.
    pub fn finish(mut self, reason: &str) {
        self.signals.request_shutdown();
        let uptime_secs = self.state.uptime().as_secs();
        let workers = std::mem::take(&mut self.workers);
        ShutdownCoordinator::new().join_all(workers);

        self.ctx.record(ActivityEvent::ServerStopped {
            role: self.role.to_string(),
            reason: reason.to_string(),
            uptime_secs,
        });
        self.ctx.activity.shutdown();
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
        info!(role = self.role, uptime_secs, reason, "stopped");
    }
}
