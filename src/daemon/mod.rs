//! Daemon subsystem: the content server and backup server processes, their
//! shared runtime, process context, state file and signal handling.

pub mod comparator;
pub mod context;
pub mod state;

#[cfg(feature = "daemon")]
pub mod backup_server;
#[cfg(feature = "daemon")]
pub mod content_server;
#[cfg(feature = "daemon")]
pub mod runtime;
#[cfg(feature = "daemon")]
pub mod signals;
