//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use content_mirror::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{MirrorError, Result};

// Content index
pub use crate::content::algebra::{intersect, merge, merge_override_b, remove, remove_instances};
pub use crate::content::content_data::{Checksum, Content, ContentData, Instance, Symlink};
pub use crate::content::dynamic::DynamicContentData;
pub use crate::content::format::{FileCompression, IndexFormat, WriteOptions};
pub use crate::content::validation::{CheckLevel, ValidationOptions};

// Copy protocol
pub use crate::copy::{
    Admission, ClientWorker, CopyClient, CopyManager, CopyServer, CopyState, FileReceiver,
    FileStreamer, PeerLink, Receipt, Streamer,
};

// Indexer
pub use crate::indexer::{IndexerConfig, QueueIndexer, index_tree};

// Process context
pub use crate::daemon::context::{ProcessContext, ProcessVars};
