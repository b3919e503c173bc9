//! Filesystem indexing: one-shot tree walks and the periodic queue indexer.

pub mod queue;
pub mod walker;

pub use queue::QueueIndexer;
pub use walker::{IndexReport, IndexerConfig, index_tree};
