#![forbid(unsafe_code)]

//! Content mirror (cmir): a content server indexes a file tree and streams
//! every content the backup server lacks, one bounded set of copies at a time.
//!
//! 1. **Content index** ([`content`]): contents, instances and symlinks with
//!    set algebra, a text file format and a live snapshot holder.
//! 2. **Copy protocol** ([`copy`]): admission control, sender and receiver
//!    endpoints, chunk streaming and framed TCP transport.
//! 3. **Daemons** ([`daemon`]): the two long-running processes that wire the
//!    indexer, protocol and transport together.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use content_mirror::prelude::*;
//! ```

pub mod prelude;

pub mod content;
pub mod copy;
pub mod core;
pub mod daemon;
pub mod indexer;
pub mod logger;
