//! Protocol messages.
//!
//! Wire enums are closed per direction; the copy server and copy client each
//! drain one internal event enum that also carries their local requests.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::content::content_data::{Checksum, ContentData};

/// One piece of a file being streamed. `content` and `content_checksum` are
/// both `None` on the end-of-file sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub checksum: Checksum,
    pub offset: u64,
    pub file_size: u64,
    pub content: Option<Vec<u8>>,
    pub content_checksum: Option<String>,
}

impl FileChunk {
    pub fn data(
        checksum: impl Into<Checksum>,
        offset: u64,
        file_size: u64,
        content: Vec<u8>,
        content_checksum: String,
    ) -> Self {
        Self {
            checksum: checksum.into(),
            offset,
            file_size,
            content: Some(content),
            content_checksum: Some(content_checksum),
        }
    }

    pub fn eof(checksum: impl Into<Checksum>, offset: u64, file_size: u64) -> Self {
        Self {
            checksum: checksum.into(),
            offset,
            file_size,
            content: None,
            content_checksum: None,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.content.is_none() && self.content_checksum.is_none()
    }
}

/// Content server -> backup server, files connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToBackup {
    /// "Do you need this content?" `timestamp` is the sender's clock.
    AckRequest { checksum: Checksum, timestamp: i64 },
    CopyChunk(FileChunk),
}

/// Backup server -> content server, files connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToContentServer {
    /// Copy every content of this diff.
    Copy(ContentData),
    /// Answer to an ack request; `timestamp` echoes the request's.
    Ack {
        timestamp: i64,
        need_copy: bool,
        checksum: Checksum,
    },
    /// Previous chunk stored, send the next one.
    CopyChunkFromRemote(Checksum),
    AbortCopy(Checksum),
    ResetResumeCopy { checksum: Checksum, offset: u64 },
}

/// Content server -> backup server, metadata connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metadata {
    Snapshot(ContentData),
}

/// Everything the copy server loop handles, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Manager admitted a content: ask the peer whether it needs it.
    SendAck(Checksum),
    Copy(ContentData),
    Ack {
        timestamp: i64,
        need_copy: bool,
        checksum: Checksum,
    },
    /// Streamer produced a chunk (or EOF) to forward to the peer.
    CopyChunk(FileChunk),
    CopyChunkFromRemote(Checksum),
    AbortCopy(Checksum),
    ResetResumeCopy { checksum: Checksum, offset: u64 },
}

impl From<ToContentServer> for ServerEvent {
    fn from(message: ToContentServer) -> Self {
        match message {
            ToContentServer::Copy(diff) => Self::Copy(diff),
            ToContentServer::Ack {
                timestamp,
                need_copy,
                checksum,
            } => Self::Ack {
                timestamp,
                need_copy,
                checksum,
            },
            ToContentServer::CopyChunkFromRemote(checksum) => Self::CopyChunkFromRemote(checksum),
            ToContentServer::AbortCopy(checksum) => Self::AbortCopy(checksum),
            ToContentServer::ResetResumeCopy { checksum, offset } => {
                Self::ResetResumeCopy { checksum, offset }
            }
        }
    }
}

/// Everything the copy client loop handles, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SendCopy(ContentData),
    CopyChunk(FileChunk),
    AckRequest { checksum: Checksum, timestamp: i64 },
    AbortCopy(Checksum),
    ResetResumeCopy { checksum: Checksum, offset: u64 },
}

impl From<ToBackup> for ClientEvent {
    fn from(message: ToBackup) -> Self {
        match message {
            ToBackup::AckRequest {
                checksum,
                timestamp,
            } => Self::AckRequest {
                checksum,
                timestamp,
            },
            ToBackup::CopyChunk(chunk) => Self::CopyChunk(chunk),
        }
    }
}

/// Seconds since the epoch, the unit of every protocol timestamp.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
