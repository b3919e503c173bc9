//! Sender-side byte source: reads one file per checksum in fixed-size chunks.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{debug, warn};

use crate::content::checksum::bytes_checksum;
use crate::content::content_data::Checksum;
use crate::copy::messages::FileChunk;
use crate::core::errors::{MirrorError, Result};

/// Operations the copy protocol needs from a byte source.
///
/// Calls only enqueue work; produced chunks come back through the
/// streamer's event callback.
pub trait Streamer: Send + Sync {
    fn start_streaming(&self, checksum: &str, path: &Path);
    fn abort_streaming(&self, checksum: &str);
    fn reset_streaming(&self, checksum: &str, offset: u64);
    fn copy_another_chunk(&self, checksum: &str);
}

/// Output of a [`FileStreamer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(FileChunk),
    /// The file could not be opened or read; streaming stopped.
    Failed { checksum: Checksum, reason: String },
}

enum Command {
    Start { checksum: Checksum, path: PathBuf },
    Abort(Checksum),
    Reset { checksum: Checksum, offset: u64 },
    Next(Checksum),
}

/// [`Streamer`] backed by a worker thread owning every open file.
pub struct FileStreamer {
    commands: Sender<Command>,
}

impl FileStreamer {
    /// Spawn the worker. It exits once the streamer is dropped.
    pub fn spawn<F>(chunk_size: u64, on_event: F) -> Result<(Self, JoinHandle<()>)>
    where
        F: Fn(StreamEvent) + Send + 'static,
    {
        let (tx, rx) = unbounded::<Command>();
        let handle = thread::Builder::new()
            .name("cmir-streamer".to_string())
            .spawn(move || {
                let mut worker = StreamWorker::new(chunk_size, on_event);
                for command in rx {
                    worker.handle(command);
                }
            })
            .map_err(|e| MirrorError::Runtime {
                details: format!("failed to spawn streamer: {e}"),
            })?;
        Ok((Self { commands: tx }, handle))
    }

    fn push(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("streamer worker is gone; command dropped");
        }
    }
}

impl Streamer for FileStreamer {
    fn start_streaming(&self, checksum: &str, path: &Path) {
        self.push(Command::Start {
            checksum: checksum.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn abort_streaming(&self, checksum: &str) {
        self.push(Command::Abort(checksum.to_string()));
    }

    fn reset_streaming(&self, checksum: &str, offset: u64) {
        self.push(Command::Reset {
            checksum: checksum.to_string(),
            offset,
        });
    }

    fn copy_another_chunk(&self, checksum: &str) {
        self.push(Command::Next(checksum.to_string()));
    }
}

struct OpenStream {
    file: File,
    path: PathBuf,
    offset: u64,
    size: u64,
}

struct StreamWorker<F> {
    chunk_size: u64,
    streams: HashMap<Checksum, OpenStream>,
    on_event: F,
}

impl<F: Fn(StreamEvent)> StreamWorker<F> {
    fn new(chunk_size: u64, on_event: F) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            streams: HashMap::new(),
            on_event,
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { checksum, path } => {
                match File::open(&path).and_then(|file| Ok((file.metadata()?.len(), file))) {
                    Ok((size, file)) => {
                        debug!(checksum = %checksum, path = %path.display(), size, "start streaming");
                        self.streams.insert(
                            checksum.clone(),
                            OpenStream {
                                file,
                                path,
                                offset: 0,
                                size,
                            },
                        );
                        self.emit_next(&checksum);
                    }
                    Err(e) => self.fail(checksum, format!("cannot open {}: {e}", path.display())),
                }
            }
            Command::Abort(checksum) => {
                if self.streams.remove(&checksum).is_some() {
                    debug!(checksum = %checksum, "streaming aborted");
                }
            }
            Command::Reset { checksum, offset } => match self.streams.get_mut(&checksum) {
                Some(stream) => {
                    debug!(checksum = %checksum, offset, "streaming cursor reset");
                    stream.offset = offset.min(stream.size);
                    self.emit_next(&checksum);
                }
                None => warn!(checksum = %checksum, offset, "reset for a file not being streamed"),
            },
            Command::Next(checksum) => {
                if self.streams.contains_key(&checksum) {
                    self.emit_next(&checksum);
                } else {
                    debug!(checksum = %checksum, "next chunk requested for a finished or unknown file");
                }
            }
        }
    }

    /// Emit the chunk at the cursor, or the EOF sentinel once it reached
    /// the end (which also closes the stream).
    fn emit_next(&mut self, checksum: &str) {
        let Some(stream) = self.streams.get_mut(checksum) else {
            return;
        };
        if stream.offset >= stream.size {
            let size = stream.size;
            self.streams.remove(checksum);
            (self.on_event)(StreamEvent::Chunk(FileChunk::eof(checksum, size, size)));
            return;
        }

        let offset = stream.offset;
        let len = (stream.size - offset).min(self.chunk_size);
        let mut buf = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
        let read = stream
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| stream.file.read_exact(&mut buf));
        match read {
            Ok(()) => {
                stream.offset += len;
                let size = stream.size;
                let digest = bytes_checksum(&buf);
                (self.on_event)(StreamEvent::Chunk(FileChunk::data(
                    checksum, offset, size, buf, digest,
                )));
            }
            Err(e) => {
                let reason = format!("read failed on {} at {offset}: {e}", stream.path.display());
                self.fail(checksum.to_string(), reason);
            }
        }
    }

    fn fail(&mut self, checksum: Checksum, reason: String) {
        warn!(checksum = %checksum, reason = %reason, "streaming failed");
        self.streams.remove(&checksum);
        (self.on_event)(StreamEvent::Failed { checksum, reason });
    }
}
