//! Receiver-side byte sink: assembles chunks into the sharded backup store.
//!
//! Partial files live under `<dest>/.tmp/<checksum>` until the end-of-file
//! sentinel arrives, so an interrupted copy resumes from the temp file's
//! length.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::content::checksum::{bytes_checksum, file_checksum, validate_checksum};
use crate::content::content_data::Checksum;
use crate::copy::messages::FileChunk;
use crate::core::paths::destination_filename;

/// Name of the partial-file directory inside the backup folder.
pub const TMP_DIR_NAME: &str = ".tmp";

/// What happened to one received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Chunk written; ready for the next one.
    Stored,
    /// End of file reached and verified; content is at `path`.
    Completed { path: PathBuf, size: u64 },
    /// Chunk rejected; the sender should resume at `offset`.
    ResetRequested { offset: u64 },
    /// Copy cannot succeed; partial data was discarded.
    Aborted { reason: String },
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stored | Self::Completed { .. })
    }
}

struct Partial {
    file: File,
    /// Offset of the next byte expected.
    expected: u64,
}

pub struct FileReceiver {
    destination: PathBuf,
    partials: HashMap<Checksum, Partial>,
}

impl FileReceiver {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            partials: HashMap::new(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn temp_path(&self, checksum: &str) -> PathBuf {
        self.destination.join(TMP_DIR_NAME).join(checksum)
    }

    pub fn receive_chunk(&mut self, chunk: &FileChunk) -> Receipt {
        // The checksum names the temp and destination files.
        if let Err(e) = validate_checksum(&chunk.checksum) {
            warn!(error = %e, "rejecting chunk");
            return Receipt::Aborted {
                reason: e.to_string(),
            };
        }
        if chunk.is_eof() {
            return self.finish(chunk);
        }
        let (Some(content), Some(content_checksum)) = (&chunk.content, &chunk.content_checksum)
        else {
            warn!(checksum = %chunk.checksum, "chunk with partial payload");
            return self.reset_to_expected(&chunk.checksum, chunk.file_size);
        };

        if bytes_checksum(content) != *content_checksum {
            warn!(checksum = %chunk.checksum, offset = chunk.offset, "chunk checksum mismatch");
            return self.reset_to_expected(&chunk.checksum, chunk.file_size);
        }

        let partial = match self.open_partial(&chunk.checksum, chunk.file_size) {
            Ok(partial) => partial,
            Err(e) => return self.abort(&chunk.checksum, format!("cannot open temp file: {e}")),
        };
        if chunk.offset != partial.expected {
            debug!(
                checksum = %chunk.checksum,
                got = chunk.offset,
                expected = partial.expected,
                "out of order chunk"
            );
            return Receipt::ResetRequested {
                offset: partial.expected,
            };
        }

        let written = partial
            .file
            .seek(SeekFrom::Start(chunk.offset))
            .and_then(|_| partial.file.write_all(content));
        match written {
            Ok(()) => {
                partial.expected += content.len() as u64;
                Receipt::Stored
            }
            Err(e) => self.abort(&chunk.checksum, format!("write failed: {e}")),
        }
    }

    /// Forget an in-flight copy, keeping its temp file for a later resume.
    pub fn release(&mut self, checksum: &str) {
        self.partials.remove(checksum);
    }

    fn finish(&mut self, chunk: &FileChunk) -> Receipt {
        let checksum = chunk.checksum.as_str();
        let partial = match self.open_partial(checksum, chunk.file_size) {
            Ok(partial) => partial,
            Err(e) => return self.abort(checksum, format!("cannot open temp file: {e}")),
        };
        if partial.expected != chunk.file_size {
            return Receipt::ResetRequested {
                offset: partial.expected,
            };
        }
        if let Err(e) = partial.file.sync_all() {
            return self.abort(checksum, format!("sync failed: {e}"));
        }
        self.partials.remove(checksum);

        let temp = self.temp_path(checksum);
        match file_checksum(&temp) {
            Ok(actual) if actual == checksum => {}
            Ok(actual) => {
                return self.abort(checksum, format!("content checksum mismatch: got {actual}"));
            }
            Err(e) => return self.abort(checksum, e.to_string()),
        }

        let dest = destination_filename(&self.destination, checksum);
        let moved = dest
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::rename(&temp, &dest));
        if let Err(e) = moved {
            return self.abort(checksum, format!("cannot move into {}: {e}", dest.display()));
        }
        info!(checksum, path = %dest.display(), size = chunk.file_size, "file received");
        Receipt::Completed {
            path: dest,
            size: chunk.file_size,
        }
    }

    /// Open (or reuse) the temp file, resuming from its current length.
    fn open_partial(&mut self, checksum: &str, file_size: u64) -> std::io::Result<&mut Partial> {
        if !self.partials.contains_key(checksum) {
            let temp = self.temp_path(checksum);
            if let Some(parent) = temp.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&temp)?;
            let mut expected = file.metadata()?.len();
            if expected > file_size {
                file.set_len(0)?;
                expected = 0;
            }
            if expected > 0 {
                debug!(checksum, expected, "resuming from partial file");
            }
            self.partials
                .insert(checksum.to_string(), Partial { file, expected });
        }
        self.partials
            .get_mut(checksum)
            .ok_or_else(|| std::io::Error::other("partial file vanished"))
    }

    fn reset_to_expected(&mut self, checksum: &str, file_size: u64) -> Receipt {
        match self.open_partial(checksum, file_size) {
            Ok(partial) => Receipt::ResetRequested {
                offset: partial.expected,
            },
            Err(e) => self.abort(checksum, format!("cannot open temp file: {e}")),
        }
    }

    fn abort(&mut self, checksum: &str, reason: String) -> Receipt {
        warn!(checksum, reason = %reason, "aborting receive");
        self.partials.remove(checksum);
        let temp = self.temp_path(checksum);
        match fs::remove_file(&temp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                debug!(path = %temp.display(), error = %e, "temp file left behind");
            }
            _ => {}
        }
        Receipt::Aborted { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"hello backup world";

    fn chunks(body: &[u8], size: usize) -> Vec<FileChunk> {
        let checksum = bytes_checksum(body);
        let mut out: Vec<FileChunk> = body
            .chunks(size)
            .enumerate()
            .map(|(i, part)| {
                FileChunk::data(
                    checksum.clone(),
                    (i * size) as u64,
                    body.len() as u64,
                    part.to_vec(),
                    bytes_checksum(part),
                )
            })
            .collect();
        out.push(FileChunk::eof(checksum, body.len() as u64, body.len() as u64));
        out
    }

    #[test]
    fn assembles_file_at_sharded_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        let all = chunks(BODY, 5);
        let (last, data) = all.split_last().unwrap();
        for chunk in data {
            assert_eq!(receiver.receive_chunk(chunk), Receipt::Stored);
        }
        let checksum = bytes_checksum(BODY);
        let expected = destination_filename(dir.path(), &checksum);
        assert_eq!(
            receiver.receive_chunk(last),
            Receipt::Completed {
                path: expected.clone(),
                size: BODY.len() as u64
            }
        );
        assert_eq!(fs::read(expected).unwrap(), BODY);
        assert!(!receiver.temp_path(&checksum).exists());
    }

    #[test]
    fn out_of_order_chunk_requests_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        let all = chunks(BODY, 5);
        assert_eq!(receiver.receive_chunk(&all[0]), Receipt::Stored);
        assert_eq!(
            receiver.receive_chunk(&all[2]),
            Receipt::ResetRequested { offset: 5 }
        );
    }

    #[test]
    fn corrupted_chunk_requests_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        let mut bad = chunks(BODY, 5).remove(0);
        bad.content = Some(b"HELLO".to_vec());
        assert_eq!(
            receiver.receive_chunk(&bad),
            Receipt::ResetRequested { offset: 0 }
        );
    }

    #[test]
    fn resumes_from_existing_partial() {
        let dir = tempfile::tempdir().unwrap();
        let all = chunks(BODY, 5);
        {
            let mut first = FileReceiver::new(dir.path());
            assert_eq!(first.receive_chunk(&all[0]), Receipt::Stored);
            assert_eq!(first.receive_chunk(&all[1]), Receipt::Stored);
        }
        let mut second = FileReceiver::new(dir.path());
        assert_eq!(
            second.receive_chunk(&all[0]),
            Receipt::ResetRequested { offset: 10 }
        );
        for chunk in &all[2..all.len() - 1] {
            assert_eq!(second.receive_chunk(chunk), Receipt::Stored);
        }
        assert!(matches!(
            second.receive_chunk(all.last().unwrap()),
            Receipt::Completed { .. }
        ));
    }

    #[test]
    fn content_mismatch_aborts_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        let wrong = "0".repeat(64);
        let chunk = FileChunk::data(wrong.clone(), 0, 3, b"abc".to_vec(), bytes_checksum(b"abc"));
        assert_eq!(receiver.receive_chunk(&chunk), Receipt::Stored);
        let receipt = receiver.receive_chunk(&FileChunk::eof(wrong.clone(), 3, 3));
        assert!(matches!(receipt, Receipt::Aborted { .. }));
        assert!(!receiver.temp_path(&wrong).exists());
        assert!(!destination_filename(dir.path(), &wrong).exists());
    }

    #[test]
    fn empty_file_completes_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        let checksum = bytes_checksum(b"");
        let receipt = receiver.receive_chunk(&FileChunk::eof(checksum.clone(), 0, 0));
        assert!(receipt.is_success());
        assert!(destination_filename(dir.path(), &checksum).exists());
    }

    #[test]
    fn malformed_checksum_never_touches_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        fs::write(&victim, b"precious data").unwrap();
        let mut receiver = FileReceiver::new(dir.path().join("backup"));

        let data = FileChunk::data("../../victim", 0, 0, b"x".to_vec(), "bogus".to_string());
        let receipt = receiver.receive_chunk(&data);
        assert!(matches!(&receipt, Receipt::Aborted { reason } if reason.contains("CMR-2002")));
        let eof = receiver.receive_chunk(&FileChunk::eof("../../victim", 0, 0));
        assert!(matches!(eof, Receipt::Aborted { .. }));

        assert_eq!(fs::read(&victim).unwrap(), b"precious data");
        assert!(!dir.path().join("backup").exists());
    }
}
