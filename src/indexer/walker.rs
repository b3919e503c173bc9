//! Recursive tree indexer: one instance per regular file, one symlink record
//! per symbolic link.
//!
//! Directories are walked depth-first without following symlinks. Files whose
//! size and mtime match the previous index are not re-hashed. Names that are
//! not valid UTF-8 cannot be stored in the index and are reported as failed.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use regex::Regex;
use tracing::{debug, warn};

use crate::content::checksum::file_checksum;
use crate::content::content_data::{ContentData, Instance};
use crate::core::errors::{MirrorError, Result};

/// What to index and how to name it.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub roots: Vec<PathBuf>,
    pub server_name: String,
    pub exclude: Vec<Regex>,
}

impl IndexerConfig {
    /// Compile `exclude_patterns`; an invalid pattern is a configuration error.
    pub fn new(roots: Vec<PathBuf>, server_name: impl Into<String>, exclude_patterns: &[String]) -> Result<Self> {
        let exclude = exclude_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| MirrorError::InvalidConfig {
                    details: format!("invalid exclude pattern {pattern:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            roots,
            server_name: server_name.into(),
            exclude,
        })
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(path))
    }
}

/// Outcome counters of one indexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub hashed: usize,
    pub reused: usize,
    pub symlinks: usize,
    pub failed: Vec<PathBuf>,
}

/// Index every root. `previous` enables shallow reuse of checksums.
pub fn index_tree(config: &IndexerConfig, previous: Option<&ContentData>) -> (ContentData, IndexReport) {
    let mut index = ContentData::new();
    let mut report = IndexReport::default();
    let mut stack: Vec<PathBuf> = config.roots.clone();

    while let Some(path) = stack.pop() {
        let Some(path_str) = path.to_str().map(str::to_owned) else {
            warn!(path = %path.display(), "name is not valid UTF-8, skipped");
            report.failed.push(path);
            continue;
        };
        if config.is_excluded(&path_str) {
            debug!(path = %path_str, "excluded");
            continue;
        }
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path_str, "vanished before indexing");
                continue;
            }
            Err(e) => {
                warn!(path = %path_str, error = %e, "cannot stat");
                report.failed.push(path);
                continue;
            }
        };

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            match fs::read_link(&path) {
                Ok(target) => match target.to_str() {
                    Some(target) => {
                        index.add_symlink(&config.server_name, path_str, target);
                        report.symlinks += 1;
                    }
                    None => {
                        warn!(path = %path_str, target = %target.display(), "symlink target is not valid UTF-8");
                        report.failed.push(path);
                    }
                },
                Err(e) => {
                    warn!(path = %path_str, error = %e, "cannot read symlink");
                    report.failed.push(path);
                }
            }
        } else if file_type.is_dir() {
            match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut children: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
                    // Reverse-sorted so the stack pops children in name order.
                    children.sort_unstable_by(|a, b| b.cmp(a));
                    stack.extend(children);
                }
                Err(e) => {
                    warn!(path = %path_str, error = %e, "cannot read directory");
                    report.failed.push(path);
                }
            }
        } else if file_type.is_file() {
            index_file(config, previous, &path, path_str, &meta, &mut index, &mut report);
        }
    }
    (index, report)
}

fn index_file(
    config: &IndexerConfig,
    previous: Option<&ContentData>,
    path: &Path,
    path_str: String,
    meta: &fs::Metadata,
    index: &mut ContentData,
    report: &mut IndexReport,
) {
    let size = meta.len();
    let mod_time = mod_time_secs(meta);

    let reusable = previous
        .and_then(|prev| prev.instance(&config.server_name, &path_str))
        .filter(|known| known.size == size && known.mod_time == mod_time);
    let checksum = if let Some(known) = reusable {
        report.reused += 1;
        known.checksum
    } else {
        match file_checksum(path) {
            Ok(checksum) => {
                report.hashed += 1;
                checksum
            }
            Err(e) => {
                warn!(path = %path_str, error = %e, "cannot hash");
                report.failed.push(path.to_path_buf());
                return;
            }
        }
    };

    index.insert(Instance {
        checksum,
        size,
        server: config.server_name.clone(),
        device: device_id(meta),
        path: path_str,
        mod_time,
    });
}

/// Device identifier recorded on instances.
pub fn device_id(meta: &fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.dev().to_string()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        "0".to_string()
    }
}

/// Modification time in whole seconds since the epoch (0 if unavailable).
pub fn mod_time_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::checksum::bytes_checksum;
    use crate::core::paths::index_path_string;
    use filetime::{FileTime, set_file_mtime};

    fn config(root: &Path, excludes: &[&str]) -> IndexerConfig {
        let patterns: Vec<String> = excludes.iter().map(ToString::to_string).collect();
        IndexerConfig::new(vec![root.to_path_buf()], "srv", &patterns).unwrap()
    }

    #[test]
    fn indexes_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"deep").unwrap();
        fs::write(dir.path().join("a/copy.txt"), b"top").unwrap();

        let (index, report) = index_tree(&config(dir.path(), &[]), None);
        assert_eq!(report.hashed, 3);
        assert_eq!(index.instances_size(), 3);
        assert_eq!(index.contents_size(), 2);
        let deep = index_path_string(&dir.path().join("a/b/deep.txt"));
        assert!(index.content_has_instance(&bytes_checksum(b"deep"), "srv", &deep));
        assert_eq!(index.instances_of(&bytes_checksum(b"top")).count(), 2);
    }

    #[test]
    fn exclude_patterns_skip_files_and_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".tmp")).unwrap();
        fs::write(dir.path().join(".tmp/partial"), b"p").unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        fs::write(dir.path().join("skip.log"), b"s").unwrap();

        let (index, _) = index_tree(&config(dir.path(), &[r"/\.tmp$", r"\.log$"]), None);
        assert_eq!(index.instances_size(), 1);
        assert!(index.content_exists(&bytes_checksum(b"k")));
    }

    #[test]
    fn unchanged_files_reuse_previous_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"body").unwrap();
        set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let cfg = config(dir.path(), &[]);

        // A previous index with a fake checksum for the same size and mtime.
        let mut previous = ContentData::new();
        previous.add_instance("FAKE", 4, "srv", "dev", index_path_string(&file), 1_000_000);
        let (index, report) = index_tree(&cfg, Some(&previous));
        assert_eq!(report.reused, 1);
        assert!(index.content_exists("FAKE"));

        // Once the mtime moves, the file is hashed again.
        set_file_mtime(&file, FileTime::from_unix_time(1_000_001, 0)).unwrap();
        let (index, report) = index_tree(&cfg, Some(&previous));
        assert_eq!(report.hashed, 1);
        assert!(index.content_exists(&bytes_checksum(b"body")));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/f"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let (index, report) = index_tree(&config(dir.path(), &[]), None);
        assert_eq!(report.symlinks, 1);
        assert_eq!(index.instances_size(), 1);
        assert!(index.symlink_exists("srv", &index_path_string(&dir.path().join("link"))));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_reported_not_indexed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join(OsStr::from_bytes(b"bad\xffname"));
        if fs::write(&bad, b"bytes").is_err() {
            // Filesystems that enforce UTF-8 names cannot hold the case.
            return;
        }
        fs::write(dir.path().join("good"), b"good").unwrap();

        let (index, report) = index_tree(&config(dir.path(), &[]), None);
        assert_eq!(index.instances_size(), 1);
        assert!(!index.content_exists(&bytes_checksum(b"bytes")));
        assert!(index.instances().all(|i| Path::new(&i.path).exists()));
        assert_eq!(report.failed, vec![bad]);
    }

    #[test]
    fn missing_root_yields_empty_index() {
        let (index, report) = index_tree(&config(Path::new("/nonexistent/cmir/root"), &[]), None);
        assert!(index.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = IndexerConfig::new(Vec::new(), "srv", &["(".to_string()]).unwrap_err();
        assert_eq!(err.code(), "CMR-1001");
    }
}
