//! Check indexed instances against the files on disk.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::content::checksum::file_checksum;
use crate::content::content_data::{ContentData, Instance};

/// How thoroughly an instance is compared with its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckLevel {
    /// File exists with the indexed size and mtime.
    #[default]
    Shallow,
    /// Shallow, then the recomputed checksum must match.
    Deep,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    pub level: CheckLevel,
    /// Only instances of this server are checked; `None` checks all.
    pub local_server: Option<String>,
}

/// Why an instance failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFault {
    Missing,
    SizeMismatch { indexed: u64, actual: u64 },
    ModTimeMismatch { indexed: i64, actual: i64 },
    ChecksumMismatch { actual: String },
    Unreadable(String),
}

impl ContentData {
    /// Validate instances against the filesystem.
    ///
    /// Returns `true` when every checked instance passes. Failed instances are
    /// added to `failed` when provided.
    pub fn validate(&self, options: &ValidationOptions, mut failed: Option<&mut Self>) -> bool {
        let mut ok = true;
        for instance in self.instances() {
            if options
                .local_server
                .as_deref()
                .is_some_and(|server| server != instance.server)
            {
                continue;
            }
            if let Err(fault) = check_instance(&instance, options.level) {
                ok = false;
                warn!(
                    checksum = %instance.checksum,
                    path = %instance.path,
                    fault = ?fault,
                    "instance failed validation"
                );
                if let Some(failed) = failed.as_deref_mut() {
                    failed.insert(instance);
                }
            }
        }
        debug!(ok, "validation finished");
        ok
    }
}

/// Compare one instance with its file.
pub fn check_instance(instance: &Instance, level: CheckLevel) -> Result<(), InstanceFault> {
    let path = Path::new(&instance.path);
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(InstanceFault::Missing),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(InstanceFault::Missing);
        }
        Err(error) => return Err(InstanceFault::Unreadable(error.to_string())),
    };

    if metadata.len() != instance.size {
        return Err(InstanceFault::SizeMismatch {
            indexed: instance.size,
            actual: metadata.len(),
        });
    }

    let actual_mtime = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
        .unwrap_or_default();
    if actual_mtime != instance.mod_time {
        return Err(InstanceFault::ModTimeMismatch {
            indexed: instance.mod_time,
            actual: actual_mtime,
        });
    }

    if level == CheckLevel::Deep {
        let actual = file_checksum(path).map_err(|e| InstanceFault::Unreadable(e.to_string()))?;
        if actual != instance.checksum {
            return Err(InstanceFault::ChecksumMismatch { actual });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::checksum::bytes_checksum;
    use filetime::{FileTime, set_file_mtime};
    use std::path::PathBuf;

    const MOD_TIME: i64 = 1_234_567_890;

    struct Fixture {
        _dir: tempfile::TempDir,
        index: ContentData,
        path1: PathBuf,
        path2: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path1 = dir.path().join("file1");
        let path2 = dir.path().join("file2");
        let mut index = ContentData::new();
        for (path, body) in [(&path1, b"first body".as_slice()), (&path2, b"second body!".as_slice())] {
            fs::write(path, body).unwrap();
            set_file_mtime(path, FileTime::from_unix_time(MOD_TIME, 0)).unwrap();
            index.add_instance(
                bytes_checksum(body),
                body.len() as u64,
                "server_1",
                "dev_1",
                path.to_string_lossy(),
                MOD_TIME,
            );
        }
        Fixture {
            _dir: dir,
            index,
            path1,
            path2,
        }
    }

    fn shallow() -> ValidationOptions {
        ValidationOptions::default()
    }

    fn deep() -> ValidationOptions {
        ValidationOptions {
            level: CheckLevel::Deep,
            local_server: None,
        }
    }

    #[test]
    fn passes_when_files_match() {
        let f = fixture();
        assert!(f.index.validate(&shallow(), None));
        assert!(f.index.validate(&deep(), None));
    }

    #[test]
    fn missing_file_fails() {
        let f = fixture();
        fs::remove_file(&f.path1).unwrap();
        assert!(!f.index.validate(&shallow(), None));
    }

    #[test]
    fn size_change_fails() {
        let f = fixture();
        fs::write(&f.path1, b"longer first body").unwrap();
        set_file_mtime(&f.path1, FileTime::from_unix_time(MOD_TIME, 0)).unwrap();
        assert!(!f.index.validate(&shallow(), None));
    }

    #[test]
    fn mtime_change_fails() {
        let f = fixture();
        set_file_mtime(&f.path2, FileTime::from_unix_time(MOD_TIME + 10, 0)).unwrap();
        assert!(!f.index.validate(&shallow(), None));
    }

    #[test]
    fn deep_check_catches_same_size_rewrite() {
        let f = fixture();
        fs::write(&f.path2, b"SECOND BODY!").unwrap();
        set_file_mtime(&f.path2, FileTime::from_unix_time(MOD_TIME, 0)).unwrap();
        assert!(f.index.validate(&shallow(), None));
        assert!(!f.index.validate(&deep(), None));
    }

    #[test]
    fn failed_collects_one_instance_per_fault() {
        let mut f = fixture();
        let absent = f.path2.with_file_name("absent");
        f.index
            .add_instance("123", 5, "server_1", "dev_1", absent.to_string_lossy(), MOD_TIME);
        set_file_mtime(&f.path2, FileTime::from_unix_time(MOD_TIME + 10, 0)).unwrap();

        let mut failed = ContentData::new();
        assert!(!f.index.validate(&shallow(), Some(&mut failed)));
        assert_eq!(failed.contents_size(), 2);
        assert_eq!(failed.instances_size(), 2);
        assert!(failed.content_exists("123"));
        assert!(failed.instance_exists("server_1", &f.path2.to_string_lossy()));
    }

    #[test]
    fn other_servers_are_skipped() {
        let mut f = fixture();
        f.index.add_instance("X", 1, "server_2", "dev", "/nonexistent/cmir", 1);
        let options = ValidationOptions {
            level: CheckLevel::Shallow,
            local_server: Some("server_1".to_string()),
        };
        assert!(f.index.validate(&options, None));
        assert!(!f.index.validate(&shallow(), None));
    }
}
