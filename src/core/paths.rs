//! Shared path helpers: absolute resolution, index path strings, sharded
//! backup destinations.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Resolve a path to an absolute, normalized path.
///
/// Uses `fs::canonicalize` when the path exists; otherwise the path is made
/// absolute relative to CWD and `..`/`.` are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Path string as stored in the index.
pub fn index_path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Sharded backup location of a content: `<base>/<cs[0..2]>/<cs[2..4]>/<cs>`.
///
/// Short checksums simply get fewer shard levels.
pub fn destination_filename(base: &Path, checksum: &str) -> PathBuf {
    let mut dest = base.to_path_buf();
    for shard in [checksum.get(0..2), checksum.get(2..4)].into_iter().flatten() {
        dest.push(shard);
    }
    dest.push(checksum);
    dest
}

/// Whether `path` lies strictly below directory `dir` (component-wise on `/`).
///
/// `/a/b` contains `/a/b/c` but neither `/a/b` nor `/a/bc`.
pub fn is_under_directory(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn normalizes_nonexistent_path_syntactically() {
        let input = Path::new("/nonexistent/foo/../bar");
        assert!(std::fs::canonicalize(input).is_err());
        assert_eq!(resolve_absolute_path(input), Path::new("/nonexistent/bar"));
    }

    #[test]
    fn handles_parent_at_root() {
        assert_eq!(normalize_syntactic(Path::new("/../foo")), Path::new("/foo"));
    }

    #[test]
    fn destination_is_sharded_by_checksum_prefix() {
        let dest = destination_filename(Path::new("/backup"), "abcdef0123");
        assert_eq!(dest, Path::new("/backup/ab/cd/abcdef0123"));
    }

    #[test]
    fn destination_for_short_checksum() {
        assert_eq!(
            destination_filename(Path::new("/backup"), "abc"),
            Path::new("/backup/ab/abc")
        );
        assert_eq!(
            destination_filename(Path::new("/backup"), "a"),
            Path::new("/backup/a")
        );
    }

    #[test]
    fn directory_containment_is_component_wise() {
        assert!(is_under_directory("/a/b/cc/file", "/a/b"));
        assert!(is_under_directory("/a/b/cc/file", "/a/b/"));
        assert!(!is_under_directory("/a/b/cc/file", "/a/b/c"));
        assert!(!is_under_directory("/a/b", "/a/b"));
        assert!(is_under_directory("/x", "/"));
    }
}
