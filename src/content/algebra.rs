//! Set algebra over content indices.
//!
//! Free functions never mutate their inputs. The in-place forms live on
//! [`ContentData`] and say so in their names.

use std::collections::BTreeSet;

use crate::content::content_data::{Checksum, ContentData, ContentRecord, InstanceRecord, Location};
use crate::core::paths::is_under_directory;

/// Which side wins when both indices hold a record at the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    KeepExisting,
    Overwrite,
}

impl ContentData {
    /// Union `other` into `self`; on a location conflict `self` keeps its record.
    pub fn merge_in_place(&mut self, other: &Self) {
        self.absorb(other, Conflict::KeepExisting);
    }

    /// Union `other` into `self`; on a location conflict `other`'s record wins.
    pub fn merge_overriding(&mut self, other: &Self) {
        self.absorb(other, Conflict::Overwrite);
    }

    /// Remove from `self` every `(checksum, server, path)` triple present in
    /// `other`, plus identical symlinks.
    pub fn remove_instances_of(&mut self, other: &Self) {
        for (location, record) in &other.instances {
            if self
                .instances
                .get(location)
                .is_some_and(|own| own.checksum == record.checksum)
            {
                self.remove_instance(&location.server, &location.path);
            }
        }
        self.remove_matching_symlinks(other);
    }

    /// Remove from `self` every whole content whose checksum appears in
    /// `other`, plus identical symlinks.
    pub fn remove_contents_of(&mut self, other: &Self) {
        for checksum in other.contents.keys() {
            if let Some(record) = self.contents.remove(checksum) {
                for location in &record.locations {
                    self.instances.remove(location);
                }
            }
        }
        self.remove_matching_symlinks(other);
    }

    /// Remove all instances and symlinks of `server` located strictly under
    /// `dir`, returning them as their own index.
    pub fn remove_directory(&mut self, dir: &str, server: &str) -> Self {
        let mut removed = Self::new();

        let doomed: Vec<Location> = self
            .instances
            .keys()
            .filter(|location| location.server == server && is_under_directory(&location.path, dir))
            .cloned()
            .collect();
        for location in doomed {
            let checksum = self.instances[&location].checksum.clone();
            if let Some(content) = self.contents.get(&checksum) {
                let (size, mod_time) = (content.size, content.mod_time);
                removed.adopt(&location, &self.instances[&location], size, mod_time, Conflict::Overwrite);
            }
            self.remove_instance(&location.server, &location.path);
        }

        let doomed_links: Vec<Location> = self
            .symlinks
            .keys()
            .filter(|location| location.server == server && is_under_directory(&location.path, dir))
            .cloned()
            .collect();
        for location in doomed_links {
            if let Some(target) = self.symlinks.remove(&location) {
                removed.symlinks.insert(location, target);
            }
        }

        removed
    }

    fn absorb(&mut self, other: &Self, conflict: Conflict) {
        for (location, record) in &other.instances {
            let Some(content) = other.contents.get(&record.checksum) else {
                continue;
            };
            self.adopt(location, record, content.size, content.mod_time, conflict);
        }
        for (location, target) in &other.symlinks {
            if conflict == Conflict::Overwrite || !self.symlinks.contains_key(location) {
                self.symlinks.insert(location.clone(), target.clone());
            }
        }
    }

    /// Insert one instance record carrying its content's size and mod_time.
    fn adopt(
        &mut self,
        location: &Location,
        record: &InstanceRecord,
        size: u64,
        content_mod_time: i64,
        conflict: Conflict,
    ) {
        if let Some(existing) = self.instances.get(location) {
            if conflict == Conflict::KeepExisting {
                return;
            }
            if existing.checksum != record.checksum {
                let stale = existing.checksum.clone();
                if let Some(content) = self.contents.get_mut(&stale) {
                    content.locations.remove(location);
                    if content.locations.is_empty() {
                        self.contents.remove(&stale);
                    }
                }
            }
        }

        match self.contents.get_mut(&record.checksum) {
            Some(content) => {
                if conflict == Conflict::Overwrite {
                    content.size = size;
                }
                content.locations.insert(location.clone());
            }
            None => {
                self.contents.insert(
                    record.checksum.clone(),
                    ContentRecord {
                        size,
                        mod_time: content_mod_time,
                        locations: BTreeSet::from([location.clone()]),
                    },
                );
            }
        }
        self.instances.insert(location.clone(), record.clone());
    }

    fn remove_matching_symlinks(&mut self, other: &Self) {
        for (location, target) in &other.symlinks {
            if self.symlinks.get(location) == Some(target) {
                self.symlinks.remove(location);
            }
        }
    }
}

/// Union of two indices. On a location present in both, `a` wins.
pub fn merge(a: &ContentData, b: &ContentData) -> ContentData {
    merge_all([a, b])
}

/// Union of any number of indices, earlier operands winning location conflicts.
pub fn merge_all<'a, I>(indices: I) -> ContentData
where
    I: IntoIterator<Item = &'a ContentData>,
{
    let mut merged = ContentData::new();
    for index in indices {
        merged.merge_in_place(index);
    }
    merged
}

/// Merge `a` into `b`, letting `a`'s records override `b`'s on conflict.
pub fn merge_override_b<'b>(a: &ContentData, b: &'b mut ContentData) -> &'b mut ContentData {
    b.merge_overriding(a);
    b
}

/// `b` without any content (all of its instances) whose checksum occurs in `a`.
///
/// `remove(None, b)` is a copy of `b`; `remove(a, None)` is `None`.
pub fn remove(a: Option<&ContentData>, b: Option<&ContentData>) -> Option<ContentData> {
    let mut result = b?.clone();
    if let Some(a) = a {
        result.remove_contents_of(a);
    }
    Some(result)
}

/// `b` without the exact `(checksum, server, path)` triples present in `a`.
///
/// Same absent-operand rules as [`remove`].
pub fn remove_instances(a: Option<&ContentData>, b: Option<&ContentData>) -> Option<ContentData> {
    let mut result = b?.clone();
    if let Some(a) = a {
        result.remove_instances_of(a);
    }
    Some(result)
}

/// In-place form of [`remove_instances`]: mutates and returns `b`.
pub fn remove_instances_in_place<'b>(
    a: Option<&ContentData>,
    b: Option<&'b mut ContentData>,
) -> Option<&'b mut ContentData> {
    let b = b?;
    if let Some(a) = a {
        b.remove_instances_of(a);
    }
    Some(b)
}

/// Contents present in both indices, with the instances of both sides.
pub fn intersect(a: &ContentData, b: &ContentData) -> ContentData {
    let mut result = ContentData::new();
    let shared: Vec<&Checksum> = a
        .contents
        .keys()
        .filter(|checksum| b.contents.contains_key(*checksum))
        .collect();

    for side in [a, b] {
        for checksum in &shared {
            let content = &side.contents[*checksum];
            for location in &content.locations {
                result.adopt(
                    location,
                    &side.instances[location],
                    content.size,
                    content.mod_time,
                    Conflict::KeepExisting,
                );
            }
        }
    }

    for (location, target) in &a.symlinks {
        if b.symlinks.get(location) == Some(target) {
            result.symlinks.insert(location.clone(), target.clone());
        }
    }
    result
}

/// Copy of `index` without the instances and symlinks of `server` under `dir`.
///
/// The input is left untouched; see [`ContentData::remove_directory`] for the
/// mutating form.
pub fn remove_directory(index: Option<&ContentData>, dir: &str, server: &str) -> Option<ContentData> {
    let mut result = index?.clone();
    result.remove_directory(dir, server);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_a() -> ContentData {
        let mut a = ContentData::new();
        a.add_instance("A1", 50, "server_1", "dev_1", "/home/file_1", 22_222_222_222);
        a
    }

    fn index_b() -> ContentData {
        let mut b = ContentData::new();
        b.add_instance("A1", 50, "server_1", "dev_1", "/home/file_1", 22_222_222_222);
        b.add_instance("A1", 50, "server_1", "dev_1", "extra_inst", 66_666_666_666);
        b.add_instance("B1", 60, "server_1", "dev_1", "/home/file_2", 44_444_444_444);
        b.add_instance("B1", 60, "server_1", "dev_1", "/home/file_3", 55_555_555_555);
        b
    }

    #[test]
    fn merge_is_independent_of_inputs() {
        let mut a = index_a();
        let mut b = ContentData::new();
        b.add_instance("B1", 60, "server_1", "dev_1", "/home/file_2", 44_444_444_444);
        b.add_instance("B1", 60, "server_1", "dev_1", "/home/file_3", 55_555_555_555);

        let merged = merge(&a, &b);
        assert_eq!(merged.contents_size(), 2);
        assert_eq!(merged.instances_size(), 3);
        assert_eq!(merged.content("B1").unwrap().mod_time, 44_444_444_444);

        let before = merged.clone();
        a.remove_instance("server_1", "/home/file_1");
        b.remove_instance("server_1", "/home/file_2");
        assert_eq!(merged, before);
    }

    #[test]
    fn merge_first_operand_wins_location_conflict() {
        let mut a = ContentData::new();
        a.add_instance("X", 10, "s", "d", "/same", 1);
        let mut b = ContentData::new();
        b.add_instance("Y", 20, "s", "d", "/same", 2);

        let merged = merge(&a, &b);
        assert!(merged.content_has_instance("X", "s", "/same"));
        assert!(!merged.content_exists("Y"));

        let reversed = merge(&b, &a);
        assert!(reversed.content_has_instance("Y", "s", "/same"));
        assert!(!reversed.content_exists("X"));
    }

    #[test]
    fn merge_with_self_is_identity() {
        let b = index_b();
        assert_eq!(merge(&b, &b), b);
    }

    #[test]
    fn merge_all_accepts_many() {
        let mut c = ContentData::new();
        c.add_symlink("server_2", "/l", "/t");
        let merged = merge_all([&index_a(), &index_b(), &c]);
        assert_eq!(merged.instances_size(), 4);
        assert_eq!(merged.symlinks_size(), 1);
    }

    #[test]
    fn merge_override_b_lets_a_win_and_mutates_b() {
        let mut a = ContentData::new();
        a.add_instance("X", 10, "s", "d_new", "/same", 5);
        let mut b = ContentData::new();
        b.add_instance("Y", 20, "s", "d_old", "/same", 2);
        b.add_instance("Z", 30, "s", "d_old", "/other", 3);

        merge_override_b(&a, &mut b);
        assert!(b.content_has_instance("X", "s", "/same"));
        assert!(!b.content_exists("Y"));
        assert!(b.content_exists("Z"));
        assert_eq!(b.instance("s", "/same").unwrap().device, "d_new");
    }

    #[test]
    fn merge_override_b_result_tracks_b() {
        let a = index_a();
        let mut b = index_b();
        b.remove_instance("server_1", "extra_inst");
        let merged = merge_override_b(&a, &mut b).clone();
        b.remove_instance("server_1", "/home/file_2");
        assert_ne!(merged, b);
        assert_eq!(b.instances_size(), 2);
    }

    #[test]
    fn remove_is_content_granular() {
        let removed = remove(Some(&index_a()), Some(&index_b())).unwrap();
        let mut expected = ContentData::new();
        expected.add_instance("B1", 60, "server_1", "dev_1", "/home/file_2", 44_444_444_444);
        expected.add_instance("B1", 60, "server_1", "dev_1", "/home/file_3", 55_555_555_555);
        assert_eq!(removed, expected);
    }

    #[test]
    fn remove_absent_operands() {
        let b = index_b();
        assert_eq!(remove(None, Some(&b)), Some(b.clone()));
        assert_eq!(remove(Some(&b), None), None);
    }

    #[test]
    fn remove_instances_is_triple_granular() {
        let removed = remove_instances(Some(&index_a()), Some(&index_b())).unwrap();
        assert_eq!(removed.contents_size(), 2);
        assert_eq!(removed.instances_size(), 3);
        assert!(removed.content_has_instance("A1", "server_1", "extra_inst"));
        assert!(!removed.instance_exists("server_1", "/home/file_1"));
        // The surviving content keeps its own record.
        assert_eq!(removed.content("A1").unwrap().mod_time, 22_222_222_222);
    }

    #[test]
    fn remove_instances_keeps_different_checksum_at_same_location() {
        let mut a = ContentData::new();
        a.add_instance("OTHER", 50, "server_1", "dev_1", "/home/file_1", 1);
        let removed = remove_instances(Some(&a), Some(&index_b())).unwrap();
        assert!(removed.content_has_instance("A1", "server_1", "/home/file_1"));
    }

    #[test]
    fn remove_instances_absent_operands() {
        let b = index_b();
        assert_eq!(remove_instances(None, Some(&b)), Some(b.clone()));
        assert_eq!(remove_instances(Some(&b), None), None);
    }

    #[test]
    fn remove_instances_in_place_mutates_b() {
        let a = index_a();
        let mut b = index_b();
        let expected = remove_instances(Some(&a), Some(&b)).unwrap();
        let returned = remove_instances_in_place(Some(&a), Some(&mut b)).unwrap().clone();
        assert_eq!(returned, expected);
        assert_eq!(b, expected);
        assert!(remove_instances_in_place(Some(&a), None).is_none());
    }

    #[test]
    fn intersect_keeps_shared_contents_with_both_instance_sets() {
        let mut a = index_a();
        a.add_instance("C1", 5, "server_2", "dev_9", "/only/a", 1);
        let mut b = ContentData::new();
        b.add_instance("A1", 50, "server_2", "dev_2", "/backup/file_1", 7);
        b.add_instance("D1", 5, "server_2", "dev_2", "/only/b", 1);

        let both = intersect(&a, &b);
        assert_eq!(both.contents_size(), 1);
        assert_eq!(both.instances_size(), 2);
        assert!(both.content_has_instance("A1", "server_1", "/home/file_1"));
        assert!(both.content_has_instance("A1", "server_2", "/backup/file_1"));
    }

    #[test]
    fn remove_directory_matches_whole_components() {
        let mut index = ContentData::new();
        index.add_instance("A", 1, "srv", "d", "/a/b/cc/file1", 1);
        index.add_instance("B", 1, "srv", "d", "/a/b/file2", 1);
        index.add_instance("C", 1, "srv", "d", "/a/bc/file3", 1);
        index.add_instance("D", 1, "other", "d", "/a/b/file4", 1);
        index.add_symlink("srv", "/a/b/link", "/x");

        let pruned = remove_directory(Some(&index), "/a/b/c", "srv").unwrap();
        assert_eq!(pruned, index);

        let pruned = remove_directory(Some(&index), "/a/b", "srv").unwrap();
        assert_eq!(pruned.instances_size(), 2);
        assert!(pruned.content_exists("C"));
        assert!(pruned.content_exists("D"));
        assert_eq!(pruned.symlinks_size(), 0);
        // Pure form leaves its input alone.
        assert_eq!(index.instances_size(), 4);

        assert!(remove_directory(None, "/a", "srv").is_none());
    }

    #[test]
    fn remove_directory_in_place_returns_removed_entries() {
        let mut index = ContentData::new();
        index.add_instance("A", 1, "srv", "d", "/a/b/file1", 7);
        index.add_instance("A", 1, "srv", "d", "/keep/file1", 9);
        index.add_symlink("srv", "/a/b/link", "/x");

        let removed = index.remove_directory("/a/b", "srv");
        assert_eq!(removed.instances_size(), 1);
        assert_eq!(removed.symlinks_size(), 1);
        assert_eq!(removed.content("A").unwrap().mod_time, 7);
        assert_eq!(index.instances_size(), 1);
        assert!(index.content_exists("A"));
        assert_eq!(index.symlinks_size(), 0);
    }

    #[test]
    fn remove_then_merge_recovers_disjoint_operand() {
        let a = index_a();
        let mut b = ContentData::new();
        b.add_instance("B1", 60, "server_1", "dev_1", "/home/file_2", 44_444_444_444);
        b.add_symlink("server_1", "/home/link", "/home/file_2");
        let merged = merge(&a, &b);
        assert_eq!(remove(Some(&a), Some(&merged)).unwrap(), b);
        assert_eq!(remove(Some(&b), Some(&merged)).unwrap(), a);
    }
}
