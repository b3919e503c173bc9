//! Content index: contents keyed by checksum, instances keyed by location,
//! symlinks keyed by location.
//!
//! A content record exists iff at least one instance references its
//! checksum. Each content record keeps the set of locations that reference
//! it, so removing the last instance cascades to the content without any
//! back-pointers from instances to contents.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

/// Content fingerprint (hex digest in practice, opaque to the index).
pub type Checksum = String;

/// Identity of an instance or symlink: `(server, path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub server: String,
    pub path: String,
}

impl Location {
    pub fn new(server: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            path: path.into(),
        }
    }
}

/// A content record as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub checksum: Checksum,
    pub size: u64,
    pub mod_time: i64,
}

/// One on-disk occurrence of a content. `size` mirrors the content record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub checksum: Checksum,
    pub size: u64,
    pub server: String,
    pub device: String,
    pub path: String,
    pub mod_time: i64,
}

impl Instance {
    pub fn location(&self) -> Location {
        Location::new(self.server.clone(), self.path.clone())
    }
}

/// A symbolic link recorded at a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    pub server: String,
    pub path: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContentRecord {
    pub(crate) size: u64,
    pub(crate) mod_time: i64,
    /// Every location whose instance carries this checksum.
    pub(crate) locations: BTreeSet<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstanceRecord {
    pub(crate) checksum: Checksum,
    pub(crate) device: String,
    pub(crate) mod_time: i64,
}

/// In-memory content index with cascade semantics.
///
/// Cloning yields a deep, independent copy. Equality is structural and
/// independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentData {
    pub(crate) contents: BTreeMap<Checksum, ContentRecord>,
    pub(crate) instances: BTreeMap<Location, InstanceRecord>,
    pub(crate) symlinks: BTreeMap<Location, String>,
}

impl ContentData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance and, if needed, its content record.
    ///
    /// An instance already stored at the same location is replaced; if it
    /// carried a different checksum it is detached from that content first
    /// (cascading the content away when it was the last instance).
    ///
    /// Size lives on the content record: re-adding a known checksum with a
    /// different size overwrites the size seen by every instance sharing it.
    /// The content `mod_time` keeps the value from the first instance added.
    #[allow(clippy::too_many_arguments)]
    pub fn add_instance(
        &mut self,
        checksum: impl Into<Checksum>,
        size: u64,
        server: impl Into<String>,
        device: impl Into<String>,
        path: impl Into<String>,
        mod_time: i64,
    ) {
        let checksum = checksum.into();
        let location = Location::new(server, path);

        if let Some(previous) = self.instances.get(&location)
            && previous.checksum != checksum
        {
            let previous_checksum = previous.checksum.clone();
            self.detach(&previous_checksum, &location);
        }

        match self.contents.get_mut(&checksum) {
            Some(record) => {
                // Same path or not, the first-seen content mod_time stays.
                if record.size != size {
                    warn!(
                        checksum = %checksum,
                        old_size = record.size,
                        new_size = size,
                        "content size differs for the same checksum, overriding"
                    );
                    record.size = size;
                }
                record.locations.insert(location.clone());
            }
            None => {
                self.contents.insert(
                    checksum.clone(),
                    ContentRecord {
                        size,
                        mod_time,
                        locations: BTreeSet::from([location.clone()]),
                    },
                );
            }
        }

        self.instances.insert(
            location,
            InstanceRecord {
                checksum,
                device: device.into(),
                mod_time,
            },
        );
    }

    /// Add an instance from an owned record.
    pub fn insert(&mut self, instance: Instance) {
        self.add_instance(
            instance.checksum,
            instance.size,
            instance.server,
            instance.device,
            instance.path,
            instance.mod_time,
        );
    }

    /// Remove the instance at `(server, path)`, cascading its content away
    /// when no other instance references it.
    pub fn remove_instance(&mut self, server: &str, path: &str) -> Option<Instance> {
        let location = Location::new(server, path);
        let record = self.instances.remove(&location)?;
        let size = self.contents.get(&record.checksum).map_or(0, |c| c.size);
        self.detach(&record.checksum, &location);
        Some(Instance {
            checksum: record.checksum,
            size,
            server: location.server,
            device: record.device,
            path: location.path,
            mod_time: record.mod_time,
        })
    }

    /// Add or replace the symlink at `(server, path)`.
    pub fn add_symlink(
        &mut self,
        server: impl Into<String>,
        path: impl Into<String>,
        target: impl Into<String>,
    ) {
        self.symlinks
            .insert(Location::new(server, path), target.into());
    }

    pub fn remove_symlink(&mut self, server: &str, path: &str) -> Option<Symlink> {
        let location = Location::new(server, path);
        self.symlinks.remove(&location).map(|target| Symlink {
            server: location.server,
            path: location.path,
            target,
        })
    }

    pub fn content_exists(&self, checksum: &str) -> bool {
        self.contents.contains_key(checksum)
    }

    pub fn instance_exists(&self, server: &str, path: &str) -> bool {
        self.instances.contains_key(&Location::new(server, path))
    }

    pub fn symlink_exists(&self, server: &str, path: &str) -> bool {
        self.symlinks.contains_key(&Location::new(server, path))
    }

    /// Whether the exact `(checksum, server, path)` triple is stored.
    pub fn content_has_instance(&self, checksum: &str, server: &str, path: &str) -> bool {
        self.instances
            .get(&Location::new(server, path))
            .is_some_and(|record| record.checksum == checksum)
    }

    pub fn get_instance_mod_time(&self, checksum: &str, server: &str, path: &str) -> Option<i64> {
        self.instances
            .get(&Location::new(server, path))
            .filter(|record| record.checksum == checksum)
            .map(|record| record.mod_time)
    }

    pub fn content(&self, checksum: &str) -> Option<Content> {
        self.contents.get(checksum).map(|record| Content {
            checksum: checksum.to_string(),
            size: record.size,
            mod_time: record.mod_time,
        })
    }

    pub fn instance(&self, server: &str, path: &str) -> Option<Instance> {
        let location = Location::new(server, path);
        self.instances
            .get(&location)
            .map(|record| self.materialize(&location, record))
    }

    pub fn contents_size(&self) -> usize {
        self.contents.len()
    }

    pub fn instances_size(&self) -> usize {
        self.instances.len()
    }

    pub fn symlinks_size(&self) -> usize {
        self.symlinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty() && self.symlinks.is_empty()
    }

    /// Contents in checksum order.
    pub fn contents(&self) -> impl Iterator<Item = Content> + '_ {
        self.contents.iter().map(|(checksum, record)| Content {
            checksum: checksum.clone(),
            size: record.size,
            mod_time: record.mod_time,
        })
    }

    /// Instances grouped by checksum, each group in location order.
    pub fn instances(&self) -> impl Iterator<Item = Instance> + '_ {
        self.contents.iter().flat_map(move |(checksum, record)| {
            record.locations.iter().map(move |location| {
                let instance = &self.instances[location];
                debug_assert_eq!(&instance.checksum, checksum);
                self.materialize(location, instance)
            })
        })
    }

    /// Instances of one checksum in location order.
    pub fn instances_of<'a>(&'a self, checksum: &str) -> impl Iterator<Item = Instance> + 'a {
        self.contents
            .get(checksum)
            .into_iter()
            .flat_map(move |record| {
                record
                    .locations
                    .iter()
                    .map(move |location| self.materialize(location, &self.instances[location]))
            })
    }

    /// Symlinks in location order.
    pub fn symlinks(&self) -> impl Iterator<Item = Symlink> + '_ {
        self.symlinks.iter().map(|(location, target)| Symlink {
            server: location.server.clone(),
            path: location.path.clone(),
            target: target.clone(),
        })
    }

    /// Set every content and instance mod_time to the minimum mod_time
    /// observed among the instances of that checksum. Idempotent.
    pub fn unify_time(&mut self) {
        for record in self.contents.values_mut() {
            let min_time = record
                .locations
                .iter()
                .filter_map(|location| self.instances.get(location))
                .map(|instance| instance.mod_time)
                .min()
                .unwrap_or(record.mod_time);
            record.mod_time = min_time;
            for location in &record.locations {
                if let Some(instance) = self.instances.get_mut(location) {
                    instance.mod_time = min_time;
                }
            }
        }
    }

    pub(crate) fn set_content_fields(&mut self, checksum: &str, size: u64, mod_time: i64) -> bool {
        match self.contents.get_mut(checksum) {
            Some(record) => {
                record.size = size;
                record.mod_time = mod_time;
                true
            }
            None => false,
        }
    }

    fn materialize(&self, location: &Location, record: &InstanceRecord) -> Instance {
        Instance {
            checksum: record.checksum.clone(),
            size: self.contents.get(&record.checksum).map_or(0, |c| c.size),
            server: location.server.clone(),
            device: record.device.clone(),
            path: location.path.clone(),
            mod_time: record.mod_time,
        }
    }

    fn detach(&mut self, checksum: &str, location: &Location) {
        if let Some(record) = self.contents.get_mut(checksum) {
            record.locations.remove(location);
            if record.locations.is_empty() {
                self.contents.remove(checksum);
            }
        }
    }
}
