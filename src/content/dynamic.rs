//! Process-wide holder of the latest known content index.
//!
//! Readers take a shared snapshot (`Arc`) under a short read lock and never
//! see it change afterwards. Writers build the next snapshot off-lock and
//! only take the write lock to swap it in.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::content::algebra::merge_override_b;
use crate::content::content_data::ContentData;

/// Live, continuously updated index snapshot.
#[derive(Debug, Default)]
pub struct DynamicContentData {
    current: RwLock<Arc<ContentData>>,
    /// Serializes writers so concurrent updates never lose each other.
    install: Mutex<()>,
}

impl DynamicContentData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: ContentData) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            install: Mutex::new(()),
        }
    }

    /// Merge `partial` into the held snapshot; `partial` wins on conflicts.
    pub fn update(&self, partial: &ContentData) {
        let _writer = self.install.lock();
        let mut next = (*self.snapshot()).clone();
        merge_override_b(partial, &mut next);
        *self.current.write() = Arc::new(next);
    }

    /// Install a complete snapshot, dropping everything previously held.
    pub fn replace(&self, full: ContentData) {
        let _writer = self.install.lock();
        *self.current.write() = Arc::new(full);
    }

    /// Shared handle to the current snapshot.
    pub fn snapshot(&self) -> Arc<ContentData> {
        Arc::clone(&*self.current.read())
    }

    /// Independent copy of the current snapshot.
    pub fn last_content_data(&self) -> ContentData {
        (*self.snapshot()).clone()
    }
}
