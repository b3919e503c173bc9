//! Content index: data model, set algebra, text format, live snapshot holder.

pub mod algebra;
pub mod checksum;
pub mod content_data;
pub mod dynamic;
pub mod format;
pub mod validation;

pub use algebra::{
    intersect, merge, merge_all, merge_override_b, remove, remove_directory, remove_instances,
    remove_instances_in_place,
};
pub use content_data::{Checksum, Content, ContentData, Instance, Location, Symlink};
pub use dynamic::DynamicContentData;
pub use format::{FileCompression, IndexFormat, WriteOptions};
pub use validation::{CheckLevel, ValidationOptions};
