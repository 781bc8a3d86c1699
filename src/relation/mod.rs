//! Relationship storage: descriptors, mode resolution, read patterns and writes.

pub mod descriptor;
pub mod mutation;
pub mod patterns;
pub mod pivot;
pub mod resolver;

pub use descriptor::{PropertyType, RelationshipDescriptor, RelationshipKind, StorageMode, Through};
pub use mutation::{attach, detach, sync, update_edge, DetachFilter};
pub use patterns::{link_pattern, LinkPattern};
pub use pivot::VirtualPivot;
pub use resolver::{
    resolve, ModeSource, ResolutionContext, ResolvedRelationship, ResolvedThrough, StorageLayers,
};
