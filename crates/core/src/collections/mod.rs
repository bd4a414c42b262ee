//! Collection hierarchy and the tag cascade that keeps card membership consistent.

mod collection_tree;
mod tag_cascade;

pub use collection_tree::{CollectionNode, CollectionTree};
pub use tag_cascade::{validate_slug, TagCascadeManager};
