//! Mutation API and read model consumed by the rendering layer.

mod library_service;

pub use library_service::LibraryService;
