//! Local-first synchronization engine for Pawkit.
//!
//! Mutations land in the [`store::LocalStore`] immediately, are journaled to the
//! [`sync::SyncQueue`] and reconciled against the remote by the
//! [`sync::SyncEngine`].

pub mod collections;
pub mod config;
pub mod entities;
pub mod errors;
pub mod library;
pub mod store;
pub mod sync;

pub use errors::{Error, Result};
