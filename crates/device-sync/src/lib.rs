//! REST client for the Pawkit entity sync API.
//!
//! [`RemoteSyncClient`] implements the core `RemoteApi` contract consumed by
//! the sync engine.

pub mod client;
pub mod error;
pub mod types;

pub use client::RemoteSyncClient;
pub use error::{DeviceSyncError, Result};
pub use types::{resource_name, ApiErrorResponse, ConflictResponse, WriteAck};
