//! Entity model shared by the local store, the sync queue and the remote contract.

mod entities_model;

pub use entities_model::*;
