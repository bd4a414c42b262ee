//! Local Store: durable per-device record store plus read-model notifications.

mod memory_store;
mod store_traits;
mod write_gate;

pub use memory_store::MemoryStore;
pub use store_traits::*;
pub use write_gate::WriteGate;
