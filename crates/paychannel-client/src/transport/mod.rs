//! Peer messaging transport abstraction.

mod memory;
mod traits;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use traits::{RoomOptions, Transport, TransportFactory};
