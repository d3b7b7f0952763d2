//! State store backends

pub mod local;
pub mod memory;

pub use local::LocalStateStore;
pub use memory::MemoryStateStore;
