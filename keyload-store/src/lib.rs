//! [`PersistentStore`](keyload_core::PersistentStore) implementations.
//!
//! - [`FileStore`]: one JSON document on disk, locked and rewritten atomically on every
//!   mutation.  Used by the `keyload` CLI.
//! - [`MemoryStore`]: process-local map, for tests and ephemeral setups.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;
