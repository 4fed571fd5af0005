//! Storage backends for the engine-owned collections.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryListingStore, MemoryStore};
pub use sqlite::SqliteStore;
