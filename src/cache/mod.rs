//! Storage for offline support.
//!
//! This module provides:
//! - Cache generations: named containers of request/response pairs
//! - A local key/value store for page-side persisted values
//! - SQLite and in-memory backends for both

mod storage;
mod traits;

pub use storage::{CacheStorage, LocalStore, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CachedEntry};
#[cfg(test)]
pub use traits::CacheSource;
