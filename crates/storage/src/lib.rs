//! Session history stores for Sleuth.
//!
//! All backends implement [`sleuth_core::HistoryStore`]:
//! - [`InMemoryStore`] for tests and one-shot runs
//! - [`FileStore`] for JSON-lines persistence, one file per session
//! - [`NoopStore`] to disable history entirely

pub mod file_backend;
pub mod in_memory;
pub mod noop;

pub use file_backend::FileStore;
pub use in_memory::InMemoryStore;
pub use noop::NoopStore;

use sleuth_core::HistoryStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Pick a backend by its configured name. Unknown names fall back to memory.
pub fn create_store(backend: &str, dir: PathBuf) -> Arc<dyn HistoryStore> {
    match backend {
        "file" => Arc::new(FileStore::new(dir)),
        "none" | "noop" => Arc::new(NoopStore),
        "memory" => Arc::new(InMemoryStore::new()),
        other => {
            tracing::warn!(backend = other, "Unknown storage backend, using in-memory history");
            Arc::new(InMemoryStore::new())
        }
    }
}
