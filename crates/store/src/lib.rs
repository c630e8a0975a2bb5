//! Store backends for Promptloom.
//!
//! - [`InMemoryStore`] keeps everything in process memory (tests, previews).
//! - [`SqliteStore`] persists to a SQLite file via `sqlx`.
//!
//! [`open`] picks a backend from a database URL.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use promptloom_core::error::StoreError;
use promptloom_core::store::Store;
use std::sync::Arc;

/// URL that selects the in-memory backend.
pub const MEMORY_URL: &str = "memory";

/// Open the backend named by `url`.
///
/// `"memory"` yields an empty [`InMemoryStore`]; `sqlite:` URLs open (and
/// migrate) a SQLite database.
pub async fn open(url: &str, max_connections: u32) -> Result<Arc<dyn Store>, StoreError> {
    if url == MEMORY_URL {
        return Ok(Arc::new(InMemoryStore::new()));
    }

    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::connect(url, max_connections).await?));
    }

    let _ = max_connections;
    Err(StoreError::Storage(format!(
        "unsupported database url '{url}' (expected 'memory' or 'sqlite:...')"
    )))
}
