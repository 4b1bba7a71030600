pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::SqliteStore;

use std::sync::Arc;

use vigil_core::config::{AppConfig, StoreBackend};
use vigil_core::error::Result;
use vigil_core::traits::StateStore;

/// Open the state store selected by the configuration.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn StateStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.store_path())?)),
    }
}
