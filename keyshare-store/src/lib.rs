//! Credential store implementations.
//!
//! Both stores implement [`keyshare_core::CredentialStore`]:
//! - [`MemoryStore`] keeps everything in process memory.
//! - [`FileStore`] additionally persists to an encrypted JSON file shared
//!   safely between processes.

mod entries;
pub mod file;
mod lock;
pub mod memory;

use std::sync::Arc;

use keyshare_core::config::{StoreBackend, StoreConfig};
use keyshare_core::{CredentialStore, StoreError};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Open the store selected by `config`.
pub fn open_configured(config: &StoreConfig) -> Result<Arc<dyn CredentialStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(MemoryStore::new()),
        StoreBackend::File => {
            let path = config.resolved_path().ok_or_else(|| {
                StoreError::Corrupt("cannot determine store path: set store.path".to_string())
            })?;
            Ok(FileStore::open(path)?)
        }
    }
}
