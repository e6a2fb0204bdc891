//! In-memory storage backend.
//!
//! Stores are registered process-wide by name, so every provider built from
//! `memory://name` sees the same objects.

use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use super::{BackendConfig, StorageProvider};

static STORES: LazyLock<Mutex<HashMap<String, Arc<InMemory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub name: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let store = {
            let mut stores = STORES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            stores
                .entry(config.name.clone())
                .or_insert_with(|| Arc::new(InMemory::new()))
                .clone()
        };
        let object_store: Arc<dyn ObjectStore> = store;

        let canonical_url = match &config.key {
            Some(key) => format!("memory://{}/{}", config.name, key),
            None => format!("memory://{}", config.name),
        };

        Self {
            config: BackendConfig::Memory(config),
            object_store,
            canonical_url,
        }
    }
}
