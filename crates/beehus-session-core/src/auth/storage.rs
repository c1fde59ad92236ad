//! Durable slots for the access and refresh tokens.
//!
//! Each token lives in its own slot and is written or removed independently
//! whenever the in-memory value changes. A slot that cannot be read is
//! reported as an error; a slot that simply does not exist is `None`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use keyring::Entry;

use crate::config::{Config, StorageKind};

/// Keychain service name
const SERVICE_NAME: &str = "beehus-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSlot {
    Access,
    Refresh,
}

impl TokenSlot {
    pub fn key(self) -> &'static str {
        match self {
            TokenSlot::Access => "access_token",
            TokenSlot::Refresh => "refresh_token",
        }
    }
}

pub trait TokenStore: Send + Sync {
    fn load(&self, slot: TokenSlot) -> Result<Option<String>>;

    fn save(&self, slot: TokenSlot, value: &str) -> Result<()>;

    /// Removing an empty slot is not an error
    fn remove(&self, slot: TokenSlot) -> Result<()>;

    /// Mirror an optional in-memory value into the slot
    fn write(&self, slot: TokenSlot, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.save(slot, value),
            None => self.remove(slot),
        }
    }
}

/// Build the store selected in the configuration
pub fn open_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.storage {
        StorageKind::File => Arc::new(FileTokenStore::new(config.cache_dir()?)),
        StorageKind::Keyring => Arc::new(KeyringTokenStore::new(SERVICE_NAME)),
        StorageKind::Memory => Arc::new(MemoryTokenStore::default()),
    };
    Ok(store)
}

// ============================================================================
// File
// ============================================================================

/// One plain file per slot, named after the slot key
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn slot_path(&self, slot: TokenSlot) -> PathBuf {
        self.dir.join(slot.key())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, slot: TokenSlot) -> Result<Option<String>> {
        let path = self.slot_path(slot);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", slot.key()))?;
        let value = contents.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    fn save(&self, slot: TokenSlot, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.slot_path(slot), value)
            .with_context(|| format!("Failed to write {}", slot.key()))
    }

    fn remove(&self, slot: TokenSlot) -> Result<()> {
        let path = self.slot_path(slot);
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", slot.key()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// OS keychain entries, one per slot, under a shared service name
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, slot: TokenSlot) -> Result<Entry> {
        Entry::new(&self.service, slot.key()).context("Failed to create keyring entry")
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self, slot: TokenSlot) -> Result<Option<String>> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn save(&self, slot: TokenSlot, value: &str) -> Result<()> {
        self.entry(slot)?
            .set_password(value)
            .context("Failed to store token in keychain")
    }

    fn remove(&self, slot: TokenSlot) -> Result<()> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Default)]
pub struct MemoryTokenStore {
    slots: Mutex<HashMap<TokenSlot, String>>,
}

impl MemoryTokenStore {
    /// Pre-populated store, as if left behind by an earlier run
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        let store = Self::default();
        if let Ok(mut slots) = store.slots.lock() {
            if let Some(access) = access {
                slots.insert(TokenSlot::Access, access.to_string());
            }
            if let Some(refresh) = refresh {
                slots.insert(TokenSlot::Refresh, refresh.to_string());
            }
        }
        store
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TokenSlot, String>>> {
        self.slots
            .lock()
            .map_err(|_| anyhow::anyhow!("Token store lock poisoned"))
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, slot: TokenSlot) -> Result<Option<String>> {
        Ok(self.slots()?.get(&slot).cloned())
    }

    fn save(&self, slot: TokenSlot, value: &str) -> Result<()> {
        self.slots()?.insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: TokenSlot) -> Result<()> {
        self.slots()?.remove(&slot);
        Ok(())
    }
}
