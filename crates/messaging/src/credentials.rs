//! Keyed storage for the credentials a messaging client provisions.
//!
//! Values are opaque to feedlink: the client decides what it writes. The only
//! key feedlink itself interprets is [`CREDENTIALS_KEY`], written once linking
//! completes.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, info, warn};

use crate::Result;

/// Key under which a client stores its account credentials after linking.
pub const CREDENTIALS_KEY: &str = "account";

/// Keyed storage handed to messaging clients.
///
/// Every mutation counts as a change the backing layer must persist before
/// returning.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn keys(&self) -> Vec<String>;
}

/// True once a linking handshake has stored account credentials.
pub fn has_credentials(store: &dyn CredentialStore) -> bool {
    store.get(CREDENTIALS_KEY).is_some()
}

/// In-memory store; counts changes so tests can observe flushes.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<BTreeMap<String, String>>,
    changes: AtomicU64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutations applied so far.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    fn changed(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        self.changed();
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        self.changed();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        self.changed();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }
}

/// JSON-file store, rewritten on every change.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCredentialStore {
    /// Open the store at `path`, loading existing entries.
    ///
    /// A missing file yields an empty store; an unreadable or corrupt one is
    /// logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(path: &std::path::Path) -> BTreeMap<String, String> {
        let shown = path.display().to_string();
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %shown, "credential file not found");
                return BTreeMap::new();
            },
            Err(e) => {
                warn!(path = %shown, error = %e, "credential file read failed");
                return BTreeMap::new();
            },
        };

        match serde_json::from_str(&data) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %shown, error = %e, "credential file parse failed");
                BTreeMap::new()
            },
        }
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = %self.path.display(), count = entries.len(), "credentials flushed");
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        info!(path = %self.path.display(), "clearing messaging credentials");
        self.flush(&entries)
    }

    fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }
}
