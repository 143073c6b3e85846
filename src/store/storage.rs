//! Profile Storage Backends
//!
//! Key/value documents shared by every client instance of one profile.
//! Each handle has an origin id; writes are announced as [`StorageEvent`]s
//! on a broadcast channel so sibling instances can react to edits made
//! elsewhere.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::error::StorageResult;

const EVENT_CAPACITY: usize = 64;

/// Change notification for one key
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Handle that made the change; `Uuid::nil()` for changes made outside
    /// this process
    pub origin: Uuid,
    pub at: DateTime<Utc>,
}

/// Key/value store shared across instances of a profile
pub trait ProfileStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Subscribe to change notifications
    fn events(&self) -> broadcast::Receiver<StorageEvent>;

    /// Identity of this handle, stamped on the events it produces
    fn origin(&self) -> Uuid;
}

// ============================================
// In-memory profile
// ============================================

/// In-memory profile; [`MemoryStorage::handle`] opens a sibling instance
#[derive(Clone)]
pub struct MemoryStorage {
    profile: Arc<MemoryProfile>,
    origin: Uuid,
}

struct MemoryProfile {
    values: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            profile: Arc::new(MemoryProfile {
                values: Mutex::new(HashMap::new()),
                events,
            }),
            origin: Uuid::new_v4(),
        }
    }

    /// Another handle over the same profile, with its own origin
    pub fn handle(&self) -> Self {
        Self {
            profile: Arc::clone(&self.profile),
            origin: Uuid::new_v4(),
        }
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.profile.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn announce(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let _ = self.profile.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.origin,
            at: Utc::now(),
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let old = self.values().insert(key.to_string(), value.to_string());
        self.announce(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let old = self.values().remove(key);
        if old.is_some() {
            self.announce(key, old, None);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<StorageEvent> {
        self.profile.events.subscribe()
    }

    fn origin(&self) -> Uuid {
        self.origin
    }
}

// ============================================
// File-backed profile
// ============================================

/// One JSON file per key inside a profile directory
///
/// Edits made by other processes are picked up by the watcher started with
/// [`FileStorage::spawn_watcher`].
#[derive(Clone)]
pub struct FileStorage {
    dir: PathBuf,
    origin: Uuid,
    events: broadcast::Sender<StorageEvent>,
    /// Last content observed per key
    seen: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl FileStorage {
    /// Open (and create) a profile directory
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let storage = Self {
            dir,
            origin: Uuid::new_v4(),
            events,
            seen: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut seen = HashMap::new();
        for key in storage.keys_on_disk()? {
            let value = storage.read_key(&key)?;
            seen.insert(key, value);
        }
        *storage.seen() = seen;

        Ok(storage)
    }

    /// Profile directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the latest known value of `key`; returns the previous one.
    /// Absent keys are forgotten rather than kept as tombstones.
    fn observe(&self, key: &str, value: Option<String>) -> Option<String> {
        let mut seen = self.seen();
        match value {
            Some(value) => seen.insert(key.to_string(), Some(value)).flatten(),
            None => seen.remove(key).flatten(),
        }
    }

    fn read_key(&self, key: &str) -> StorageResult<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_on_disk(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }

    /// Compare disk content with what was last observed and announce
    /// differences as external edits. Returns the number of changes found.
    pub fn poll_changes(&self) -> StorageResult<usize> {
        let mut keys = self.keys_on_disk()?;
        for key in self.seen().keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut changes = 0;
        for key in keys {
            let current = self.read_key(&key)?;
            let previous = self.observe(&key, current.clone());
            if previous != current {
                changes += 1;
                tracing::debug!(key = %key, "External profile edit detected");
                let _ = self.events.send(StorageEvent {
                    key,
                    old_value: previous,
                    new_value: current,
                    origin: Uuid::nil(),
                    at: Utc::now(),
                });
            }
        }
        Ok(changes)
    }

    /// Poll the directory for edits made by other processes
    pub fn spawn_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = storage.poll_changes() {
                    tracing::warn!(error = %e, dir = ?storage.dir, "Profile watch failed");
                }
            }
        })
    }

    fn announce(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.origin,
            at: Utc::now(),
        });
    }
}

impl ProfileStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.read_key(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;

        let old = self.observe(key, Some(value.to_string()));
        self.announce(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let old = self.observe(key, None);
        self.announce(key, old, None);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn origin(&self) -> Uuid {
        self.origin
    }
}
