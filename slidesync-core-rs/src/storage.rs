//! Local persistence for the shared state.
//!
//! Implements:
//! - A single keyed slot holding the latest serialized state
//! - A byte quota, enforced before anything is written
//! - Change notification for other execution contexts on the same device
//!   (the local-loopback channel)
//!
//! Two backends: a directory of JSON files watched with `notify`, and an
//! in-memory map for tests and same-process setups.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{LoadError, StoreError};
use crate::types::SharedState;

/// Pending notifications per subscriber
const SUBSCRIPTION_BUFFER: usize = 32;

/// Raw key/value persistence the store writes through
pub trait Backend: Send + Sync {
    /// Current value for `key`, if any
    fn read(&self, key: &str) -> io::Result<Option<String>>;

    /// Replace the value for `key`. Must not leave a partial value behind.
    fn write(&self, key: &str, value: &str) -> io::Result<()>;

    /// Remove `key`; a missing key is not an error
    fn remove(&self, key: &str) -> io::Result<()>;

    /// Deliver each new value written to `key` by another writer
    fn watch(&self, key: &str) -> Result<Subscription, StoreError>;
}

/// Stream of raw values written to a watched key
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    _watcher: Option<RecommendedWatcher>,
}

impl Subscription {
    fn new(rx: mpsc::Receiver<String>, watcher: Option<RecommendedWatcher>) -> Self {
        Self {
            rx,
            _watcher: watcher,
        }
    }

    /// Next written value; `None` once the backend stops notifying
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// One JSON file per key inside a directory
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create the backend, creating `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Backend for FileBackend {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        // Write to temp file then rename (atomic)
        let path = self.path_for(key);
        let temp_path = self.dir.join(format!("{}.json.tmp", key));
        fs::write(&temp_path, value)?;
        fs::rename(&temp_path, &path)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn watch(&self, key: &str) -> Result<Subscription, StoreError> {
        let path = self.path_for(key);
        let file_name = path.file_name().map(|n| n.to_os_string());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut last: Option<String> = None;

        // Runs on the watcher's own thread, so blocking_send is fine here
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Store: watch error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let touches_key = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_key {
                return;
            }

            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Store: changed file not readable yet: {}", e);
                    return;
                }
            };
            if last.as_deref() == Some(raw.as_str()) {
                return;
            }
            last = Some(raw.clone());
            let _ = tx.blocking_send(raw);
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        debug!("Store: watching {:?} for key {}", self.dir, key);
        Ok(Subscription::new(rx, Some(watcher)))
    }
}

/// In-memory backend for testing and same-process presenter/viewer pairs
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    watchers: Mutex<Vec<(String, mpsc::Sender<String>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());

        let mut watchers = self.watchers.lock();
        watchers.retain(|(_, tx)| !tx.is_closed());
        for (watched, tx) in watchers.iter() {
            if watched == key {
                let _ = tx.try_send(value.to_string());
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn watch(&self, key: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.watchers.lock().push((key.to_string(), tx));
        Ok(Subscription::new(rx, None))
    }
}

/// The shared state's persistence channel
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn Backend>,
    key: String,
    quota: usize,
}

impl StateStore {
    pub fn new(backend: Arc<dyn Backend>, key: impl Into<String>, quota: usize) -> Self {
        Self {
            backend,
            key: key.into(),
            quota,
        }
    }

    /// File-backed store as described by the configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend = FileBackend::new(&config.dir)?;
        info!(
            "Store: using {:?} (key={}, quota={} bytes)",
            backend.dir(),
            config.key,
            config.quota_bytes
        );
        Ok(Self::new(Arc::new(backend), &config.key, config.quota_bytes))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Last persisted state
    pub fn load(&self) -> Result<SharedState, LoadError> {
        let raw = self.backend.read(&self.key)?.ok_or(LoadError::Missing)?;
        let state = SharedState::from_json(&raw)?;
        state.validate()?;
        Ok(state)
    }

    /// Last persisted state, or the all-absent default when there is none or
    /// it cannot be read
    pub fn load_or_default(&self) -> SharedState {
        match self.load() {
            Ok(state) => state,
            Err(LoadError::Missing) => SharedState::default(),
            Err(e) => {
                warn!("Store: ignoring persisted state for {}: {}", self.key, e);
                SharedState::default()
            }
        }
    }

    /// Serialize and persist. Returns the encoded payload so callers can
    /// reuse it for propagation. On error nothing is written.
    pub fn save(&self, state: &SharedState) -> Result<String, StoreError> {
        let encoded = state.to_json()?;
        if encoded.len() > self.quota {
            return Err(StoreError::Capacity {
                size: encoded.len(),
                quota: self.quota,
            });
        }

        self.backend.write(&self.key, &encoded)?;
        debug!("Store: saved {} bytes under {}", encoded.len(), self.key);
        Ok(encoded)
    }

    /// Drop any persisted value
    pub fn clear(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.key)?;
        debug!("Store: cleared {}", self.key);
        Ok(())
    }

    /// Values written for this key from elsewhere on the device
    pub fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.backend.watch(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionId;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_state() -> SharedState {
        let mut state = SharedState::new("obs-ab12cd".parse::<SessionId>().unwrap());
        state.slots[0] = Some("data:image/png;base64,iVBORw0KGgo=".to_string());
        state.interval_seconds = 8;
        state.active = true;
        state
    }

    fn memory_store(quota: usize) -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()), "slidesync_state", quota)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = memory_store(64 * 1024);
        let state = sample_state();

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_capacity_keeps_prior_value() {
        let store = memory_store(300);
        let state = sample_state();
        store.save(&state).unwrap();

        let mut big = state.clone();
        big.slots[1] = Some(format!("data:image/png;base64,{}", "A".repeat(400)));

        let err = store.save(&big).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::new(backend.clone(), "k", 1024);

        assert!(matches!(store.load(), Err(LoadError::Missing)));
        assert_eq!(store.load_or_default(), SharedState::default());

        backend.write("k", "{not json").unwrap();
        assert!(matches!(store.load(), Err(LoadError::Parse(_))));
        assert_eq!(store.load_or_default(), SharedState::default());

        backend
            .write(
                "k",
                r#"{"slots":[null,null,null,null,null],"intervalSeconds":0,"active":false,"ownerId":"obs-x"}"#,
            )
            .unwrap();
        assert!(matches!(store.load(), Err(LoadError::Shape(_))));
    }

    #[test]
    fn test_clear() {
        let store = memory_store(64 * 1024);
        store.save(&sample_state()).unwrap();
        store.clear().unwrap();
        assert!(matches!(store.load(), Err(LoadError::Missing)));

        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[tokio::test]
    async fn test_memory_subscription() {
        let store = memory_store(64 * 1024);
        let mut sub = store.subscribe().unwrap();

        let encoded = store.save(&sample_state()).unwrap();
        assert_eq!(sub.recv().await.unwrap(), encoded);
    }

    #[test]
    fn test_file_backend_roundtrip() -> io::Result<()> {
        let dir = tempdir()?;
        let config = StoreConfig {
            dir: dir.path().join("nested"),
            ..Default::default()
        };
        let state = sample_state();

        {
            let store = StateStore::from_config(&config).unwrap();
            store.save(&state).unwrap();
        }

        // A second store over the same directory sees the value
        let store = StateStore::from_config(&config).unwrap();
        assert_eq!(store.load().unwrap(), state);
        assert!(!dir.path().join("nested/slidesync_state.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_subscription_sees_other_writer() {
        let dir = tempdir().unwrap();
        let reader = FileBackend::new(dir.path()).unwrap();
        let writer = FileBackend::new(dir.path()).unwrap();

        let mut sub = reader.watch("slidesync_state").unwrap();
        writer.write("unrelated", "{}").unwrap();
        writer.write("slidesync_state", "first").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "first");
    }
}
