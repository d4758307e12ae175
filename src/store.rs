//! Flat-file persistence for fleet state
//!
//! The whole [`FleetState`] is read and written as one unit. Writers are
//! serialized through an internal lock and land on disk via an atomic
//! temp-file replace, so a crash never leaves a torn state file.

use crate::error::{FleetError, Result};
use crate::model::FleetState;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Load/save contract for the persisted fleet state
pub trait FleetStore: Send + Sync {
    fn load(&self) -> Result<FleetState>;
    fn save(&self, state: &FleetState) -> Result<()>;
}

/// JSON flat-file store
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store at the given path, creating the parent directory and
    /// an initial empty state file if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FleetError::Store(format!("create {}: {}", parent.display(), e)))?;
        }

        let store = Self {
            path,
            write_lock: Mutex::new(()),
        };

        if !store.path.exists() {
            store.save(&FleetState::default())?;
            info!(path = %store.path.display(), "Initialized empty fleet state file");
        } else {
            info!(path = %store.path.display(), "Fleet state file found");
        }

        Ok(store)
    }

    fn parent_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl FleetStore for JsonFileStore {
    fn load(&self) -> Result<FleetState> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| FleetError::Store(format!("read {}: {}", self.path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| FleetError::Store(format!("parse {}: {}", self.path.display(), e)))
    }

    fn save(&self, state: &FleetState) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| FleetError::Store(format!("serialize state: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(self.parent_dir())
            .map_err(|e| FleetError::Store(format!("temp file: {}", e)))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| FleetError::Store(format!("write temp file: {}", e)))?;
        tmp.persist(&self.path)
            .map_err(|e| FleetError::Store(format!("replace {}: {}", self.path.display(), e)))?;

        debug!(
            path = %self.path.display(),
            entries = state.entries.len(),
            log = state.log.len(),
            "Fleet state saved"
        );
        Ok(())
    }
}

/// In-memory store for tests
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<FleetState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: FleetState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

impl FleetStore for MemoryStore {
    fn load(&self) -> Result<FleetState> {
        Ok(self.state.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save(&self, state: &FleetState) -> Result<()> {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryStatus, FleetEntry};
    use chrono::Utc;

    fn sample_entry(id: u64) -> FleetEntry {
        FleetEntry {
            id,
            user_id: 1,
            label: format!("VN-{}", id),
            credential: "key".to_string(),
            subdomain: format!("proxy{}", id),
            port: 9000 + id as u16 - 1,
            region: "random".to_string(),
            is_active: true,
            upstream: None,
            upstream_ip: None,
            location: None,
            status: EntryStatus::Pending,
            latency_ms: None,
            last_check_at: None,
            expiration_at: None,
            ttl: None,
            ttc: None,
            last_rotated_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_initializes_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("fleet.json")).unwrap();

        let state = store.load().unwrap();
        assert!(state.entries.is_empty());
        assert!(state.log.is_empty());
        assert!(state.settings.rotate_on_expiration);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("fleet.json")).unwrap();

        let mut state = FleetState::default();
        state.entries.push(sample_entry(1));
        state.entries.push(sample_entry(2));
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].subdomain, "proxy1");
        assert_eq!(loaded.entries[1].port, 9001);
    }

    #[test]
    fn test_reopen_keeps_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            let mut state = FleetState::default();
            state.entries.push(sample_entry(1));
            store.save(&state).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, FleetError::Store(_)));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let mut state = store.load().unwrap();
        state.entries.push(sample_entry(1));
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap().entries.len(), 1);
    }
}
