//! Durable storage for learned throttling state.
//!
//! The snapshot is advisory, not correctness-critical: a missing or
//! corrupt file means starting from defaults, never a failed run. Saves
//! are atomic (temp file + rename) so a crash mid-write cannot leave a
//! half-written store behind.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ratelimit::{BreakerSnapshot, GovernorSnapshot, HostKey};
use crate::types::{ErrorKind, Result};

/// Schema version of the state file. Bumped on incompatible layout
/// changes; older or newer files are discarded with a warning.
pub const STATE_VERSION: u32 = 1;

/// Persisted throttling state for one host key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    /// Rate governor snapshot
    pub governor: GovernorSnapshot,
    /// Circuit breaker snapshot
    pub breaker: BreakerSnapshot,
}

/// A versioned snapshot of every host's governor and breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version, compared against [`STATE_VERSION`] on load
    pub version: u32,
    /// Unix timestamp (seconds) of the save
    pub saved_at: u64,
    /// Per-host snapshots
    pub hosts: HashMap<HostKey, HostState>,
}

impl PersistedState {
    /// An empty snapshot stamped with the current time
    #[must_use]
    pub fn now(hosts: HashMap<HostKey, HostState>) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            hosts,
        }
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::now(HashMap::new())
    }
}

/// Loads and saves [`PersistedState`] snapshots at a fixed path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store backed by `path`; nothing is touched until
    /// [`load`](Self::load) or [`save`](Self::save)
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path this store reads and writes
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, falling back to an empty default if the file
    /// is missing, unreadable, unparseable, or of a different schema
    /// version. Never fails: throttling history is an optimization.
    #[must_use]
    pub fn load(&self) -> PersistedState {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state file at {}, starting fresh", self.path.display());
                return PersistedState::default();
            }
            Err(e) => {
                log::warn!("Failed to read state file {}: {e}", self.path.display());
                return PersistedState::default();
            }
        };

        let state: PersistedState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                log::warn!(
                    "Discarding corrupt state file {}: {e}",
                    self.path.display()
                );
                return PersistedState::default();
            }
        };

        if state.version != STATE_VERSION {
            log::warn!(
                "Discarding state file {} with schema version {} (expected {})",
                self.path.display(),
                state.version,
                STATE_VERSION
            );
            return PersistedState::default();
        }

        log::info!(
            "Loaded throttling state for {} host(s) from {}",
            state.hosts.len(),
            self.path.display()
        );
        state
    }

    /// Atomically replace the state file with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`] if the temp file cannot be created,
    /// written, or renamed over the target.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            std::fs::create_dir_all(dir).map_err(|e| ErrorKind::Io(Some(dir.to_path_buf()), e))?;
        }

        let dir = parent.map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| ErrorKind::Io(Some(dir.clone()), e))?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ErrorKind::Io(None, std::io::Error::other(e)))?;
        tmp.write_all(&json)
            .map_err(|e| ErrorKind::Io(Some(self.path.clone()), e))?;
        tmp.persist(&self.path)
            .map_err(|e| ErrorKind::Io(Some(self.path.clone()), e.error))?;

        log::info!(
            "Saved throttling state for {} host(s) to {}",
            state.hosts.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BreakerSnapshot, GovernorSnapshot};
    use std::time::Duration;

    fn sample_state() -> PersistedState {
        let mut hosts = HashMap::new();
        hosts.insert(
            HostKey::from("example.com"),
            HostState {
                governor: GovernorSnapshot {
                    capacity: 2.0,
                    tokens: 0.5,
                    target_rate: 1.0,
                    current_rate: 0.25,
                    ramp_elapsed: Duration::from_secs(9),
                },
                breaker: BreakerSnapshot::Open {
                    remaining: Duration::from_secs(42),
                    cooldown: Duration::from_secs(120),
                },
            },
        );
        PersistedState::now(hosts)
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let state = sample_state();
        store.save(&state).unwrap();
        let loaded = store.load();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nope.json"));
        let state = store.load();
        assert!(state.hosts.is_empty());
        assert_eq!(state.version, STATE_VERSION);
    }

    #[test]
    fn test_corrupt_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let state = StateStore::new(&path).load();
        assert!(state.hosts.is_empty());
    }

    #[test]
    fn test_version_mismatch_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = sample_state();
        state.version = STATE_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();
        let loaded = StateStore::new(&path).load();
        assert!(loaded.hosts.is_empty());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("deep/nested/state.json"));
        store.save(&sample_state()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_replaces_not_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();

        let empty = PersistedState::default();
        store.save(&empty).unwrap();
        let loaded = store.load();
        assert!(loaded.hosts.is_empty());
    }
}
