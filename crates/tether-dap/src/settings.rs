//! Persisted per-adapter preferences.
//!
//! Currently this stores the enabled/disabled state of exception breakpoint
//! filters, keyed by the owning debug-adapter server's identity so the
//! choice survives across sessions.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    /// adapter id -> (filter id -> enabled)
    #[serde(default)]
    exception_filters: BTreeMap<String, BTreeMap<String, bool>>,
}

/// Store backing the exception-filter registry. File-backed when created
/// with [`FilterSettingsStore::open`]; purely in-memory otherwise.
pub struct FilterSettingsStore {
    path: Option<PathBuf>,
    state: Mutex<SettingsFile>,
}

impl FilterSettingsStore {
    /// Load the settings file, falling back to defaults when it is missing
    /// or unreadable. A corrupt file is logged, not an error: losing filter
    /// preferences must never block a debug session.
    pub fn open(path: PathBuf) -> Self {
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(
                        target: "tether.settings",
                        path = %path.display(),
                        "ignoring unreadable settings file: {err}"
                    );
                    SettingsFile::default()
                }
            },
            Err(_) => SettingsFile::default(),
        };
        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(SettingsFile::default()),
        }
    }

    /// The persisted filter map for one adapter. Empty when nothing has
    /// been stored yet.
    pub fn exception_filters(&self, adapter_id: &str) -> BTreeMap<String, bool> {
        self.state
            .lock()
            .exception_filters
            .get(adapter_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the filter map for one adapter and persist.
    pub fn set_exception_filters(&self, adapter_id: &str, filters: BTreeMap<String, bool>) {
        {
            let mut state = self.state.lock();
            state
                .exception_filters
                .insert(adapter_id.to_string(), filters);
        }
        self.flush();
    }

    fn flush(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let bytes = {
            let state = self.state.lock();
            match serde_json::to_vec_pretty(&*state) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(target: "tether.settings", "failed to serialize settings: {err}");
                    return;
                }
            }
        };

        // Write-then-rename so a crash mid-write never corrupts the file.
        let result = (|| {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => std::path::Path::new("."),
            };
            std::fs::create_dir_all(dir)?;
            let mut temp = tempfile::NamedTempFile::new_in(dir)?;
            temp.write_all(&bytes)?;
            temp.persist(path)?;
            Ok::<_, std::io::Error>(())
        })();
        if let Err(err) = result {
            tracing::warn!(
                target: "tether.settings",
                path = %path.display(),
                "failed to persist settings: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = FilterSettingsStore::open(path.clone());
        let mut filters = BTreeMap::new();
        filters.insert("uncaught".to_string(), true);
        filters.insert("caught".to_string(), false);
        store.set_exception_filters("debugpy", filters.clone());

        let reloaded = FilterSettingsStore::open(path);
        assert_eq!(reloaded.exception_filters("debugpy"), filters);
        assert!(reloaded.exception_filters("other-adapter").is_empty());
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = FilterSettingsStore::open(path);
        assert!(store.exception_filters("debugpy").is_empty());
    }

    #[test]
    fn in_memory_store_does_not_touch_disk() {
        let store = FilterSettingsStore::in_memory();
        let mut filters = BTreeMap::new();
        filters.insert("all".to_string(), true);
        store.set_exception_filters("x", filters.clone());
        assert_eq!(store.exception_filters("x"), filters);
    }
}
