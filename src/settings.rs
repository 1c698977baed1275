//! User-configurable settings and their persistence
//!
//! `Settings` is an immutable value object replaced wholesale on update.
//! Persistence goes through the `SettingsStore` key-value seam; the bundled
//! `JsonFileStore` keeps a single JSON object on disk and writes it
//! atomically (temp file + rename) so a crash mid-write never corrupts it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Key under which the serialized `Settings` value is stored.
pub const SETTINGS_KEY: &str = "settings";

/// How captured audio is dispatched to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Send each encoded chunk as soon as it is flushed.
    Streaming,
    /// Accumulate the whole recording and send once at stop.
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Transcription model requested from the server.
    pub model: String,
    /// Language code, or `None` for server-side auto-detection.
    pub language: Option<String>,
    pub mode: DispatchMode,
    /// Dispatch a finished batch recording immediately at stop. When off,
    /// the clip is held until `SessionController::send_pending`.
    pub auto_send: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            language: None,
            mode: DispatchMode::Batch,
            auto_send: true,
        }
    }
}

/// Partial settings update. `None` fields keep their current value.
///
/// `language` is doubly optional: `Some(None)` clears the language back to
/// auto-detect, `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub model: Option<String>,
    pub language: Option<Option<String>>,
    pub mode: Option<DispatchMode>,
    pub auto_send: Option<bool>,
}

impl Settings {
    /// Return a new value with `patch` merged in.
    pub fn merged(&self, patch: &SettingsPatch) -> Settings {
        Settings {
            model: patch.model.clone().unwrap_or_else(|| self.model.clone()),
            language: patch
                .language
                .clone()
                .unwrap_or_else(|| self.language.clone()),
            mode: patch.mode.unwrap_or(self.mode),
            auto_send: patch.auto_send.unwrap_or(self.auto_send),
        }
    }

    /// Load from `store`, falling back to defaults on a missing or
    /// unparseable entry.
    pub fn load(store: &dyn SettingsStore) -> Settings {
        match store.get(SETTINGS_KEY) {
            Some(raw) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Settings: failed to parse stored value: {}", e);
                    Settings::default()
                }
            },
            None => Settings::default(),
        }
    }

    /// Serialize and write through `store`.
    pub fn persist(&self, store: &dyn SettingsStore) -> Result<(), String> {
        let raw =
            serde_json::to_string(self).map_err(|e| format!("Serialize settings: {}", e))?;
        store.set(SETTINGS_KEY, &raw)
    }
}

/// Persistent key-value store consumed by the client. The mechanics of
/// persistence belong to the embedding application; `JsonFileStore` is the
/// default implementation.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
}

/// File-backed store holding one JSON object of string values.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create on first write) the store at `path`. A missing file
    /// starts empty; an unreadable or corrupt file is logged and treated as
    /// empty rather than failing the client.
    pub fn new(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("Settings store: failed to parse {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("Settings store: failed to read {:?}: {}", path, e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Default location under the platform config directory.
    pub fn default_path() -> Result<PathBuf, String> {
        let dir = dirs::config_dir()
            .ok_or_else(|| "Could not determine config directory".to_string())?;
        Ok(dir.join("voicewire").join(SETTINGS_FILE_NAME))
    }

    fn write_atomic(&self, entries: &BTreeMap<String, String>) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let contents = serde_json::to_string_pretty(entries)
            .map_err(|e| format!("Serialize store: {}", e))?;

        // Write to a temp file in the same directory, then rename, so a
        // crash mid-write never leaves a truncated store on disk.
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| format!("Write temp store {:?}: {}", tmp_path, e))?;

        // On Unix, rename atomically replaces the destination. On Windows,
        // rename fails if the destination exists, so remove it first.
        if cfg!(windows) && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing store {:?}: {}", self.path, e));
                }
            }
        }

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| format!("Rename {:?} to {:?}: {}", tmp_path, self.path, e))
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_string());
        self.write_atomic(&entries)
    }
}
