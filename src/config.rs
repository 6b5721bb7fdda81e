//! Engine configuration and the per-task settings store.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing configuration for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max time to wait for a frame, in ms. Also the default timeout for
    /// `wait_until` when the caller passes zero.
    pub scene_wait_timeout_ms: u64,
    /// Delay before the first `wait_until` attempt, in ms.
    pub settle_delay_ms: u64,
    /// Confirmation delay after a `wait_until` predicate matches, in ms.
    pub confirm_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scene_wait_timeout_ms: 10_000,
            settle_delay_ms: 1_000,
            confirm_delay_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Frame-wait timeout as a duration.
    pub fn scene_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.scene_wait_timeout_ms)
    }

    /// Settle delay as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Confirmation delay as a duration.
    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    /// Load configuration from a TOML file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Write configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Per-key validation hook for task settings. Returns a rejection message,
/// or `None` to accept the value.
pub type SettingsValidator = fn(key: &str, value: &Value) -> Option<String>;

/// Loads and saves per-task settings blobs keyed by task name.
///
/// Each task gets one pretty-printed JSON file under the store folder.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    folder: PathBuf,
}

impl SettingsStore {
    /// Create a store rooted at `folder`. The folder is created on first
    /// save, not here.
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    /// Load settings for `task_name`, merging the stored blob over the
    /// given defaults. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(
        &self,
        task_name: &str,
        defaults: BTreeMap<String, Value>,
    ) -> Result<TaskSettings> {
        let path = self.folder.join(format!("{task_name}.json"));
        let mut values = defaults.clone();

        match std::fs::read(&path) {
            Ok(bytes) => {
                let stored: BTreeMap<String, Value> =
                    serde_json::from_slice(&bytes).map_err(|e| {
                        EngineError::Config(format!(
                            "cannot parse settings for '{task_name}': {e}"
                        ))
                    })?;
                values.extend(stored);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::Config(format!(
                    "cannot read settings for '{task_name}': {e}"
                )));
            }
        }

        Ok(TaskSettings {
            path: Some(path),
            defaults,
            values,
            validator: None,
        })
    }
}

/// A task's key-value settings, persisted as JSON.
#[derive(Debug)]
pub struct TaskSettings {
    path: Option<PathBuf>,
    defaults: BTreeMap<String, Value>,
    values: BTreeMap<String, Value>,
    validator: Option<SettingsValidator>,
}

impl TaskSettings {
    /// In-memory settings with no backing file, used when no store is
    /// configured.
    pub fn detached(defaults: BTreeMap<String, Value>) -> Self {
        Self {
            path: None,
            values: defaults.clone(),
            defaults,
            validator: None,
        }
    }

    /// Attach a validation hook applied by [`set`](Self::set).
    pub fn with_validator(mut self, validator: SettingsValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Get a setting value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a boolean setting.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    /// Get an integer setting.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    /// Get a string setting.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Validate, update, and persist one setting.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` when validation rejects the value or
    /// the write fails.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if let Some(validator) = self.validator {
            if let Some(message) = validator(&key, &value) {
                return Err(EngineError::Config(format!(
                    "invalid value for '{key}': {message}"
                )));
            }
        }
        self.values.insert(key, value);
        self.save()
    }

    /// Reset every setting to its default and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn reset(&mut self) -> Result<()> {
        self.values = self.defaults.clone();
        self.save()
    }

    /// Snapshot of all current values.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| EngineError::Config(format!("cannot serialize settings: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
