//! Loading, saving and reading user settings.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Read access to settings by name. Features go through this rather than a concrete settings type
/// so that hosts can supply their own store.
pub trait SettingsSource: Send + Sync {
    fn get(&self, name: &str) -> Option<serde_json::Value>;

    /// Reads a boolean setting, falling back to `default` if it is missing or not a boolean.
    fn flag(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .and_then(|value| value.as_bool())
            .unwrap_or(default)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|value| value.as_str().map(str::to_owned))
    }
}

/// The user's general settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralSettings {
    /// Whether user badges are shown.
    pub badges: bool,

    /// Where badge data is fetched from.
    pub api_url: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            badges: true,
            api_url: "https://replugged.dev".to_string(),
        }
    }
}

impl GeneralSettings {
    fn parse_json(reader: impl Read) -> Result<GeneralSettings> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Settings backed by a JSON file.
pub struct Settings {
    path: Option<PathBuf>,
    values: Mutex<GeneralSettings>,
    dirty: AtomicBool,
}

impl Settings {
    /// Settings that are never written to disk.
    pub fn in_memory(values: GeneralSettings) -> Settings {
        Settings {
            path: None,
            values: Mutex::new(values),
            dirty: AtomicBool::new(false),
        }
    }

    fn load_path(path: &Path) -> Result<Option<GeneralSettings>> {
        if !path.exists() {
            // This isn't an error, but there aren't any settings.
            return Ok(None);
        }

        let file = File::open(path).wrap_err("unable to open settings file")?;
        Ok(Some(GeneralSettings::parse_json(file)?))
    }

    /// Loads settings from `path`. Defaults are used if the file is missing or can't be parsed.
    pub fn load(path: impl Into<PathBuf>) -> Settings {
        let path = path.into();

        let (values, dirty) = match Settings::load_path(&path) {
            Ok(Some(values)) => (values, false),

            Ok(None) => {
                log::info!("No settings file found. Defaults will be used.");
                (GeneralSettings::default(), true)
            }

            Err(err) => {
                log::error!("Error loading settings: {err:?}. Defaults will be used.");
                (GeneralSettings::default(), true)
            }
        };

        Settings {
            path: Some(path),
            values: Mutex::new(values),
            dirty: AtomicBool::new(dirty),
        }
    }

    /// Returns a copy of the current values.
    pub fn values(&self) -> GeneralSettings {
        self.values.lock().clone()
    }

    pub fn update(&self, change: impl FnOnce(&mut GeneralSettings)) {
        change(&mut *self.values.lock());
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Writes the settings to their file if they have changed since the last save.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if !self.dirty.swap(false, Ordering::SeqCst) {
            log::debug!("Settings have not changed since last save.");
            return Ok(());
        }

        let json = serde_json::to_string_pretty(&self.values())?;

        if let Err(err) = std::fs::write(path, json) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err).wrap_err_with(|| format!("unable to write {}", path.display()));
        }

        log::info!("Settings saved.");
        Ok(())
    }
}

impl SettingsSource for Settings {
    fn get(&self, name: &str) -> Option<serde_json::Value> {
        serde_json::to_value(&*self.values.lock())
            .ok()?
            .get(name)
            .cloned()
    }
}
