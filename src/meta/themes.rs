//! The inventory of installed themes. Each theme is a directory (or `.asar` archive) in the themes
//! folder with a `manifest.json` describing it.

use std::{
    ffi::OsStr,
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// The only `type` a theme manifest may declare.
const THEME_TYPE: &str = "replugged-theme";

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9_-]+\.)+[a-zA-Z0-9_-]+$").expect("ID pattern is a valid regex")
});

/// Manifest fields that may hold either a single value or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(one) => std::slice::from_ref(one).iter(),
            OneOrMany::Many(many) => many.iter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,

    #[serde(default, rename = "discordID", skip_serializing_if = "Option::is_none")]
    pub discord_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeManifest {
    /// Reverse-domain identifier, e.g. `dev.someone.midnight`.
    pub id: String,
    pub name: String,
    pub description: String,
    pub author: OneOrMany<Author>,
    pub version: String,
    pub license: String,

    #[serde(rename = "type")]
    pub kind: String,

    /// Stylesheet applied to the main window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,

    /// Stylesheet applied to the splash screen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<OneOrMany<String>>,
}

impl ThemeManifest {
    /// Checks the rules that deserialisation alone doesn't enforce.
    fn validate(&self) -> std::result::Result<(), String> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(format!("`{}` is not a reverse-domain id", self.id));
        }

        let required = [
            ("name", &self.name),
            ("description", &self.description),
            ("version", &self.version),
            ("license", &self.license),
        ];

        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(format!("`{field}` must not be empty"));
        }

        if self.author.iter().next().is_none() {
            return Err("at least one author is required".to_string());
        }

        if self.author.iter().any(|author| author.name.trim().is_empty()) {
            return Err("author names must not be empty".to_string());
        }

        if self.kind != THEME_TYPE {
            return Err(format!("type must be `{THEME_TYPE}`, not `{}`", self.kind));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Theme {
    /// The theme's entry name inside the themes directory.
    pub path: String,
    pub manifest: ThemeManifest,
}

/// Returns true for things that can hold a theme: directories and `.asar` archives.
fn is_theme_file(meta: &fs::Metadata, path: &Path) -> bool {
    meta.is_dir() || (meta.is_file() && path.extension() == Some(OsStr::new("asar")))
}

/// Theme names are single path components. Anything that could climb out of the themes directory
/// is refused.
fn check_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::InvalidThemeName(name.to_string())),
    }
}

pub struct ThemeStore {
    dir: PathBuf,
}

impl ThemeStore {
    pub fn new(dir: impl Into<PathBuf>) -> ThemeStore {
        ThemeStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, path: &str) -> Result<Theme> {
        check_name(path)?;

        let manifest_path = self.dir.join(path).join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path)?;

        let invalid = |reason: String| Error::ManifestInvalid {
            path: manifest_path.clone(),
            reason,
        };

        let manifest: ThemeManifest =
            serde_json::from_str(&text).map_err(|err| invalid(err.to_string()))?;

        manifest.validate().map_err(invalid)?;

        Ok(Theme {
            path: path.to_string(),
            manifest,
        })
    }

    /// Returns the theme at `path`, or `None` if it's missing or its manifest is invalid.
    pub fn get(&self, path: &str) -> Option<Theme> {
        match self.read(path) {
            Ok(theme) => Some(theme),
            Err(err) => {
                log::debug!("no theme at {path}: {err}");
                None
            }
        }
    }

    fn is_candidate(&self, entry: &fs::DirEntry) -> bool {
        let path = entry.path();

        let Ok(file_type) = entry.file_type() else {
            return false;
        };

        if !file_type.is_symlink() {
            return fs::metadata(&path).map_or(false, |meta| is_theme_file(&meta, &path));
        }

        // Follow the link, but judge the extension by where it points.
        match (fs::read_link(&path), fs::metadata(&path)) {
            (Ok(target), Ok(meta)) => is_theme_file(&meta, &target),
            _ => false,
        }
    }

    /// Lists every valid theme, sorted by entry name. Entries with a missing or invalid manifest
    /// are logged and left out; they don't stop the rest from being listed.
    pub fn list(&self) -> Result<Vec<Theme>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,

            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!("themes directory {:?} does not exist", self.dir);
                return Ok(vec![]);
            }

            Err(err) => return Err(err.into()),
        };

        let names = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| self.is_candidate(entry))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .sorted()
            .collect_vec();

        let themes = names
            .iter()
            .filter_map(|name| match self.read(name) {
                Ok(theme) => Some(theme),
                Err(err) => {
                    log::error!("skipping theme {name}: {err}");
                    None
                }
            })
            .collect();

        Ok(themes)
    }

    /// Deletes a theme. Deleting a theme that isn't there succeeds.
    pub fn uninstall(&self, name: &str) -> Result<()> {
        check_name(name)?;

        let path = self.dir.join(name);

        let removed = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) => Err(err),
        };

        match removed {
            Ok(()) => {
                log::info!("uninstalled theme {name}");
                Ok(())
            }

            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
