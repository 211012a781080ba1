//! JSON file store

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Directory-scoped JSON store
///
/// Writes go to `<file>.tmp` first and are renamed into place; the previous
/// file is kept as `<file>.bak` and used as a fallback when the primary is
/// missing or empty.
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Global config dir (`~/.config/devyard/`)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("devyard");
        Ok(Self::new(dir))
    }

    /// Project config dir (`<root>/.devyard/`)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".devyard"))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn backup_path(&self, filename: &str) -> PathBuf {
        self.file_path(&format!("{}.bak", filename))
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir).map_err(|e| {
                Error::Persistence(format!(
                    "Failed to create {}: {}",
                    self.base_dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn read_non_empty(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(content))
        }
    }

    /// Load `filename`, falling back to its backup
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let primary = self.file_path(filename);
        let content = match Self::read_non_empty(&primary)? {
            Some(content) => content,
            None => match Self::read_non_empty(&self.backup_path(filename))? {
                Some(content) => content,
                None => return Ok(None),
            },
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Persistence(format!("Failed to parse {}: {}", primary.display(), e)))
    }

    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        self.load_optional(filename)?.ok_or_else(|| {
            Error::NotFound(format!("{}", self.file_path(filename).display()))
        })
    }

    pub fn load_or_default<T: DeserializeOwned + Default>(&self, filename: &str) -> T {
        self.load_optional(filename).ok().flatten().unwrap_or_default()
    }

    /// Save `data` as pretty JSON (temp file + rename)
    pub fn save<T: Serialize + ?Sized>(&self, filename: &str, data: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.file_path(filename);
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Persistence(format!("Failed to serialize {}: {}", filename, e)))?;

        let tmp_path = self.file_path(&format!("{}.tmp", filename));
        std::fs::write(&tmp_path, content).map_err(|e| {
            Error::Persistence(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;

        if path.exists() {
            let _ = std::fs::rename(&path, self.backup_path(filename));
        }

        std::fs::rename(&tmp_path, &path)
            .map_err(|e| Error::Persistence(format!("Failed to replace {}: {}", path.display(), e)))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }
}
