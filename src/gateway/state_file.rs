use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::config::BalancerSettings;

#[derive(Debug, Error)]
pub enum SettingsFileError {
    #[error("read settings file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse settings file failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("write settings file failed: {0}")]
    Write(std::io::Error),
}

/// Best-effort persistence of the settings document as one pretty JSON file.
/// Writes go through a temp file and rename; when that fails the file is
/// written in place.
#[derive(Clone, Debug)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings; `None` when the file is absent or empty.
    pub fn load(&self) -> Result<Option<BalancerSettings>, SettingsFileError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, settings: &BalancerSettings) -> Result<(), SettingsFileError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(SettingsFileError::Write)?;
            }
        }

        let payload = serde_json::to_vec_pretty(settings).map_err(SettingsFileError::Parse)?;
        let tmp_path = self.path.with_extension("tmp");
        if fs::write(&tmp_path, &payload).is_err() {
            fs::write(&self.path, &payload).map_err(SettingsFileError::Write)?;
            return Ok(());
        }
        match fs::rename(&tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(_) => {
                fs::write(&self.path, &payload).map_err(SettingsFileError::Write)?;
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            }
        }
    }
}
