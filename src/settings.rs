//! Persisted user defaults.
//!
//! Settings are loaded once at startup and replaced wholesale through
//! [`SettingsStore::save`]. Saves are serialized by an async mutex and
//! written atomically via `tempfile::NamedTempFile::persist()` so a crash
//! mid-write never leaves a truncated file behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::models::request::{check_dimension, check_guidance, check_steps};
use crate::{AppError, Result};

/// User-configurable defaults for new generation requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct Settings {
    /// Default image width.
    pub default_width: u32,
    /// Default image height.
    pub default_height: u32,
    /// Default denoising step count.
    pub default_inference_steps: u32,
    /// Default guidance scale.
    pub default_guidance_scale: f32,
    /// Directory generated images are written to.
    pub output_dir: PathBuf,
    /// Selected model file, if any.
    pub model_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_width: 512,
            default_height: 512,
            default_inference_steps: 20,
            default_guidance_scale: 7.5,
            output_dir: PathBuf::from("outputs"),
            model_path: None,
        }
    }
}

impl Settings {
    /// Apply the same bounds a generation request must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` naming the first out-of-range default.
    pub fn validate(&self) -> Result<()> {
        check_dimension("default width", self.default_width)?;
        check_dimension("default height", self.default_height)?;
        check_steps("default inference steps", self.default_inference_steps)?;
        check_guidance("default guidance scale", self.default_guidance_scale)?;
        Ok(())
    }
}

/// Process-wide settings holder with a serialized save path.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    save_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Settings` if the file exists but cannot be read or
    /// parsed, or holds out-of-range values.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|err| {
                AppError::Settings(format!("failed to read {}: {err}", path.display()))
            })?;
            let parsed: Settings = toml::from_str(&raw).map_err(|err| {
                AppError::Settings(format!("invalid settings in {}: {err}", path.display()))
            })?;
            parsed
                .validate()
                .map_err(|err| AppError::Settings(err.to_string()))?;
            parsed
        } else {
            info!(path = %path.display(), "settings file not found, using defaults");
            Settings::default()
        };

        Ok(Self {
            path,
            current: RwLock::new(settings),
            save_lock: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current settings.
    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    /// Validate, persist, and publish `settings`, replacing the previous value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for out-of-range values, or
    /// `AppError::Settings` if serialization or the atomic write fails.
    pub async fn save(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let _guard = self.save_lock.lock().await;

        let body = toml::to_string_pretty(&settings)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &body))
            .await
            .map_err(|err| AppError::Settings(format!("settings write task panicked: {err}")))??;

        *self.current.write().await = settings;
        info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

fn write_atomically(path: &Path, body: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    std::fs::create_dir_all(&parent).map_err(|err| {
        AppError::Settings(format!(
            "failed to create settings directory {}: {err}",
            parent.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(&parent)
        .map_err(|err| AppError::Settings(format!("failed to create temporary file: {err}")))?;

    tmp.write_all(body.as_bytes())
        .map_err(|err| AppError::Settings(format!("failed to write temporary file: {err}")))?;

    tmp.persist(path).map_err(|err| {
        AppError::Settings(format!(
            "failed to persist settings to {}: {err}",
            path.display()
        ))
    })?;

    Ok(())
}
