//! Application settings persistence
//!
//! Stores user preferences in the platform-specific app data folder:
//! - Linux: ~/.config/s3-manager/settings.json
//! - Windows: %APPDATA%/s3-manager/settings.json
//! - macOS: ~/Library/Application Support/s3-manager/settings.json

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest part S3 accepts for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Tuning for listings and transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Keys requested per listing page
    pub page_size: i32,
    /// Automatic retries of a listing after a transient failure
    pub listing_retries: u32,
    /// Delay before the first retry; doubled for each further one
    pub retry_backoff_ms: u64,
    /// Minimum spacing between progress events of one job
    pub progress_interval_ms: u64,
    /// Files at or above this size are uploaded in parts
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Parent of the scratch directories used by edit sessions; the
    /// system temp directory when unset
    pub edit_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            listing_retries: 1,
            retry_backoff_ms: 250,
            progress_interval_ms: 100,
            multipart_threshold: 8 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
            edit_dir: None,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.page_size <= 0 || self.page_size > 1000 {
            anyhow::bail!("page_size must be between 1 and 1000, got {}", self.page_size);
        }
        if self.part_size < MIN_PART_SIZE {
            anyhow::bail!(
                "part_size must be at least {} bytes, got {}",
                MIN_PART_SIZE,
                self.part_size
            );
        }
        if self.multipart_threshold < self.part_size {
            anyhow::bail!("multipart_threshold must not be smaller than part_size");
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Application settings that persist between sessions
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Last selected AWS profile name
    #[serde(default)]
    pub last_profile: Option<String>,

    /// Last viewed bucket name
    #[serde(default)]
    pub last_bucket: Option<String>,

    /// Last viewed prefix (folder path) within the bucket
    #[serde(default)]
    pub last_prefix: Option<String>,

    #[serde(default)]
    pub engine: EngineSettings,
}

impl Settings {
    /// Load settings from disk, returning defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::settings_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Settings file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;

        let settings: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings from {:?}", path))?;

        settings
            .engine
            .validate()
            .with_context(|| format!("Invalid engine settings in {:?}", path))?;

        tracing::info!(
            "Loaded settings: profile={:?}, bucket={:?}, prefix={:?}",
            settings.last_profile,
            settings.last_bucket,
            settings.last_prefix
        );

        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(path, contents).with_context(|| format!("Failed to write settings to {:?}", path))?;

        tracing::debug!("Saved settings to {:?}", path);

        Ok(())
    }

    /// Get the path to the settings file
    fn settings_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "s3-manager", "s3-manager")
            .context("Failed to determine settings directory")?;

        Ok(proj_dirs.config_dir().join("settings.json"))
    }

    /// Update the last viewed location
    pub fn set_location(&mut self, bucket: Option<&str>, prefix: Option<&str>) {
        self.last_bucket = bucket.map(|s| s.to_string());
        self.last_prefix = prefix.map(|s| s.to_string());
    }

    /// Update the last selected profile. Changing profile forgets the location.
    pub fn set_profile(&mut self, profile: Option<&str>) {
        if self.last_profile.as_deref() != profile {
            self.set_location(None, None);
        }
        self.last_profile = profile.map(|s| s.to_string());
    }
}
