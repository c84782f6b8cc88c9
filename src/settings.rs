//! File-based configuration.
//!
//! Settings live in a TOML file under the platform config directory. A
//! missing file is not an error: the defaults are written out on first run
//! so there is always a file to edit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::config::BusConfig;
use crate::bus::event::EmotionLabel;
use crate::policy::DriveMode;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine a config directory for this platform")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BusConfig,
    pub policy: PolicySettings,
    pub hold: HoldSettings,
    pub fanout: FanoutSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Readings below this confidence are ignored entirely.
    pub confidence_threshold: f32,
    /// Number of preceding readings considered for majority smoothing;
    /// 0 disables smoothing.
    pub history_window: usize,
    /// Per-label additions or replacements applied over the default table,
    /// keyed by wire spelling (e.g. `surprised = "restricted"`).
    pub overrides: HashMap<String, DriveMode>,
}

impl PolicySettings {
    /// Overrides with their labels resolved; unrecognized labels are skipped.
    pub fn override_table(&self) -> HashMap<EmotionLabel, DriveMode> {
        self.overrides
            .iter()
            .filter_map(|(raw, mode)| {
                let label = EmotionLabel::from_wire(raw);
                if label == EmotionLabel::Unknown {
                    warn!("ignoring policy override for unrecognized label '{}'", raw);
                    return None;
                }
                Some((label, *mode))
            })
            .collect()
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            history_window: 0,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldSettings {
    /// Minimum display duration of a mode change.
    pub duration_ms: u64,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self { duration_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    /// Per-subscriber backlog bound.
    pub queue_capacity: usize,
    /// Consecutive overflows before a subscriber is evicted.
    pub max_lag_strikes: u32,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_lag_strikes: 3,
        }
    }
}

impl Settings {
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .ok_or(SettingsError::NoConfigDir)
            .map(|dir| dir.join("drivestate").join("config.toml"))
    }

    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            info!("no config at {}, writing defaults", path.display());
            let settings = Self::default();
            settings.write_to(path)?;
            return Ok(settings);
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
