//! # Configuration Module
//!
//! Configuration and data directory management for Echoes.
//!
//! All settings live in one JSON file. By default it is stored in the
//! platform configuration directory:
//! - Linux: `~/.config/echoes/config.json`
//! - macOS: `~/Library/Application Support/echoes/config.json`
//! - Windows: `%APPDATA%\echoes\config.json`
//!
//! The SQLite catalog, the similarity index and generated playlists default to
//! the platform data directory (`~/.local/share/echoes/` on Linux).
//!
//! The `features` section doubles as the weight artifact: an ordered map of
//! feature name to `{ "weight": f64 }`, rewritten wholesale after a confirmed
//! training pass (see [`crate::weights`]).

use crate::features::FeatureSchema;
use crate::weights::FeatureTable;
use anyhow::{ensure, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Returns the platform-appropriate data directory for Echoes, creating it
/// if needed.
///
/// # Errors
///
/// Fails if the system data directory cannot be determined or created.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let echoes_dir = data_dir.join("echoes");
    fs::create_dir_all(&echoes_dir).with_context(|| {
        format!(
            "Failed to create Echoes data directory at {}. Please check file permissions.",
            echoes_dir.display()
        )
    })?;

    Ok(echoes_dir)
}

/// Returns the default configuration file path.
///
/// # Errors
///
/// Fails if the system configuration directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        anyhow::anyhow!("Could not determine system configuration directory.")
    })?;
    Ok(config_dir.join("echoes").join("config.json"))
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a partial file.
///
/// The data goes to a temporary file in the destination directory, is synced,
/// and is then renamed over `path`.
///
/// # Errors
///
/// Fails if the directory is not writable or the rename fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut temp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("Failed to write temporary file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temporary file for {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Location of the persisted similarity index.
    pub path: PathBuf,
    /// More trees give better recall at the cost of build time and size.
    pub num_trees: usize,
    /// Must equal the number of configured features.
    pub feature_dim: usize,
}

/// Gradient descent parameters for feedback training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub max_epochs: usize,
    /// Epochs without improvement before stopping early.
    pub patience: usize,
    /// How far one rating point moves the target similarity.
    pub adjustment_factor: f64,
    /// Number of neighbors presented for rating.
    pub candidates: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            max_epochs: 200,
            patience: 10,
            adjustment_factor: 0.2,
            candidates: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Neighbors fetched per expanded track.
    pub neighbors: usize,
    /// Expansion depth; 1 means seeds and their direct neighbors.
    pub max_depth: usize,
    /// Minimum similarity for an extra edge between two candidates.
    pub edge_threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            neighbors: 10,
            max_depth: 1,
            edge_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Track ids per parallel work item.
    pub batch_size: usize,
    /// Minimum similarity for a stored pair.
    pub threshold: f64,
    /// Pairs kept per track.
    pub top_n: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            threshold: 0.8,
            top_n: 100,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub index: IndexConfig,
    pub features: FeatureTable,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
    /// Where generated playlists are written.
    pub temp_dir: PathBuf,
}

impl AppConfig {
    /// Default configuration with every artifact placed under `data_dir`.
    #[must_use]
    pub fn default_in(data_dir: &Path) -> Self {
        let features = FeatureTable::default();
        Self {
            database: DatabaseConfig {
                path: data_dir.join("music.db"),
            },
            index: IndexConfig {
                path: data_dir.join("features.idx"),
                num_trees: 10,
                feature_dim: features.len(),
            },
            features,
            training: TrainingConfig::default(),
            similarity: SimilarityConfig::default(),
            bulk: BulkConfig::default(),
            temp_dir: data_dir.join("playlists"),
        }
    }

    /// Read and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, is not valid JSON, or is inconsistent.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Configuration file '{}' not found", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Error decoding '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, writing a default configuration there first if it does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, written or validated.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default_in(&get_data_dir()?);
            config.save(path)?;
            info!("Wrote default configuration to {}", path.display());
            return Ok(config);
        }
        Self::load(path)
    }

    /// Write the configuration as pretty JSON, atomically.
    ///
    /// # Errors
    ///
    /// Fails if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize configuration")?;
        write_atomic(path, &json)
    }

    /// Feature schema given by the key order of `features`.
    ///
    /// # Errors
    ///
    /// Fails if no features are configured.
    pub fn schema(&self) -> Result<FeatureSchema> {
        self.features.schema()
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.features.is_empty(), "Configuration lists no features");
        ensure!(
            self.index.feature_dim == self.features.len(),
            "index.feature_dim is {} but {} features are configured",
            self.index.feature_dim,
            self.features.len()
        );
        ensure!(self.index.num_trees > 0, "index.num_trees must be positive");
        ensure!(self.bulk.batch_size > 0, "bulk.batch_size must be positive");
        Ok(())
    }
}
