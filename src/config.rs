//! Configuration module for the embedding substrate.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `ES_` and use double underscores
//! to separate nested levels:
//! - `ES_VECTOR__DIMENSION=768` sets `vector.dimension`
//! - `ES_INDEX__DRIFT_THRESHOLD=500` sets `index.drift_threshold`
//! - `ES_STORAGE__JOURNAL=false` sets `storage.journal`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EmbedError, EmbedResult};
use crate::vector::{VECTOR_DIMENSION_384, VectorContract, VectorDimension};

/// Directory holding the settings file, searched upward from the cwd.
pub const CONFIG_DIR: &str = ".embedstore";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Shared vector contract
    #[serde(default)]
    pub vector: VectorConfig,

    /// Index lifecycle tuning
    #[serde(default)]
    pub index: IndexConfig,

    /// Prototype routing and rollups
    #[serde(default)]
    pub prototypes: PrototypeConfig,

    /// On-disk state
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output for the binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VectorConfig {
    /// Embedding width shared by every column and centroid
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexConfig {
    /// Distinct rows changed since the last build before an index turns stale
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: usize,

    /// Target rows per IVF list when the list count is chosen automatically
    #[serde(default = "default_rows_per_list")]
    pub rows_per_list: usize,

    /// Floor for automatically chosen list counts
    #[serde(default = "default_min_lists")]
    pub min_lists: usize,

    /// Ceiling for automatically chosen list counts
    #[serde(default = "default_max_lists")]
    pub max_lists: usize,

    /// Lists probed per approximate query
    #[serde(default = "default_probes")]
    pub probes: usize,

    /// K-means iteration cap
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Seed for K-means++ initialization
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Threads used for index builds
    #[serde(default = "default_build_threads")]
    pub build_threads: usize,

    /// Rebuild stale indexes from `run_maintenance`
    #[serde(default = "default_true")]
    pub auto_rebuild: bool,

    /// Rebuild indexes recorded in metadata when opening a data directory
    #[serde(default = "default_true")]
    pub rebuild_on_open: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PrototypeConfig {
    /// Prototypes consulted by `route_then_search` when the caller gives none
    #[serde(default = "default_route_top_n")]
    pub route_top_n: usize,

    /// Topics kept by `rebuild_topic_rollups`
    #[serde(default = "default_rollup_topic_limit")]
    pub rollup_topic_limit: usize,

    /// Minimum cosine similarity for topic/document coverage links
    #[serde(default = "default_coverage_min_similarity")]
    pub coverage_min_similarity: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory for vector segments, prototypes, metadata and the journal
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write every mutation to the journal before applying it
    #[serde(default = "default_true")]
    pub journal: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub default_level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default = "default_false")]
    pub json: bool,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_dimension() -> usize {
    VECTOR_DIMENSION_384
}
fn default_drift_threshold() -> usize {
    256
}
fn default_rows_per_list() -> usize {
    1000
}
fn default_min_lists() -> usize {
    1
}
fn default_max_lists() -> usize {
    1000
}
fn default_probes() -> usize {
    8
}
fn default_max_iterations() -> usize {
    50
}
fn default_seed() -> u64 {
    42
}
fn default_build_threads() -> usize {
    num_cpus::get()
}
fn default_route_top_n() -> usize {
    4
}
fn default_rollup_topic_limit() -> usize {
    200
}
fn default_coverage_min_similarity() -> f32 {
    0.30
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".embedstore/data")
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            vector: VectorConfig::default(),
            index: IndexConfig::default(),
            prototypes: PrototypeConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            rows_per_list: default_rows_per_list(),
            min_lists: default_min_lists(),
            max_lists: default_max_lists(),
            probes: default_probes(),
            max_iterations: default_max_iterations(),
            seed: default_seed(),
            build_threads: default_build_threads(),
            auto_rebuild: true,
            rebuild_on_open: true,
        }
    }
}

impl Default for PrototypeConfig {
    fn default() -> Self {
        Self {
            route_top_n: default_route_top_n(),
            rollup_topic_limit: default_rollup_topic_limit(),
            coverage_min_similarity: default_coverage_min_similarity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            journal: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: default_log_level(),
            json: false,
        }
    }
}

impl IndexConfig {
    /// List count for a table of `rows` rows: one list per `rows_per_list`
    /// rows, clamped to `[min_lists, max_lists]`.
    pub fn lists_for_rows(&self, rows: usize) -> usize {
        rows.div_ceil(self.rows_per_list.max(1))
            .clamp(self.min_lists, self.max_lists)
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring `ES_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting; single underscores stay in
            // field names.
            .merge(Env::prefixed("ES_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.embedstore/settings.toml` from the current directory upward
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join("settings.toml"))
    }

    /// Rejects combinations the components cannot work with.
    pub fn validate(&self) -> EmbedResult<()> {
        VectorDimension::new(self.vector.dimension)?;
        let index = &self.index;
        if index.rows_per_list == 0 || index.probes == 0 || index.min_lists == 0 {
            return Err(EmbedError::Config {
                reason: "index.rows_per_list, index.probes and index.min_lists must be positive"
                    .to_string(),
            });
        }
        if index.min_lists > index.max_lists {
            return Err(EmbedError::Config {
                reason: format!(
                    "index.min_lists ({}) exceeds index.max_lists ({})",
                    index.min_lists, index.max_lists
                ),
            });
        }
        if !(-1.0..=1.0).contains(&self.prototypes.coverage_min_similarity) {
            return Err(EmbedError::Config {
                reason: "prototypes.coverage_min_similarity must be within [-1, 1]".to_string(),
            });
        }
        Ok(())
    }

    /// The shared vector contract described by these settings.
    pub fn contract(&self) -> EmbedResult<VectorContract> {
        Ok(VectorContract::new(VectorDimension::new(
            self.vector.dimension,
        )?))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# embedstore configuration

version = 1

[vector]
# Width of every embedding column and prototype centroid
dimension = {dimension}

[index]
# Rows changed since the last build before an index is marked stale
drift_threshold = {drift}

# Automatic list count: ceil(rows / rows_per_list), clamped to [min_lists, max_lists]
rows_per_list = {rows_per_list}
min_lists = {min_lists}
max_lists = {max_lists}

# Lists probed per approximate query
probes = {probes}

# Rebuild stale indexes on the maintenance tick
auto_rebuild = true

[prototypes]
# Prototypes consulted before a routed search
route_top_n = {route}

[storage]
data_dir = ".embedstore/data"
journal = true

[logging]
# Overridden by RUST_LOG
default_level = "warn"
json = false
"#,
            dimension = default_dimension(),
            drift = default_drift_threshold(),
            rows_per_list = default_rows_per_list(),
            min_lists = default_min_lists(),
            max_lists = default_max_lists(),
            probes = default_probes(),
            route = default_route_top_n(),
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }
}
