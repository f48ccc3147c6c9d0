use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::block::DEFAULT_BLOCK_CAPACITY;
use crate::cache::CacheConfig;
use crate::merge::MergeOp;
use crate::query::DEFAULT_LIMIT;

const DEFAULT_MAX_CACHED: usize = 1_000_000;
const DEFAULT_INDEX_CAPACITY: u32 = 1024;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreSection,
    pub query: QuerySection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("ASSOCSTORE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load `path` if it exists, then overlay `ASSOCSTORE_*` variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ASSOCSTORE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: String,
    /// Pending associations before a blocking flush.
    pub max_cached: usize,
    pub initial_index_capacity: u32,
    pub initial_block_capacity: usize,
    /// Operator used for writes that do not name one.
    pub merge_op: MergeOp,
}

impl StoreSection {
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            bail!("store.path must be specified");
        }
        if self.max_cached == 0 {
            bail!("store.max_cached must be greater than zero");
        }
        if !self.initial_index_capacity.is_power_of_two() {
            bail!(
                "store.initial_index_capacity must be a power of two, got {}",
                self.initial_index_capacity
            );
        }
        if !self.initial_block_capacity.is_power_of_two() {
            bail!(
                "store.initial_block_capacity must be a power of two, got {}",
                self.initial_block_capacity
            );
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_cached: self.max_cached,
            initial_index_capacity: self.initial_index_capacity,
            initial_block_capacity: self.initial_block_capacity,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: "./data/assoc.db".to_string(),
            max_cached: DEFAULT_MAX_CACHED,
            initial_index_capacity: DEFAULT_INDEX_CAPACITY,
            initial_block_capacity: DEFAULT_BLOCK_CAPACITY,
            merge_op: MergeOp::Sum,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    /// Default result cap, 0 for unlimited.
    pub limit: usize,
    pub merge_op: MergeOp,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            merge_op: MergeOp::Sum,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
