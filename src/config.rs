// Engine configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::dataset::DatasetId;

pub const ENV_CACHE_ROOT: &str = "DSTORE_CACHE_ROOT";
pub const ENV_UPLOAD_CPU_LIMIT: &str = "DSTORE_UPLOAD_CPU_LIMIT";
pub const ENV_DOWNLOAD_CPU_LIMIT: &str = "DSTORE_DOWNLOAD_CPU_LIMIT";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for dataset caches and the metadata database
    pub cache_root: PathBuf,

    /// Number of parallel push batches
    #[serde(default = "default_cpu_limit")]
    pub upload_cpu_limit: usize,

    /// Number of parallel pull batches
    #[serde(default = "default_cpu_limit")]
    pub download_cpu_limit: usize,
}

fn default_cpu_limit() -> usize {
    num_cpus::get()
}

impl EngineConfig {
    /// Load configuration with the following priority:
    /// 1. config.toml file (~/.config/dstore/config.toml), or defaults
    /// 2. DSTORE_* environment variables override individual fields
    pub async fn load() -> Result<Self> {
        let mut config = match Self::config_file_path() {
            Some(config_path) if config_path.exists() => {
                let content = fs::read_to_string(&config_path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                toml::from_str::<EngineConfig>(&content)
                    .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var(ENV_CACHE_ROOT) {
            self.cache_root = PathBuf::from(root);
        }
        if let Ok(limit) = std::env::var(ENV_UPLOAD_CPU_LIMIT) {
            self.upload_cpu_limit = limit
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_UPLOAD_CPU_LIMIT, limit))?;
        }
        if let Ok(limit) = std::env::var(ENV_DOWNLOAD_CPU_LIMIT) {
            self.download_cpu_limit = limit
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_DOWNLOAD_CPU_LIMIT, limit))?;
        }
        Ok(())
    }

    /// Get the config file path (~/.config/dstore/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dstore").join("config.toml"))
    }

    /// Save configuration to config file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path().context("Failed to determine config directory")?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    pub fn datasets_root(&self) -> PathBuf {
        self.cache_root.join("datasets")
    }

    /// Per-dataset cache root holding `objects/` and the revision directories
    pub fn dataset_cache_root(&self, id: &DatasetId) -> PathBuf {
        self.datasets_root()
            .join(&id.namespace)
            .join(&id.owner)
            .join(&id.name)
    }

    /// Get the metadata database path
    pub fn db_path(&self) -> PathBuf {
        self.cache_root.join("meta.db")
    }

    /// Cache root under `root` with explicit limits
    pub fn with_root<P: Into<PathBuf>>(root: P, upload_cpu_limit: usize, download_cpu_limit: usize) -> Self {
        Self {
            cache_root: root.into(),
            upload_cpu_limit,
            download_cpu_limit,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dstore");

        Self {
            cache_root,
            upload_cpu_limit: default_cpu_limit(),
            download_cpu_limit: default_cpu_limit(),
        }
    }
}
