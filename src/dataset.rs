// Dataset identity and lifecycle
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;

use crate::backend::{Backend, BackendRegistry};
use crate::config::EngineConfig;
use crate::db::MetadataDb;
use crate::error::{DatasetError, IoContext, Result};
use crate::repository::Repository;

/// `(namespace, owner, name)` identity of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub namespace: String,
    pub owner: String,
    pub name: String,
}

impl DatasetId {
    pub fn new(namespace: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.owner, self.name)
    }
}

/// Every storage backend this build knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// Unmanaged: an external local directory is the source of truth
    LocalFilesystem,
    /// Managed: a directory acting as the dataset's remote object store
    ObjectDirectory,
}

impl StorageType {
    pub const ALL: [StorageType; 2] = [StorageType::LocalFilesystem, StorageType::ObjectDirectory];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::LocalFilesystem => "local_filesystem",
            StorageType::ObjectDirectory => "object_directory",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        StorageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DatasetError::InvalidArgument(format!("Unknown storage type: {}", s)))
    }
}

/// Backend settings and credentials, stored outside the versioned tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig(BTreeMap<String, String>);

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for BackendConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        BackendConfig(iter.into_iter().collect())
    }
}

/// Worker counts used when splitting transfers into batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub upload: usize,
    pub download: usize,
}

impl From<&EngineConfig> for TransferLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            upload: config.upload_cpu_limit,
            download: config.download_cpu_limit,
        }
    }
}

/// A versioned collection of files with a pluggable storage backend
pub struct Dataset {
    id: DatasetId,
    storage_type: StorageType,
    backend_config: BackendConfig,
    backend: Backend,
    repository: Arc<dyn Repository>,
    cache_root: PathBuf,
    limits: TransferLimits,
}

impl Dataset {
    /// Build a dataset handle without touching the metadata database
    pub fn new(
        id: DatasetId,
        storage_type: StorageType,
        backend_config: BackendConfig,
        repository: Arc<dyn Repository>,
        registry: &BackendRegistry,
        config: &EngineConfig,
    ) -> Result<Self> {
        let backend = registry.create(storage_type, &backend_config)?;
        let cache_root = config.dataset_cache_root(&id);

        Ok(Self {
            id,
            storage_type,
            backend_config,
            backend,
            repository,
            cache_root,
            limits: TransferLimits::from(config),
        })
    }

    /// Register a new dataset and create its cache tree
    pub async fn create(
        id: DatasetId,
        storage_type: StorageType,
        backend_config: BackendConfig,
        repository: Arc<dyn Repository>,
        registry: &BackendRegistry,
        config: &EngineConfig,
        db: &MetadataDb,
    ) -> Result<Self> {
        let dataset = Self::new(id, storage_type, backend_config, repository, registry, config)?;

        db.register_dataset(&dataset.id, storage_type).await?;
        db.set_backend_config(&dataset.id, &dataset.backend_config).await?;

        fs::create_dir_all(&dataset.cache_root)
            .await
            .with_context(|| format!("Failed to create dataset cache: {}", dataset.cache_root.display()))?;

        tracing::info!("Created dataset {} ({})", dataset.id, storage_type);
        Ok(dataset)
    }

    /// Reopen a registered dataset
    pub async fn open(
        id: DatasetId,
        repository: Arc<dyn Repository>,
        registry: &BackendRegistry,
        config: &EngineConfig,
        db: &MetadataDb,
    ) -> Result<Self> {
        let storage_type = db.storage_type(&id).await?;
        let backend_config = db.backend_config(&id).await?;
        Self::new(id, storage_type, backend_config, repository, registry, config)
    }

    /// Replace the backend configuration and rebuild the backend
    pub async fn set_backend_config(
        &mut self,
        backend_config: BackendConfig,
        registry: &BackendRegistry,
        db: &MetadataDb,
    ) -> Result<()> {
        self.backend = registry.create(self.storage_type, &backend_config)?;
        db.set_backend_config(&self.id, &backend_config).await?;
        self.backend_config = backend_config;
        Ok(())
    }

    /// Delete the dataset's cache tree and its metadata rows
    pub async fn destroy(self, db: &MetadataDb) -> Result<()> {
        if fs::try_exists(&self.cache_root).await.unwrap_or(false) {
            fs::remove_dir_all(&self.cache_root)
                .await
                .with_context(|| format!("Failed to remove dataset cache: {}", self.cache_root.display()))?;
        }
        db.delete_dataset(&self.id).await?;

        tracing::info!("Destroyed dataset {}", self.id);
        Ok(())
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.backend_config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn limits(&self) -> TransferLimits {
        self.limits
    }
}
