// Storage type -> backend resolution
use super::{Backend, BackendMetadata, LocalFilesystemBackend, ObjectDirectoryBackend};
use crate::dataset::{BackendConfig, StorageType};
use crate::error::{DatasetError, Result};

/// Known backends, built once at startup and passed by reference
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    entries: Vec<&'static BackendMetadata>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        let entries = StorageType::ALL.iter().map(|t| Self::metadata_for(*t)).collect();
        Self { entries }
    }

    fn metadata_for(storage_type: StorageType) -> &'static BackendMetadata {
        match storage_type {
            StorageType::LocalFilesystem => &LocalFilesystemBackend::METADATA,
            StorageType::ObjectDirectory => &ObjectDirectoryBackend::METADATA,
        }
    }

    pub fn metadata(&self, storage_type: StorageType) -> &'static BackendMetadata {
        Self::metadata_for(storage_type)
    }

    pub fn list(&self) -> &[&'static BackendMetadata] {
        &self.entries
    }

    /// Instantiate the backend for `storage_type`
    ///
    /// Missing required settings don't fail here; `confirm_configuration` reports them.
    pub fn create(&self, storage_type: StorageType, config: &BackendConfig) -> Result<Backend> {
        let backend = match storage_type {
            StorageType::LocalFilesystem => Backend::Unmanaged(Box::new(LocalFilesystemBackend::new(config))),
            StorageType::ObjectDirectory => Backend::Managed(Box::new(ObjectDirectoryBackend::new(config))),
        };
        Ok(backend)
    }

    /// Names of required settings absent from `config`
    pub fn missing_config(&self, storage_type: StorageType, config: &BackendConfig) -> Vec<&'static str> {
        self.metadata(storage_type)
            .required_config
            .iter()
            .copied()
            .filter(|key| config.get(key).map_or(true, |v| v.trim().is_empty()))
            .collect()
    }

    pub fn validate(&self, storage_type: StorageType, config: &BackendConfig) -> Result<()> {
        let missing = self.missing_config(storage_type, config);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DatasetError::Configuration(format!(
                "{} requires: {}",
                storage_type,
                missing.join(", ")
            )))
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
