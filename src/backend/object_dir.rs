// Managed backend: a directory acting as the dataset's remote object store
use super::{BackendMetadata, ManagedStorageBackend, StorageBackend};
use crate::dataset::{BackendConfig, Dataset, StorageType};
use crate::error::{DatasetError, IoContext, Result};
use crate::hash::ObjectId;
use crate::manifest::Manifest;
use crate::store::{stage_copy, OBJECTS_DIR};
use crate::transfer::{ProgressCallback, ProgressTracker, PullObject, PullResult, PushObject, PushResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const REMOTE_ROOT_KEY: &str = "remote_root";

/// Remote layout: `<remote_root>/<namespace>/<owner>/<name>/objects/<object_id>`
pub struct ObjectDirectoryBackend {
    remote_root: Option<PathBuf>,
}

impl ObjectDirectoryBackend {
    pub const METADATA: BackendMetadata = BackendMetadata {
        storage_type: StorageType::ObjectDirectory,
        name: "Object directory",
        description: "Content-addressed object store in a shared directory. Supports push and pull.",
        managed: true,
        required_config: &[REMOTE_ROOT_KEY],
    };

    pub fn new(config: &BackendConfig) -> Self {
        let remote_root = config
            .get(REMOTE_ROOT_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self { remote_root }
    }

    fn remote_objects_dir(&self, dataset: &Dataset) -> Result<PathBuf> {
        let root = self.remote_root.as_ref().ok_or_else(|| {
            DatasetError::Configuration(format!("{} is not set for dataset {}", REMOTE_ROOT_KEY, dataset.id()))
        })?;
        let id = dataset.id();
        Ok(root
            .join(&id.namespace)
            .join(&id.owner)
            .join(&id.name)
            .join(OBJECTS_DIR))
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl StorageBackend for ObjectDirectoryBackend {
    fn metadata(&self) -> &'static BackendMetadata {
        &Self::METADATA
    }

    /// A shared directory needs no credentials
    fn has_credentials(&self) -> bool {
        true
    }

    async fn confirm_configuration(&self, dataset: &Dataset) -> Result<()> {
        let Some(root) = self.remote_root.as_deref() else {
            return Err(DatasetError::Configuration(format!(
                "{} is not set for dataset {}",
                REMOTE_ROOT_KEY,
                dataset.id()
            )));
        };
        let is_dir = fs::metadata(root).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(DatasetError::Configuration(format!(
                "Remote root does not exist: {}",
                root.display()
            )));
        }
        Ok(())
    }

    async fn prepare_pull(&self, manifest: &Manifest, objects: &[PullObject]) -> Result<()> {
        let dir = self.remote_objects_dir(manifest.dataset())?;
        tracing::info!("Pulling {} objects from {}", objects.len(), dir.display());
        Ok(())
    }

    async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: &[PullObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PullResult> {
        let dir = self.remote_objects_dir(manifest.dataset())?;
        let store = manifest.store();
        let mut tracker = ProgressTracker::new(on_progress);
        let mut result = PullResult::new();

        for object in objects {
            let expected: ObjectId = match object.object_id().parse() {
                Ok(id) => id,
                Err(e) => {
                    result.failure(object.clone(), e.to_string());
                    continue;
                }
            };

            if store.contains(&expected).await {
                result.success(object.clone());
                continue;
            }

            let source = dir.join(object.object_id());
            if !exists(&source).await {
                result.failure(object.clone(), format!("Object {} not found on remote", expected));
                continue;
            }

            match store.import_object(&expected, &source, &mut |n| tracker.advance(n)).await {
                Ok(_) => result.success(object.clone()),
                Err(e) => {
                    tracing::warn!("Failed to pull {}: {}", object.dataset_path, e);
                    result.failure(object.clone(), e.to_string());
                }
            }
        }

        Ok(result)
    }

    async fn finalize_pull(&self, _manifest: &Manifest) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ManagedStorageBackend for ObjectDirectoryBackend {
    async fn prepare_push(&self, manifest: &Manifest, objects: &[PushObject]) -> Result<()> {
        let dir = self.remote_objects_dir(manifest.dataset())?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create remote object directory: {}", dir.display()))?;
        tracing::info!("Pushing {} objects to {}", objects.len(), dir.display());
        Ok(())
    }

    async fn push_objects(
        &self,
        manifest: &Manifest,
        objects: &[PushObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PushResult> {
        let dir = self.remote_objects_dir(manifest.dataset())?;
        let mut tracker = ProgressTracker::new(on_progress);
        let mut result = PushResult::new();

        for object in objects {
            let destination = dir.join(object.object_id());
            if exists(&destination).await {
                tracing::debug!("Object already on remote: {}", object.object_id());
                let size = fs::metadata(&object.object_path).await.map(|m| m.len()).unwrap_or(0);
                tracker.advance(size);
                result.success(object.clone());
                continue;
            }

            let staged = match stage_copy(&object.object_path, &dir, &mut |n| tracker.advance(n)).await {
                Ok(staged) => staged,
                Err(e) => {
                    tracing::warn!("Failed to push {}: {}", object.dataset_path, e);
                    result.failure(object.clone(), e.to_string());
                    continue;
                }
            };

            if staged.id.to_hex() != object.object_id() {
                result.failure(
                    object.clone(),
                    format!("Local object {} is corrupt (hashes to {})", object.object_id(), staged.id),
                );
                continue;
            }

            match staged.persist(&destination) {
                Ok(()) => result.success(object.clone()),
                Err(e) => result.failure(object.clone(), e.to_string()),
            }
        }

        Ok(result)
    }

    async fn finalize_push(&self, manifest: &Manifest) -> Result<()> {
        tracing::debug!("Push finished for {}", manifest.dataset().id());
        Ok(())
    }

    fn client_should_dedup_on_push(&self) -> bool {
        true
    }
}
