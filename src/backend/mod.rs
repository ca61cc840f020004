// Storage backend traits and implementations
use async_trait::async_trait;

use crate::dataset::{Dataset, StorageType};
use crate::error::Result;
use crate::manifest::{Manifest, ManifestStatus};
use crate::transfer::{ProgressCallback, PullObject, PullResult, PushObject, PushResult, StatusCallback};

mod local;
mod object_dir;
mod registry;

pub use local::{LocalFilesystemBackend, UnmanagedState, DATA_DIRECTORY_KEY};
pub use object_dir::{ObjectDirectoryBackend, REMOTE_ROOT_KEY};
pub use registry::BackendRegistry;

/// Static description of a backend implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMetadata {
    pub storage_type: StorageType,
    pub name: &'static str,
    pub description: &'static str,
    /// Managed backends own the remote copy and accept pushes
    pub managed: bool,
    /// Backend config keys that must be present
    pub required_config: &'static [&'static str],
}

/// Contract shared by every backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn metadata(&self) -> &'static BackendMetadata;

    fn has_credentials(&self) -> bool;

    /// Validate backend settings before any transfer is attempted
    async fn confirm_configuration(&self, dataset: &Dataset) -> Result<()>;

    async fn prepare_pull(&self, manifest: &Manifest, objects: &[PullObject]) -> Result<()>;

    /// Fetch objects into the manifest's content store
    async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: &[PullObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PullResult>;

    async fn finalize_pull(&self, manifest: &Manifest) -> Result<()>;
}

/// Backend that owns the authoritative remote copy
#[async_trait]
pub trait ManagedStorageBackend: StorageBackend {
    async fn prepare_push(&self, manifest: &Manifest, objects: &[PushObject]) -> Result<()>;

    async fn push_objects(
        &self,
        manifest: &Manifest,
        objects: &[PushObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PushResult>;

    async fn finalize_push(&self, manifest: &Manifest) -> Result<()>;

    /// Whether one push may skip repeated object ids
    fn client_should_dedup_on_push(&self) -> bool;
}

/// Backend whose source of truth lives outside the dataset
#[async_trait]
pub trait UnmanagedStorageBackend: StorageBackend {
    fn can_update_from_remote(&self) -> bool;

    fn state(&self) -> UnmanagedState;

    /// Full re-scan of the external source
    async fn update_from_remote(&self, manifest: &Manifest, on_status: StatusCallback<'_>) -> Result<ManifestStatus>;

    /// Re-scan honoring known state; with `verify_contents`, re-hash known files
    /// and refresh the ones that changed
    async fn update_from_local(
        &self,
        manifest: &Manifest,
        on_status: StatusCallback<'_>,
        verify_contents: bool,
    ) -> Result<ManifestStatus>;

    /// Hash-compare known files against the source; no mutation
    async fn verify_contents(
        &self,
        manifest: &Manifest,
        on_status: StatusCallback<'_>,
    ) -> Result<std::collections::BTreeSet<String>>;
}

/// A configured backend, tagged with its capability set
pub enum Backend {
    Managed(Box<dyn ManagedStorageBackend>),
    Unmanaged(Box<dyn UnmanagedStorageBackend>),
}

impl Backend {
    pub fn as_managed(&self) -> Option<&dyn ManagedStorageBackend> {
        match self {
            Backend::Managed(backend) => Some(backend.as_ref()),
            Backend::Unmanaged(_) => None,
        }
    }

    pub fn as_unmanaged(&self) -> Option<&dyn UnmanagedStorageBackend> {
        match self {
            Backend::Managed(_) => None,
            Backend::Unmanaged(backend) => Some(backend.as_ref()),
        }
    }

    pub fn metadata(&self) -> &'static BackendMetadata {
        match self {
            Backend::Managed(b) => b.metadata(),
            Backend::Unmanaged(b) => b.metadata(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        match self {
            Backend::Managed(b) => b.has_credentials(),
            Backend::Unmanaged(b) => b.has_credentials(),
        }
    }

    pub async fn confirm_configuration(&self, dataset: &Dataset) -> Result<()> {
        match self {
            Backend::Managed(b) => b.confirm_configuration(dataset).await,
            Backend::Unmanaged(b) => b.confirm_configuration(dataset).await,
        }
    }

    pub async fn prepare_pull(&self, manifest: &Manifest, objects: &[PullObject]) -> Result<()> {
        match self {
            Backend::Managed(b) => b.prepare_pull(manifest, objects).await,
            Backend::Unmanaged(b) => b.prepare_pull(manifest, objects).await,
        }
    }

    pub async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: &[PullObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PullResult> {
        match self {
            Backend::Managed(b) => b.pull_objects(manifest, objects, on_progress).await,
            Backend::Unmanaged(b) => b.pull_objects(manifest, objects, on_progress).await,
        }
    }

    pub async fn finalize_pull(&self, manifest: &Manifest) -> Result<()> {
        match self {
            Backend::Managed(b) => b.finalize_pull(manifest).await,
            Backend::Unmanaged(b) => b.finalize_pull(manifest).await,
        }
    }
}
