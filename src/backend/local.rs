// Local filesystem backend: an external directory is the source of truth
use super::{BackendMetadata, StorageBackend, UnmanagedStorageBackend};
use crate::dataset::{BackendConfig, Dataset, StorageType};
use crate::error::{DatasetError, Result};
use crate::hash::ObjectId;
use crate::manifest::{Manifest, ManifestChange, ManifestEntry, ManifestStatus};
use crate::paths::{is_os_artifact, mtime_secs, to_key};
use crate::transfer::{ProgressCallback, ProgressTracker, PullObject, PullResult, StatusCallback};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

pub const DATA_DIRECTORY_KEY: &str = "data_directory";

const STATUS_EVERY: usize = 100;

/// Sync state of an unmanaged dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmanagedState {
    Unconfigured,
    Configured,
    Synced,
    /// External content changed since the last update
    Drifted,
}

/// Unmanaged backend reading from a local directory
///
/// Files are copied into the content store on update, so later external
/// edits never reach objects that revisions already link to.
pub struct LocalFilesystemBackend {
    data_directory: Option<PathBuf>,
    state: Mutex<UnmanagedState>,
}

/// A file or directory found in the data directory
struct ScannedItem {
    key: String,
    path: PathBuf,
    is_dir: bool,
    size: u64,
    mtime: Option<f64>,
}

impl LocalFilesystemBackend {
    pub const METADATA: BackendMetadata = BackendMetadata {
        storage_type: StorageType::LocalFilesystem,
        name: "Local directory",
        description: "Links a dataset to a directory on this machine. Files are discovered, never pushed.",
        managed: false,
        required_config: &[DATA_DIRECTORY_KEY],
    };

    pub fn new(config: &BackendConfig) -> Self {
        let data_directory = config
            .get(DATA_DIRECTORY_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            data_directory,
            state: Mutex::new(UnmanagedState::Unconfigured),
        }
    }

    fn set_state(&self, state: UnmanagedState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Local backend state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Data directory, once `confirm_configuration` has accepted it
    fn configured_root(&self) -> Result<&Path> {
        match (*self.state.lock(), self.data_directory.as_deref()) {
            (UnmanagedState::Unconfigured, _) | (_, None) => Err(DatasetError::Configuration(
                "Local data directory has not been confirmed".to_string(),
            )),
            (_, Some(root)) => Ok(root),
        }
    }

    async fn scan(root: &Path) -> Result<Vec<ScannedItem>> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut items = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy();
                if is_os_artifact(&name) {
                    continue;
                }

                let file_type = entry.file_type();
                if !file_type.is_file() && !file_type.is_dir() {
                    continue;
                }

                let relative = entry.path().strip_prefix(&root).map_err(|_| {
                    DatasetError::InvalidArgument(format!("{} escapes the data directory", entry.path().display()))
                })?;
                let metadata = entry.metadata()?;
                items.push(ScannedItem {
                    key: to_key(relative, file_type.is_dir())?,
                    path: entry.path().to_path_buf(),
                    is_dir: file_type.is_dir(),
                    size: if file_type.is_dir() { 0 } else { metadata.len() },
                    mtime: metadata.modified().ok().and_then(mtime_secs),
                });
            }
            Ok(items)
        })
        .await?
    }

    /// Changes for everything that vanished from the data directory
    fn removals(manifest: &Manifest, seen: &HashSet<String>) -> Vec<ManifestChange> {
        manifest
            .snapshot()
            .entries()
            .keys()
            .filter(|key| !seen.contains(*key))
            .map(|key| ManifestChange::Remove { key: key.clone() })
            .collect()
    }

    async fn ingest(manifest: &Manifest, item: &ScannedItem) -> Result<ManifestChange> {
        let (id, size) = manifest.store().insert_file(&item.path).await?;
        Ok(ManifestChange::Upsert {
            key: item.key.clone(),
            entry: ManifestEntry::file(id, size, item.mtime),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalFilesystemBackend {
    fn metadata(&self) -> &'static BackendMetadata {
        &Self::METADATA
    }

    /// Local directories need no credentials
    fn has_credentials(&self) -> bool {
        true
    }

    async fn confirm_configuration(&self, dataset: &Dataset) -> Result<()> {
        let root = self.data_directory.as_deref().ok_or_else(|| {
            DatasetError::Configuration(format!("{} is not set for dataset {}", DATA_DIRECTORY_KEY, dataset.id()))
        })?;

        let is_dir = fs::metadata(root).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(DatasetError::Configuration(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let mut state = self.state.lock();
        if *state == UnmanagedState::Unconfigured {
            *state = UnmanagedState::Configured;
        }
        Ok(())
    }

    async fn prepare_pull(&self, _manifest: &Manifest, objects: &[PullObject]) -> Result<()> {
        let root = self.configured_root()?;
        tracing::debug!("Preparing to copy {} objects from {}", objects.len(), root.display());
        Ok(())
    }

    async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: &[PullObject],
        on_progress: ProgressCallback<'_>,
    ) -> Result<PullResult> {
        let root = self.configured_root()?.to_path_buf();
        let store = manifest.store();
        let mut tracker = ProgressTracker::new(on_progress);
        let mut result = PullResult::new();
        let mut drifted = false;

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

            let source = root.join(&object.dataset_path);
            match store.import_object(&expected, &source, &mut |n| tracker.advance(n)).await {
                Ok(_) => result.success(object.clone()),
                Err(DatasetError::Integrity { .. }) => {
                    drifted = true;
                    result.failure(object.clone(), "File changed in the data directory since the last update");
                }
                Err(e) => result.failure(object.clone(), e.to_string()),
            }
        }

        if drifted {
            self.set_state(UnmanagedState::Drifted);
        }
        Ok(result)
    }

    async fn finalize_pull(&self, _manifest: &Manifest) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UnmanagedStorageBackend for LocalFilesystemBackend {
    fn can_update_from_remote(&self) -> bool {
        true
    }

    fn state(&self) -> UnmanagedState {
        *self.state.lock()
    }

    async fn update_from_remote(&self, manifest: &Manifest, on_status: StatusCallback<'_>) -> Result<ManifestStatus> {
        let root = self.configured_root()?.to_path_buf();
        on_status(&format!("Scanning {}", root.display()));

        let items = Self::scan(&root).await?;
        let snapshot = manifest.snapshot();
        let total_files = items.iter().filter(|i| !i.is_dir).count();
        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        let mut processed = 0;

        for item in &items {
            seen.insert(item.key.clone());
            if item.is_dir {
                if snapshot.get(&item.key).is_none() {
                    changes.push(ManifestChange::Upsert {
                        key: item.key.clone(),
                        entry: ManifestEntry::directory(),
                    });
                }
                continue;
            }

            let change = Self::ingest(manifest, item).await?;
            if let (ManifestChange::Upsert { entry, .. }, Some(known)) = (&change, snapshot.get(&item.key)) {
                if entry == known {
                    processed += 1;
                    continue;
                }
            }
            changes.push(change);

            processed += 1;
            if processed % STATUS_EVERY == 0 {
                on_status(&format!("Processed {} of {} files", processed, total_files));
            }
        }

        changes.extend(Self::removals(manifest, &seen));
        let status = manifest.apply(changes).await?;
        self.set_state(UnmanagedState::Synced);

        on_status(&format!(
            "Update complete: {} new, {} modified, {} deleted",
            status.created.len(),
            status.modified.len(),
            status.deleted.len()
        ));
        Ok(status)
    }

    async fn update_from_local(
        &self,
        manifest: &Manifest,
        on_status: StatusCallback<'_>,
        verify_contents: bool,
    ) -> Result<ManifestStatus> {
        let root = self.configured_root()?.to_path_buf();
        let modified = if verify_contents {
            self.verify_contents(manifest, on_status).await?
        } else {
            BTreeSet::new()
        };

        let items = Self::scan(&root).await?;
        let snapshot = manifest.snapshot();
        let mut seen = HashSet::new();
        let mut changes = Vec::new();

        for item in &items {
            seen.insert(item.key.clone());
            let known = snapshot.get(&item.key);

            if item.is_dir {
                if known.is_none() {
                    changes.push(ManifestChange::Upsert {
                        key: item.key.clone(),
                        entry: ManifestEntry::directory(),
                    });
                }
                continue;
            }

            let refresh = match known {
                None => true,
                Some(_) if modified.contains(&item.key) => true,
                Some(entry) => entry.size != item.size || entry.mtime != item.mtime,
            };
            if refresh {
                changes.push(Self::ingest(manifest, item).await?);
            }
        }

        changes.extend(Self::removals(manifest, &seen));
        let status = manifest.apply(changes).await?;
        self.set_state(UnmanagedState::Synced);

        on_status(&format!(
            "Local update complete: {} new, {} modified, {} deleted",
            status.created.len(),
            status.modified.len(),
            status.deleted.len()
        ));
        Ok(status)
    }

    async fn verify_contents(&self, manifest: &Manifest, on_status: StatusCallback<'_>) -> Result<BTreeSet<String>> {
        let root = self.configured_root()?.to_path_buf();
        let snapshot = manifest.snapshot();
        let mut modified = BTreeSet::new();

        for (key, id) in snapshot.files() {
            let path = root.join(key);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            if ObjectId::from_file_async(&path).await? != *id {
                modified.insert(key.to_string());
            }
        }

        if !modified.is_empty() {
            tracing::info!("{} files changed in {}", modified.len(), root.display());
            self.set_state(UnmanagedState::Drifted);
        }
        on_status(&format!("Verified {} files, {} modified", snapshot.files().count(), modified.len()));
        Ok(modified)
    }
}
