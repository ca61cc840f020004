// Transfer planning and the bracketed push/pull lifecycle
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

use crate::backend::ManagedStorageBackend;
use crate::dataset::Dataset;
use crate::error::{DatasetError, IoContext, Result, TransferOperation};
use crate::manifest::{Manifest, Snapshot};
use crate::transfer::{
    balance_batches, ProgressCallback, PullObject, PullResult, PushObject, PushResult, TransferPlan,
};

/// Splits push/pull work into core-balanced batches and drives the backend
///
/// No threading happens here; callers run each batch on its own worker.
pub struct IoManager {
    dataset: Arc<Dataset>,
    manifest: Arc<Manifest>,
}

impl IoManager {
    pub fn new(dataset: Arc<Dataset>, manifest: Arc<Manifest>) -> Self {
        Self { dataset, manifest }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn managed_backend(&self) -> Result<&dyn ManagedStorageBackend> {
        self.dataset.backend().as_managed().ok_or_else(|| {
            DatasetError::InvalidArgument(format!(
                "Push is not supported by {} datasets",
                self.dataset.storage_type()
            ))
        })
    }

    pub async fn objects_to_push(&self, remove_duplicates: bool) -> Result<Vec<PushObject>> {
        self.manifest
            .push_queue()
            .objects_to_push(self.dataset.repository(), remove_duplicates)
            .await
    }

    /// Objects a push would upload right now; zero for unmanaged datasets
    pub async fn num_objects_to_push(&self) -> Result<usize> {
        match self.dataset.backend().as_managed() {
            Some(backend) => Ok(self
                .objects_to_push(backend.client_should_dedup_on_push())
                .await?
                .len()),
            None => Ok(0),
        }
    }

    pub async fn compute_push_batches(&self) -> Result<TransferPlan<PushObject>> {
        let backend = self.managed_backend()?;
        let objects = self.objects_to_push(backend.client_should_dedup_on_push()).await?;

        let mut sized = Vec::with_capacity(objects.len());
        for object in objects {
            let size = fs::metadata(&object.object_path)
                .await
                .with_context(|| format!("Queued object is missing: {}", object.object_path.display()))?
                .len();
            sized.push((object, size));
        }

        let plan = balance_batches(sized, self.dataset.limits().upload);
        tracing::info!(
            "Planned {} push batches for {}: {} objects, {} bytes",
            plan.batches.len(),
            self.dataset.id(),
            plan.total_count,
            plan.total_bytes
        );
        Ok(plan)
    }

    /// Run one push batch through prepare, push and finalize
    ///
    /// Succeeded objects leave the push queue, along with every other record of
    /// the same object when the backend dedups by content. Backend errors are logged and
    /// returned as [`DatasetError::BackendTransfer`]; there is no retry here.
    pub async fn push_objects(&self, objects: &[PushObject], on_progress: ProgressCallback<'_>) -> Result<PushResult> {
        let backend = self.managed_backend()?;
        let manifest = self.manifest.as_ref();

        let outcome: Result<PushResult> = async {
            backend.prepare_push(manifest, objects).await?;
            let result = backend.push_objects(manifest, objects, on_progress).await?;
            backend.finalize_push(manifest).await?;
            Ok(result)
        }
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let bytes = total_size(objects.iter().map(|o| o.object_path.as_path())).await;
                tracing::error!("Push of {} objects ({} bytes) failed: {}", objects.len(), bytes, e);
                return Err(DatasetError::BackendTransfer {
                    operation: TransferOperation::Push,
                    objects: objects.len(),
                    bytes,
                    source: Box::new(e),
                });
            }
        };

        if !result.succeeded.is_empty() {
            let _lock = self.dataset.repository().lock().await;
            let queue = self.manifest.push_queue();
            if backend.client_should_dedup_on_push() {
                queue.remove_objects(&result.succeeded).await?;
            } else {
                queue.remove(&result.succeeded).await?;
            }
        }
        if !result.is_complete() {
            tracing::warn!("{} of {} objects failed to push", result.failed.len(), objects.len());
        }
        Ok(result)
    }

    /// Split a pull into batches
    ///
    /// Exactly one of `keys` and `pull_all` must be given. With `pull_all`,
    /// entries already in the revision are skipped and objects already in the
    /// store are linked straight away, so only real downloads are planned.
    pub async fn compute_pull_batches(
        &self,
        keys: Option<&[String]>,
        pull_all: bool,
    ) -> Result<TransferPlan<PullObject>> {
        let snapshot = self.manifest.snapshot();
        let requests = match (keys, pull_all) {
            (Some(keys), false) => self.pull_requests(&snapshot, keys)?,
            (None, true) => self.download_set(&snapshot).await?,
            _ => {
                return Err(DatasetError::InvalidArgument(
                    "Exactly one of keys or pull_all must be given".to_string(),
                ))
            }
        };

        let plan = balance_batches(requests, self.dataset.limits().download);
        tracing::info!(
            "Planned {} pull batches for {}: {} objects, {} bytes",
            plan.batches.len(),
            self.dataset.id(),
            plan.total_count,
            plan.total_bytes
        );
        Ok(plan)
    }

    /// Pull the objects behind `keys`, then optionally re-link the whole revision
    pub async fn pull_objects(
        &self,
        keys: &[String],
        on_progress: ProgressCallback<'_>,
        link_revision: bool,
    ) -> Result<PullResult> {
        let snapshot = self.manifest.snapshot();
        let requests = self.pull_requests(&snapshot, keys)?;
        let bytes: u64 = requests.iter().map(|(_, size)| size).sum();
        let objects: Vec<PullObject> = requests.into_iter().map(|(object, _)| object).collect();

        let backend = self.dataset.backend();
        let manifest = self.manifest.as_ref();
        let outcome: Result<PullResult> = async {
            backend.prepare_pull(manifest, &objects).await?;
            let result = backend.pull_objects(manifest, &objects, on_progress).await?;
            backend.finalize_pull(manifest).await?;
            Ok(result)
        }
        .await;

        let result = outcome.map_err(|e| {
            tracing::error!("Pull of {} objects ({} bytes) failed: {}", objects.len(), bytes, e);
            DatasetError::BackendTransfer {
                operation: TransferOperation::Pull,
                objects: objects.len(),
                bytes,
                source: Box::new(e),
            }
        })?;

        if link_revision {
            self.manifest.link_revision().await?;
        }
        if !result.is_complete() {
            tracing::warn!("{} of {} objects failed to pull", result.failed.len(), objects.len());
        }
        Ok(result)
    }

    /// Pull requests for explicit keys; directory keys are skipped
    fn pull_requests(&self, snapshot: &Snapshot, keys: &[String]) -> Result<Vec<(PullObject, u64)>> {
        let mut requests = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = snapshot
                .get(key)
                .ok_or_else(|| DatasetError::NotFound(format!("No manifest entry for {}", key)))?;
            let Some(id) = entry.object_id else {
                continue;
            };
            requests.push((
                PullObject {
                    dataset_path: key.clone(),
                    object_path: self.manifest.store().object_path(&id),
                    revision: snapshot.revision().to_string(),
                },
                entry.size,
            ));
        }
        Ok(requests)
    }

    /// Everything the revision lacks that the store can't provide
    async fn download_set(&self, snapshot: &Snapshot) -> Result<Vec<(PullObject, u64)>> {
        let _lock = self.dataset.repository().lock().await;
        let store = self.manifest.store();
        let revision = snapshot.revision();
        let mut requests = Vec::new();
        let mut linked = 0;

        for (key, entry) in snapshot.entries() {
            let Some(id) = &entry.object_id else {
                continue;
            };
            if store.is_materialized(revision, key).await {
                continue;
            }
            if store.materialize(revision, key, id).await? {
                linked += 1;
                continue;
            }
            requests.push((
                PullObject {
                    dataset_path: key.clone(),
                    object_path: store.object_path(id),
                    revision: revision.to_string(),
                },
                entry.size,
            ));
        }

        if linked > 0 {
            tracing::debug!("Linked {} cached objects without downloading", linked);
        }
        Ok(requests)
    }
}

async fn total_size<'a>(paths: impl Iterator<Item = &'a Path>) -> u64 {
    let mut total = 0;
    for path in paths {
        total += fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::config::EngineConfig;
    use crate::dataset::{BackendConfig, DatasetId, StorageType};
    use crate::manifest::{MANIFEST_DIR, MANIFEST_FILE};
    use crate::repository::Repository;
    use crate::testing::{noop_progress, Fixture};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn io(fixture: &Fixture) -> IoManager {
        IoManager::new(fixture.dataset.clone(), fixture.manifest.clone())
    }

    async fn insert(fixture: &Fixture, key: &str, data: &[u8]) {
        let source = fixture.source_file(key, data);
        fixture.manifest.insert_file(&source, key).await.unwrap();
    }

    async fn push_all(io: &IoManager) {
        let plan = io.compute_push_batches().await.unwrap();
        for batch in &plan.batches {
            assert!(io.push_objects(batch, noop_progress()).await.unwrap().is_complete());
        }
    }

    fn keys(plan: &TransferPlan<PullObject>) -> Vec<String> {
        plan.batches
            .iter()
            .flatten()
            .map(|o| o.dataset_path.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_push_batches_are_balanced() {
        let fixture = Fixture::managed().await;
        for key in ["f1", "f2", "f3", "f4"] {
            insert(&fixture, key, key.repeat(5).as_bytes()).await;
        }
        fixture.repo.commit("post-write");

        let plan = io(&fixture).compute_push_batches().await.unwrap();
        let names: Vec<Vec<&str>> = plan
            .batches
            .iter()
            .map(|b| b.iter().map(|o| o.dataset_path.as_str()).collect())
            .collect();

        assert_eq!(names, vec![vec!["f1", "f3"], vec!["f2", "f4"]]);
        assert_eq!(plan.total_bytes, 40);
        assert_eq!(plan.total_count, 4);
    }

    #[tokio::test]
    async fn test_push_then_pull_into_fresh_cache() {
        let fixture = Fixture::managed().await;
        insert(&fixture, "a.txt", b"alpha").await;
        insert(&fixture, "dir/b.txt", b"beta").await;
        fixture.repo.commit("post-write");

        let uploader = io(&fixture);
        assert_eq!(uploader.num_objects_to_push().await.unwrap(), 2);
        let plan = uploader.compute_push_batches().await.unwrap();
        let pushed = AtomicU64::new(0);
        for batch in &plan.batches {
            let progress = |n: u64| {
                pushed.fetch_max(n, Ordering::SeqCst);
            };
            let result = uploader.push_objects(batch, &progress).await.unwrap();
            assert!(result.is_complete());
        }
        assert!(pushed.load(Ordering::SeqCst) > 0);
        assert_eq!(uploader.num_objects_to_push().await.unwrap(), 0);

        let fresh = fixture.reopen_with_empty_cache().await;
        let downloader = io(&fresh);
        let plan = downloader.compute_pull_batches(None, true).await.unwrap();
        assert_eq!(plan.total_count, 2);
        assert_eq!(plan.total_bytes, 9);

        let result = downloader
            .pull_objects(&keys(&plan), noop_progress(), true)
            .await
            .unwrap();
        assert_eq!(result.succeeded.len(), 2);

        let root = fresh.manifest.revision_dir();
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(root.join("dir/b.txt")).unwrap(), b"beta");
        assert!(downloader.compute_pull_batches(None, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_clears_records_sharing_an_object() {
        let fixture = Fixture::managed().await;
        insert(&fixture, "copy1.bin", b"shared").await;
        insert(&fixture, "copy2.bin", b"shared").await;
        fixture.repo.commit("post-write");

        let io = io(&fixture);
        assert_eq!(io.objects_to_push(false).await.unwrap().len(), 2);
        assert_eq!(io.num_objects_to_push().await.unwrap(), 1);

        push_all(&io).await;

        assert_eq!(io.num_objects_to_push().await.unwrap(), 0);
        assert!(io.objects_to_push(false).await.unwrap().is_empty());
        assert!(fixture.manifest.push_queue().revisions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_after_pull_keeps_manifest() {
        let fixture = Fixture::managed().await;
        insert(&fixture, "a.txt", b"alpha").await;
        insert(&fixture, "dir/b.txt", b"beta").await;
        fixture.repo.commit("post-write");
        push_all(&io(&fixture)).await;

        // Pulled objects are written later, so their mtimes differ from the recorded ones
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = fixture.reopen_with_empty_cache().await;
        let downloader = io(&fresh);
        let plan = downloader.compute_pull_batches(None, true).await.unwrap();
        downloader
            .pull_objects(&keys(&plan), noop_progress(), true)
            .await
            .unwrap();

        let manifest_path = fixture.repo.root_dir().join(MANIFEST_DIR).join(MANIFEST_FILE);
        let before = std::fs::read(&manifest_path).unwrap();

        let status = fresh.manifest.update().await.unwrap();
        assert!(status.is_empty());
        assert_eq!(std::fs::read(&manifest_path).unwrap(), before);
        assert_eq!(fresh.manifest.snapshot().entries(), fixture.manifest.snapshot().entries());
    }

    #[tokio::test]
    async fn test_pull_all_links_cached_objects() {
        let fixture = Fixture::managed().await;
        insert(&fixture, "cached.txt", b"cached").await;
        std::fs::remove_file(fixture.manifest.revision_dir().join("cached.txt")).unwrap();

        let plan = io(&fixture).compute_pull_batches(None, true).await.unwrap();

        assert!(plan.is_empty());
        assert!(fixture.manifest.is_materialized("cached.txt").await);
    }

    #[tokio::test]
    async fn test_pull_argument_validation() {
        let fixture = Fixture::managed().await;
        insert(&fixture, "a.txt", b"alpha").await;
        insert(&fixture, "d/b.txt", b"beta").await;
        let io = io(&fixture);
        let keys = vec!["a.txt".to_string()];

        for (keys, pull_all) in [(None, false), (Some(keys.as_slice()), true)] {
            let err = io.compute_pull_batches(keys, pull_all).await.unwrap_err();
            assert!(matches!(err, DatasetError::InvalidArgument(_)));
        }

        let unknown = vec!["nope".to_string()];
        let err = io.compute_pull_batches(Some(&unknown), false).await.unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));

        let with_dir = vec!["a.txt".to_string(), "d/".to_string()];
        let plan = io.compute_pull_batches(Some(&with_dir), false).await.unwrap();
        assert_eq!(plan.total_count, 1);
        assert_eq!(plan.total_bytes, 5);
    }

    #[tokio::test]
    async fn test_unmanaged_push_is_rejected() {
        let fixture = Fixture::local().await;
        let io = io(&fixture);

        let err = io.push_objects(&[], noop_progress()).await.unwrap_err();
        assert!(matches!(err, DatasetError::InvalidArgument(_)));
        assert!(matches!(
            io.compute_push_batches().await,
            Err(DatasetError::InvalidArgument(_))
        ));
        assert_eq!(io.num_objects_to_push().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_wrapped() {
        let fixture = Fixture::managed().await;
        // A regular file where the remote directory should be
        let blocker = fixture.source_file("blocker", b"not a directory");
        let config = EngineConfig::with_root(fixture.temp.path().join("broken-cache"), 1, 1);
        let dataset = Arc::new(
            Dataset::new(
                DatasetId::new("ns", "owner", "broken"),
                StorageType::ObjectDirectory,
                BackendConfig::new().with("remote_root", blocker.to_string_lossy()),
                fixture.repo.clone(),
                &BackendRegistry::new(),
                &config,
            )
            .unwrap(),
        );
        let manifest = Arc::new(Manifest::open(dataset.clone()).await.unwrap());
        let source = fixture.source_file("a.txt", b"alpha");
        manifest.insert_file(&source, "a.txt").await.unwrap();
        fixture.repo.commit("post-write");

        let io = IoManager::new(dataset, manifest);
        let objects = io.objects_to_push(true).await.unwrap();
        let err = io.push_objects(&objects, noop_progress()).await.unwrap_err();

        match err {
            DatasetError::BackendTransfer {
                operation,
                objects,
                bytes,
                ..
            } => {
                assert_eq!(operation, TransferOperation::Push);
                assert_eq!(objects, 1);
                assert_eq!(bytes, 5);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(io.num_objects_to_push().await.unwrap(), 1);
    }
}
