// Revision-scoped manifest: what a revision of the dataset should contain
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;
use walkdir::WalkDir;

use crate::backend::Backend;
use crate::dataset::Dataset;
use crate::error::{DatasetError, IoContext, Result};
use crate::hash::ObjectId;
use crate::paths::{is_os_artifact, mtime_secs, normalize_key, to_key};
use crate::push_queue::PushQueue;
use crate::repository::Repository;
use crate::store::{is_temp_name, ContentStore};

pub const MANIFEST_DIR: &str = "manifest";
pub const MANIFEST_FILE: &str = "manifest.json";

const SCHEMA_VERSION: &str = "1.0";

/// One manifest record; directories carry no object id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<f64>,
}

impl ManifestEntry {
    pub fn file(object_id: ObjectId, size: u64, mtime: Option<f64>) -> Self {
        Self {
            object_id: Some(object_id),
            size,
            mtime,
        }
    }

    pub fn directory() -> Self {
        Self {
            object_id: None,
            size: 0,
            mtime: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.object_id.is_none()
    }
}

/// On-disk manifest format
#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    schema_version: String,
    entries: BTreeMap<String, ManifestEntry>,
}

/// Immutable view of the manifest at one revision
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    revision: String,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Snapshot {
    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn entries(&self) -> &BTreeMap<String, ManifestEntry> {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    /// File keys and their object ids, in key order
    pub fn files(&self) -> impl Iterator<Item = (&str, &ObjectId)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.object_id.as_ref().map(|id| (key.as_str(), id)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys touched by an update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestStatus {
    pub created: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ManifestStatus {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// A single edit applied through [`Manifest::apply`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ManifestChange {
    Upsert { key: String, entry: ManifestEntry },
    Remove { key: String },
}

/// A file or directory found while scanning a revision directory
struct RevisionItem {
    key: String,
    path: PathBuf,
    is_dir: bool,
    size: u64,
    mtime: Option<f64>,
}

/// Manifest of the active revision, backed by the dataset's content store
///
/// Readers always see one complete [`Snapshot`]; edits build a new snapshot
/// and swap it in under the repository lock.
pub struct Manifest {
    dataset: Arc<Dataset>,
    store: ContentStore,
    push_queue: PushQueue,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Manifest {
    pub async fn open(dataset: Arc<Dataset>) -> Result<Self> {
        let store = ContentStore::new(dataset.cache_root());
        store.initialize().await?;
        let push_queue = PushQueue::new(&store.objects_dir());
        push_queue.initialize().await?;

        let snapshot = load_snapshot(dataset.repository()).await?;
        tracing::debug!(
            "Opened manifest for {} at {} ({} entries)",
            dataset.id(),
            snapshot.revision,
            snapshot.len()
        );

        let manifest = Self {
            dataset,
            store,
            push_queue,
            snapshot: RwLock::new(Arc::new(snapshot)),
        };
        manifest.materialize_new_revision().await?;
        Ok(manifest)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn push_queue(&self) -> &PushQueue {
        &self.push_queue
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn revision(&self) -> String {
        self.snapshot.read().revision.clone()
    }

    /// Materialized tree of the active revision
    pub fn revision_dir(&self) -> PathBuf {
        self.store.revision_dir(&self.revision())
    }

    pub fn get(&self, key: &str) -> Result<ManifestEntry> {
        self.snapshot
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(format!("No manifest entry for {}", key)))
    }

    /// Content store location of the object behind `key`
    pub fn dataset_to_object_path(&self, key: &str) -> Result<PathBuf> {
        let entry = self.get(key)?;
        let id = entry
            .object_id
            .ok_or_else(|| DatasetError::InvalidArgument(format!("{} is a directory", key)))?;
        Ok(self.store.object_path(&id))
    }

    pub async fn is_materialized(&self, key: &str) -> bool {
        self.store.is_materialized(&self.revision(), key).await
    }

    /// Switch to the repository's current revision
    pub async fn reload(&self) -> Result<()> {
        let snapshot = load_snapshot(self.dataset.repository()).await?;
        tracing::info!("Manifest for {} now at revision {}", self.dataset.id(), snapshot.revision);
        *self.snapshot.write() = Arc::new(snapshot);
        self.materialize_new_revision().await
    }

    /// Link a revision the first time it is seen
    ///
    /// An existing revision directory is left alone, so files removed from it
    /// still read as deletions on the next [`Manifest::update`].
    async fn materialize_new_revision(&self) -> Result<()> {
        let _lock = self.dataset.repository().lock().await;
        let snapshot = self.snapshot();
        let root = self.store.revision_dir(&snapshot.revision);
        if !fs::try_exists(&root).await.unwrap_or(false) {
            self.link_snapshot(&snapshot).await?;
        }
        Ok(())
    }

    /// Add a local file under `key`
    pub async fn insert_file(&self, source: &Path, key: &str) -> Result<ManifestStatus> {
        let key = normalize_key(key)?;
        if key.ends_with('/') {
            return Err(DatasetError::InvalidArgument(format!("{} names a directory", key)));
        }

        let (id, size) = self.store.insert_file(source).await?;
        let mtime = modified_secs(&self.store.object_path(&id)).await;

        let snapshot = self.snapshot();
        let mut changes: Vec<ManifestChange> = parent_keys(&key)
            .filter(|parent| snapshot.get(parent).is_none())
            .map(|parent| ManifestChange::Upsert {
                key: parent,
                entry: ManifestEntry::directory(),
            })
            .collect();
        changes.push(ManifestChange::Upsert {
            key,
            entry: ManifestEntry::file(id, size, mtime),
        });

        self.apply(changes).await
    }

    /// Reconcile the manifest with what is on disk
    ///
    /// Unmanaged datasets defer to their backend. Managed datasets scan the
    /// materialized revision: new or changed files are adopted into the store,
    /// files whose object is local but whose link vanished are deleted, and
    /// entries still waiting for a pull are kept.
    pub async fn update(&self) -> Result<ManifestStatus> {
        match self.dataset.backend() {
            Backend::Unmanaged(backend) => backend.update_from_local(self, &|_: &str| {}, false).await,
            Backend::Managed(_) => self.update_managed().await,
        }
    }

    async fn update_managed(&self) -> Result<ManifestStatus> {
        let _lock = self.dataset.repository().lock().await;
        let snapshot = self.snapshot();
        let root = self.store.revision_dir(&snapshot.revision);
        if !fs::try_exists(&root).await.unwrap_or(false) {
            self.link_snapshot(&snapshot).await?;
        }

        let items = scan_revision(&root).await?;
        let mut seen = HashSet::new();
        let mut changes = Vec::new();

        for item in &items {
            seen.insert(item.key.as_str());
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

            if let Some(ManifestEntry {
                object_id: Some(id),
                size,
                mtime,
            }) = known
            {
                // Pulled objects carry a fresh mtime but are still the recorded content
                if *size == item.size
                    && (*mtime == item.mtime || is_linked_to(&item.path, &self.store.object_path(id)).await)
                {
                    continue;
                }
            }

            let (id, size) = self.store.adopt_file(&item.path).await?;
            let mtime = modified_secs(&item.path).await;
            changes.push(ManifestChange::Upsert {
                key: item.key.clone(),
                entry: ManifestEntry::file(id, size, mtime),
            });
        }

        let mut pending = Vec::new();
        let mut missing_dirs = Vec::new();
        for (key, entry) in snapshot.entries() {
            if seen.contains(key.as_str()) {
                continue;
            }
            match &entry.object_id {
                None => missing_dirs.push(key),
                Some(id) => {
                    if self.store.contains(id).await {
                        changes.push(ManifestChange::Remove { key: key.clone() });
                    } else {
                        pending.push(key.as_str());
                    }
                }
            }
        }
        for dir in missing_dirs {
            if !pending.iter().any(|key| key.starts_with(dir.as_str())) {
                changes.push(ManifestChange::Remove { key: dir.clone() });
            }
        }

        self.commit(changes).await
    }

    /// Materialize every entry whose object is already in the store
    ///
    /// Returns how many files are linked. Safe to re-run at any time.
    pub async fn link_revision(&self) -> Result<usize> {
        let _lock = self.dataset.repository().lock().await;
        self.link_snapshot(&self.snapshot()).await
    }

    /// Callers hold the repository lock
    async fn link_snapshot(&self, snapshot: &Snapshot) -> Result<usize> {
        let root = self.store.revision_dir(&snapshot.revision);
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create revision directory: {}", root.display()))?;
        let mut linked = 0;

        for (key, entry) in snapshot.entries() {
            match &entry.object_id {
                None => {
                    let dir = root.join(key);
                    fs::create_dir_all(&dir)
                        .await
                        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
                }
                Some(id) => {
                    if self.store.materialize(&snapshot.revision, key, id).await? {
                        linked += 1;
                    }
                }
            }
        }

        tracing::debug!("Linked {} files into revision {}", linked, snapshot.revision);
        Ok(linked)
    }

    /// Apply edits under the repository lock
    pub(crate) async fn apply(&self, changes: Vec<ManifestChange>) -> Result<ManifestStatus> {
        let _lock = self.dataset.repository().lock().await;
        self.commit(changes).await
    }

    /// Persist a new snapshot, queue its new objects and update the revision tree
    ///
    /// Callers hold the repository lock.
    async fn commit(&self, changes: Vec<ManifestChange>) -> Result<ManifestStatus> {
        let previous = self.snapshot();
        let revision = previous.revision.clone();
        let mut entries = previous.entries.clone();
        let mut status = ManifestStatus::default();
        let mut linked = Vec::new();
        let mut unlinked = Vec::new();

        for change in changes {
            match change {
                ManifestChange::Upsert { key, entry } => {
                    let old = entries.insert(key.clone(), entry.clone());
                    let old_id = old.as_ref().and_then(|o| o.object_id);
                    match &old {
                        None => {
                            status.created.insert(key.clone());
                        }
                        Some(_) if old_id != entry.object_id => {
                            status.modified.insert(key.clone());
                        }
                        Some(_) => {}
                    }
                    if old.is_none() || old_id != entry.object_id {
                        linked.push((key, entry.object_id));
                    }
                }
                ManifestChange::Remove { key } => {
                    if entries.remove(&key).is_some() {
                        status.deleted.insert(key.clone());
                        unlinked.push(key);
                    }
                }
            }
        }

        if entries == previous.entries {
            return Ok(status);
        }

        save_manifest(self.dataset.repository().root_dir(), &entries).await?;

        if self.dataset.backend().as_managed().is_some() {
            let records: Vec<(String, PathBuf)> = linked
                .iter()
                .filter_map(|(key, id)| id.as_ref().map(|id| (key.clone(), self.store.object_path(id))))
                .collect();
            self.push_queue.append(&revision, &records).await?;
        }

        *self.snapshot.write() = Arc::new(Snapshot {
            revision: revision.clone(),
            entries,
        });

        let root = self.store.revision_dir(&revision);
        unlinked.sort_by(|a, b| b.cmp(a));
        for key in &unlinked {
            remove_materialized(&root.join(key), key.ends_with('/')).await?;
        }
        for (key, id) in &linked {
            match id {
                Some(id) => {
                    self.store.relink(&revision, key, id).await?;
                }
                None => {
                    let dir = root.join(key);
                    fs::create_dir_all(&dir)
                        .await
                        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
                }
            }
        }

        tracing::info!(
            "Manifest {} at {}: {} created, {} modified, {} deleted",
            self.dataset.id(),
            revision,
            status.created.len(),
            status.modified.len(),
            status.deleted.len()
        );
        Ok(status)
    }
}

fn manifest_path(repository_root: &Path) -> PathBuf {
    repository_root.join(MANIFEST_DIR).join(MANIFEST_FILE)
}

async fn load_snapshot(repository: &dyn Repository) -> Result<Snapshot> {
    let revision = repository.current_revision().await?;
    let path = manifest_path(repository.root_dir());

    let entries = match fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice::<ManifestFile>(&bytes)?.entries,
        Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => {
            return Err(DatasetError::Io {
                context: format!("Failed to read manifest {}", path.display()),
                source: e,
            })
        }
    };

    Ok(Snapshot { revision, entries })
}

async fn save_manifest(repository_root: &Path, entries: &BTreeMap<String, ManifestEntry>) -> Result<()> {
    let path = manifest_path(repository_root);
    let dir = repository_root.join(MANIFEST_DIR);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create manifest directory: {}", dir.display()))?;

    let file = ManifestFile {
        schema_version: SCHEMA_VERSION.to_string(),
        entries: entries.clone(),
    };
    let json = serde_json::to_vec_pretty(&file)?;

    let temp = NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?
        .into_temp_path();
    fs::write(&temp, json)
        .await
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    temp.persist(&path).map_err(|e| DatasetError::Io {
        context: format!("Failed to replace manifest {}", path.display()),
        source: e.error,
    })
}

/// `a/b/c.txt` -> `a/`, `a/b/`
fn parent_keys(key: &str) -> impl Iterator<Item = String> + '_ {
    key.match_indices('/').map(move |(i, _)| key[..=i].to_string())
}

async fn modified_secs(path: &Path) -> Option<f64> {
    let metadata = fs::metadata(path).await.ok()?;
    metadata.modified().ok().and_then(mtime_secs)
}

/// True when `path` is a hard link to `object`
#[cfg(unix)]
async fn is_linked_to(path: &Path, object: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(path).await, fs::metadata(object).await) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
async fn is_linked_to(_path: &Path, _object: &Path) -> bool {
    false
}

async fn remove_materialized(path: &Path, is_dir: bool) -> Result<()> {
    let result = if is_dir {
        fs::remove_dir(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        // Directory still holds untracked files
        Err(_) if is_dir => Ok(()),
        Err(e) => Err(DatasetError::Io {
            context: format!("Failed to remove {}", path.display()),
            source: e,
        }),
    }
}

async fn scan_revision(root: &Path) -> Result<Vec<RevisionItem>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut items = Vec::new();
        let walker = WalkDir::new(&root).min_depth(1).sort_by_file_name().into_iter();
        for entry in walker.filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !is_os_artifact(&name) && !is_temp_name(&name)
        }) {
            let entry = entry?;
            let file_type = entry.file_type();
            if !file_type.is_file() && !file_type.is_dir() {
                continue;
            }

            let relative = entry.path().strip_prefix(&root).map_err(|_| {
                DatasetError::InvalidArgument(format!("{} escapes the revision directory", entry.path().display()))
            })?;
            let metadata = entry.metadata()?;
            items.push(RevisionItem {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn write(path: &Path, data: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // Materialized files are read-only links to objects
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_parent_keys() {
        assert_eq!(parent_keys("a/b/c.txt").collect::<Vec<_>>(), vec!["a/", "a/b/"]);
        assert_eq!(parent_keys("top.txt").count(), 0);
    }

    #[test]
    fn test_entry_serialization() {
        let id = ObjectId::from_bytes(b"data");
        let file = serde_json::to_value(ManifestEntry::file(id, 4, Some(1.5))).unwrap();
        assert_eq!(file["object_id"], id.to_hex());
        assert_eq!(file["size"], 4);

        let dir = serde_json::to_value(ManifestEntry::directory()).unwrap();
        assert!(dir.get("object_id").is_none());
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let fixture = Fixture::managed().await;
        assert!(matches!(fixture.manifest.get("nope"), Err(DatasetError::NotFound(_))));
        assert!(matches!(
            fixture.manifest.dataset_to_object_path("nope"),
            Err(DatasetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_file_queues_and_links() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("in.csv", b"a,b\n1,2\n");

        let status = fixture.manifest.insert_file(&source, "tables/in.csv").await.unwrap();
        assert_eq!(
            status.created.into_iter().collect::<Vec<_>>(),
            vec!["tables/", "tables/in.csv"]
        );

        let entry = fixture.manifest.get("tables/in.csv").unwrap();
        let id = entry.object_id.unwrap();
        assert_eq!(
            fixture.manifest.dataset_to_object_path("tables/in.csv").unwrap(),
            fixture.manifest.store().object_path(&id)
        );
        assert!(fixture.manifest.is_materialized("tables/in.csv").await);

        let revision = fixture.manifest.revision();
        assert_eq!(fixture.manifest.push_queue().revisions().await.unwrap(), vec![revision]);
    }

    #[tokio::test]
    async fn test_manifest_survives_reopen() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("a.txt", b"alpha");
        fixture.manifest.insert_file(&source, "a.txt").await.unwrap();

        let reopened = Manifest::open(fixture.dataset.clone()).await.unwrap();
        assert_eq!(reopened.snapshot(), fixture.manifest.snapshot());
    }

    #[tokio::test]
    async fn test_reload_swaps_revision() {
        let fixture = Fixture::managed().await;
        let before = fixture.manifest.snapshot();

        let next = fixture.repo.commit("next");
        fixture.manifest.reload().await.unwrap();

        assert_eq!(fixture.manifest.revision(), next);
        assert_eq!(before.revision(), "r0");
        assert_ne!(before.revision(), fixture.manifest.snapshot().revision());
    }

    #[tokio::test]
    async fn test_update_detects_changes() {
        let fixture = Fixture::managed().await;
        let keep = fixture.source_file("keep.txt", b"keep");
        let gone = fixture.source_file("gone.txt", b"gone");
        let edit = fixture.source_file("edit.txt", b"edit");
        for (path, key) in [(&keep, "keep.txt"), (&gone, "gone.txt"), (&edit, "edit.txt")] {
            fixture.manifest.insert_file(path, key).await.unwrap();
        }

        let root = fixture.manifest.revision_dir();
        std::fs::remove_file(root.join("gone.txt")).unwrap();
        write(&root.join("edit.txt"), b"edited content");
        write(&root.join("new/file.txt"), b"brand new");
        std::fs::write(root.join(".DS_Store"), b"junk").unwrap();

        let status = fixture.manifest.update().await.unwrap();
        assert_eq!(status.created.into_iter().collect::<Vec<_>>(), vec!["new/", "new/file.txt"]);
        assert_eq!(status.modified.into_iter().collect::<Vec<_>>(), vec!["edit.txt"]);
        assert_eq!(status.deleted.into_iter().collect::<Vec<_>>(), vec!["gone.txt"]);

        let edited = fixture.manifest.get("edit.txt").unwrap();
        assert_eq!(edited.object_id, Some(ObjectId::from_bytes(b"edited content")));
        assert!(fixture.manifest.store().contains(&edited.object_id.unwrap()).await);

        assert!(fixture.manifest.update().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_entries_pending_pull() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("remote.bin", b"remote bytes");
        fixture.manifest.insert_file(&source, "data/remote.bin").await.unwrap();

        let fresh = fixture.reopen_with_empty_cache().await;
        let status = fresh.manifest.update().await.unwrap();

        assert!(status.is_empty());
        assert!(fresh.manifest.get("data/remote.bin").is_ok());
        assert!(fresh.manifest.get("data/").is_ok());
    }

    #[tokio::test]
    async fn test_update_after_revision_change_keeps_entries() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("a.txt", b"alpha");
        fixture.manifest.insert_file(&source, "nested/a.txt").await.unwrap();

        fixture.repo.commit("post-write");
        fixture.manifest.reload().await.unwrap();
        assert!(fixture.manifest.is_materialized("nested/a.txt").await);

        // A write into the new revision must not hide the entries it inherited
        let later = fixture.source_file("b.txt", b"beta");
        fixture.manifest.insert_file(&later, "b.txt").await.unwrap();

        let status = fixture.manifest.update().await.unwrap();
        assert!(status.is_empty());
        assert!(fixture.manifest.get("nested/a.txt").is_ok());
        assert!(fixture.manifest.get("b.txt").is_ok());

        fixture.repo.commit("post-write-2");
        let reopened = Manifest::open(fixture.dataset.clone()).await.unwrap();
        assert!(reopened.update().await.unwrap().is_empty());
        assert_eq!(reopened.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_reopen_does_not_restore_removed_files() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("gone.txt", b"gone");
        fixture.manifest.insert_file(&source, "gone.txt").await.unwrap();
        std::fs::remove_file(fixture.manifest.revision_dir().join("gone.txt")).unwrap();

        let reopened = Manifest::open(fixture.dataset.clone()).await.unwrap();
        let status = reopened.update().await.unwrap();
        assert_eq!(status.deleted.into_iter().collect::<Vec<_>>(), vec!["gone.txt"]);
    }

    #[tokio::test]
    async fn test_link_revision_restores_tree() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("a.txt", b"alpha");
        fixture.manifest.insert_file(&source, "nested/a.txt").await.unwrap();

        std::fs::remove_dir_all(fixture.manifest.revision_dir()).unwrap();
        assert!(!fixture.manifest.is_materialized("nested/a.txt").await);

        assert_eq!(fixture.manifest.link_revision().await.unwrap(), 1);
        assert_eq!(fixture.manifest.link_revision().await.unwrap(), 1);
        assert!(fixture.manifest.is_materialized("nested/a.txt").await);
    }

    #[tokio::test]
    async fn test_insert_rejects_directory_key() {
        let fixture = Fixture::managed().await;
        let source = fixture.source_file("a.txt", b"alpha");
        let err = fixture.manifest.insert_file(&source, "dir/").await.unwrap_err();
        assert!(matches!(err, DatasetError::InvalidArgument(_)));
    }
}
