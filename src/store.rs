// Content-addressed object cache and revision materialization
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempPath};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{DatasetError, IoContext, Result};
use crate::hash::{ObjectHasher, ObjectId};

pub const OBJECTS_DIR: &str = "objects";

const COPY_BUFFER_SIZE: usize = 1024 * 1024;
pub(crate) const INCOMING_PREFIX: &str = ".incoming-";
const RELINK_PREFIX: &str = ".relink-";

/// On-disk object cache of one dataset
///
/// Layout under the dataset cache root:
/// `objects/<object_id>` for content, `<revision>/...` for materialized
/// revisions. Each unique content is stored once and hard linked into every
/// revision that references it.
#[derive(Debug, Clone)]
pub struct ContentStore {
    cache_root: PathBuf,
}

impl ContentStore {
    pub fn new<P: AsRef<Path>>(cache_root: P) -> Self {
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
        }
    }

    /// Create the object directory if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        let objects = self.objects_dir();
        fs::create_dir_all(&objects)
            .await
            .with_context(|| format!("Failed to create object directory: {}", objects.display()))
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.cache_root.join(OBJECTS_DIR)
    }

    /// Location of an object; independent of any revision
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir().join(id.to_hex())
    }

    pub fn revision_dir(&self, revision: &str) -> PathBuf {
        self.cache_root.join(revision)
    }

    pub async fn contains(&self, id: &ObjectId) -> bool {
        fs::try_exists(self.object_path(id)).await.unwrap_or(false)
    }

    /// Copy a file into the store, hashing while copying
    pub async fn insert_file(&self, source: &Path) -> Result<(ObjectId, u64)> {
        let staged = stage_copy(source, &self.objects_dir(), &mut |_| {}).await?;
        let (id, size) = (staged.id, staged.size);
        self.commit(staged).await?;
        Ok((id, size))
    }

    /// Copy an object fetched from elsewhere, refusing content that doesn't match `expected`
    pub async fn import_object(
        &self,
        expected: &ObjectId,
        source: &Path,
        on_chunk: &mut (dyn FnMut(u64) + Send),
    ) -> Result<u64> {
        let staged = stage_copy(source, &self.objects_dir(), on_chunk).await?;
        if staged.id != *expected {
            return Err(DatasetError::Integrity {
                expected: *expected,
                actual: staged.id,
            });
        }
        let size = staged.size;
        self.commit(staged).await?;
        Ok(size)
    }

    async fn commit(&self, staged: StagedObject) -> Result<()> {
        let destination = self.object_path(&staged.id);
        if fs::try_exists(&destination).await.unwrap_or(false) {
            tracing::debug!("Object already exists: {}", staged.id);
            return Ok(());
        }

        let id = staged.id;
        let size = staged.size;
        staged.persist(&destination)?;
        set_readonly(&destination).await?;

        tracing::debug!("Stored object: {} ({} bytes)", id, size);
        Ok(())
    }

    /// Move a file written into a revision directory into the store
    ///
    /// The file ends up hard linked to its object, so it costs no extra space.
    pub async fn adopt_file(&self, path: &Path) -> Result<(ObjectId, u64)> {
        let id = ObjectId::from_file_async(path).await?;
        let size = fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let object = self.object_path(&id);

        if fs::try_exists(&object).await.unwrap_or(false) {
            replace_with_link(&object, path).await?;
        } else {
            let temp = reserve_temp_path(&self.objects_dir(), INCOMING_PREFIX)?;
            fs::hard_link(path, &temp)
                .await
                .with_context(|| format!("Failed to link {} into the store", path.display()))?;
            temp.persist(&object).map_err(|e| DatasetError::Io {
                context: format!("Failed to persist object {}", object.display()),
                source: e.error,
            })?;
            set_readonly(&object).await?;
            tracing::debug!("Adopted {} as object {}", path.display(), id);
        }

        Ok((id, size))
    }

    /// Hard link an object into a revision directory
    ///
    /// Returns `false` when the object isn't in the store yet and has to be pulled
    /// first. Pre-existing directories and links are not an error, so concurrent
    /// batches can materialize into the same tree.
    pub async fn materialize(&self, revision: &str, key: &str, id: &ObjectId) -> Result<bool> {
        let object = self.object_path(id);
        if !fs::try_exists(&object).await.unwrap_or(false) {
            return Ok(false);
        }

        let target = self.revision_dir(revision).join(key);
        ensure_parent(&target).await?;

        match fs::hard_link(&object, &target).await {
            Ok(()) => {
                tracing::trace!("Linked {} -> {}", key, id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(true),
            Err(e) => Err(DatasetError::Io {
                context: format!("Failed to link {} into {}", id, target.display()),
                source: e,
            }),
        }
    }

    /// Force the revision file for `key` to point at `id`, replacing stale content
    pub async fn relink(&self, revision: &str, key: &str, id: &ObjectId) -> Result<bool> {
        let object = self.object_path(id);
        if !fs::try_exists(&object).await.unwrap_or(false) {
            return Ok(false);
        }

        let target = self.revision_dir(revision).join(key);
        ensure_parent(&target).await?;
        replace_with_link(&object, &target).await?;
        Ok(true)
    }

    pub async fn is_materialized(&self, revision: &str, key: &str) -> bool {
        fs::try_exists(self.revision_dir(revision).join(key))
            .await
            .unwrap_or(false)
    }
}

/// A fully written and hashed temp file waiting to be renamed into place
pub(crate) struct StagedObject {
    temp: TempPath,
    pub id: ObjectId,
    pub size: u64,
}

impl StagedObject {
    pub fn persist(self, destination: &Path) -> Result<()> {
        self.temp.persist(destination).map_err(|e| DatasetError::Io {
            context: format!("Failed to persist {}", destination.display()),
            source: e.error,
        })
    }
}

/// Copy `source` into a temp file inside `dir`, hashing on the way
///
/// `on_chunk` receives the size of every chunk written.
pub(crate) async fn stage_copy(
    source: &Path,
    dir: &Path,
    on_chunk: &mut (dyn FnMut(u64) + Send),
) -> Result<StagedObject> {
    let temp = Builder::new()
        .prefix(INCOMING_PREFIX)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    let (file, temp) = temp.into_parts();
    let mut writer = fs::File::from_std(file);

    let mut reader = fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open {}", source.display()))?;

    let mut hasher = ObjectHasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        writer
            .write_all(&buffer[..bytes_read])
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        size += bytes_read as u64;
        on_chunk(bytes_read as u64);
    }

    writer
        .sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", temp.display()))?;

    Ok(StagedObject {
        temp,
        id: hasher.finalize(),
        size,
    })
}

/// Pick a free temp name in `dir` without keeping a file there
fn reserve_temp_path(dir: &Path, prefix: &str) -> Result<TempPath> {
    let temp = Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?
        .into_temp_path();
    std::fs::remove_file(&temp).with_context(|| format!("Failed to clear {}", temp.display()))?;
    Ok(temp)
}

/// Atomically replace `target` with a hard link to `object`
async fn replace_with_link(object: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| DatasetError::InvalidArgument(format!("No parent directory: {}", target.display())))?;
    let temp = reserve_temp_path(parent, RELINK_PREFIX)?;
    let temp_name = temp.to_path_buf();

    fs::hard_link(object, &temp)
        .await
        .with_context(|| format!("Failed to link {}", object.display()))?;
    temp.persist(target).map_err(|e| DatasetError::Io {
        context: format!("Failed to replace {}", target.display()),
        source: e.error,
    })?;

    // rename() between two links of the same inode succeeds without removing the source
    if fs::try_exists(&temp_name).await.unwrap_or(false) {
        fs::remove_file(&temp_name)
            .await
            .with_context(|| format!("Failed to remove {}", temp_name.display()))?;
    }
    Ok(())
}

async fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Objects are immutable; linked revision files share the inode
async fn set_readonly(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// True for the store's own temp files
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.starts_with(INCOMING_PREFIX) || name.starts_with(RELINK_PREFIX)
}
