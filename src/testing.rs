// Test doubles and fixtures
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use crate::backend::{BackendRegistry, DATA_DIRECTORY_KEY, REMOTE_ROOT_KEY};
use crate::config::EngineConfig;
use crate::dataset::{BackendConfig, Dataset, DatasetId, StorageType};
use crate::error::{DatasetError, Result};
use crate::manifest::Manifest;
use crate::repository::{Repository, RepositoryLock};
use crate::transfer::{ProgressCallback, StatusCallback};

static IGNORE_PROGRESS: fn(u64) = |_| {};
static IGNORE_STATUS: fn(&str) = |_| {};

pub fn noop_progress() -> ProgressCallback<'static> {
    &IGNORE_PROGRESS
}

pub fn noop_status() -> StatusCallback<'static> {
    &IGNORE_STATUS
}

#[derive(Default)]
struct CommitGraph {
    parents: HashMap<String, Option<String>>,
    head: Option<String>,
}

/// In-memory commit graph standing in for git
pub struct MemoryRepository {
    root: PathBuf,
    graph: Mutex<CommitGraph>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryRepository {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            graph: Mutex::new(CommitGraph::default()),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Commit on top of HEAD and move HEAD to it
    pub fn commit(&self, id: &str) -> String {
        let mut graph = self.graph.lock();
        let parent = graph.head.clone();
        graph.parents.insert(id.to_string(), parent);
        graph.head = Some(id.to_string());
        id.to_string()
    }

    pub fn checkout(&self, id: &str) {
        let mut graph = self.graph.lock();
        assert!(graph.parents.contains_key(id), "unknown commit {}", id);
        graph.head = Some(id.to_string());
    }

    /// `HEAD`, `HEAD~N` or a commit id
    fn resolve(graph: &CommitGraph, reference: &str) -> Option<String> {
        let (base, depth) = match reference.split_once('~') {
            Some((base, n)) => (base, n.parse::<usize>().ok()?),
            None => (reference, 0),
        };

        let mut current = if base == "HEAD" {
            graph.head.clone()?
        } else if graph.parents.contains_key(base) {
            base.to_string()
        } else {
            return None;
        };

        for _ in 0..depth {
            current = graph.parents.get(&current)?.clone()?;
        }
        Some(current)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn root_dir(&self) -> &Path {
        &self.root
    }

    async fn current_revision(&self) -> Result<String> {
        self.graph
            .lock()
            .head
            .clone()
            .ok_or_else(|| DatasetError::Repository("No commits yet".to_string()))
    }

    async fn is_ancestor(&self, commit: &str, reference: &str) -> Result<bool> {
        let graph = self.graph.lock();
        let Some(mut current) = Self::resolve(&graph, reference) else {
            return Ok(false);
        };

        loop {
            if current == commit {
                return Ok(true);
            }
            match graph.parents.get(&current).cloned().flatten() {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    async fn lock(&self) -> RepositoryLock {
        self.lock.clone().lock_owned().await
    }
}

static CACHE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A dataset with its repository, cache and external directory in one temp dir
///
/// `external` is the data directory of a local dataset or the remote root of
/// a managed one.
pub struct Fixture {
    pub temp: Arc<TempDir>,
    pub repo: Arc<MemoryRepository>,
    pub registry: BackendRegistry,
    pub dataset: Arc<Dataset>,
    pub manifest: Arc<Manifest>,
    pub external: PathBuf,
}

impl Fixture {
    pub async fn managed() -> Self {
        Self::build(StorageType::ObjectDirectory, REMOTE_ROOT_KEY).await
    }

    pub async fn local() -> Self {
        Self::build(StorageType::LocalFilesystem, DATA_DIRECTORY_KEY).await
    }

    async fn build(storage_type: StorageType, external_key: &str) -> Self {
        let temp = Arc::new(TempDir::new().unwrap());
        let external = temp.path().join("external");
        std::fs::create_dir_all(&external).unwrap();

        let repo = Arc::new(MemoryRepository::new(temp.path().join("repo")));
        repo.commit("base");
        repo.commit("r0");

        let backend_config = BackendConfig::new().with(external_key, external.to_string_lossy());
        let registry = BackendRegistry::new();
        let config = EngineConfig::with_root(temp.path().join("cache"), 2, 2);
        let dataset = Arc::new(
            Dataset::new(
                DatasetId::new("ns", "owner", "data"),
                storage_type,
                backend_config,
                repo.clone(),
                &registry,
                &config,
            )
            .unwrap(),
        );
        let manifest = Arc::new(Manifest::open(dataset.clone()).await.unwrap());

        Self {
            temp,
            repo,
            registry,
            dataset,
            manifest,
            external,
        }
    }

    /// Same dataset, repository and external directory, with an empty cache
    pub async fn reopen_with_empty_cache(&self) -> Self {
        let n = CACHE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let config = EngineConfig::with_root(self.temp.path().join(format!("cache-{}", n)), 2, 2);
        let dataset = Arc::new(
            Dataset::new(
                self.dataset.id().clone(),
                self.dataset.storage_type(),
                self.dataset.backend_config().clone(),
                self.repo.clone(),
                &self.registry,
                &config,
            )
            .unwrap(),
        );
        let manifest = Arc::new(Manifest::open(dataset.clone()).await.unwrap());

        Self {
            temp: self.temp.clone(),
            repo: self.repo.clone(),
            registry: self.registry.clone(),
            dataset,
            manifest,
            external: self.external.clone(),
        }
    }

    /// Write a file outside the dataset to insert from
    pub fn source_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.temp.path().join("sources").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }
}

#[tokio::test]
async fn test_memory_repository_resolves_parents() {
    let repo = MemoryRepository::new("/tmp/unused");
    repo.commit("a");
    repo.commit("b");
    repo.commit("c");

    assert_eq!(repo.current_revision().await.unwrap(), "c");
    assert!(repo.is_ancestor("a", "HEAD~1").await.unwrap());
    assert!(repo.is_ancestor("b", "HEAD~1").await.unwrap());
    assert!(!repo.is_ancestor("c", "HEAD~1").await.unwrap());
    assert!(!repo.is_ancestor("a", "HEAD~5").await.unwrap());
}
