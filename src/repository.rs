// Version control collaborator contract
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{DatasetError, IoContext, Result};

/// Guard serialising writes to the manifest and cache tree
pub type RepositoryLock = OwnedMutexGuard<()>;

/// What the engine needs from the repository that versions a dataset
#[async_trait]
pub trait Repository: Send + Sync {
    /// Working tree root; the manifest lives under it
    fn root_dir(&self) -> &Path;

    /// Commit hash of HEAD
    async fn current_revision(&self) -> Result<String>;

    /// True if `commit` is reachable from `reference` (a commit is its own ancestor)
    ///
    /// A reference that doesn't resolve, such as `HEAD~1` on the root commit,
    /// has no ancestors.
    async fn is_ancestor(&self, commit: &str, reference: &str) -> Result<bool>;

    /// Acquire the repository write lock
    async fn lock(&self) -> RepositoryLock;
}

/// Repository backed by the `git` executable
pub struct GitRepository {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitRepository {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join(".git").exists() {
            return Err(DatasetError::Repository(format!(
                "Not a git repository: {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn resolves(&self, reference: &str) -> Result<bool> {
        let peeled = format!("{}^{{commit}}", reference);
        let output = self.git(&["rev-parse", "--verify", "--quiet", peeled.as_str()]).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn root_dir(&self) -> &Path {
        &self.root
    }

    async fn current_revision(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "HEAD"]).await?;
        if !output.status.success() {
            return Err(DatasetError::Repository(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn is_ancestor(&self, commit: &str, reference: &str) -> Result<bool> {
        if !self.resolves(reference).await? {
            tracing::debug!("{} does not resolve; treating it as having no ancestors", reference);
            return Ok(false);
        }

        let output = self.git(&["merge-base", "--is-ancestor", commit, reference]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(DatasetError::Repository(format!(
                "Ancestry check {} -> {} failed: {}",
                commit,
                reference,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn lock(&self) -> RepositoryLock {
        self.lock.clone().lock_owned().await
    }
}
