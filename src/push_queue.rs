// Per-revision record of objects awaiting upload
//
// One file per writing revision under `objects/.push/`, one
// `dataset_path,object_path` record per line.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{DatasetError, IoContext, Result};
use crate::paths::is_os_artifact;
use crate::repository::Repository;
use crate::store::{is_temp_name, INCOMING_PREFIX};
use crate::transfer::PushObject;

pub const PUSH_DIR: &str = ".push";

/// HEAD itself is the internal commit made after a write, so queue files are
/// checked against its parent.
const ANCESTRY_REFERENCE: &str = "HEAD~1";

#[derive(Debug, Clone)]
pub struct PushQueue {
    dir: PathBuf,
}

impl PushQueue {
    pub fn new(objects_dir: &Path) -> Self {
        Self {
            dir: objects_dir.join(PUSH_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create push queue: {}", self.dir.display()))
    }

    /// Append records for `revision`; callers hold the repository lock
    pub async fn append(&self, revision: &str, records: &[(String, PathBuf)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let path = self.dir.join(revision);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open push queue {}", path.display()))?;

        let mut buffer = String::new();
        for (dataset_path, object_path) in records {
            buffer.push_str(&format_record(dataset_path, object_path));
        }

        file.write_all(buffer.as_bytes())
            .await
            .with_context(|| format!("Failed to append to push queue {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to flush push queue {}", path.display()))?;

        tracing::debug!("Queued {} objects for push in revision {}", records.len(), revision);
        Ok(())
    }

    /// Revisions that have a queue file
    pub async fn revisions(&self) -> Result<Vec<String>> {
        let mut revisions = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(revisions),
            Err(e) => {
                return Err(DatasetError::Io {
                    context: format!("Failed to list push queue {}", self.dir.display()),
                    source: e,
                })
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list push queue {}", self.dir.display()))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_os_artifact(&name) || is_temp_name(&name) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                revisions.push(name);
            }
        }

        revisions.sort();
        Ok(revisions)
    }

    /// Objects that must be uploaded from the current branch
    ///
    /// Queue files of revisions that are not ancestors of `HEAD~1` belong to
    /// another branch and are skipped. With `remove_duplicates`, only the first
    /// record (by sorted dataset path) of each object id is kept. The result is
    /// ordered naturally by dataset path.
    pub async fn objects_to_push(
        &self,
        repository: &dyn Repository,
        remove_duplicates: bool,
    ) -> Result<Vec<PushObject>> {
        let mut ancestry: HashMap<String, bool> = HashMap::new();
        let mut objects = Vec::new();

        for revision in self.revisions().await? {
            let is_ancestor = match ancestry.get(&revision) {
                Some(cached) => *cached,
                None => {
                    let result = repository.is_ancestor(&revision, ANCESTRY_REFERENCE).await?;
                    ancestry.insert(revision.clone(), result);
                    result
                }
            };

            if !is_ancestor {
                tracing::debug!("Skipping push queue {}: not an ancestor of {}", revision, ANCESTRY_REFERENCE);
                continue;
            }

            let mut records = self.read_records(&revision).await?;
            records.sort();
            objects.extend(records.into_iter().map(|(dataset_path, object_path)| PushObject {
                dataset_path,
                object_path,
                revision: revision.clone(),
            }));
        }

        if remove_duplicates {
            objects.sort_by(|a, b| {
                a.dataset_path
                    .cmp(&b.dataset_path)
                    .then_with(|| a.object_path.cmp(&b.object_path))
            });
            let mut seen = HashSet::new();
            objects.retain(|o| seen.insert(o.object_id().to_string()));
        }

        objects.sort_by(|a, b| natural_cmp(&a.dataset_path, &b.dataset_path));
        Ok(objects)
    }

    /// Drop pushed records; a queue file left empty is deleted
    ///
    /// Re-running with records that are already gone is a no-op. Callers hold
    /// the repository lock.
    pub async fn remove(&self, pushed: &[PushObject]) -> Result<()> {
        let mut by_revision: HashMap<&str, HashSet<(&str, &Path)>> = HashMap::new();
        for object in pushed {
            by_revision
                .entry(object.revision.as_str())
                .or_default()
                .insert((object.dataset_path.as_str(), object.object_path.as_path()));
        }

        for (revision, done) in by_revision {
            self.retain(revision, |d, o| !done.contains(&(d, o))).await?;
        }
        Ok(())
    }

    /// Drop every record, in any revision, that points at a pushed object
    ///
    /// Used when the remote is keyed by content, so one upload satisfies all
    /// dataset paths sharing the object. Callers hold the repository lock.
    pub async fn remove_objects(&self, pushed: &[PushObject]) -> Result<()> {
        let done: HashSet<&Path> = pushed.iter().map(|o| o.object_path.as_path()).collect();
        if done.is_empty() {
            return Ok(());
        }

        for revision in self.revisions().await? {
            self.retain(&revision, |_, o| !done.contains(o)).await?;
        }
        Ok(())
    }

    /// Keep the records of `revision` matching `keep`
    async fn retain<F>(&self, revision: &str, keep: F) -> Result<()>
    where
        F: Fn(&str, &Path) -> bool,
    {
        let path = self.dir.join(revision);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let records = self.read_records(revision).await?;
        let before = records.len();
        let remaining: Vec<(String, PathBuf)> = records
            .into_iter()
            .filter(|(d, o)| keep(d.as_str(), o.as_path()))
            .collect();

        if remaining.is_empty() {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove push queue {}", path.display()))?;
            tracing::debug!("Push queue for revision {} is empty", revision);
        } else if remaining.len() != before {
            let content: String = remaining.iter().map(|(d, o)| format_record(d, o)).collect();
            self.rewrite(&path, content).await?;
        }
        Ok(())
    }

    async fn read_records(&self, revision: &str) -> Result<Vec<(String, PathBuf)>> {
        let path = self.dir.join(revision);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read push queue {}", path.display()))?;

        Ok(content
            .lines()
            .filter_map(|line| {
                let record = parse_record(line);
                if record.is_none() && !line.trim().is_empty() {
                    tracing::warn!("Ignoring malformed push queue line in {}: {}", revision, line);
                }
                record
            })
            .collect())
    }

    async fn rewrite(&self, path: &Path, content: String) -> Result<()> {
        let temp = Builder::new()
            .prefix(INCOMING_PREFIX)
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?
            .into_temp_path();
        fs::write(&temp, content)
            .await
            .with_context(|| format!("Failed to write {}", temp.display()))?;
        temp.persist(path).map_err(|e| DatasetError::Io {
            context: format!("Failed to replace push queue {}", path.display()),
            source: e.error,
        })
    }
}

fn format_record(dataset_path: &str, object_path: &Path) -> String {
    format!("{},{}\n", dataset_path, object_path.display())
}

/// Object paths never contain commas, dataset paths might
fn parse_record(line: &str) -> Option<(String, PathBuf)> {
    let (dataset_path, object_path) = line.trim_end().rsplit_once(',')?;
    if dataset_path.is_empty() || object_path.is_empty() {
        return None;
    }
    Some((dataset_path.to_string(), PathBuf::from(object_path)))
}

/// Numeric-aware, case-insensitive ordering: `file2` sorts before `file10`
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let left = split_runs(a);
    let right = split_runs(b);

    for ((left_digits, l), (right_digits, r)) in left.iter().zip(right.iter()) {
        let ordering = match (left_digits, right_digits) {
            (true, true) => {
                let l = l.trim_start_matches('0');
                let r = r.trim_start_matches('0');
                l.len().cmp(&r.len()).then_with(|| l.cmp(r))
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => l.to_lowercase().cmp(&r.to_lowercase()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

/// Split into alternating runs of ASCII digits and everything else
fn split_runs(s: &str) -> Vec<(bool, &str)> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut current: Option<bool> = None;

    for (i, c) in s.char_indices() {
        let is_digit = c.is_ascii_digit();
        if let Some(previous) = current {
            if previous != is_digit {
                runs.push((previous, &s[start..i]));
                start = i;
            }
        }
        current = Some(is_digit);
    }
    if let Some(previous) = current {
        runs.push((previous, &s[start..]));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRepository;
    use tempfile::TempDir;

    fn object(dir: &Path, id: &str) -> PathBuf {
        dir.join("objects").join(id)
    }

    async fn create_queue() -> (PushQueue, TempDir) {
        let temp = TempDir::new().unwrap();
        let queue = PushQueue::new(&temp.path().join("objects"));
        queue.initialize().await.unwrap();
        (queue, temp)
    }

    #[test]
    fn test_natural_cmp() {
        let mut names = vec!["file10", "file2", "File1", "file02b", "a", "file2a"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["a", "File1", "file2", "file2a", "file02b", "file10"]);
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record("dir/a,b.csv,/cache/objects/abc\n"),
            Some(("dir/a,b.csv".to_string(), PathBuf::from("/cache/objects/abc")))
        );
        assert_eq!(parse_record("no-comma"), None);
        assert_eq!(parse_record(""), None);
    }

    #[tokio::test]
    async fn test_ancestry_filtering() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("r1");
        let main_tip = repo.commit("r1-sync");

        // A sibling branch writes r2, then we go back to main
        repo.commit("r2");
        repo.commit("r2-sync");
        repo.checkout(&main_tip);
        repo.commit("r3");

        queue
            .append("r1", &[("main.txt".into(), object(temp.path(), "aaa"))])
            .await
            .unwrap();
        queue
            .append("r2", &[("branch.txt".into(), object(temp.path(), "bbb"))])
            .await
            .unwrap();

        let objects = queue.objects_to_push(&repo, false).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].dataset_path, "main.txt");
        assert_eq!(objects[0].revision, "r1");
    }

    #[tokio::test]
    async fn test_last_commit_is_included() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("write");
        repo.commit("post-write");

        queue
            .append("write", &[("new.bin".into(), object(temp.path(), "ccc"))])
            .await
            .unwrap();

        assert_eq!(queue.objects_to_push(&repo, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_root_commit_has_nothing_to_push() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("root");

        queue
            .append("root", &[("first.bin".into(), object(temp.path(), "ddd"))])
            .await
            .unwrap();

        assert!(queue.objects_to_push(&repo, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_leaves_no_revision_behind() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("r1");
        repo.commit("r1-sync");

        queue
            .append(
                "r1",
                &[
                    ("a".into(), object(temp.path(), "1")),
                    ("b".into(), object(temp.path(), "2")),
                ],
            )
            .await
            .unwrap();
        // Left over from an interrupted rewrite
        std::fs::write(queue.dir().join(format!("{}crash", INCOMING_PREFIX)), b"a,/x\n").unwrap();

        let objects = queue.objects_to_push(&repo, false).await.unwrap();
        queue.remove(&objects[..1]).await.unwrap();

        assert_eq!(queue.revisions().await.unwrap(), vec!["r1"]);
        assert_eq!(queue.objects_to_push(&repo, false).await.unwrap(), objects[1..].to_vec());
    }

    #[tokio::test]
    async fn test_remove_objects_spans_paths_and_revisions() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("r1");
        repo.commit("r2");
        repo.commit("r2-sync");

        let shared = object(temp.path(), "same");
        queue
            .append(
                "r1",
                &[("one.bin".into(), shared.clone()), ("keep.bin".into(), object(temp.path(), "other"))],
            )
            .await
            .unwrap();
        queue.append("r2", &[("two.bin".into(), shared.clone())]).await.unwrap();

        let deduped = queue.objects_to_push(&repo, true).await.unwrap();
        let pushed: Vec<_> = deduped.into_iter().filter(|o| o.object_path == shared).collect();
        assert_eq!(pushed.len(), 1);

        queue.remove_objects(&pushed).await.unwrap();

        let left = queue.objects_to_push(&repo, false).await.unwrap();
        let names: Vec<_> = left.iter().map(|o| o.dataset_path.as_str()).collect();
        assert_eq!(names, vec!["keep.bin"]);
        assert_eq!(queue.revisions().await.unwrap(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_remove_duplicates_and_natural_order() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("r1");
        repo.commit("r1-sync");

        queue
            .append(
                "r1",
                &[
                    ("file10.txt".into(), object(temp.path(), "same")),
                    ("file2.txt".into(), object(temp.path(), "same")),
                    ("file1.txt".into(), object(temp.path(), "other")),
                ],
            )
            .await
            .unwrap();
        std::fs::write(queue.dir().join(".DS_Store"), b"junk").unwrap();

        let all = queue.objects_to_push(&repo, false).await.unwrap();
        let names: Vec<_> = all.iter().map(|o| o.dataset_path.as_str()).collect();
        assert_eq!(names, vec!["file1.txt", "file2.txt", "file10.txt"]);

        // "file10.txt" < "file2.txt" lexically, so it keeps the shared object
        let deduped = queue.objects_to_push(&repo, true).await.unwrap();
        let names: Vec<_> = deduped.iter().map(|o| o.dataset_path.as_str()).collect();
        assert_eq!(names, vec!["file1.txt", "file10.txt"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (queue, temp) = create_queue().await;
        let repo = MemoryRepository::new(temp.path().join("repo"));
        repo.commit("r1");
        repo.commit("r1-sync");

        queue
            .append(
                "r1",
                &[
                    ("a".into(), object(temp.path(), "1")),
                    ("b".into(), object(temp.path(), "2")),
                ],
            )
            .await
            .unwrap();

        let objects = queue.objects_to_push(&repo, false).await.unwrap();
        queue.remove(&objects[..1]).await.unwrap();
        queue.remove(&objects[..1]).await.unwrap();
        assert_eq!(queue.objects_to_push(&repo, false).await.unwrap(), objects[1..].to_vec());

        queue.remove(&objects).await.unwrap();
        assert!(queue.revisions().await.unwrap().is_empty());
    }
}
