// Push/pull request units, results and batch planning
use std::path::PathBuf;

/// Called with the cumulative number of bytes completed in the current batch
pub type ProgressCallback<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Called with human readable progress messages during long scans
pub type StatusCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// One object to upload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PushObject {
    pub dataset_path: String,
    pub object_path: PathBuf,
    pub revision: String,
}

/// One object to download
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullObject {
    pub dataset_path: String,
    pub object_path: PathBuf,
    pub revision: String,
}

impl PushObject {
    /// Object id, taken from the object file name
    pub fn object_id(&self) -> &str {
        object_name(&self.object_path)
    }
}

impl PullObject {
    pub fn object_id(&self) -> &str {
        object_name(&self.object_path)
    }
}

fn object_name(path: &std::path::Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// An object the backend could not transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFailure<T> {
    pub object: T,
    pub reason: String,
}

/// Per-object outcome of one push or pull batch
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<TransferFailure<T>>,
}

pub type PushResult = TransferResult<PushObject>;
pub type PullResult = TransferResult<PullObject>;

impl<T> TransferResult<T> {
    pub fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn success(&mut self, object: T) {
        self.succeeded.push(object);
    }

    pub fn failure(&mut self, object: T, reason: impl Into<String>) {
        self.failed.push(TransferFailure {
            object,
            reason: reason.into(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<T> Default for TransferResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Work split into batches, one per worker
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan<T> {
    pub batches: Vec<Vec<T>>,
    pub total_bytes: u64,
    pub total_count: usize,
}

impl<T> TransferPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }
}

/// Greedy N-way balancing by byte size
///
/// Each item, in input order, goes to the batch with the lowest running
/// total (lowest index on ties). Empty batches are dropped, so `workers` is
/// an upper bound on the number of batches.
pub fn balance_batches<T>(items: Vec<(T, u64)>, workers: usize) -> TransferPlan<T> {
    let workers = workers.max(1);
    let mut batches: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    let mut sizes = vec![0u64; workers];
    let mut total_bytes = 0u64;
    let mut total_count = 0usize;

    for (item, size) in items {
        let (index, _) = sizes
            .iter()
            .enumerate()
            .min_by_key(|(_, total)| **total)
            .unwrap_or((0, &0));
        sizes[index] += size;
        batches[index].push(item);
        total_bytes += size;
        total_count += 1;
    }

    TransferPlan {
        batches: batches.into_iter().filter(|b| !b.is_empty()).collect(),
        total_bytes,
        total_count,
    }
}

/// Turns per-chunk byte counts into the cumulative value reported to callers
pub(crate) struct ProgressTracker<'a> {
    completed: u64,
    callback: ProgressCallback<'a>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(callback: ProgressCallback<'a>) -> Self {
        Self { completed: 0, callback }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.completed += bytes;
        (self.callback)(self.completed);
    }
}
