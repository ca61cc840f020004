// Dataset content-addressed storage and synchronization engine

pub mod backend;
pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod hash;
pub mod io_manager;
pub mod manifest;
pub mod paths;
pub mod push_queue;
pub mod repository;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendRegistry, ManagedStorageBackend, StorageBackend, UnmanagedStorageBackend};
pub use config::EngineConfig;
pub use dataset::{BackendConfig, Dataset, DatasetId, StorageType};
pub use error::{DatasetError, Result};
pub use hash::ObjectId;
pub use io_manager::IoManager;
pub use manifest::{Manifest, ManifestEntry, ManifestStatus};
pub use repository::{GitRepository, Repository};
pub use store::ContentStore;
pub use transfer::{PullObject, PullResult, PushObject, PushResult, TransferPlan};
