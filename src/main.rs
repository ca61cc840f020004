use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dstore::backend::UnmanagedStorageBackend;
use dstore::db::MetadataDb;
use dstore::{
    BackendConfig, BackendRegistry, Dataset, DatasetId, EngineConfig, GitRepository, IoManager, Manifest,
    ManifestStatus, Repository, StorageType, TransferPlan,
};

#[derive(Parser)]
#[command(name = "dstore")]
#[command(about = "Content-addressed dataset storage and sync", long_about = None)]
#[command(version)]
struct Cli {
    /// Git repository that versions the dataset manifest
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[arg(long, global = true, default_value = "default")]
    namespace: String,

    #[arg(long, global = true, default_value = "local")]
    owner: String,

    /// Dataset name
    #[arg(long, global = true, default_value = "data")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a dataset with a storage backend
    Create {
        /// local_filesystem or object_directory
        #[arg(long)]
        storage_type: String,

        /// Backend setting as key=value
        #[arg(long = "set", value_parser = parse_key_value)]
        settings: Vec<(String, String)>,
    },

    /// Replace backend settings
    Configure {
        #[arg(long = "set", value_parser = parse_key_value, required = true)]
        settings: Vec<(String, String)>,
    },

    /// Add a local file to the dataset
    Add {
        /// File to add
        file: PathBuf,

        /// Path inside the dataset
        key: String,
    },

    /// Reconcile the manifest with the files on disk
    Update,

    /// Show the active revision and pending work
    Status,

    /// Show push and pull batches without transferring anything
    Plan,

    /// Upload queued objects
    Push,

    /// Download objects into the active revision
    Pull {
        /// Pull everything that is missing
        #[arg(long, conflicts_with = "keys", required_unless_present = "keys")]
        all: bool,

        /// Dataset paths to pull
        keys: Vec<String>,
    },

    /// Hash-compare files against the external source (unmanaged datasets)
    Verify,

    /// Re-scan the external source (unmanaged datasets)
    Refresh,

    /// Delete the dataset cache and its registration
    Destroy,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Everything a command needs besides its own arguments
struct Session {
    config: EngineConfig,
    registry: BackendRegistry,
    db: MetadataDb,
    repository: Arc<dyn Repository>,
    id: DatasetId,
}

impl Session {
    async fn open(cli: &Cli) -> Result<Self> {
        let config = EngineConfig::load().await?;
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("Failed to create cache root: {}", config.cache_root.display()))?;

        let db = MetadataDb::new(&config.db_path().to_string_lossy()).await?;
        let repository: Arc<dyn Repository> = Arc::new(GitRepository::open(&cli.repo)?);

        Ok(Self {
            config,
            registry: BackendRegistry::new(),
            db,
            repository,
            id: DatasetId::new(&cli.namespace, &cli.owner, &cli.name),
        })
    }

    async fn dataset(&self) -> Result<Dataset> {
        let dataset = Dataset::open(
            self.id.clone(),
            self.repository.clone(),
            &self.registry,
            &self.config,
            &self.db,
        )
        .await
        .with_context(|| format!("Dataset {} is not registered", self.id))?;
        Ok(dataset)
    }

    async fn io_manager(&self) -> Result<IoManager> {
        let dataset = Arc::new(self.dataset().await?);
        let manifest = Arc::new(Manifest::open(dataset.clone()).await?);
        Ok(IoManager::new(dataset, manifest))
    }
}

fn unmanaged(io: &IoManager) -> Result<&dyn UnmanagedStorageBackend> {
    match io.dataset().backend().as_unmanaged() {
        Some(backend) => Ok(backend),
        None => bail!("{} is a managed dataset", io.dataset().id()),
    }
}

fn print_status(status: &ManifestStatus) {
    for key in &status.created {
        println!("  new:      {}", key);
    }
    for key in &status.modified {
        println!("  modified: {}", key);
    }
    for key in &status.deleted {
        println!("  deleted:  {}", key);
    }
    if status.is_empty() {
        println!("  no changes");
    }
}

fn print_plan<T>(label: &str, plan: &TransferPlan<T>) {
    println!(
        "{}: {} objects, {} bytes in {} batches",
        label,
        plan.total_count,
        plan.total_bytes,
        plan.batches.len()
    );
    for (i, batch) in plan.batches.iter().enumerate() {
        println!("  batch {}: {} objects", i, batch.len());
    }
}

fn log_status(message: &str) {
    tracing::info!("{}", message);
}

/// Per-batch cumulative progress folded into one shared total
struct BatchProgress {
    done: AtomicU64,
    last: Vec<AtomicU64>,
    total_bytes: u64,
}

impl BatchProgress {
    fn new(batches: usize, total_bytes: u64) -> Self {
        Self {
            done: AtomicU64::new(0),
            last: (0..batches).map(|_| AtomicU64::new(0)).collect(),
            total_bytes,
        }
    }

    fn report(&self, batch: usize, completed: u64) {
        let previous = self.last[batch].swap(completed, Ordering::SeqCst);
        let delta = completed.saturating_sub(previous);
        let total = self.done.fetch_add(delta, Ordering::SeqCst) + delta;
        tracing::debug!("batch {}: {} / {} bytes", batch, total, self.total_bytes);
    }

    /// One progress callback per batch
    fn reporters(&self) -> Vec<impl Fn(u64) + Send + Sync + '_> {
        (0..self.last.len())
            .map(|batch| move |completed: u64| self.report(batch, completed))
            .collect()
    }

    fn finish(&self) {
        tracing::info!(
            "Transferred {} of {} bytes",
            self.done.load(Ordering::SeqCst),
            self.total_bytes
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let session = Session::open(&cli).await?;

    match &cli.command {
        Commands::Create { storage_type, settings } => {
            let storage_type: StorageType = storage_type.parse()?;
            let backend_config: BackendConfig = settings.iter().cloned().collect();
            session.registry.validate(storage_type, &backend_config)?;

            let dataset = Dataset::create(
                session.id.clone(),
                storage_type,
                backend_config,
                session.repository.clone(),
                &session.registry,
                &session.config,
                &session.db,
            )
            .await?;
            if let Err(e) = dataset.backend().confirm_configuration(&dataset).await {
                tracing::warn!("Dataset created, but the backend is not ready: {}", e);
            }
            Manifest::open(Arc::new(dataset)).await?;
            println!("Created dataset {}", session.id);
            Ok(())
        }
        Commands::Configure { settings } => {
            let mut dataset = session.dataset().await?;
            let backend_config: BackendConfig = settings.iter().cloned().collect();
            session.registry.validate(dataset.storage_type(), &backend_config)?;
            dataset
                .set_backend_config(backend_config, &session.registry, &session.db)
                .await?;
            dataset.backend().confirm_configuration(&dataset).await?;
            println!("Updated backend configuration for {}", session.id);
            Ok(())
        }
        Commands::Add { file, key } => {
            let io = session.io_manager().await?;
            let status = io.manifest().insert_file(file, key).await?;
            print_status(&status);
            Ok(())
        }
        Commands::Update => {
            let io = session.io_manager().await?;
            io.dataset().backend().confirm_configuration(io.dataset()).await?;
            let status = io.manifest().update().await?;
            print_status(&status);
            Ok(())
        }
        Commands::Status => {
            let io = session.io_manager().await?;
            let snapshot = io.manifest().snapshot();
            let backend = io.dataset().backend();

            println!("Dataset:   {} ({})", session.id, io.dataset().storage_type());
            println!("Revision:  {}", snapshot.revision());
            println!("Entries:   {}", snapshot.len());
            println!("To push:   {}", io.num_objects_to_push().await?);
            if let Some(unmanaged) = backend.as_unmanaged() {
                println!("State:     {:?}", unmanaged.state());
            }
            if !backend.has_credentials() {
                println!("Backend credentials are missing");
            }
            Ok(())
        }
        Commands::Plan => {
            let io = session.io_manager().await?;
            if io.dataset().backend().as_managed().is_some() {
                print_plan("push", &io.compute_push_batches().await?);
            }
            print_plan("pull", &io.compute_pull_batches(None, true).await?);
            Ok(())
        }
        Commands::Push => {
            let io = session.io_manager().await?;
            io.dataset().backend().confirm_configuration(io.dataset()).await?;
            let plan = io.compute_push_batches().await?;
            if plan.is_empty() {
                println!("Nothing to push");
                return Ok(());
            }

            let progress = BatchProgress::new(plan.batches.len(), plan.total_bytes);
            let reporters = progress.reporters();
            let jobs = plan
                .batches
                .iter()
                .zip(&reporters)
                .map(|(batch, report)| io.push_objects(batch, report));
            let results = try_join_all(jobs).await?;
            progress.finish();

            let failed: Vec<_> = results.iter().flat_map(|r| &r.failed).collect();
            for failure in &failed {
                eprintln!("  failed: {} ({})", failure.object.dataset_path, failure.reason);
            }
            println!("Pushed {} of {} objects", plan.total_count - failed.len(), plan.total_count);
            if !failed.is_empty() {
                bail!("{} objects failed to push", failed.len());
            }
            Ok(())
        }
        Commands::Pull { all, keys } => {
            let io = session.io_manager().await?;
            io.dataset().backend().confirm_configuration(io.dataset()).await?;
            let requested = if *all { None } else { Some(keys.as_slice()) };
            let plan = io.compute_pull_batches(requested, *all).await?;

            let batch_keys: Vec<Vec<String>> = plan
                .batches
                .iter()
                .map(|batch| batch.iter().map(|o| o.dataset_path.clone()).collect())
                .collect();
            let progress = BatchProgress::new(batch_keys.len(), plan.total_bytes);
            let reporters = progress.reporters();
            let jobs = batch_keys
                .iter()
                .zip(&reporters)
                .map(|(keys, report)| io.pull_objects(keys, report, false));
            let results = try_join_all(jobs).await?;
            progress.finish();
            let linked = io.manifest().link_revision().await?;

            let failed: Vec<_> = results.iter().flat_map(|r| &r.failed).collect();
            for failure in &failed {
                eprintln!("  failed: {} ({})", failure.object.dataset_path, failure.reason);
            }
            println!("Pulled {} objects, {} files linked", plan.total_count - failed.len(), linked);
            if !failed.is_empty() {
                bail!("{} objects failed to pull", failed.len());
            }
            Ok(())
        }
        Commands::Verify => {
            let io = session.io_manager().await?;
            let backend = unmanaged(&io)?;
            io.dataset().backend().confirm_configuration(io.dataset()).await?;
            let modified = backend.verify_contents(io.manifest(), &log_status).await?;
            for key in &modified {
                println!("  modified: {}", key);
            }
            println!("{} files changed outside the dataset", modified.len());
            Ok(())
        }
        Commands::Refresh => {
            let io = session.io_manager().await?;
            let backend = unmanaged(&io)?;
            if !backend.can_update_from_remote() {
                bail!("{} cannot re-scan its source", io.dataset().storage_type());
            }
            io.dataset().backend().confirm_configuration(io.dataset()).await?;
            let status = backend.update_from_remote(io.manifest(), &log_status).await?;
            print_status(&status);
            Ok(())
        }
        Commands::Destroy => {
            let dataset = session.dataset().await?;
            dataset.destroy(&session.db).await?;
            println!("Destroyed dataset {}", session.id);
            Ok(())
        }
    }
}
