// SQLite metadata database
//
// Holds dataset registrations and backend configuration. Credentials live
// here so they never end up in the versioned repository tree.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::dataset::{BackendConfig, DatasetId, StorageType};
use crate::error::{DatasetError, Result};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS datasets (
        namespace TEXT NOT NULL,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        storage_type TEXT NOT NULL,
        PRIMARY KEY (namespace, owner, name)
    )",
    "CREATE TABLE IF NOT EXISTS backend_config (
        namespace TEXT NOT NULL,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (namespace, owner, name, key)
    )",
];

/// Metadata database wrapper
pub struct MetadataDb {
    pool: SqlitePool,
}

impl MetadataDb {
    /// Create or open database at path (`:memory:` for a private in-memory db)
    pub async fn new(db_path: &str) -> Result<Self> {
        let (options, max_connections) = if db_path == ":memory:" {
            (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true),
                4,
            )
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::debug!("Opened metadata database: {}", db_path);
        Ok(MetadataDb { pool })
    }

    /// Register a dataset (or change its storage type)
    pub async fn register_dataset(&self, id: &DatasetId, storage_type: StorageType) -> Result<()> {
        sqlx::query(
            "INSERT INTO datasets (namespace, owner, name, storage_type) VALUES (?, ?, ?, ?)
             ON CONFLICT (namespace, owner, name) DO UPDATE SET storage_type = excluded.storage_type",
        )
        .bind(&id.namespace)
        .bind(&id.owner)
        .bind(&id.name)
        .bind(storage_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn storage_type(&self, id: &DatasetId) -> Result<StorageType> {
        let row = sqlx::query("SELECT storage_type FROM datasets WHERE namespace = ? AND owner = ? AND name = ?")
            .bind(&id.namespace)
            .bind(&id.owner)
            .bind(&id.name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatasetError::NotFound(format!("Dataset {}", id)))?;

        let storage_type: String = row.try_get("storage_type")?;
        StorageType::from_str(&storage_type)
    }

    /// Replace the full backend configuration of a dataset
    pub async fn set_backend_config(&self, id: &DatasetId, config: &BackendConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM backend_config WHERE namespace = ? AND owner = ? AND name = ?")
            .bind(&id.namespace)
            .bind(&id.owner)
            .bind(&id.name)
            .execute(&mut *tx)
            .await?;

        for (key, value) in config.iter() {
            sqlx::query("INSERT INTO backend_config (namespace, owner, name, key, value) VALUES (?, ?, ?, ?, ?)")
                .bind(&id.namespace)
                .bind(&id.owner)
                .bind(&id.name)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn backend_config(&self, id: &DatasetId) -> Result<BackendConfig> {
        let rows = sqlx::query("SELECT key, value FROM backend_config WHERE namespace = ? AND owner = ? AND name = ?")
            .bind(&id.namespace)
            .bind(&id.owner)
            .bind(&id.name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(String, String)> { Ok((row.try_get("key")?, row.try_get("value")?)) })
            .collect()
    }

    /// Remove a dataset and its backend configuration
    pub async fn delete_dataset(&self, id: &DatasetId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM backend_config WHERE namespace = ? AND owner = ? AND name = ?",
            "DELETE FROM datasets WHERE namespace = ? AND owner = ? AND name = ?",
        ] {
            sqlx::query(statement)
                .bind(&id.namespace)
                .bind(&id.owner)
                .bind(&id.name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_db_creation() {
        let db = MetadataDb::new(":memory:").await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn test_backend_config_replaced_wholesale() {
        let db = MetadataDb::new(":memory:").await.unwrap();
        let id = DatasetId::new("ns", "owner", "data");
        db.register_dataset(&id, StorageType::LocalFilesystem).await.unwrap();

        let first = BackendConfig::new().with("data_directory", "/a").with("token", "secret");
        db.set_backend_config(&id, &first).await.unwrap();
        assert_eq!(db.backend_config(&id).await.unwrap(), first);

        let second = BackendConfig::new().with("data_directory", "/b");
        db.set_backend_config(&id, &second).await.unwrap();
        assert_eq!(db.backend_config(&id).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_file_backed_db() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("meta.db");
        let id = DatasetId::new("ns", "owner", "data");

        {
            let db = MetadataDb::new(path.to_str().unwrap()).await.unwrap();
            db.register_dataset(&id, StorageType::ObjectDirectory).await.unwrap();
        }

        let db = MetadataDb::new(path.to_str().unwrap()).await.unwrap();
        assert_eq!(db.storage_type(&id).await.unwrap(), StorageType::ObjectDirectory);
    }

    #[tokio::test]
    async fn test_delete_dataset() {
        let db = MetadataDb::new(":memory:").await.unwrap();
        let id = DatasetId::new("ns", "owner", "data");
        db.register_dataset(&id, StorageType::ObjectDirectory).await.unwrap();
        db.set_backend_config(&id, &BackendConfig::new().with("remote_root", "/r"))
            .await
            .unwrap();

        db.delete_dataset(&id).await.unwrap();

        assert!(matches!(db.storage_type(&id).await, Err(DatasetError::NotFound(_))));
        assert!(db.backend_config(&id).await.unwrap().is_empty());
    }
}
