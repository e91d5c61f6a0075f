//! SQLite resource store.
//!
//! Implements `ResourceStore` from `tideway-core`. Every resource is a row
//! keyed by `<kind>/<id>`; the kind and id are also stored separately so
//! listing by kind never confuses `workflow/` with `workflow_execution/`.

use chrono::Utc;
use sqlx::Row;
use tideway_core::repository::resource::{ResourceKind, ResourceStore, check_prefix, resource_key};
use tideway_types::error::RepositoryError;

use super::pool::DatabasePool;

pub struct SqliteResourceStore {
    pool: DatabasePool,
}

impl SqliteResourceStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

impl ResourceStore for SqliteResourceStore {
    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM resources WHERE key = ?")
            .bind(resource_key(kind, id))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|r| r.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(query_err)
    }

    async fn put(&self, kind: ResourceKind, id: &str, bytes: Vec<u8>) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO resources (key, kind, id, value, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(resource_key(kind, id))
        .bind(kind.as_str())
        .bind(id)
        .bind(bytes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<(String, Vec<u8>)>, RepositoryError> {
        let rows = sqlx::query("SELECT id, value FROM resources WHERE kind = ? ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("value")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(query_err)
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM resources WHERE key = ?")
            .bind(resource_key(kind, id))
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_kind(&self, kind: ResourceKind) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM resources WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        tracing::info!(kind = %kind, deleted = result.rows_affected(), "purged resources by kind");
        Ok(result.rows_affected())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RepositoryError> {
        check_prefix(prefix)?;
        // substr instead of LIKE so '%' and '_' in ids match literally.
        let result = sqlx::query("DELETE FROM resources WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM resources")
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        tracing::warn!(deleted = result.rows_affected(), "wiped resource store");
        Ok(result.rows_affected())
    }
}
