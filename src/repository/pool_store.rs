use crate::repository::DbPool;
use crate::services::{ConnectionError, PooledConnection};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Backing storage for pool entries.
///
/// The sqlite store lets several workers sharing one database see the same
/// control sockets; the memory store serves single-process deployments.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<PooledConnection>, ConnectionError>;

    async fn put(&self, conn: &PooledConnection) -> Result<(), ConnectionError>;

    async fn remove(&self, key: &str) -> Result<(), ConnectionError>;

    async fn list(&self) -> Result<Vec<PooledConnection>, ConnectionError>;
}

#[derive(Debug, Default)]
pub struct MemoryPoolStore {
    entries: Mutex<HashMap<String, PooledConnection>>,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PooledConnection>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn get(&self, key: &str) -> Result<Option<PooledConnection>, ConnectionError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, conn: &PooledConnection) -> Result<(), ConnectionError> {
        self.entries().insert(conn.key.clone(), conn.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ConnectionError> {
        self.entries().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PooledConnection>, ConnectionError> {
        Ok(self.entries().values().cloned().collect())
    }
}

#[derive(Clone)]
pub struct SqlitePoolStore {
    pool: DbPool,
}

impl SqlitePoolStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PooledConnectionRow {
    key: String,
    destination: String,
    control_path: String,
    created_at: i64,
    last_used_at: i64,
    use_count: i64,
}

impl From<PooledConnectionRow> for PooledConnection {
    fn from(row: PooledConnectionRow) -> Self {
        Self {
            key: row.key,
            destination: row.destination,
            control_path: PathBuf::from(row.control_path),
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            use_count: row.use_count.max(0) as u64,
        }
    }
}

fn store_error(e: sqlx::Error) -> ConnectionError {
    ConnectionError::Store(e.to_string())
}

#[async_trait]
impl PoolStore for SqlitePoolStore {
    async fn get(&self, key: &str) -> Result<Option<PooledConnection>, ConnectionError> {
        let row = sqlx::query_as::<_, PooledConnectionRow>(
            "SELECT * FROM pooled_connections WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(row.map(PooledConnection::from))
    }

    async fn put(&self, conn: &PooledConnection) -> Result<(), ConnectionError> {
        sqlx::query(
            r#"
            INSERT INTO pooled_connections (key, destination, control_path, created_at, last_used_at, use_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                destination = excluded.destination,
                control_path = excluded.control_path,
                created_at = excluded.created_at,
                last_used_at = excluded.last_used_at,
                use_count = excluded.use_count
            "#,
        )
        .bind(&conn.key)
        .bind(&conn.destination)
        .bind(conn.control_path.to_string_lossy().to_string())
        .bind(conn.created_at)
        .bind(conn.last_used_at)
        .bind(conn.use_count as i64)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ConnectionError> {
        sqlx::query("DELETE FROM pooled_connections WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<PooledConnection>, ConnectionError> {
        let rows = sqlx::query_as::<_, PooledConnectionRow>(
            "SELECT * FROM pooled_connections ORDER BY last_used_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(rows.into_iter().map(PooledConnection::from).collect())
    }
}
