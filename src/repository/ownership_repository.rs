use crate::error::Result;
use crate::repository::DbPool;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Who may observe or control a process.
#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn record_ownership(&self, process_id: &str, owner_id: &str) -> Result<()>;

    async fn check_ownership(&self, process_id: &str, caller_id: &str) -> Result<bool>;

    /// Drops records past their retention window.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Ownership records with the same retention window as process handles.
#[derive(Clone)]
pub struct OwnershipRepository {
    pool: DbPool,
    ttl: Duration,
}

impl OwnershipRepository {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl AuthorizationStore for OwnershipRepository {
    async fn record_ownership(&self, process_id: &str, owner_id: &str) -> Result<()> {
        let expires_at = Utc::now().timestamp_millis() + self.ttl.as_millis() as i64;
        sqlx::query(
            r#"
            INSERT INTO process_owners (process_id, owner_id, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(process_id) DO UPDATE SET owner_id = excluded.owner_id, expires_at = excluded.expires_at
            "#,
        )
        .bind(process_id)
        .bind(owner_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn check_ownership(&self, process_id: &str, caller_id: &str) -> Result<bool> {
        let owner: Option<String> = sqlx::query_scalar(
            "SELECT owner_id FROM process_owners WHERE process_id = ? AND expires_at > ?",
        )
        .bind(process_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(owner.as_deref() == Some(caller_id))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM process_owners WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
