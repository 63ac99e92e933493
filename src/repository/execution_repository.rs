use crate::error::{AppError, Result};
use crate::models::{ProcessHandle, ProcessState};
use crate::repository::DbPool;
use chrono::Utc;

#[derive(Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, handle: &ProcessHandle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (id, owner_id, host_id, hostname, port, user, command, state, started_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&handle.id)
        .bind(&handle.owner_id)
        .bind(&handle.host_id)
        .bind(&handle.hostname)
        .bind(handle.port)
        .bind(&handle.user)
        .bind(&handle.command)
        .bind(handle.state as i32)
        .bind(handle.started_at)
        .bind(handle.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Expired handles are treated as gone even before they are purged.
    pub async fn get(&self, id: &str) -> Result<ProcessHandle> {
        let handle = sqlx::query_as::<_, ProcessHandle>(
            "SELECT * FROM processes WHERE id = ? AND expires_at > ?",
        )
        .bind(id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::ExecutionNotFound(id.to_string()))?;

        Ok(handle)
    }

    /// Returns `false` if the handle left `Pending` before the process started.
    pub async fn mark_running(&self, id: &str, pid: u32) -> Result<bool> {
        let result = sqlx::query("UPDATE processes SET os_pid = ?, state = ? WHERE id = ? AND state = ?")
            .bind(pid)
            .bind(ProcessState::Running as i32)
            .bind(id)
            .bind(ProcessState::Pending as i32)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records a terminal state. Returns `false` when the handle was already
    /// terminal, so exactly one terminal transition is ever persisted.
    pub async fn finish(
        &self,
        id: &str,
        state: ProcessState,
        exit_code: Option<i32>,
        message: &str,
    ) -> Result<bool> {
        debug_assert!(state.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET state = ?, exit_code = ?, message = ?, ended_at = ?
            WHERE id = ? AND state IN (?, ?)
            "#,
        )
        .bind(state as i32)
        .bind(exit_code)
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(ProcessState::Pending as i32)
        .bind(ProcessState::Running as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processes WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostSpec;
    use crate::repository::establish_connection;

    fn host() -> HostSpec {
        HostSpec {
            id: "web".to_string(),
            hostname: "10.0.0.5".to_string(),
            port: 22,
            user: "deploy".to_string(),
            identity: "deploy".to_string(),
            active: true,
        }
    }

    async fn repo() -> ExecutionRepository {
        ExecutionRepository::new(establish_connection("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn walks_pending_running_completed() {
        let repo = repo().await;
        let handle = ProcessHandle::new("owner1", &host(), "uptime", 60_000);
        repo.create(&handle).await.unwrap();

        let stored = repo.get(&handle.id).await.unwrap();
        assert_eq!(stored.state, ProcessState::Pending);
        assert_eq!(stored.os_pid, None);

        assert!(repo.mark_running(&handle.id, 4242).await.unwrap());
        let stored = repo.get(&handle.id).await.unwrap();
        assert_eq!(stored.state, ProcessState::Running);
        assert_eq!(stored.os_pid, Some(4242));

        assert!(repo.finish(&handle.id, ProcessState::Completed, Some(0), "ok").await.unwrap());
        let stored = repo.get(&handle.id).await.unwrap();
        assert_eq!(stored.state, ProcessState::Completed);
        assert_eq!(stored.exit_code, Some(0));
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn terminal_state_is_written_once() {
        let repo = repo().await;
        let handle = ProcessHandle::new("owner1", &host(), "sleep 5", 60_000);
        repo.create(&handle).await.unwrap();
        repo.mark_running(&handle.id, 1).await.unwrap();

        assert!(repo.finish(&handle.id, ProcessState::Killed, None, "stopped").await.unwrap());
        assert!(!repo.finish(&handle.id, ProcessState::Completed, Some(0), "late").await.unwrap());
        assert_eq!(repo.get(&handle.id).await.unwrap().state, ProcessState::Killed);
    }

    #[tokio::test]
    async fn expired_handles_disappear() {
        let repo = repo().await;
        let handle = ProcessHandle::new("owner1", &host(), "true", -1);
        repo.create(&handle).await.unwrap();

        assert!(matches!(
            repo.get(&handle.id).await,
            Err(AppError::ExecutionNotFound(_))
        ));
        assert_eq!(repo.purge_expired().await.unwrap(), 1);
    }
}
