use crate::repository::DbPool;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    // Every connection to an in-memory database is a separate database.
    let in_memory = db_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 8 })
        .connect_with(options)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processes (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            host_id TEXT NOT NULL,
            hostname TEXT NOT NULL,
            port INTEGER NOT NULL,
            user TEXT NOT NULL,
            command TEXT NOT NULL,
            state INTEGER NOT NULL,
            os_pid INTEGER,
            exit_code INTEGER,
            message TEXT,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS process_owners (
            process_id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pooled_connections (
            key TEXT PRIMARY KEY,
            destination TEXT NOT NULL,
            control_path TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER NOT NULL,
            use_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_processes_expires_at ON processes(expires_at);
        CREATE INDEX IF NOT EXISTS idx_process_owners_expires_at ON process_owners(expires_at);
        CREATE INDEX IF NOT EXISTS idx_pooled_connections_last_used ON pooled_connections(last_used_at);
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}
