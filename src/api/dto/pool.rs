use super::execution::rfc3339;
use crate::services::PooledConnection;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct PooledConnectionResponse {
    pub key: String,
    pub destination: String,
    pub created_at: String,
    pub last_used_at: String,
    pub use_count: u64,
}

impl From<PooledConnection> for PooledConnectionResponse {
    fn from(conn: PooledConnection) -> Self {
        Self {
            key: conn.key,
            destination: conn.destination,
            created_at: rfc3339(conn.created_at),
            last_used_at: rfc3339(conn.last_used_at),
            use_count: conn.use_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PoolListResponse {
    pub data: Vec<PooledConnectionResponse>,
}

#[derive(Debug, Serialize)]
pub struct PoolEvictResponse {
    pub evicted: usize,
}
