use crate::api::dto::pool::{PoolEvictResponse, PoolListResponse, PooledConnectionResponse};
use crate::api::routes::AppState;
use crate::error::{AppError, Result};
use axum::{
    Json,
    extract::{Path, State},
};

pub async fn list_connections(State(state): State<AppState>) -> Result<Json<PoolListResponse>> {
    let connections = state.execution_service.pool().list().await?;
    Ok(Json(PoolListResponse {
        data: connections
            .into_iter()
            .map(PooledConnectionResponse::from)
            .collect(),
    }))
}

pub async fn evict_connections(State(state): State<AppState>) -> Result<Json<PoolEvictResponse>> {
    let evicted = state.execution_service.pool().evict_all().await?;
    Ok(Json(PoolEvictResponse { evicted }))
}

pub async fn evict_connection(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<PoolEvictResponse>> {
    if !state.execution_service.pool().evict(&key).await? {
        return Err(AppError::ConnectionNotFound(key));
    }
    Ok(Json(PoolEvictResponse { evicted: 1 }))
}
