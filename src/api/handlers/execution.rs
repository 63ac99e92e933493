use crate::api::dto::execution::{
    ExecutionResponse, StartExecutionRequest, StartExecutionResponse, StopExecutionResponse,
};
use crate::api::extract::Requester;
use crate::api::routes::AppState;
use crate::api::stream::{encode_batch, encode_settled};
use crate::error::{AppError, Result};
use crate::executor::ShellMode;
use crate::services::{BroadcastError, StartExecution};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::convert::Infallible;

pub async fn start_execution(
    State(state): State<AppState>,
    requester: Requester,
    Json(req): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<StartExecutionResponse>)> {
    let mode = if req.bash.unwrap_or(false) {
        ShellMode::Interactive
    } else {
        ShellMode::Raw
    };

    let process_id = state
        .execution_service
        .start_execution(StartExecution {
            command: req.command,
            host_id: req.host_id,
            owner_id: requester.0,
            mode,
            timeout_secs: req.timeout_secs,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartExecutionResponse { process_id })))
}

pub async fn get_execution(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResponse>> {
    let handle = state
        .execution_service
        .get_status(&id, requester.as_str())
        .await?;
    Ok(Json(ExecutionResponse::from(handle)))
}

pub async fn stop_execution(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Json<StopExecutionResponse>> {
    let outcome = state
        .execution_service
        .stop_execution(&id, requester.as_str())
        .await?;
    Ok(Json(StopExecutionResponse::from(outcome)))
}

pub async fn stream_execution(
    State(state): State<AppState>,
    requester: Requester,
    Path(id): Path<String>,
) -> Result<Response> {
    let service = &state.execution_service;
    let body = match service.subscribe(&id, requester.as_str()).await {
        Ok(subscription) => Body::from_stream(
            subscription
                .into_stream()
                .map(|batch| Ok::<_, Infallible>(encode_batch(&batch))),
        ),
        Err(AppError::Broadcast(BroadcastError::NotFound(_))) => {
            // The live channel is gone; a finished execution still gets its outcome.
            let handle = service.get_status(&id, requester.as_str()).await?;
            if !handle.state.is_terminal() {
                return Err(BroadcastError::NotFound(id).into());
            }
            Body::from(encode_settled(&handle))
        }
        Err(e) => return Err(e),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}
