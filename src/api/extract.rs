use crate::error::AppError;
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};

pub const REQUESTER_HEADER: &str = "x-user-id";

/// Caller identity, taken from the `X-User-Id` header set by the fronting gateway.
#[derive(Clone, Debug)]
pub struct Requester(pub String);

impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        requester_id(&parts.headers)
            .map(Requester)
            .ok_or(AppError::Unauthenticated)
    }
}

impl Requester {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn requester_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUESTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}
