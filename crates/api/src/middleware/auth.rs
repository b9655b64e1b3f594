use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use statuscast_core::token::secrets_match;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Guards owner-only routes with the configured admin bearer token.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

    let token = parse_bearer(header_value)?;
    if !secrets_match(&state.settings.admin_token, token) {
        return Err(ApiError::Unauthorized("invalid admin token".to_string()));
    }

    Ok(next.run(req).await)
}

fn parse_bearer(value: &HeaderValue) -> ApiResult<&str> {
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("invalid authorization header".to_string()))?;
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();
    if scheme != "Bearer" || token.is_empty() {
        return Err(ApiError::Unauthorized("invalid authorization header".to_string()));
    }
    Ok(token)
}
