use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use nanoid::nanoid;
use tracing::info;

use crate::state::RequestId;

/// Tags the request with an id, echoes it in `X-Request-Id` and logs the
/// outcome.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id = format!("req_{}", nanoid!(16));
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut resp = next.run(req).await;

    info!(
        request_id = %request_id,
        %method,
        path = %redact_token(&path),
        status = resp.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    if let Ok(value) = request_id.parse() {
        resp.headers_mut().insert("X-Request-Id", value);
    }
    resp
}

/// `/v1/subscriptions/<token>/...` with the token replaced.
fn redact_token(path: &str) -> String {
    match path.strip_prefix("/v1/subscriptions/") {
        Some(rest) => {
            let tail = rest.find('/').map(|idx| &rest[idx..]).unwrap_or("");
            format!("/v1/subscriptions/:token{}", tail)
        }
        None => path.to_string(),
    }
}
