use axum::{
    extract::{MatchedPath, Request},
    http::header,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Logs one `request_completed` line per request under the `metrics` target.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let ranged = req.headers().contains_key(header::RANGE);

    let response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status();
    let content_length = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    info!(
        target: "metrics",
        method = %method,
        route = %route,
        status = status.as_u16(),
        ranged,
        content_length,
        latency_ms = latency.as_millis() as u64,
        "request_completed"
    );

    response
}
