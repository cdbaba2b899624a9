//! HTTP middleware

pub mod rate_limit;

use axum::{extract::Request, middleware::Next, response::Response};
use propbot_common::metrics::RequestMetrics;

pub use rate_limit::{create_rate_limiter, rate_limit_middleware, RateLimitState};

/// Record count and latency for every request
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let metrics = RequestMetrics::start(request.method().as_str(), request.uri().path());
    let response = next.run(request).await;
    metrics.finish(response.status().as_u16());
    response
}
