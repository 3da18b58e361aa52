//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use messaging::InMemoryMessageChannel;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker: &'static str,
}

/// GET /health: 200 while the broker is open, 503 once it has closed.
pub async fn check(State(channel): State<InMemoryMessageChannel>) -> (StatusCode, Json<HealthResponse>) {
    if channel.is_closed().await {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                broker: "closed",
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                broker: "open",
            }),
        )
    }
}
