use axum::{extract::State, http::StatusCode, routing::get, Router};
use tracing::{info, warn};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/ready", get(ready))
}

async fn health() -> &'static str {
    info!("GET /health - Health check");
    "OK"
}

/// Ready once the request-side store answers.
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "READY"),
        Err(e) => {
            warn!("GET /health/ready - store not ready: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}
