use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /api/health: 200 while the dispatcher and every worker heartbeat
/// and the database answers; 503 otherwise.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let database = state.store.ping();
    let healthy = database && state.health.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "unhealthy" },
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "profile": state.config.profile,
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
            "database": database,
            "components": state.health.snapshot(),
            "events": state.store.status_counts().ok(),
        })),
    )
}
