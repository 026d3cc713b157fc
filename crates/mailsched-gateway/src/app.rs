use std::sync::Arc;

use axum::{routing::get, routing::post, Router};
use chrono::{DateTime, Utc};
use mailsched_core::{config::MailschedConfig, HealthHandle, InputZone};
use mailsched_store::EventStore;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: MailschedConfig,
    pub store: Arc<EventStore>,
    pub health: HealthHandle,
    /// Zone applied to submitted timestamps that carry no offset.
    pub zone: InputZone,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: MailschedConfig,
        store: Arc<EventStore>,
        health: HealthHandle,
        zone: InputZone,
    ) -> Self {
        Self {
            config,
            store,
            health,
            zone,
            started_at: Utc::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(crate::http::health::health_handler))
        .route("/api/save_emails", post(crate::http::events::save_emails))
        .route("/api/events", get(crate::http::events::list_events))
        .route("/api/events/{id}", get(crate::http::events::get_event))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use mailsched_core::HealthRegistry;

    use super::*;

    pub fn state() -> Arc<AppState> {
        state_with_health(HealthRegistry::shared(Duration::from_secs(60)))
    }

    pub fn state_with_health(health: HealthHandle) -> Arc<AppState> {
        let config = MailschedConfig::for_testing();
        let store = EventStore::open(&config.database.path, config.database.busy_timeout_ms)
            .expect("in-memory store");
        Arc::new(AppState::new(config, Arc::new(store), health, InputZone::Utc))
    }
}
