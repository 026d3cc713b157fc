//! Submission and query endpoints.
//!
//! POST /api/save_emails
//!   Request:  `{"subject", "content", "timestamp", "recipients"}`
//!             (`recipients` is a comma-separated string or a list)
//!   Response: 201 `{"message": "...", "id": 1}`, 400 `{"message": "..."}`
//!
//! GET /api/events/{id}: one event, 404 when unknown
//! GET /api/events?status=&limit=&offset=: newest first

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use mailsched_core::{Event, EventId, EventStatus, SubmitRequest};
use mailsched_store::{ListFilter, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{api_error, ApiError, ApiResult};
use crate::app::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
pub struct SaveReply {
    pub message: String,
    pub id: EventId,
}

/// POST /api/save_emails: validate and schedule one email.
pub async fn save_emails(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SaveReply>)> {
    let Json(req) = payload.map_err(|rejection| {
        warn!("malformed save_emails body: {}", rejection.body_text());
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid request data: {}", rejection.body_text()),
        )
    })?;

    let new = req.validate(state.zone).map_err(|e| {
        warn!(code = e.code(), "validation error in save_emails: {e}");
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                message: format!("Validation error: {e}"),
                code: Some(e.code()),
            }),
        )
    })?;

    match state.store.create(&new) {
        Ok(id) => {
            info!(event_id = id, scheduled_at = %new.scheduled_at, "email scheduled");
            Ok((
                StatusCode::CREATED,
                Json(SaveReply {
                    message: "Event successfully saved to scheduler".to_string(),
                    id,
                }),
            ))
        }
        Err(StoreError::Validation(e)) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Validation error: {e}"),
        )),
        Err(e) => {
            error!("save_emails store failure: {e}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error occurred",
            ))
        }
    }
}

/// GET /api/events/{id}
pub async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
) -> ApiResult<Json<Event>> {
    match state.store.get(id) {
        Ok(event) => Ok(Json(event)),
        Err(StoreError::NotFound { .. }) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Event with ID {id} not found"),
        )),
        Err(e) => {
            error!(event_id = id, "get_event store failure: {e}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error occurred",
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub limit: usize,
    pub offset: usize,
}

/// GET /api/events: newest first, optionally filtered by status.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<EventPage>> {
    let status = match q.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<EventStatus>()
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };
    let filter = ListFilter {
        status,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        offset: q.offset.unwrap_or(0),
    };

    let events = state.store.list(&filter).map_err(|e| {
        error!("list_events store failure: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "An unexpected error occurred")
    })?;

    Ok(Json(EventPage {
        events,
        limit: filter.limit,
        offset: filter.offset,
    }))
}
