//! HTTP boundary: the event webhook and plugin-owned callback paths.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::EventError;
use crate::lark::validator::{EventValidator, SignatureHeaders, Validated};
use crate::plugin::dispatcher::Dispatcher;
use crate::plugin::PathRequest;

#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<EventValidator>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(webhook))
        .fallback(path_callback)
        .with_state(state)
}

fn accepted() -> Json<Value> {
    Json(json!({ "code": 0, "msg": "success" }))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, EventError> {
    let signature = SignatureHeaders::from_headers(&headers);
    let validated = state.validator.validate(&body, &signature).map_err(|e| {
        warn!(status = %e.status(), "Rejected webhook: {}", e);
        e
    })?;

    match validated {
        Validated::Challenge(challenge) => {
            debug!("Answered URL verification");
            Ok(Json(json!({ "challenge": challenge })))
        }
        Validated::Event(event) => {
            debug!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                "Accepted event"
            );
            state.dispatcher.spawn_event(event);
            Ok(accepted())
        }
    }
}

async fn path_callback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    if state.dispatcher.registry().route_for_path(path).is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" }))).into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let request = PathRequest::new(method.as_str(), path, uri.query(), content_type, body);
    debug!(path = %request.path, method = %request.method, "Accepted path callback");
    state.dispatcher.spawn_path(request);
    accepted().into_response()
}
