//! ActivityPub endpoints
//!
//! - Person, repository and instance actor documents
//! - Person and repository inboxes

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::activity::link_id;
use crate::federation::{
    InboundActivity, InboxOutcome, InboxOwner, extract_signature_key_id, key_id_matches_actor,
    verify_signature,
};
use crate::metrics::HTTP_REQUESTS_TOTAL;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /api/v1/activitypub/user-id/:id - Person actor
/// - POST /api/v1/activitypub/user-id/:id/inbox - Person inbox
/// - GET /api/v1/activitypub/repository-id/:id - Repository actor
/// - POST /api/v1/activitypub/repository-id/:id/inbox - Repository inbox
/// - GET /api/v1/activitypub/actor - Instance actor
/// - POST /api/v1/activitypub/actor/inbox - Instance actor inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/activitypub/user-id/:id", get(person))
        .route("/api/v1/activitypub/user-id/:id/inbox", post(person_inbox))
        .route("/api/v1/activitypub/repository-id/:id", get(repository))
        .route(
            "/api/v1/activitypub/repository-id/:id/inbox",
            post(repository_inbox),
        )
        .route("/api/v1/activitypub/actor", get(server_actor))
        .route("/api/v1/activitypub/actor/inbox", post(server_actor_inbox))
}

fn activity_json(endpoint: &str, document: Value) -> Response {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", endpoint, "200"])
        .inc();
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(document)).into_response()
}

/// GET /api/v1/activitypub/user-id/:id
async fn person(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    match state.db.get_user(id).await? {
        Some(user) if !user.is_remote => Ok(activity_json(
            "/api/v1/activitypub/user-id/:id",
            state.federation.urls.person_document(&user),
        )),
        _ => Err(AppError::NotFound),
    }
}

/// GET /api/v1/activitypub/repository-id/:id
async fn repository(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let repository = state
        .db
        .get_repository(id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(activity_json(
        "/api/v1/activitypub/repository-id/:id",
        state.federation.urls.repository_document(&repository),
    ))
}

/// GET /api/v1/activitypub/actor
async fn server_actor(State(state): State<AppState>) -> Response {
    let federation = &state.federation;
    activity_json(
        "/api/v1/activitypub/actor",
        federation
            .urls
            .server_actor_document(&federation.server_public_key_pem),
    )
}

/// POST /api/v1/activitypub/user-id/:id/inbox
async fn person_inbox(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    const ENDPOINT: &str = "/api/v1/activitypub/user-id/:id/inbox";
    let result: Result<InboxOutcome, AppError> = async {
        ensure_federation_enabled(&state)?;
        let user = match state.db.get_user(id).await? {
            Some(user) if !user.is_remote => user,
            _ => return Err(AppError::NotFound),
        };
        receive(&state, InboxOwner::Person(user), &uri, &headers, &body).await
    }
    .await;
    respond(ENDPOINT, result)
}

/// POST /api/v1/activitypub/repository-id/:id/inbox
async fn repository_inbox(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    const ENDPOINT: &str = "/api/v1/activitypub/repository-id/:id/inbox";
    let result: Result<InboxOutcome, AppError> = async {
        ensure_federation_enabled(&state)?;
        let repository = state
            .db
            .get_repository(id)
            .await?
            .ok_or(AppError::NotFound)?;
        receive(
            &state,
            InboxOwner::Repository(repository),
            &uri,
            &headers,
            &body,
        )
        .await
    }
    .await;
    respond(ENDPOINT, result)
}

/// POST /api/v1/activitypub/actor/inbox
///
/// Signed deliveries are acknowledged; nothing addressed to the instance
/// actor changes local state.
async fn server_actor_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    const ENDPOINT: &str = "/api/v1/activitypub/actor/inbox";
    let result: Result<InboxOutcome, AppError> = async {
        ensure_federation_enabled(&state)?;
        let raw = parse_json(&body)?;
        authenticate(&state, &raw, &uri, &headers, &body).await?;
        Ok(InboxOutcome::NoContent)
    }
    .await;
    respond(ENDPOINT, result)
}

fn ensure_federation_enabled(state: &AppState) -> Result<(), AppError> {
    if state.config.federation.enabled {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

fn parse_json(body: &[u8]) -> Result<Value, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))
}

/// Verify, parse and process one inbound activity.
async fn receive(
    state: &AppState,
    owner: InboxOwner,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<InboxOutcome, AppError> {
    let raw = parse_json(body)?;
    authenticate(state, &raw, uri, headers, body).await?;

    let activity = InboundActivity::from_value(raw)?;
    state.federation.inbox.process(&owner, activity).await
}

/// Check the HTTP signature of an inbound POST.
///
/// The signing key must belong to the activity's actor. A stored key that
/// fails to verify is re-fetched once, to pick up a rotation.
async fn authenticate(
    state: &AppState,
    raw: &Value,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    if !state.config.federation.signature_enforced {
        return Ok(());
    }

    if headers.get("signature").is_none() {
        return Err(AppError::Unauthorized);
    }

    let actor_id = raw
        .get("actor")
        .and_then(link_id)
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    // Ensure keyId points to the same actor before fetching remote key material.
    let key_id = extract_signature_key_id(headers)?;
    if !key_id_matches_actor(&key_id, actor_id) {
        return Err(AppError::TrustViolation(format!(
            "key {key_id} does not belong to {actor_id}"
        )));
    }

    let keys = &state.federation.keys;
    let resolved = keys.resolve_key(&key_id).await?;
    let path = uri.path();

    match verify_signature("POST", path, headers, Some(body), &resolved.public_key) {
        Err(AppError::InvalidSignature) if resolved.from_cache => {
            tracing::debug!(key_id = %key_id, "Stored key failed to verify; refetching");
            let refreshed = keys.refresh_key(&key_id).await?;
            verify_signature("POST", path, headers, Some(body), &refreshed.public_key)
        }
        other => other,
    }
}

fn respond(endpoint: &str, result: Result<InboxOutcome, AppError>) -> Result<Response, AppError> {
    let status = match &result {
        Ok(InboxOutcome::Accepted) => StatusCode::ACCEPTED,
        Ok(InboxOutcome::NoContent) => StatusCode::NO_CONTENT,
        Err(e) => e.status_code(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, status.as_str()])
        .inc();

    Ok(match result? {
        InboxOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "Accepted" })),
        )
            .into_response(),
        InboxOutcome::NoContent => StatusCode::NO_CONTENT.into_response(),
    })
}
