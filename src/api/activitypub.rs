//! ActivityPub HTTP endpoints
//!
//! Serves actor, note and collection documents, and receives inbound
//! activities on the per-actor and shared inboxes. Inbox requests are
//! verified against the sender's key before any processing happens;
//! verification failure returns 401 and mutates nothing.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::{AppError, Result};
use crate::federation::objects::parse_cursor;
use crate::federation::signature::{
    extract_signature_key_id, key_id_matches_actor, verify_signature,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor_document))
        .route("/users/:username/posts/:post_id", get(note_document))
        .route("/users/:username/followers", get(followers_collection))
        .route("/users/:username/following", get(following_collection))
        .route("/users/:username/outbox", get(outbox_collection))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(inbox))
}

/// JSON body served with the ActivityPub media type
struct ActivityJson(Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        (
            [(header::CONTENT_TYPE, "application/activity+json")],
            self.0.to_string(),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct CursorQuery {
    cursor: Option<String>,
}

async fn local_actor(state: &AppState, username: &str) -> Result<crate::data::models::Actor> {
    let uri = state.federation.resolver.local_actor_uri(username);
    let actor = state
        .db
        .get_actor_by_uri(&uri)
        .await?
        .ok_or(AppError::NotFound)?;
    if !actor.is_local() {
        return Err(AppError::NotFound);
    }
    Ok(actor)
}

async fn actor_document(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson> {
    let actor = local_actor(&state, &username).await?;
    let user_id = actor.user_id.ok_or(AppError::NotFound)?;
    let keys = state.federation.keys.get_or_create_all(user_id).await?;
    let document = state.federation.objects.actor_document(&actor, &keys)?;
    Ok(ActivityJson(document))
}

async fn note_document(
    State(state): State<AppState>,
    Path((username, post_id)): Path<(String, i64)>,
) -> Result<ActivityJson> {
    let actor = local_actor(&state, &username).await?;
    let post = state
        .db
        .get_post_by_id(post_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if post.actor_id != actor.id || !post.is_local {
        return Err(AppError::NotFound);
    }

    let document = state.federation.objects.note_document(&post, &actor).await?;
    Ok(ActivityJson(document))
}

async fn followers_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<CursorQuery>,
) -> Result<ActivityJson> {
    let actor = local_actor(&state, &username).await?;
    let cursor = parse_cursor(query.cursor.as_deref())?;
    let document = state
        .federation
        .objects
        .followers_collection(&actor, cursor)
        .await?;
    Ok(ActivityJson(document))
}

async fn following_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<CursorQuery>,
) -> Result<ActivityJson> {
    let actor = local_actor(&state, &username).await?;
    let cursor = parse_cursor(query.cursor.as_deref())?;
    let document = state
        .federation
        .objects
        .following_collection(&actor, cursor)
        .await?;
    Ok(ActivityJson(document))
}

async fn outbox_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<CursorQuery>,
) -> Result<ActivityJson> {
    let actor = local_actor(&state, &username).await?;
    let cursor = parse_cursor(query.cursor.as_deref())?;
    let document = state
        .federation
        .objects
        .outbox_collection(&actor, cursor)
        .await?;
    Ok(ActivityJson(document))
}

/// A signing key we cannot obtain makes the signature unverifiable, and
/// an unverifiable activity is rejected like an invalid one rather than
/// answered with a server error the sender would retry against. Only
/// local database failures still surface as 500s.
fn key_resolution_error(key_id: &str, err: AppError) -> AppError {
    match err {
        AppError::Database(e) => AppError::Database(e),
        other => {
            debug!(key_id, error = %other, "Could not resolve signing key, rejecting");
            AppError::InvalidSignature
        }
    }
}

/// Shared and per-actor inbox
///
/// Verification order: signature header present, keyId belongs to the
/// activity's actor, signature valid against that actor's key. Only then
/// is the activity handed to processing. A stale cached key gets one
/// refetch before the request is rejected.
async fn inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    if !headers.contains_key("signature") {
        return Err(AppError::Unauthorized);
    }
    let key_id = extract_signature_key_id(&headers)?;

    let activity: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("malformed activity JSON: {}", e)))?;
    let actor_uri = activity
        .get("actor")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("activity has no actor".to_string()))?;

    if !key_id_matches_actor(&key_id, actor_uri) {
        warn!(key_id, actor = actor_uri, "Signature keyId does not match activity actor");
        return Err(AppError::InvalidSignature);
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let resolver = &state.federation.resolver;
    let pem = resolver
        .public_key_for(&key_id, false)
        .await
        .map_err(|e| key_resolution_error(&key_id, e))?;

    let verified = match verify_signature("POST", &path_and_query, &headers, Some(&body), &pem) {
        Ok(()) => Ok(()),
        Err(AppError::InvalidSignature) => {
            // The sender may have rotated keys since we cached theirs.
            debug!(key_id, "Signature failed with cached key, refetching");
            let fresh = resolver
                .public_key_for(&key_id, true)
                .await
                .map_err(|e| key_resolution_error(&key_id, e))?;
            verify_signature("POST", &path_and_query, &headers, Some(&body), &fresh)
        }
        Err(other) => Err(other),
    };
    verified?;

    state.federation.inbox.process(&activity).await?;
    Ok(StatusCode::ACCEPTED)
}
