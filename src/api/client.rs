//! Authenticated client API
//!
//! The surface a local client uses to act: provision a user, write
//! posts, and manage follows, likes and reposts. Side effects that need
//! federation (Accept, fan-out) are delivered through the federation
//! engine; delivery failures are logged, never surfaced as API errors.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::data::NewAttachment;
use crate::data::models::{Actor, KeyAlgorithm};
use crate::error::{AppError, Result};
use crate::federation::delivery::builder;
use crate::federation::objects::create_activity;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/users", post(create_user))
        .route("/api/v1/posts", post(create_post))
        .route("/api/v1/follows", post(follow).delete(unfollow))
        .route("/api/v1/likes", post(like).delete(unlike))
        .route("/api/v1/reposts", post(repost).delete(unrepost))
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
}

/// Provision a local user with an actor and signing keys
///
/// The API token is returned exactly once, in this response.
async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let username = request.username.trim().to_lowercase();
    if username.is_empty()
        || username.len() > 64
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(
            "username must be 1-64 characters of [a-z0-9_]".to_string(),
        ));
    }

    let user = state.db.create_user(&username).await?;

    // Generate key material up front so the actor document is complete
    // from the first fetch.
    let signing_key = state
        .federation
        .keys
        .get_or_create(user.id, KeyAlgorithm::RsaPkcs1V15)
        .await?;
    state
        .federation
        .keys
        .get_or_create(user.id, KeyAlgorithm::Ed25519)
        .await?;

    let actor = state
        .federation
        .resolver
        .ensure_local_actor(&user, signing_key.public_key_pem()?)
        .await?;

    info!(username = %user.username, actor = %actor.uri, "Provisioned user");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": user.id,
            "username": user.username,
            "actor_uri": actor.uri,
            "handle": actor.handle,
            "api_token": user.api_token,
        })),
    ))
}

#[derive(Deserialize)]
struct AttachmentRequest {
    url: String,
    media_type: String,
    description: Option<String>,
}

#[derive(Deserialize)]
struct CreatePostRequest {
    content: String,
    #[serde(default)]
    attachments: Vec<AttachmentRequest>,
}

/// Create a post and fan it out to followers
///
/// Content arrives as plain text and is HTML-escaped before storage;
/// the API response returns before deliveries complete.
async fn create_post(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("content must not be empty".to_string()));
    }

    let actor = actor_for_user(&state, user.id).await?;
    let html = format!("<p>{}</p>", html_escape::encode_text(content));

    let attachments: Vec<NewAttachment> = request
        .attachments
        .into_iter()
        .map(|a| NewAttachment {
            url: a.url,
            media_type: a.media_type,
            description: a.description,
        })
        .collect();

    let post = state
        .db
        .create_local_post(actor.id, &actor.uri, &html, &attachments)
        .await?;

    let note = state.federation.objects.note_document(&post, &actor).await?;
    let activity = create_activity(&note, &actor);

    let delivery = state.federation.delivery.clone();
    let fan_out_actor = actor.clone();
    tokio::spawn(async move {
        if let Err(e) = delivery.fan_out_to_followers(&fan_out_actor, &activity).await {
            warn!(post = %fan_out_actor.uri, error = %e, "Post fan-out failed");
        }
    });

    Ok((StatusCode::CREATED, Json(serde_json::to_value(&post)?)))
}

#[derive(Deserialize)]
struct FollowRequest {
    handle: String,
}

/// Follow a remote (or local) actor by handle
async fn follow(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<FollowRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let me = actor_for_user(&state, user.id).await?;
    let target = state.federation.resolver.resolve_handle(&request.handle).await?;

    if target.id == me.id {
        return Err(AppError::Validation("cannot follow yourself".to_string()));
    }

    if target.is_local() {
        // No federation round trip needed inside one instance.
        state.db.add_follow(target.id, me.id).await?;
    } else {
        // The edge is recorded when the remote side's Accept arrives.
        let activity = builder::follow(&state.federation.base_url, &me, &target.uri);
        state
            .federation
            .delivery
            .send_to_actor(&me, &activity, &target)
            .await?;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "following": target.uri })),
    ))
}

/// Unfollow: drop the edge locally and send Undo(Follow)
async fn unfollow(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<FollowRequest>,
) -> Result<Json<Value>> {
    let me = actor_for_user(&state, user.id).await?;
    let target = state.federation.resolver.resolve_handle(&request.handle).await?;

    state.db.remove_follow(target.id, me.id).await?;

    if !target.is_local() {
        let inner = json!({
            "type": "Follow",
            "actor": me.uri,
            "object": target.uri,
        });
        let activity = builder::undo(&state.federation.base_url, &me, inner);
        if let Err(e) = state
            .federation
            .delivery
            .send_to_actor(&me, &activity, &target)
            .await
        {
            warn!(target = %target.uri, error = %e, "Undo(Follow) delivery failed");
        }
    }

    Ok(Json(json!({ "unfollowed": target.uri })))
}

#[derive(Deserialize)]
struct PostRefRequest {
    post_uri: String,
}

async fn like(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<PostRefRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let me = actor_for_user(&state, user.id).await?;
    let post = state
        .db
        .get_post_by_uri(&request.post_uri)
        .await?
        .ok_or(AppError::NotFound)?;

    let activity = builder::like(&state.federation.base_url, &me, &post.uri);
    let activity_uri = activity["id"].as_str().unwrap_or_default().to_string();
    state.db.add_like(post.id, me.id, &activity_uri).await?;

    deliver_to_author(&state, &me, &activity, post.actor_id).await?;

    Ok((StatusCode::CREATED, Json(json!({ "liked": post.uri }))))
}

async fn unlike(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<PostRefRequest>,
) -> Result<Json<Value>> {
    let me = actor_for_user(&state, user.id).await?;
    let post = state
        .db
        .get_post_by_uri(&request.post_uri)
        .await?
        .ok_or(AppError::NotFound)?;

    let Some(existing) = state.db.get_like(post.id, me.id).await? else {
        return Ok(Json(json!({ "unliked": post.uri })));
    };

    state.db.remove_like(&existing.activity_uri).await?;

    let inner = json!({
        "type": "Like",
        "id": existing.activity_uri,
        "actor": me.uri,
        "object": post.uri,
    });
    let activity = builder::undo(&state.federation.base_url, &me, inner);
    deliver_to_author(&state, &me, &activity, post.actor_id).await?;

    Ok(Json(json!({ "unliked": post.uri })))
}

async fn repost(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<PostRefRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let me = actor_for_user(&state, user.id).await?;
    let post = state
        .db
        .get_post_by_uri(&request.post_uri)
        .await?
        .ok_or(AppError::NotFound)?;

    let activity = builder::announce(&state.federation.base_url, &me, &post.uri);
    let activity_uri = activity["id"].as_str().unwrap_or_default().to_string();
    state.db.add_repost(post.id, me.id, &activity_uri).await?;

    // Announce goes to the author and to our followers.
    deliver_to_author(&state, &me, &activity, post.actor_id).await?;
    let delivery = state.federation.delivery.clone();
    let fan_out_actor = me.clone();
    tokio::spawn(async move {
        if let Err(e) = delivery.fan_out_to_followers(&fan_out_actor, &activity).await {
            warn!(error = %e, "Announce fan-out failed");
        }
    });

    Ok((StatusCode::CREATED, Json(json!({ "reposted": post.uri }))))
}

async fn unrepost(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(request): Json<PostRefRequest>,
) -> Result<Json<Value>> {
    let me = actor_for_user(&state, user.id).await?;
    let post = state
        .db
        .get_post_by_uri(&request.post_uri)
        .await?
        .ok_or(AppError::NotFound)?;

    let Some(existing) = state.db.get_repost(post.id, me.id).await? else {
        return Ok(Json(json!({ "unreposted": post.uri })));
    };

    state.db.remove_repost(&existing.activity_uri).await?;

    let inner = json!({
        "type": "Announce",
        "id": existing.activity_uri,
        "actor": me.uri,
        "object": post.uri,
    });
    let activity = builder::undo(&state.federation.base_url, &me, inner);
    deliver_to_author(&state, &me, &activity, post.actor_id).await?;
    let delivery = state.federation.delivery.clone();
    let fan_out_actor = me.clone();
    tokio::spawn(async move {
        if let Err(e) = delivery.fan_out_to_followers(&fan_out_actor, &activity).await {
            warn!(error = %e, "Undo(Announce) fan-out failed");
        }
    });

    Ok(Json(json!({ "unreposted": post.uri })))
}

async fn actor_for_user(state: &AppState, user_id: i64) -> Result<Actor> {
    state
        .db
        .get_actor_by_user_id(user_id)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("user has no actor row")))
}

/// Send a directed activity to a post's author when the author is remote
async fn deliver_to_author(
    state: &AppState,
    sender: &Actor,
    activity: &Value,
    author_actor_id: i64,
) -> Result<()> {
    let Some(author) = state.db.get_actor_by_id(author_actor_id).await? else {
        return Ok(());
    };
    if author.is_local() {
        return Ok(());
    }

    if let Err(e) = state
        .federation
        .delivery
        .send_to_actor(sender, activity, &author)
        .await
    {
        warn!(author = %author.uri, error = %e, "Directed delivery failed");
    }
    Ok(())
}
