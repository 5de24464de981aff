//! Discovery endpoints: WebFinger, NodeInfo and host-meta

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::{AppError, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_index))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo_document))
}

#[derive(Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// Resolve `acct:user@domain` (or a bare actor URI) to the actor URI
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse> {
    let resource = query.resource.trim();

    let username = if let Some(acct) = resource.strip_prefix("acct:") {
        let (user, host) = acct
            .split_once('@')
            .ok_or_else(|| AppError::Validation("malformed acct resource".to_string()))?;
        if host != state.federation.domain {
            return Err(AppError::NotFound);
        }
        user.to_string()
    } else if let Some(rest) = resource.strip_prefix(&format!("{}/users/", state.federation.base_url))
    {
        rest.to_string()
    } else {
        return Err(AppError::NotFound);
    };

    let actor_uri = state.federation.resolver.local_actor_uri(&username);
    let actor = state
        .db
        .get_actor_by_uri(&actor_uri)
        .await?
        .filter(|a| a.is_local())
        .ok_or(AppError::NotFound)?;

    let jrd = json!({
        "subject": format!("acct:{}", actor.handle),
        "aliases": [actor.uri],
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": actor.uri,
            }
        ],
    });

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        jrd.to_string(),
    ))
}

async fn nodeinfo_index(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", state.federation.base_url),
            }
        ]
    }))
}

async fn nodeinfo_document(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(state.db.pool())
        .await
        .map_err(AppError::Database)?;

    Ok(axum::Json(json!({
        "version": "2.0",
        "software": {
            "name": "roost",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "protocols": ["activitypub"],
        "services": { "inbound": [], "outbound": [] },
        "openRegistrations": false,
        "usage": {
            "users": { "total": user_count },
        },
        "metadata": {},
    })))
}

async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>
"#,
        state.federation.base_url
    );
    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
