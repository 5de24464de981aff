//! Client API authentication
//!
//! The client API uses opaque bearer tokens minted at user creation.
//! Handlers take [`AuthenticatedUser`] as an extractor; unauthenticated
//! requests never reach them.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::AppState;
use crate::data::models::User;
use crate::error::AppError;

/// The user a valid bearer token resolves to
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AppError::Unauthorized)?;

        let user = state
            .db
            .get_user_by_token(token)
            .await?
            .ok_or(AppError::Unauthorized)?;

        Ok(AuthenticatedUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_auth(value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/posts");
        if let Some(value) = value {
            builder = builder.header("authorization", value);
        }
        let (parts, ()) = builder.body(()).expect("request").into_parts();
        parts
    }

    #[test]
    fn extracts_bearer_token() {
        let parts = parts_with_auth(Some("Bearer roost_abc123"));
        assert_eq!(bearer_token(&parts), Some("roost_abc123"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert_eq!(bearer_token(&parts_with_auth(None)), None);
        assert_eq!(bearer_token(&parts_with_auth(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&parts_with_auth(Some("Bearer "))), None);
    }
}
