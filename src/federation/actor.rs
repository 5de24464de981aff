//! Actor resolution
//!
//! Remote actors are fetched on first contact, cached in the actors
//! table, and refreshed by upsert on later contact (which is also how
//! rotated keys are picked up). Local actors are provisioned alongside
//! their user row. Cached actors are never evicted; the URI is the
//! stable identity.

use serde_json::Value;

use crate::data::models::{Actor, User};
use crate::data::{ActorRecord, Database};
use crate::error::{AppError, Result};
use crate::federation::signature::extract_actor_domain;

/// Resolves actor URIs and handles to cached actor rows
#[derive(Clone)]
pub struct ActorResolver {
    db: Database,
    http: reqwest::Client,
    base_url: String,
    domain: String,
}

impl ActorResolver {
    pub fn new(db: Database, http: reqwest::Client, base_url: String, domain: String) -> Self {
        Self {
            db,
            http,
            base_url,
            domain,
        }
    }

    /// Canonical URI for a local username
    pub fn local_actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    /// Whether a URI belongs to this instance
    pub fn is_local_uri(&self, uri: &str) -> bool {
        uri.starts_with(&format!("{}/", self.base_url)) || uri == self.base_url
    }

    /// Create or refresh the actor row for a local user
    pub async fn ensure_local_actor(
        &self,
        user: &User,
        public_key_pem: Option<String>,
    ) -> Result<Actor> {
        let uri = self.local_actor_uri(&user.username);
        self.db
            .upsert_actor(&ActorRecord {
                user_id: Some(user.id),
                uri: uri.clone(),
                handle: format!("{}@{}", user.username, self.domain),
                name: Some(user.username.clone()),
                inbox_url: format!("{}/inbox", uri),
                shared_inbox_url: Some(format!("{}/inbox", self.base_url)),
                url: Some(uri),
                public_key_pem,
            })
            .await
    }

    /// Resolve an actor URI, fetching and caching it if unknown
    pub async fn resolve(&self, uri: &str) -> Result<Actor> {
        if let Some(actor) = self.db.get_actor_by_uri(uri).await? {
            return Ok(actor);
        }
        self.fetch_and_cache(uri).await
    }

    /// Fetch an actor document and upsert the cached row
    ///
    /// Used both for first contact and for forced refresh after a
    /// signature check fails against a stale cached key.
    pub async fn fetch_and_cache(&self, uri: &str) -> Result<Actor> {
        let document = self.fetch_actor_document(uri).await?;
        let record = record_from_document(&document, uri)?;
        self.db.upsert_actor(&record).await
    }

    /// Resolve the public key a signature's keyId points at
    ///
    /// Serves from the actor cache when possible; `force_refresh` skips
    /// the cache so callers can retry once after a rotation.
    pub async fn public_key_for(&self, key_id: &str, force_refresh: bool) -> Result<String> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);

        if !force_refresh {
            if let Some(actor) = self.db.get_actor_by_uri(actor_uri).await? {
                if let Some(pem) = actor.public_key_pem {
                    return Ok(pem);
                }
            }
        }

        let document = self.fetch_actor_document(actor_uri).await?;

        // When the keyId carries a fragment, the actor must advertise
        // exactly that key id.
        let public_key = document
            .get("publicKey")
            .ok_or_else(|| AppError::Federation("actor document has no publicKey".to_string()))?;
        if key_id.contains('#') {
            let advertised = public_key
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::Federation("publicKey has no id".to_string()))?;
            if advertised != key_id {
                return Err(AppError::Validation(
                    "signature keyId does not match actor's advertised key".to_string(),
                ));
            }
        }

        let record = record_from_document(&document, actor_uri)?;
        let actor = self.db.upsert_actor(&record).await?;

        actor
            .public_key_pem
            .ok_or_else(|| AppError::Federation("actor document has no publicKeyPem".to_string()))
    }

    /// Resolve a `user@host` handle through WebFinger
    pub async fn resolve_handle(&self, handle: &str) -> Result<Actor> {
        let handle = handle.trim_start_matches('@');
        let (user, host) = handle
            .split_once('@')
            .ok_or_else(|| AppError::Validation(format!("invalid handle: {}", handle)))?;

        if host == self.domain {
            let uri = self.local_actor_uri(user);
            return self
                .db
                .get_actor_by_uri(&uri)
                .await?
                .ok_or(AppError::NotFound);
        }

        let webfinger_url = format!(
            "https://{}/.well-known/webfinger?resource={}",
            host,
            urlencoding::encode(&format!("acct:{}@{}", user, host))
        );

        let response = self
            .http
            .get(&webfinger_url)
            .header("Accept", "application/jrd+json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("WebFinger lookup failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "WebFinger lookup failed: HTTP {}",
                response.status()
            )));
        }

        let jrd: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("malformed WebFinger response: {}", e)))?;

        let actor_uri = jrd
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|link| {
                    link.get("rel").and_then(Value::as_str) == Some("self")
                        && link
                            .get("type")
                            .and_then(Value::as_str)
                            .map(|t| t.contains("activity+json"))
                            .unwrap_or(false)
                })
            })
            .and_then(|link| link.get("href").and_then(Value::as_str))
            .ok_or_else(|| {
                AppError::Federation("WebFinger response has no self link".to_string())
            })?;

        self.resolve(actor_uri).await
    }

    async fn fetch_actor_document(&self, uri: &str) -> Result<Value> {
        // Scheme and host filtering before any network traffic.
        extract_actor_domain(uri)?;

        let response = self
            .http
            .get(uri)
            .header("Accept", "application/activity+json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("actor fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "actor fetch failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("malformed actor document: {}", e)))
    }
}

/// Map an actor document onto the cached row shape
fn record_from_document(document: &Value, uri: &str) -> Result<ActorRecord> {
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Federation("actor document has no id".to_string()))?;
    if id != uri {
        return Err(AppError::Validation(
            "actor document id does not match fetched URI".to_string(),
        ));
    }

    let host = extract_actor_domain(uri)?;
    let username = document
        .get("preferredUsername")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AppError::Federation("actor document has no preferredUsername".to_string())
        })?;

    let inbox_url = document
        .get("inbox")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Federation("actor document has no inbox".to_string()))?;

    let shared_inbox_url = document
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let public_key_pem = document
        .get("publicKey")
        .and_then(|k| k.get("publicKeyPem"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ActorRecord {
        user_id: None,
        uri: uri.to_string(),
        handle: format!("{}@{}", username, host),
        name: document
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
        inbox_url: inbox_url.to_string(),
        shared_inbox_url,
        url: document
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string),
        public_key_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/users/alice",
            "type": "Person",
            "preferredUsername": "alice",
            "name": "Alice",
            "inbox": "https://remote.example/users/alice/inbox",
            "endpoints": { "sharedInbox": "https://remote.example/inbox" },
            "url": "https://remote.example/@alice",
            "publicKey": {
                "id": "https://remote.example/users/alice#main-key",
                "owner": "https://remote.example/users/alice",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----\n"
            }
        })
    }

    #[test]
    fn record_from_document_maps_fields() {
        let record =
            record_from_document(&sample_document(), "https://remote.example/users/alice")
                .expect("valid document");

        assert_eq!(record.handle, "alice@remote.example");
        assert_eq!(record.inbox_url, "https://remote.example/users/alice/inbox");
        assert_eq!(
            record.shared_inbox_url.as_deref(),
            Some("https://remote.example/inbox")
        );
        assert!(record.public_key_pem.is_some());
        assert!(record.user_id.is_none());
    }

    #[test]
    fn record_from_document_rejects_id_mismatch() {
        let result =
            record_from_document(&sample_document(), "https://other.example/users/alice");
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn record_from_document_tolerates_missing_optionals() {
        let document = json!({
            "id": "https://remote.example/users/bob",
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": "https://remote.example/users/bob/inbox"
        });

        let record = record_from_document(&document, "https://remote.example/users/bob")
            .expect("minimal document");
        assert!(record.shared_inbox_url.is_none());
        assert!(record.public_key_pem.is_none());
        assert!(record.name.is_none());
    }
}
