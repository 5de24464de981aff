//! Outbound activity delivery
//!
//! Fan-out posts one signed copy of an activity to each distinct target
//! inbox. Recipients sharing a shared inbox collapse to a single
//! delivery. Sends run concurrently under a semaphore and failures are
//! logged without failing the triggering operation; there is no retry
//! queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::data::Database;
use crate::data::models::{Actor, Recipient};
use crate::error::{AppError, Result};
use crate::federation::keys::{KeyMaterial, KeyStore};
use crate::federation::signature::sign_request;
use crate::metrics::{ACTIVITIES_SENT_TOTAL, DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

/// Outcome of one inbox delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_url: String,
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Signs and delivers activities to remote inboxes
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Database,
    http: reqwest::Client,
    keys: KeyStore,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(
        db: Database,
        http: reqwest::Client,
        keys: KeyStore,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            http,
            keys,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            timeout,
        }
    }

    /// Deliver an activity from a local actor to every follower
    pub async fn fan_out_to_followers(
        &self,
        sender: &Actor,
        activity: &Value,
    ) -> Result<Vec<DeliveryResult>> {
        let recipients = self.db.all_follower_recipients(sender.id).await?;
        self.deliver(sender, activity, &recipients).await
    }

    /// Deliver an activity to a single actor's personal inbox
    ///
    /// Used for directed activities such as Accept, where the shared
    /// inbox would lose the addressee.
    pub async fn send_to_actor(
        &self,
        sender: &Actor,
        activity: &Value,
        recipient: &Actor,
    ) -> Result<DeliveryResult> {
        let target = Recipient {
            uri: recipient.uri.clone(),
            inbox_url: recipient.inbox_url.clone(),
            shared_inbox_url: None,
        };
        let mut results = self.deliver(sender, activity, &[target]).await?;
        results
            .pop()
            .ok_or_else(|| AppError::Federation("delivery produced no result".to_string()))
    }

    /// Deliver an activity to a set of recipients, one send per inbox
    pub async fn deliver(
        &self,
        sender: &Actor,
        activity: &Value,
        recipients: &[Recipient],
    ) -> Result<Vec<DeliveryResult>> {
        let user_id = sender.user_id.ok_or_else(|| {
            AppError::Federation("only local actors can deliver activities".to_string())
        })?;

        let signing_key = self.keys.signing_key(user_id).await?;
        let private_key = match signing_key.material {
            KeyMaterial::Rsa { private, .. } => private,
            KeyMaterial::Ed25519 { .. } => {
                return Err(AppError::Federation(
                    "signing key must be RSA".to_string(),
                ));
            }
        };

        let inboxes = unique_inboxes(recipients);
        if inboxes.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(activity_type) = activity.get("type").and_then(Value::as_str) {
            ACTIVITIES_SENT_TOTAL
                .with_label_values(&[activity_type])
                .inc();
        }

        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Federation(format!("activity serialization failed: {}", e)))?;
        let key_id = format!("{}#main-key", sender.uri);

        let mut handles = Vec::with_capacity(inboxes.len());
        for inbox_url in inboxes {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::Federation("delivery semaphore closed".to_string()))?;

            let http = self.http.clone();
            let body = body.clone();
            let private_key = private_key.clone();
            let key_id = key_id.clone();
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                deliver_one(http, inbox_url, body, private_key, key_id, timeout).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    let status_label = if result.success { "success" } else { "failure" };
                    DELIVERIES_TOTAL.with_label_values(&[status_label]).inc();
                    if !result.success {
                        warn!(
                            inbox = %result.inbox_url,
                            status = ?result.status,
                            error = ?result.error,
                            "Inbox delivery failed"
                        );
                    }
                    results.push(result);
                }
                Err(e) => {
                    DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                    warn!(error = %e, "Delivery task panicked");
                }
            }
        }

        Ok(results)
    }
}

async fn deliver_one(
    http: reqwest::Client,
    inbox_url: String,
    body: Vec<u8>,
    private_key: rsa::RsaPrivateKey,
    key_id: String,
    timeout: Duration,
) -> DeliveryResult {
    let timer = DELIVERY_DURATION_SECONDS
        .with_label_values(&["all"])
        .start_timer();

    let signed = match sign_request("POST", &inbox_url, Some(&body), &private_key, &key_id) {
        Ok(signed) => signed,
        Err(e) => {
            timer.observe_duration();
            return DeliveryResult {
                inbox_url,
                success: false,
                status: None,
                error: Some(format!("signing failed: {}", e)),
            };
        }
    };

    let mut request = http
        .post(&inbox_url)
        .timeout(timeout)
        .header("Content-Type", "application/activity+json")
        .header("Date", &signed.date)
        .header("Signature", &signed.signature)
        .body(body);
    if let Some(digest) = &signed.digest {
        request = request.header("Digest", digest);
    }

    let result = match request.send().await {
        Ok(response) => {
            let status = response.status();
            debug!(inbox = %inbox_url, status = %status, "Inbox delivery completed");
            DeliveryResult {
                inbox_url,
                success: status.is_success(),
                status: Some(status.as_u16()),
                error: None,
            }
        }
        Err(e) => DeliveryResult {
            inbox_url,
            success: false,
            status: None,
            error: Some(e.to_string()),
        },
    };

    timer.observe_duration();
    result
}

/// Collapse recipients onto their distinct delivery inboxes
///
/// Recipients behind the same shared inbox yield one entry.
fn unique_inboxes(recipients: &[Recipient]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut inboxes = Vec::new();
    for recipient in recipients {
        let inbox = recipient.delivery_inbox();
        if seen.insert(inbox.to_string()) {
            inboxes.push(inbox.to_string());
        }
    }
    inboxes
}

/// Activity document builders for locally initiated actions
pub mod builder {
    use super::*;

    fn activity_id(base_url: &str) -> String {
        format!("{}/activities/{}", base_url, ulid::Ulid::new())
    }

    pub fn follow(base_url: &str, actor: &Actor, target_uri: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(base_url),
            "type": "Follow",
            "actor": actor.uri,
            "object": target_uri,
        })
    }

    /// Accept echoing back the original Follow payload
    pub fn accept(base_url: &str, actor: &Actor, follow_activity: &Value) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(base_url),
            "type": "Accept",
            "actor": actor.uri,
            "object": follow_activity.clone(),
        })
    }

    pub fn like(base_url: &str, actor: &Actor, post_uri: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(base_url),
            "type": "Like",
            "actor": actor.uri,
            "object": post_uri,
        })
    }

    pub fn announce(base_url: &str, actor: &Actor, post_uri: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(base_url),
            "type": "Announce",
            "actor": actor.uri,
            "object": post_uri,
            "to": [crate::federation::objects::PUBLIC_COLLECTION],
            "cc": [format!("{}/followers", actor.uri)],
        })
    }

    /// Undo wrapping a previously sent activity
    ///
    /// The inner object's id is what the receiving side matches on, so
    /// it must be the original activity URI.
    pub fn undo(base_url: &str, actor: &Actor, inner: Value) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": activity_id(base_url),
            "type": "Undo",
            "actor": actor.uri,
            "object": inner,
        })
    }
}
