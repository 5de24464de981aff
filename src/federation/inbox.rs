//! Inbound activity processing
//!
//! Activities arrive here after their HTTP signature has been verified.
//! Processing is lenient: malformed or unsupported payloads are logged
//! and dropped so remote servers do not retry them forever, while
//! database failures propagate and surface as server errors.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::data::Database;
use crate::data::models::Actor;
use crate::error::Result;
use crate::federation::actor::ActorResolver;
use crate::federation::delivery::{DeliveryEngine, builder};
use crate::metrics::ACTIVITIES_RECEIVED_TOTAL;

/// The activity vocabulary this server handles
///
/// A closed set; anything else is dropped at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Follow,
    Accept,
    Undo,
    Like,
    Announce,
    Create,
}

impl ActivityKind {
    pub fn parse(activity_type: &str) -> Option<Self> {
        match activity_type {
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Create" => Some(Self::Create),
            _ => None,
        }
    }
}

/// Applies verified inbound activities to local state
#[derive(Clone)]
pub struct InboxProcessor {
    db: Database,
    resolver: ActorResolver,
    delivery: DeliveryEngine,
    base_url: String,
}

impl InboxProcessor {
    pub fn new(
        db: Database,
        resolver: ActorResolver,
        delivery: DeliveryEngine,
        base_url: String,
    ) -> Self {
        Self {
            db,
            resolver,
            delivery,
            base_url,
        }
    }

    /// Process one verified activity
    ///
    /// The signature check has already bound `activity.actor` to the
    /// request, so the actor field is trusted here.
    pub async fn process(&self, activity: &Value) -> Result<()> {
        let Some(activity_type) = activity.get("type").and_then(Value::as_str) else {
            warn!("Dropping activity without a type");
            return Ok(());
        };

        ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[activity_type])
            .inc();

        let Some(kind) = ActivityKind::parse(activity_type) else {
            debug!(activity_type, "Ignoring unsupported activity type");
            return Ok(());
        };

        let Some(actor_uri) = activity.get("actor").and_then(Value::as_str) else {
            warn!(activity_type, "Dropping activity without an actor");
            return Ok(());
        };

        let sender = match self.resolver.resolve(actor_uri).await {
            Ok(sender) => sender,
            Err(e) => {
                warn!(actor = actor_uri, error = %e, "Could not resolve activity sender");
                return Ok(());
            }
        };

        match kind {
            ActivityKind::Follow => self.handle_follow(&sender, activity).await,
            ActivityKind::Accept => self.handle_accept(&sender, activity).await,
            ActivityKind::Undo => self.handle_undo(&sender, activity).await,
            ActivityKind::Like => self.handle_like(&sender, activity).await,
            ActivityKind::Announce => self.handle_announce(&sender, activity).await,
            ActivityKind::Create => self.handle_create(&sender, activity).await,
        }
    }

    /// Follow of a local actor: record the edge and send Accept back
    async fn handle_follow(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(target_uri) = object_uri(activity.get("object")) else {
            warn!("Dropping Follow without an object");
            return Ok(());
        };

        let Some(target) = self.db.get_actor_by_uri(target_uri).await? else {
            warn!(target = target_uri, "Dropping Follow of unknown actor");
            return Ok(());
        };
        if !target.is_local() {
            warn!(target = target_uri, "Dropping Follow of non-local actor");
            return Ok(());
        }

        self.db.add_follow(target.id, sender.id).await?;
        info!(follower = %sender.uri, followed = %target.uri, "Recorded follower");

        let accept = builder::accept(&self.base_url, &target, activity);
        if let Err(e) = self.delivery.send_to_actor(&target, &accept, sender).await {
            warn!(follower = %sender.uri, error = %e, "Accept delivery failed");
        }

        Ok(())
    }

    /// Accept of a Follow we sent: record that we now follow the sender
    async fn handle_accept(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(follow) = activity.get("object").filter(|o| o.is_object()) else {
            warn!("Dropping Accept without an embedded Follow");
            return Ok(());
        };
        if follow.get("type").and_then(Value::as_str) != Some("Follow") {
            debug!("Ignoring Accept of a non-Follow object");
            return Ok(());
        }

        let Some(follower_uri) = follow.get("actor").and_then(Value::as_str) else {
            warn!("Dropping Accept whose Follow has no actor");
            return Ok(());
        };
        let Some(follower) = self.db.get_actor_by_uri(follower_uri).await? else {
            warn!(follower = follower_uri, "Dropping Accept for unknown follower");
            return Ok(());
        };
        if !follower.is_local() {
            warn!(follower = follower_uri, "Dropping Accept for non-local follower");
            return Ok(());
        }

        self.db.add_follow(sender.id, follower.id).await?;
        info!(follower = %follower.uri, followed = %sender.uri, "Follow accepted");
        Ok(())
    }

    /// Undo of Follow, Like or Announce
    ///
    /// Deletes are tolerant of ordering: undoing something never seen is
    /// a no-op, not an error.
    async fn handle_undo(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(inner) = activity.get("object").filter(|o| o.is_object()) else {
            warn!("Dropping Undo without an embedded object");
            return Ok(());
        };

        match inner.get("type").and_then(Value::as_str) {
            Some("Follow") => {
                let Some(target_uri) = object_uri(inner.get("object")) else {
                    warn!("Dropping Undo(Follow) without a target");
                    return Ok(());
                };
                let Some(target) = self.db.get_actor_by_uri(target_uri).await? else {
                    return Ok(());
                };
                self.db.remove_follow(target.id, sender.id).await?;
                info!(follower = %sender.uri, followed = %target.uri, "Removed follower");
            }
            Some("Like") => {
                if let Some(like_uri) = inner.get("id").and_then(Value::as_str) {
                    self.db.remove_like(like_uri).await?;
                    debug!(like = like_uri, "Removed like");
                }
            }
            Some("Announce") => {
                if let Some(announce_uri) = inner.get("id").and_then(Value::as_str) {
                    self.db.remove_repost(announce_uri).await?;
                    debug!(announce = announce_uri, "Removed repost");
                }
            }
            other => {
                debug!(object_type = ?other, "Ignoring Undo of unsupported object");
            }
        }

        Ok(())
    }

    async fn handle_like(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(activity_uri) = activity.get("id").and_then(Value::as_str) else {
            warn!("Dropping Like without an id");
            return Ok(());
        };
        let Some(post_uri) = object_uri(activity.get("object")) else {
            warn!("Dropping Like without an object");
            return Ok(());
        };
        let Some(post) = self.db.get_post_by_uri(post_uri).await? else {
            debug!(post = post_uri, "Ignoring Like of unknown post");
            return Ok(());
        };

        self.db.add_like(post.id, sender.id, activity_uri).await?;
        debug!(post = post_uri, actor = %sender.uri, "Recorded like");
        Ok(())
    }

    async fn handle_announce(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(activity_uri) = activity.get("id").and_then(Value::as_str) else {
            warn!("Dropping Announce without an id");
            return Ok(());
        };
        let Some(post_uri) = object_uri(activity.get("object")) else {
            warn!("Dropping Announce without an object");
            return Ok(());
        };
        let Some(post) = self.db.get_post_by_uri(post_uri).await? else {
            debug!(post = post_uri, "Ignoring Announce of unknown post");
            return Ok(());
        };

        self.db.add_repost(post.id, sender.id, activity_uri).await?;
        debug!(post = post_uri, actor = %sender.uri, "Recorded repost");
        Ok(())
    }

    /// Create(Note): persist the remote note with sanitized content
    async fn handle_create(&self, sender: &Actor, activity: &Value) -> Result<()> {
        let Some(note) = activity.get("object").filter(|o| o.is_object()) else {
            warn!("Dropping Create without an embedded object");
            return Ok(());
        };
        if note.get("type").and_then(Value::as_str) != Some("Note") {
            debug!("Ignoring Create of a non-Note object");
            return Ok(());
        }

        let Some(note_uri) = note.get("id").and_then(Value::as_str) else {
            warn!("Dropping Create whose Note has no id");
            return Ok(());
        };
        let Some(content) = note.get("content").and_then(Value::as_str) else {
            warn!(note = note_uri, "Dropping Note without content");
            return Ok(());
        };

        // The signed actor must be the author; a relayed note attributed
        // to someone else is dropped.
        if let Some(attributed) = note.get("attributedTo").and_then(Value::as_str) {
            if attributed != sender.uri {
                warn!(
                    note = note_uri,
                    attributed, sender = %sender.uri,
                    "Dropping Note not attributed to its sender"
                );
                return Ok(());
            }
        }

        let published = note
            .get("published")
            .and_then(Value::as_str)
            .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
            .map(|p| p.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let sanitized = ammonia::clean(content);
        let url = note.get("url").and_then(Value::as_str);

        self.db
            .upsert_remote_post(sender.id, note_uri, url, &sanitized, published)
            .await?;
        info!(note = note_uri, author = %sender.uri, "Stored remote note");
        Ok(())
    }
}

/// Object reference as a URI, whether given as a string or embedded
fn object_uri(object: Option<&Value>) -> Option<&str> {
    match object? {
        Value::String(uri) => Some(uri.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActorRecord, Database};
    use crate::federation::keys::KeyStore;
    use serde_json::json;
    use std::time::Duration;

    fn processor_for(db: Database) -> InboxProcessor {
        let http = reqwest::Client::new();
        let base_url = "https://local.test".to_string();
        let resolver = ActorResolver::new(
            db.clone(),
            http.clone(),
            base_url.clone(),
            "local.test".to_string(),
        );
        let delivery = DeliveryEngine::new(
            db.clone(),
            http,
            KeyStore::new(db.clone()),
            4,
            Duration::from_secs(5),
        );
        InboxProcessor::new(db, resolver, delivery, base_url)
    }

    async fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Database::connect(&dir.path().join("test.db"))
            .await
            .expect("database connects");
        (dir, db)
    }

    async fn cached_remote_actor(db: &Database) -> crate::data::models::Actor {
        db.upsert_actor(&ActorRecord {
            user_id: None,
            uri: "https://remote.test/users/bob".to_string(),
            handle: "bob@remote.test".to_string(),
            name: None,
            inbox_url: "https://remote.test/users/bob/inbox".to_string(),
            shared_inbox_url: None,
            url: None,
            public_key_pem: Some("pem".to_string()),
        })
        .await
        .expect("actor")
    }

    async fn cached_local_actor(db: &Database) -> crate::data::models::Actor {
        let user = db.create_user("alice").await.expect("user");
        db.upsert_actor(&ActorRecord {
            user_id: Some(user.id),
            uri: "https://local.test/users/alice".to_string(),
            handle: "alice@local.test".to_string(),
            name: None,
            inbox_url: "https://local.test/users/alice/inbox".to_string(),
            shared_inbox_url: Some("https://local.test/inbox".to_string()),
            url: None,
            public_key_pem: None,
        })
        .await
        .expect("actor")
    }

    #[test]
    fn activity_kind_is_a_closed_set() {
        assert_eq!(ActivityKind::parse("Follow"), Some(ActivityKind::Follow));
        assert_eq!(ActivityKind::parse("Create"), Some(ActivityKind::Create));
        assert_eq!(ActivityKind::parse("Move"), None);
        assert_eq!(ActivityKind::parse(""), None);
    }

    #[test]
    fn object_uri_accepts_both_shapes() {
        let as_string = json!("https://remote.test/notes/1");
        let as_object = json!({"id": "https://remote.test/notes/1", "type": "Note"});
        let as_array = json!([1, 2]);

        assert_eq!(
            object_uri(Some(&as_string)),
            Some("https://remote.test/notes/1")
        );
        assert_eq!(
            object_uri(Some(&as_object)),
            Some("https://remote.test/notes/1")
        );
        assert_eq!(object_uri(Some(&as_array)), None);
        assert_eq!(object_uri(None), None);
    }

    #[tokio::test]
    async fn unsupported_activity_is_dropped_silently() {
        let (_dir, db) = test_db().await;
        let processor = processor_for(db);

        let activity = json!({
            "type": "Question",
            "actor": "https://remote.test/users/bob",
            "id": "https://remote.test/questions/1",
        });

        processor
            .process(&activity)
            .await
            .expect("unknown types must not error");
    }

    #[tokio::test]
    async fn follow_records_one_edge_even_when_redelivered() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let target = cached_local_actor(&db).await;
        let processor = processor_for(db.clone());

        let activity = json!({
            "type": "Follow",
            "id": "https://remote.test/follows/1",
            "actor": sender.uri,
            "object": target.uri,
        });

        // The Accept cannot reach remote.test from here; that delivery
        // failure is logged and must not surface from processing.
        processor.process(&activity).await.expect("first delivery");
        processor.process(&activity).await.expect("redelivery");

        assert_eq!(db.followers_count(target.id).await.expect("count"), 1);
        assert!(db.follow_exists(target.id, sender.id).await.expect("edge"));
    }

    #[tokio::test]
    async fn follow_of_unknown_or_remote_target_is_dropped() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let processor = processor_for(db.clone());

        let activity = json!({
            "type": "Follow",
            "id": "https://remote.test/follows/2",
            "actor": sender.uri,
            "object": "https://local.test/users/nobody",
        });
        processor.process(&activity).await.expect("unknown target");

        // Following another remote actor through our inbox is dropped too.
        let remote_target = json!({
            "type": "Follow",
            "id": "https://remote.test/follows/3",
            "actor": sender.uri,
            "object": sender.uri,
        });
        processor.process(&remote_target).await.expect("remote target");

        assert_eq!(db.followers_count(sender.id).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn create_persists_sanitized_note() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let processor = processor_for(db.clone());

        let activity = json!({
            "type": "Create",
            "id": "https://remote.test/creates/1",
            "actor": sender.uri,
            "object": {
                "type": "Note",
                "id": "https://remote.test/notes/1",
                "attributedTo": sender.uri,
                "content": "<p>hello</p><script>alert(1)</script>",
                "published": "2026-01-02T03:04:05Z",
            },
        });

        processor.process(&activity).await.expect("create");

        let post = db
            .get_post_by_uri("https://remote.test/notes/1")
            .await
            .expect("lookup")
            .expect("note stored");
        assert!(!post.is_local);
        assert!(post.content.contains("<p>hello</p>"));
        assert!(!post.content.contains("script"), "markup must be sanitized");
    }

    #[tokio::test]
    async fn create_redelivery_is_idempotent() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let processor = processor_for(db.clone());

        let activity = json!({
            "type": "Create",
            "id": "https://remote.test/creates/1",
            "actor": sender.uri,
            "object": {
                "type": "Note",
                "id": "https://remote.test/notes/1",
                "attributedTo": sender.uri,
                "content": "<p>hello</p>",
            },
        });

        processor.process(&activity).await.expect("first");
        processor.process(&activity).await.expect("redelivery");

        let post = db
            .get_post_by_uri("https://remote.test/notes/1")
            .await
            .expect("lookup")
            .expect("note stored once");
        assert_eq!(post.content, "<p>hello</p>");
    }

    #[tokio::test]
    async fn undo_like_before_like_is_a_noop() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let processor = processor_for(db);

        let activity = json!({
            "type": "Undo",
            "id": "https://remote.test/undos/1",
            "actor": sender.uri,
            "object": {
                "type": "Like",
                "id": "https://remote.test/likes/1",
                "object": "https://local.test/users/alice/posts/1",
            },
        });

        processor
            .process(&activity)
            .await
            .expect("out-of-order undo must not error");
    }

    #[tokio::test]
    async fn like_of_unknown_post_is_ignored() {
        let (_dir, db) = test_db().await;
        let sender = cached_remote_actor(&db).await;
        let processor = processor_for(db);

        let activity = json!({
            "type": "Like",
            "id": "https://remote.test/likes/1",
            "actor": sender.uri,
            "object": "https://elsewhere.test/notes/404",
        });

        processor.process(&activity).await.expect("ignored like");
    }
}
