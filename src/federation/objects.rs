//! ActivityPub object rendering
//!
//! Builds the JSON-LD documents this server publishes: actor profiles,
//! notes, and the followers/following/outbox collections. Collections
//! are served as an OrderedCollection head plus cursor-linked pages.

use serde_json::{Value, json};

use crate::data::models::{Actor, Post, PostAttachment, Recipient};
use crate::data::{Database, Page, PageCursor};
use crate::error::{AppError, Result};
use crate::federation::keys::UserKey;

/// The ActivityStreams public collection URI
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// @context for actor documents (security vocabulary included for keys)
fn actor_context() -> Value {
    json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1",
    ])
}

/// Renders the server's published ActivityPub objects
#[derive(Clone)]
pub struct ObjectDispatcher {
    db: Database,
    base_url: String,
    page_size: u32,
}

impl ObjectDispatcher {
    pub fn new(db: Database, base_url: String, page_size: u32) -> Self {
        Self {
            db,
            base_url,
            page_size,
        }
    }

    /// Person document for a local actor
    ///
    /// The primary RSA key is published as `publicKey` with PEM material
    /// for HTTP signature verification; every pair additionally appears
    /// under `assertionMethod` as JWK.
    pub fn actor_document(&self, actor: &Actor, keys: &[UserKey]) -> Result<Value> {
        let uri = &actor.uri;
        let username = actor
            .handle
            .split('@')
            .next()
            .unwrap_or(&actor.handle)
            .to_string();

        let primary_pem = keys
            .iter()
            .find_map(|key| key.public_key_pem().transpose())
            .transpose()?
            .ok_or_else(|| {
                AppError::Federation("local actor has no PEM-encodable key".to_string())
            })?;

        let assertion_methods: Vec<Value> = keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                json!({
                    "id": format!("{}#key-{}", uri, index),
                    "type": "Multikey",
                    "controller": uri,
                    "publicKeyJwk": key.public_jwk(),
                })
            })
            .collect();

        Ok(json!({
            "@context": actor_context(),
            "id": uri,
            "type": "Person",
            "preferredUsername": username,
            "name": actor.name,
            "url": actor.url,
            "inbox": format!("{}/inbox", uri),
            "outbox": format!("{}/outbox", uri),
            "followers": format!("{}/followers", uri),
            "following": format!("{}/following", uri),
            "endpoints": {
                "sharedInbox": format!("{}/inbox", self.base_url),
            },
            "published": actor.created_at.to_rfc3339(),
            "publicKey": {
                "id": format!("{}#main-key", uri),
                "owner": uri,
                "publicKeyPem": primary_pem,
            },
            "assertionMethod": assertion_methods,
        }))
    }

    /// Note document for a post
    ///
    /// Addressed to the public collection with the author's followers in
    /// cc, the only audience shape this server produces.
    pub async fn note_document(&self, post: &Post, author: &Actor) -> Result<Value> {
        let attachments = self.db.attachments_for_post(post.id).await?;

        let mut note = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": post.uri,
            "type": "Note",
            "attributedTo": author.uri,
            "content": post.content,
            "published": post.created_at.to_rfc3339(),
            "to": [PUBLIC_COLLECTION],
            "cc": [format!("{}/followers", author.uri)],
            "url": post.url,
        });

        if !attachments.is_empty() {
            note["attachment"] = Value::Array(
                attachments.iter().map(attachment_document).collect(),
            );
        }

        Ok(note)
    }

    /// Followers collection head or page
    pub async fn followers_collection(
        &self,
        actor: &Actor,
        cursor: Option<PageCursor>,
    ) -> Result<Value> {
        let collection_id = format!("{}/followers", actor.uri);
        match cursor {
            None => {
                let total = self.db.followers_count(actor.id).await?;
                Ok(self.collection_head(&collection_id, total))
            }
            Some(cursor) => {
                let page = self
                    .db
                    .followers_page(actor.id, first_page_cursor(cursor), self.page_size)
                    .await?;
                Ok(self.recipient_page(&collection_id, cursor, page))
            }
        }
    }

    /// Following collection head or page
    pub async fn following_collection(
        &self,
        actor: &Actor,
        cursor: Option<PageCursor>,
    ) -> Result<Value> {
        let collection_id = format!("{}/following", actor.uri);
        match cursor {
            None => {
                let total = self.db.following_count(actor.id).await?;
                Ok(self.collection_head(&collection_id, total))
            }
            Some(cursor) => {
                let page = self
                    .db
                    .following_page(actor.id, first_page_cursor(cursor), self.page_size)
                    .await?;
                Ok(self.recipient_page(&collection_id, cursor, page))
            }
        }
    }

    /// Outbox collection head or page of Create activities
    pub async fn outbox_collection(
        &self,
        actor: &Actor,
        cursor: Option<PageCursor>,
    ) -> Result<Value> {
        let collection_id = format!("{}/outbox", actor.uri);
        match cursor {
            None => {
                let total = self.db.outbox_count(actor.id).await?;
                Ok(self.collection_head(&collection_id, total))
            }
            Some(cursor) => {
                let page = self
                    .db
                    .outbox_page(actor.id, first_page_cursor(cursor), self.page_size)
                    .await?;

                let mut items = Vec::with_capacity(page.items.len());
                for post in &page.items {
                    let note = self.note_document(post, actor).await?;
                    items.push(create_activity(&note, actor));
                }

                Ok(self.ordered_page(&collection_id, cursor, items, page.next))
            }
        }
    }

    fn collection_head(&self, collection_id: &str, total: i64) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": collection_id,
            "type": "OrderedCollection",
            "totalItems": total,
            "first": format!("{}?cursor={}", collection_id, FIRST_PAGE_TOKEN),
        })
    }

    fn recipient_page(
        &self,
        collection_id: &str,
        cursor: PageCursor,
        page: Page<Recipient>,
    ) -> Value {
        let items: Vec<Value> = page
            .items
            .into_iter()
            .map(|r| Value::String(r.uri))
            .collect();
        self.ordered_page(collection_id, cursor, items, page.next)
    }

    fn ordered_page(
        &self,
        collection_id: &str,
        cursor: PageCursor,
        items: Vec<Value>,
        next: Option<PageCursor>,
    ) -> Value {
        let mut page = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}?cursor={}", collection_id, encode_cursor(cursor)),
            "type": "OrderedCollectionPage",
            "partOf": collection_id,
            "orderedItems": items,
        });
        if let Some(next) = next {
            page["next"] = Value::String(format!(
                "{}?cursor={}",
                collection_id,
                next.encode()
            ));
        }
        page
    }
}

/// Create activity wrapping a note, for outbox listings and delivery
pub fn create_activity(note: &Value, author: &Actor) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}#activity", note["id"].as_str().unwrap_or_default()),
        "type": "Create",
        "actor": author.uri,
        "to": note["to"].clone(),
        "cc": note["cc"].clone(),
        "object": note.clone(),
    })
}

fn attachment_document(attachment: &PostAttachment) -> Value {
    let mut doc = json!({
        "type": "Document",
        "mediaType": attachment.media_type,
        "url": attachment.url,
    });
    if let Some(description) = &attachment.description {
        doc["name"] = Value::String(description.clone());
    }
    doc
}

/// Token used for the first page, which has no keyset position yet
pub const FIRST_PAGE_TOKEN: &str = "first";

/// Sentinel cursor meaning "start from the newest row"
///
/// The collection head links to `?cursor=first`; page queries translate
/// that into an unbounded keyset scan.
pub fn parse_cursor(raw: Option<&str>) -> Result<Option<PageCursor>> {
    match raw {
        None => Ok(None),
        Some(FIRST_PAGE_TOKEN) => Ok(Some(FIRST_PAGE)),
        Some(token) => Ok(Some(PageCursor::decode(token)?)),
    }
}

const FIRST_PAGE: PageCursor = PageCursor {
    created_at: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    id: i64::MAX,
};

fn first_page_cursor(cursor: PageCursor) -> Option<PageCursor> {
    if cursor == FIRST_PAGE {
        None
    } else {
        Some(cursor)
    }
}

fn encode_cursor(cursor: PageCursor) -> String {
    if cursor == FIRST_PAGE {
        FIRST_PAGE_TOKEN.to_string()
    } else {
        cursor.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn local_actor() -> Actor {
        Actor {
            id: 1,
            user_id: Some(1),
            uri: "https://local.test/users/alice".to_string(),
            handle: "alice@local.test".to_string(),
            name: Some("Alice".to_string()),
            inbox_url: "https://local.test/users/alice/inbox".to_string(),
            shared_inbox_url: Some("https://local.test/inbox".to_string()),
            url: Some("https://local.test/users/alice".to_string()),
            public_key_pem: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_activity_copies_note_audience() {
        let actor = local_actor();
        let note = json!({
            "id": "https://local.test/users/alice/posts/1",
            "to": [PUBLIC_COLLECTION],
            "cc": ["https://local.test/users/alice/followers"],
        });

        let activity = create_activity(&note, &actor);
        assert_eq!(activity["type"], "Create");
        assert_eq!(activity["actor"], actor.uri);
        assert_eq!(activity["to"], note["to"]);
        assert_eq!(activity["cc"], note["cc"]);
        assert_eq!(
            activity["id"],
            "https://local.test/users/alice/posts/1#activity"
        );
    }

    #[test]
    fn parse_cursor_handles_all_shapes() {
        assert_eq!(parse_cursor(None).expect("none"), None);
        assert_eq!(
            parse_cursor(Some(FIRST_PAGE_TOKEN)).expect("first"),
            Some(FIRST_PAGE)
        );
        assert!(parse_cursor(Some("garbage!!")).is_err());

        let real = PageCursor {
            created_at: Utc::now(),
            id: 7,
        };
        let parsed = parse_cursor(Some(&real.encode()))
            .expect("valid token")
            .expect("cursor present");
        assert_eq!(parsed.id, 7);
    }

    #[test]
    fn attachment_document_includes_description_as_name() {
        let attachment = PostAttachment {
            id: 1,
            post_id: 1,
            url: "https://cdn.example/a.png".to_string(),
            media_type: "image/png".to_string(),
            description: Some("a bird".to_string()),
        };

        let doc = attachment_document(&attachment);
        assert_eq!(doc["type"], "Document");
        assert_eq!(doc["mediaType"], "image/png");
        assert_eq!(doc["name"], "a bird");
    }
}
