//! Data models
//!
//! Rust structs representing database entities. Row ids are SQLite
//! integers (post URIs embed the id); generated activity URIs use ULIDs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// User
// =============================================================================

/// A local account that can log in and act through its actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Bearer token for the client API
    #[serde(skip_serializing)]
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Actor
// =============================================================================

/// A local or remote ActivityPub identity
///
/// Local actors reference their owning user; remote actors are created
/// lazily on first interaction and cached forever (no eviction).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: i64,
    /// Owning local user, NULL for remote actors
    pub user_id: Option<i64>,
    /// Globally unique, immutable ActivityPub URI
    pub uri: String,
    /// Display form (user@host)
    pub handle: String,
    pub name: Option<String>,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub url: Option<String>,
    /// Cached public key (PEM), refreshed on upsert conflict
    pub public_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Actor {
    /// Whether this actor belongs to a local user
    pub fn is_local(&self) -> bool {
        self.user_id.is_some()
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Supported signing key algorithms
///
/// Closed set; callers request pairs per algorithm and must not assume
/// only one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA with PKCS#1 v1.5 padding, 2048-bit modulus
    RsaPkcs1V15,
    Ed25519,
}

impl KeyAlgorithm {
    /// All supported algorithms, in preference order (primary first)
    pub const ALL: [KeyAlgorithm; 2] = [KeyAlgorithm::RsaPkcs1V15, KeyAlgorithm::Ed25519];

    /// Database/wire tag for this algorithm
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaPkcs1V15 => "RSASSA-PKCS1-v1_5",
            Self::Ed25519 => "Ed25519",
        }
    }

    /// Parse algorithm from its tag
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RSASSA-PKCS1-v1_5" => Some(Self::RsaPkcs1V15),
            "Ed25519" => Some(Self::Ed25519),
            _ => None,
        }
    }
}

/// A stored key pair row, both halves serialized as JWK JSON
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyRow {
    pub user_id: i64,
    pub algorithm: String,
    pub private_key: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Post
// =============================================================================

/// A post (ActivityPub Note)
///
/// Local posts carry a URI derived from their row id; remote notes
/// persisted from Create activities keep their origin URI.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    /// ActivityPub URI (globally unique, stable once assigned)
    pub uri: String,
    pub url: Option<String>,
    pub actor_id: i64,
    /// HTML content
    pub content: String,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
}

/// Media attached to a post (remote URL, no local file storage)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostAttachment {
    pub id: i64,
    pub post_id: i64,
    pub url: String,
    pub media_type: String,
    pub description: Option<String>,
}

// =============================================================================
// Relationships
// =============================================================================

/// Like record, keyed by (post, actor) with a unique activity URI
///
/// The activity URI is what an Undo must match.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Like {
    pub post_id: i64,
    pub actor_id: i64,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Repost (Announce) record, same shape as Like
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Repost {
    pub post_id: i64,
    pub actor_id: i64,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery
// =============================================================================

/// Delivery target extracted from a collection page
///
/// Mirrors the ActivityStreams recipient shape: actor URI, personal
/// inbox, optional shared inbox for de-duplicated fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub uri: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
}

impl Recipient {
    /// The physical inbox URL deliveries should target
    ///
    /// Prefers the shared inbox when the recipient declares one.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_url.as_deref().unwrap_or(&self.inbox_url)
    }
}
