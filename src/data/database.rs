//! Database access layer
//!
//! All persistence goes through [`Database`], a thin wrapper around a
//! SQLite connection pool. Write paths that federation retries can hit
//! twice are idempotent at the SQL level (upserts and insert-or-ignore)
//! rather than guarded by application locks.

use std::path::Path;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::data::models::{Actor, KeyRow, Like, Post, PostAttachment, Recipient, Repost, User};
use crate::error::{AppError, Result};

/// Shared database handle
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Fields for a new remote actor, or refreshed fields for a cached one
#[derive(Debug, Clone)]
pub struct ActorRecord {
    pub user_id: Option<i64>,
    pub uri: String,
    pub handle: String,
    pub name: Option<String>,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub url: Option<String>,
    pub public_key_pem: Option<String>,
}

/// Attachment payload accepted alongside a new post
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub url: String,
    pub media_type: String,
    pub description: Option<String>,
}

/// Opaque keyset cursor over (created_at, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

impl PageCursor {
    /// Encode to an opaque URL-safe token
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.to_rfc3339(), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token produced by [`PageCursor::encode`]
    ///
    /// Malformed tokens are a caller error, not a server fault.
    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || AppError::Validation("invalid pagination cursor".to_string());

        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (timestamp, id) = raw.split_once('|').ok_or_else(invalid)?;

        Ok(Self {
            created_at: DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| invalid())?
                .with_timezone(&Utc),
            id: i64::from_str(id).map_err(|_| invalid())?,
        })
    }
}

/// One page of rows plus the cursor for the next page, if any
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

impl Database {
    /// Open (creating if needed) the SQLite database and run migrations
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Config(format!("migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Raw pool access for callers composing their own transactions
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Create a local user with a fresh API token
    pub async fn create_user(&self, username: &str) -> Result<User> {
        let token = format!("roost_{}", ulid::Ulid::new());
        let now = Utc::now();

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, api_token, created_at)
            VALUES (?, ?, ?)
            RETURNING id, username, api_token, created_at
            "#,
        )
        .bind(username)
        .bind(&token)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Validation(format!("username already taken: {}", username))
            }
            other => AppError::Database(other),
        })?;

        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, api_token, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_token(&self, token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, api_token, created_at FROM users WHERE api_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert an actor, or refresh the cached copy if the URI exists
    ///
    /// On conflict only the cached public key is updated (rotation);
    /// identity fields are immutable once seen.
    pub async fn upsert_actor(&self, record: &ActorRecord) -> Result<Actor> {
        let now = Utc::now();

        let actor = sqlx::query_as::<_, Actor>(
            r#"
            INSERT INTO actors
                (user_id, uri, handle, name, inbox_url, shared_inbox_url, url,
                 public_key_pem, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (uri) DO UPDATE SET
                public_key_pem = excluded.public_key_pem
            RETURNING id, user_id, uri, handle, name, inbox_url,
                      shared_inbox_url, url, public_key_pem, created_at
            "#,
        )
        .bind(record.user_id)
        .bind(&record.uri)
        .bind(&record.handle)
        .bind(&record.name)
        .bind(&record.inbox_url)
        .bind(&record.shared_inbox_url)
        .bind(&record.url)
        .bind(&record.public_key_pem)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(actor)
    }

    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>> {
        let actor = sqlx::query_as::<_, Actor>(
            r#"
            SELECT id, user_id, uri, handle, name, inbox_url,
                   shared_inbox_url, url, public_key_pem, created_at
            FROM actors WHERE uri = ?
            "#,
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    pub async fn get_actor_by_user_id(&self, user_id: i64) -> Result<Option<Actor>> {
        let actor = sqlx::query_as::<_, Actor>(
            r#"
            SELECT id, user_id, uri, handle, name, inbox_url,
                   shared_inbox_url, url, public_key_pem, created_at
            FROM actors WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    pub async fn get_actor_by_id(&self, id: i64) -> Result<Option<Actor>> {
        let actor = sqlx::query_as::<_, Actor>(
            r#"
            SELECT id, user_id, uri, handle, name, inbox_url,
                   shared_inbox_url, url, public_key_pem, created_at
            FROM actors WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    // =========================================================================
    // Keys
    // =========================================================================

    pub async fn get_key(&self, user_id: i64, algorithm: &str) -> Result<Option<KeyRow>> {
        let key = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT user_id, algorithm, private_key, public_key, created_at
            FROM keys WHERE user_id = ? AND algorithm = ?
            "#,
        )
        .bind(user_id)
        .bind(algorithm)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Store a freshly generated key pair
    ///
    /// If a concurrent request generated the pair first, the existing
    /// row wins and is returned, so both callers sign with the same key.
    pub async fn insert_key(
        &self,
        user_id: i64,
        algorithm: &str,
        private_jwk: &str,
        public_jwk: &str,
    ) -> Result<KeyRow> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO keys (user_id, algorithm, private_key, public_key, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, algorithm) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(algorithm)
        .bind(private_jwk)
        .bind(public_jwk)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_key(user_id, algorithm)
            .await?
            .ok_or(AppError::Internal(anyhow::anyhow!(
                "key row missing after insert"
            )))
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Create a local post whose URI embeds its row id
    ///
    /// Uses an IMMEDIATE transaction: the row is inserted with a
    /// placeholder URI and patched with the final id-embedding URI
    /// before commit, so no other connection ever observes the
    /// placeholder.
    pub async fn create_local_post(
        &self,
        actor_id: i64,
        actor_uri: &str,
        content: &str,
        attachments: &[NewAttachment],
    ) -> Result<Post> {
        let now = Utc::now();
        let placeholder = format!("urn:roost:pending:{}", ulid::Ulid::new());

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Post> = async {
            let post_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO posts (uri, url, actor_id, content, is_local, created_at)
                VALUES (?, NULL, ?, ?, 1, ?)
                RETURNING id
                "#,
            )
            .bind(&placeholder)
            .bind(actor_id)
            .bind(content)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;

            let uri = format!("{}/posts/{}", actor_uri, post_id);

            let post = sqlx::query_as::<_, Post>(
                r#"
                UPDATE posts SET uri = ?, url = ? WHERE id = ?
                RETURNING id, uri, url, actor_id, content, is_local, created_at
                "#,
            )
            .bind(&uri)
            .bind(&uri)
            .bind(post_id)
            .fetch_one(&mut *conn)
            .await?;

            for attachment in attachments {
                sqlx::query(
                    r#"
                    INSERT INTO post_attachments (post_id, url, media_type, description)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(post_id)
                .bind(&attachment.url)
                .bind(&attachment.media_type)
                .bind(&attachment.description)
                .execute(&mut *conn)
                .await?;
            }

            Ok(post)
        }
        .await;

        match result {
            Ok(post) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(post)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Persist a remote note, keeping its origin URI
    ///
    /// Redelivery of the same note collapses onto the existing row.
    pub async fn upsert_remote_post(
        &self,
        actor_id: i64,
        uri: &str,
        url: Option<&str>,
        content: &str,
        published: DateTime<Utc>,
    ) -> Result<Post> {
        sqlx::query(
            r#"
            INSERT INTO posts (uri, url, actor_id, content, is_local, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT (uri) DO NOTHING
            "#,
        )
        .bind(uri)
        .bind(url)
        .bind(actor_id)
        .bind(content)
        .bind(published)
        .execute(&self.pool)
        .await?;

        self.get_post_by_uri(uri)
            .await?
            .ok_or(AppError::Internal(anyhow::anyhow!(
                "post row missing after upsert"
            )))
    }

    pub async fn get_post_by_uri(&self, uri: &str) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, uri, url, actor_id, content, is_local, created_at
            FROM posts WHERE uri = ?
            "#,
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    pub async fn get_post_by_id(&self, id: i64) -> Result<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, uri, url, actor_id, content, is_local, created_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    pub async fn attachments_for_post(&self, post_id: i64) -> Result<Vec<PostAttachment>> {
        let attachments = sqlx::query_as::<_, PostAttachment>(
            r#"
            SELECT id, post_id, url, media_type, description
            FROM post_attachments WHERE post_id = ? ORDER BY id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attachments)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Record a follow edge; redelivered Follow activities are no-ops
    pub async fn add_follow(&self, following_id: i64, follower_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follows (following_id, follower_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (following_id, follower_id) DO NOTHING
            "#,
        )
        .bind(following_id)
        .bind(follower_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a follow edge; succeeds even if the edge never existed
    pub async fn remove_follow(&self, following_id: i64, follower_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM follows WHERE following_id = ? AND follower_id = ?")
            .bind(following_id)
            .bind(follower_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn follow_exists(&self, following_id: i64, follower_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM follows WHERE following_id = ? AND follower_id = ?",
        )
        .bind(following_id)
        .bind(follower_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn followers_count(&self, actor_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE following_id = ?")
                .bind(actor_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn following_count(&self, actor_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM follows WHERE follower_id = ?")
                .bind(actor_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// One page of followers, newest follow first
    pub async fn followers_page(
        &self,
        actor_id: i64,
        cursor: Option<PageCursor>,
        limit: u32,
    ) -> Result<Page<Recipient>> {
        self.follow_edge_page(actor_id, cursor, limit, FollowDirection::Followers)
            .await
    }

    /// One page of followed actors, newest follow first
    pub async fn following_page(
        &self,
        actor_id: i64,
        cursor: Option<PageCursor>,
        limit: u32,
    ) -> Result<Page<Recipient>> {
        self.follow_edge_page(actor_id, cursor, limit, FollowDirection::Following)
            .await
    }

    /// Every follower as a delivery recipient, unpaginated
    ///
    /// Used for activity fan-out, where the whole audience is needed.
    pub async fn all_follower_recipients(&self, actor_id: i64) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT a.uri, a.inbox_url, a.shared_inbox_url
            FROM follows f JOIN actors a ON a.id = f.follower_id
            WHERE f.following_id = ?
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RecipientRow::into_recipient).collect())
    }

    async fn follow_edge_page(
        &self,
        actor_id: i64,
        cursor: Option<PageCursor>,
        limit: u32,
        direction: FollowDirection,
    ) -> Result<Page<Recipient>> {
        // One extra row decides whether a next cursor exists.
        let fetch = i64::from(limit) + 1;

        let (match_column, select_side) = match direction {
            FollowDirection::Followers => ("f.following_id", "f.follower_id"),
            FollowDirection::Following => ("f.follower_id", "f.following_id"),
        };

        let sql = format!(
            r#"
            SELECT a.uri, a.inbox_url, a.shared_inbox_url,
                   f.created_at AS edge_created_at, a.id AS edge_id
            FROM follows f JOIN actors a ON a.id = {select_side}
            WHERE {match_column} = ?
              AND (? IS NULL
                   OR f.created_at < ?
                   OR (f.created_at = ? AND a.id < ?))
            ORDER BY f.created_at DESC, a.id DESC
            LIMIT ?
            "#
        );

        let (cursor_time, cursor_id) = match cursor {
            Some(c) => (Some(c.created_at), Some(c.id)),
            None => (None, None),
        };

        let mut rows = sqlx::query_as::<_, EdgeRecipientRow>(&sql)
            .bind(actor_id)
            .bind(cursor_time)
            .bind(cursor_time)
            .bind(cursor_time)
            .bind(cursor_id)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await?;

        let next = if rows.len() as i64 == fetch {
            rows.pop();
            rows.last().map(|row| PageCursor {
                created_at: row.edge_created_at,
                id: row.edge_id,
            })
        } else {
            None
        };

        Ok(Page {
            items: rows
                .into_iter()
                .map(|row| Recipient {
                    uri: row.uri,
                    inbox_url: row.inbox_url,
                    shared_inbox_url: row.shared_inbox_url,
                })
                .collect(),
            next,
        })
    }

    // =========================================================================
    // Likes and reposts
    // =========================================================================

    /// Record a like; duplicate activity URIs and duplicate (post, actor)
    /// pairs both collapse onto the first row
    pub async fn add_like(&self, post_id: i64, actor_id: i64, activity_uri: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO likes (post_id, actor_id, activity_uri, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(post_id)
        .bind(actor_id)
        .bind(activity_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a like by its original activity URI; no-op when absent
    pub async fn remove_like(&self, activity_uri: &str) -> Result<()> {
        sqlx::query("DELETE FROM likes WHERE activity_uri = ?")
            .bind(activity_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_like(&self, post_id: i64, actor_id: i64) -> Result<Option<Like>> {
        let like = sqlx::query_as::<_, Like>(
            r#"
            SELECT post_id, actor_id, activity_uri, created_at
            FROM likes WHERE post_id = ? AND actor_id = ?
            "#,
        )
        .bind(post_id)
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(like)
    }

    pub async fn likes_count(&self, post_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE post_id = ?")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn add_repost(
        &self,
        post_id: i64,
        actor_id: i64,
        activity_uri: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reposts (post_id, actor_id, activity_uri, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(post_id)
        .bind(actor_id)
        .bind(activity_uri)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_repost(&self, activity_uri: &str) -> Result<()> {
        sqlx::query("DELETE FROM reposts WHERE activity_uri = ?")
            .bind(activity_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_repost(&self, post_id: i64, actor_id: i64) -> Result<Option<Repost>> {
        let repost = sqlx::query_as::<_, Repost>(
            r#"
            SELECT post_id, actor_id, activity_uri, created_at
            FROM reposts WHERE post_id = ? AND actor_id = ?
            "#,
        )
        .bind(post_id)
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(repost)
    }

    pub async fn reposts_count(&self, post_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reposts WHERE post_id = ?")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    pub async fn outbox_count(&self, actor_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM posts WHERE actor_id = ? AND is_local = 1",
        )
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// One page of an actor's local posts, newest first
    pub async fn outbox_page(
        &self,
        actor_id: i64,
        cursor: Option<PageCursor>,
        limit: u32,
    ) -> Result<Page<Post>> {
        let fetch = i64::from(limit) + 1;

        let (cursor_time, cursor_id) = match cursor {
            Some(c) => (Some(c.created_at), Some(c.id)),
            None => (None, None),
        };

        let mut rows = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, uri, url, actor_id, content, is_local, created_at
            FROM posts
            WHERE actor_id = ? AND is_local = 1
              AND (? IS NULL
                   OR created_at < ?
                   OR (created_at = ? AND id < ?))
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(actor_id)
        .bind(cursor_time)
        .bind(cursor_time)
        .bind(cursor_time)
        .bind(cursor_id)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let next = if rows.len() as i64 == fetch {
            rows.pop();
            rows.last().map(|post| PageCursor {
                created_at: post.created_at,
                id: post.id,
            })
        } else {
            None
        };

        Ok(Page { items: rows, next })
    }
}

enum FollowDirection {
    Followers,
    Following,
}

#[derive(sqlx::FromRow)]
struct RecipientRow {
    uri: String,
    inbox_url: String,
    shared_inbox_url: Option<String>,
}

impl RecipientRow {
    fn into_recipient(self) -> Recipient {
        Recipient {
            uri: self.uri,
            inbox_url: self.inbox_url,
            shared_inbox_url: self.shared_inbox_url,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRecipientRow {
    uri: String,
    inbox_url: String,
    shared_inbox_url: Option<String>,
    edge_created_at: DateTime<Utc>,
    edge_id: i64,
}
