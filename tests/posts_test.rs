//! Post creation and note serving E2E tests

mod common;

use common::TestServer;
use serde_json::{Value, json};

#[tokio::test]
async fn post_uri_embeds_id_and_note_is_served() {
    let server = TestServer::new().await;
    let (token, actor_uri) = server.create_user("alice").await;

    let response = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth(&token)
        .json(&json!({ "content": "hello fediverse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    let post: Value = response.json().await.unwrap();
    let post_id = post["id"].as_i64().unwrap();
    let post_uri = post["uri"].as_str().unwrap();
    assert_eq!(
        post_uri,
        format!("{}/posts/{}", actor_uri, post_id),
        "post URI must embed the row id"
    );

    let note: Value = server
        .client
        .get(server.url(&format!("/users/alice/posts/{}", post_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(note["type"], "Note");
    assert_eq!(note["id"], post_uri);
    assert_eq!(note["attributedTo"], actor_uri.as_str());
    assert_eq!(note["to"][0], "https://www.w3.org/ns/activitystreams#Public");
    assert_eq!(note["cc"][0], format!("{}/followers", actor_uri));
}

#[tokio::test]
async fn post_content_is_html_escaped() {
    let server = TestServer::new().await;
    let (token, _) = server.create_user("alice").await;

    let post: Value = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth(&token)
        .json(&json!({ "content": "<script>alert(1)</script>" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let content = post["content"].as_str().unwrap();
    assert!(!content.contains("<script>"));
    assert!(content.contains("&lt;script&gt;"));
}

#[tokio::test]
async fn post_with_attachments_includes_them_in_the_note() {
    let server = TestServer::new().await;
    let (token, _) = server.create_user("alice").await;

    let post: Value = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth(&token)
        .json(&json!({
            "content": "look at this",
            "attachments": [
                {
                    "url": "https://cdn.example/a.png",
                    "media_type": "image/png",
                    "description": "a bird"
                }
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let note: Value = server
        .client
        .get(server.url(&format!(
            "/users/alice/posts/{}",
            post["id"].as_i64().unwrap()
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let attachment = &note["attachment"][0];
    assert_eq!(attachment["type"], "Document");
    assert_eq!(attachment["mediaType"], "image/png");
    assert_eq!(attachment["url"], "https://cdn.example/a.png");
    assert_eq!(attachment["name"], "a bird");
}

#[tokio::test]
async fn posting_requires_a_valid_token() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let unauthenticated = server
        .client
        .post(server.url("/api/v1/posts"))
        .json(&json!({ "content": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status().as_u16(), 401);

    let bad_token = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth("roost_not_a_real_token")
        .json(&json!({ "content": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_token.status().as_u16(), 401);
}

#[tokio::test]
async fn empty_content_is_rejected() {
    let server = TestServer::new().await;
    let (token, _) = server.create_user("alice").await;

    let response = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth(&token)
        .json(&json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn duplicate_username_is_rejected() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .post(server.url("/api/v1/users"))
        .json(&json!({ "username": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn like_and_unlike_round_trip() {
    let server = TestServer::new().await;
    let (alice_token, _) = server.create_user("alice").await;
    let (bob_token, _) = server.create_user("bob").await;

    let post: Value = server
        .client
        .post(server.url("/api/v1/posts"))
        .bearer_auth(&alice_token)
        .json(&json!({ "content": "like me" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let post_uri = post["uri"].as_str().unwrap();
    let post_id = post["id"].as_i64().unwrap();

    let like = server
        .client
        .post(server.url("/api/v1/likes"))
        .bearer_auth(&bob_token)
        .json(&json!({ "post_uri": post_uri }))
        .send()
        .await
        .unwrap();
    assert_eq!(like.status().as_u16(), 201);
    assert_eq!(server.state.db.likes_count(post_id).await.unwrap(), 1);

    // Liking again is idempotent.
    server
        .client
        .post(server.url("/api/v1/likes"))
        .bearer_auth(&bob_token)
        .json(&json!({ "post_uri": post_uri }))
        .send()
        .await
        .unwrap();
    assert_eq!(server.state.db.likes_count(post_id).await.unwrap(), 1);

    let unlike = server
        .client
        .delete(server.url("/api/v1/likes"))
        .bearer_auth(&bob_token)
        .json(&json!({ "post_uri": post_uri }))
        .send()
        .await
        .unwrap();
    assert_eq!(unlike.status().as_u16(), 200);
    assert_eq!(server.state.db.likes_count(post_id).await.unwrap(), 0);
}
