//! Collection endpoint E2E tests
//!
//! Page size is 3 in the test config, so 5 seeded rows exercise the
//! cursor chain.

mod common;

use common::TestServer;
use serde_json::{Value, json};

async fn fetch(server: &TestServer, path_or_url: &str) -> Value {
    let url = if path_or_url.starts_with("http") {
        // Collection links carry the configured public base URL; rewrite
        // to the test listener.
        let path = path_or_url
            .strip_prefix("https://test.example.com")
            .unwrap_or(path_or_url)
            .to_string();
        server.url(&path)
    } else {
        server.url(path_or_url)
    };

    server
        .client
        .get(url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn followers_collection_paginates_without_duplicates() {
    let server = TestServer::new().await;
    let (_token, actor_uri) = server.create_user("alice").await;
    let alice = server
        .state
        .db
        .get_actor_by_uri(&actor_uri)
        .await
        .unwrap()
        .unwrap();

    for n in 1..=5 {
        let follower = server.seed_remote_actor(n).await;
        server
            .state
            .db
            .add_follow(alice.id, follower.id)
            .await
            .unwrap();
    }

    let head = fetch(&server, "/users/alice/followers").await;
    assert_eq!(head["type"], "OrderedCollection");
    assert_eq!(head["totalItems"], 5);

    let mut seen: Vec<String> = Vec::new();
    let mut next = Some(head["first"].as_str().unwrap().to_string());
    while let Some(page_url) = next {
        let page = fetch(&server, &page_url).await;
        assert_eq!(page["type"], "OrderedCollectionPage");

        let items = page["orderedItems"].as_array().unwrap();
        assert!(items.len() <= 3);
        seen.extend(items.iter().map(|i| i.as_str().unwrap().to_string()));

        next = page["next"].as_str().map(str::to_string);
    }

    assert_eq!(seen.len(), 5);
    let unique: std::collections::HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 5, "no follower may repeat across pages");
}

#[tokio::test]
async fn outbox_lists_create_activities_newest_first() {
    let server = TestServer::new().await;
    let (token, actor_uri) = server.create_user("alice").await;

    for n in 1..=4 {
        let response = server
            .client
            .post(server.url("/api/v1/posts"))
            .bearer_auth(&token)
            .json(&json!({ "content": format!("post {}", n) }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }

    let head = fetch(&server, "/users/alice/outbox").await;
    assert_eq!(head["totalItems"], 4);

    let first_page = fetch(&server, head["first"].as_str().unwrap()).await;
    let items = first_page["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 3, "page size is 3");

    for item in items {
        assert_eq!(item["type"], "Create");
        assert_eq!(item["actor"], actor_uri.as_str());
        assert_eq!(
            item["object"]["to"][0],
            "https://www.w3.org/ns/activitystreams#Public"
        );
        assert_eq!(
            item["object"]["cc"][0],
            format!("{}/followers", actor_uri)
        );
    }

    // Newest first: "post 4" leads.
    assert!(
        items[0]["object"]["content"]
            .as_str()
            .unwrap()
            .contains("post 4")
    );

    let second_page = fetch(&server, first_page["next"].as_str().unwrap()).await;
    let rest = second_page["orderedItems"].as_array().unwrap();
    assert_eq!(rest.len(), 1);
    assert!(second_page.get("next").is_none());
}

#[tokio::test]
async fn empty_collection_has_zero_total_and_empty_first_page() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let head = fetch(&server, "/users/alice/following").await;
    assert_eq!(head["totalItems"], 0);

    let page = fetch(&server, head["first"].as_str().unwrap()).await;
    assert_eq!(page["orderedItems"].as_array().unwrap().len(), 0);
    assert!(page.get("next").is_none());
}

#[tokio::test]
async fn invalid_cursor_is_a_client_error() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(server.url("/users/alice/followers?cursor=%21%21garbage"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}
