//! Actor document and WebFinger E2E tests

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn actor_document_is_served_with_keys() {
    let server = TestServer::new().await;
    let (_token, actor_uri) = server.create_user("alice").await;

    let response = server
        .client
        .get(server.url("/users/alice"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/activity+json")
    );

    let doc: Value = response.json().await.unwrap();
    assert_eq!(doc["type"], "Person");
    assert_eq!(doc["id"], actor_uri.as_str());
    assert_eq!(doc["preferredUsername"], "alice");

    // Primary key as PEM for HTTP signatures.
    assert_eq!(doc["publicKey"]["id"], format!("{}#main-key", actor_uri));
    assert!(
        doc["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );

    // Both algorithms published as JWK assertion methods.
    let methods = doc["assertionMethod"].as_array().unwrap();
    assert_eq!(methods.len(), 2);
    let ktys: Vec<&str> = methods
        .iter()
        .map(|m| m["publicKeyJwk"]["kty"].as_str().unwrap())
        .collect();
    assert!(ktys.contains(&"RSA"));
    assert!(ktys.contains(&"OKP"));
    for method in methods {
        assert!(
            method["publicKeyJwk"].get("d").is_none(),
            "published JWKs must not leak private fields"
        );
    }

    assert_eq!(doc["inbox"], format!("{}/inbox", actor_uri));
    assert_eq!(
        doc["endpoints"]["sharedInbox"],
        "https://test.example.com/inbox"
    );
}

#[tokio::test]
async fn repeated_actor_fetches_reuse_the_same_key() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let first: Value = server
        .client
        .get(server.url("/users/alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: Value = server
        .client
        .get(server.url("/users/alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        first["publicKey"]["publicKeyPem"],
        second["publicKey"]["publicKeyPem"],
        "key generation must be once per user, not per request"
    );
}

#[tokio::test]
async fn unknown_actor_returns_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn webfinger_resolves_local_user() {
    let server = TestServer::new().await;
    let (_token, actor_uri) = server.create_user("alice").await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@test.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let jrd: Value = response.json().await.unwrap();
    assert_eq!(jrd["subject"], "acct:alice@test.example.com");
    let link = &jrd["links"][0];
    assert_eq!(link["rel"], "self");
    assert_eq!(link["type"], "application/activity+json");
    assert_eq!(link["href"], actor_uri.as_str());
}

#[tokio::test]
async fn webfinger_rejects_foreign_domain() {
    let server = TestServer::new().await;
    server.create_user("alice").await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:alice@other.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn nodeinfo_is_discoverable() {
    let server = TestServer::new().await;

    let index: Value = server
        .client
        .get(server.url("/.well-known/nodeinfo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let href = index["links"][0]["href"].as_str().unwrap();
    assert!(href.ends_with("/nodeinfo/2.0"));

    let doc: Value = server
        .client
        .get(server.url("/nodeinfo/2.0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(doc["software"]["name"], "roost");
    assert_eq!(doc["protocols"][0], "activitypub");
}
