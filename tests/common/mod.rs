//! Common test utilities for E2E tests

use roost::config::{
    AppConfig, DatabaseConfig, FederationConfig, LoggingConfig, ServerConfig,
};
use roost::{AppState, build_router};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Spin up a full server on a random local port
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig { path: db_path },
            federation: FederationConfig {
                delivery_timeout_seconds: 5,
                max_concurrent_deliveries: 4,
                collection_page_size: 3,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        // Generous timeout: user creation generates RSA-2048 keys, which
        // is slow in debug builds when the whole suite runs in parallel.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Provision a user through the API; returns (api_token, actor_uri)
    pub async fn create_user(&self, username: &str) -> (String, String) {
        let response = self
            .client
            .post(self.url("/api/v1/users"))
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201, "user creation must succeed");

        let body: serde_json::Value = response.json().await.unwrap();
        (
            body["api_token"].as_str().unwrap().to_string(),
            body["actor_uri"].as_str().unwrap().to_string(),
        )
    }

    /// Seed a cached remote actor directly in the database
    pub async fn seed_remote_actor(&self, n: u32) -> roost::data::models::Actor {
        self.state
            .db
            .upsert_actor(&roost::data::ActorRecord {
                user_id: None,
                uri: format!("https://remote.test/users/u{}", n),
                handle: format!("u{}@remote.test", n),
                name: None,
                inbox_url: format!("https://remote.test/users/u{}/inbox", n),
                shared_inbox_url: Some("https://remote.test/inbox".to_string()),
                url: None,
                public_key_pem: Some("unused".to_string()),
            })
            .await
            .unwrap()
    }
}
