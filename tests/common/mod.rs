//! Common test utilities for E2E tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forgefed::error::AppError;
use forgefed::federation::{FederationClient, PostResponse, Signer, sign_request};
use forgefed::{AppState, config};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const REMOTE_BASE: &str = "https://remote.example";
pub const REMOTE_ACTOR: &str = "https://remote.example/api/v1/activitypub/user-id/7";

/// A delivery POST captured by [`FakeFederationClient`].
#[derive(Debug, Clone)]
pub struct CapturedPost {
    pub url: String,
    pub key_id: String,
    pub payload: Value,
}

/// Serves canned documents and records deliveries instead of touching the network.
pub struct FakeFederationClient {
    documents: Mutex<HashMap<String, Vec<u8>>>,
    posts: mpsc::UnboundedSender<CapturedPost>,
}

impl FakeFederationClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CapturedPost>) {
        let (posts, receiver) = mpsc::unbounded_channel();
        let client = Self {
            documents: Mutex::new(HashMap::new()),
            posts,
        };
        (client, receiver)
    }

    pub fn serve(&self, url: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), document.to_string().into_bytes());
    }

    /// Nodeinfo discovery documents for a remote Forgejo instance.
    pub fn serve_forgejo_host(&self, base: &str) {
        self.serve(
            &format!("{base}/.well-known/nodeinfo"),
            serde_json::json!({
                "links": [{
                    "href": format!("{base}/api/v1/nodeinfo"),
                    "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                }]
            }),
        );
        self.serve(
            &format!("{base}/api/v1/nodeinfo"),
            serde_json::json!({
                "version": "2.1",
                "software": { "name": "forgejo", "version": "9.0.0" },
            }),
        );
    }

    pub fn serve_person(&self, actor: &str, username: &str, public_key_pem: &str) {
        self.serve(
            actor,
            serde_json::json!({
                "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
                "type": "Person",
                "id": actor,
                "preferredUsername": username,
                "inbox": format!("{actor}/inbox"),
                "publicKey": {
                    "id": format!("{actor}#main-key"),
                    "owner": actor,
                    "publicKeyPem": public_key_pem,
                }
            }),
        );
    }
}

#[async_trait]
impl FederationClient for FakeFederationClient {
    async fn get_body(&self, _signer: &Signer, url: &str) -> Result<Vec<u8>, AppError> {
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::Federation(format!("{url} returned 404")))
    }

    async fn post(
        &self,
        signer: &Signer,
        url: &str,
        payload: &[u8],
    ) -> Result<PostResponse, AppError> {
        let payload = serde_json::from_slice(payload).unwrap();
        let _ = self.posts.send(CapturedPost {
            url: url.to_string(),
            key_id: signer.key_id.clone(),
            payload,
        });
        Ok(PostResponse {
            status: 202,
            body: String::new(),
        })
    }
}

/// Remote actor whose requests the tests sign.
pub struct RemoteActorKeys {
    pub actor: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteActorKeys {
    pub fn generate(actor: &str) -> Self {
        let (private_key_pem, public_key_pem) =
            forgefed::federation::generate_rsa_keypair(1024).unwrap();
        Self {
            actor: actor.to_string(),
            private_key_pem,
            public_key_pem,
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor)
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    pub federation: Arc<FakeFederationClient>,
    pub deliveries: tokio::sync::Mutex<mpsc::UnboundedReceiver<CapturedPost>>,
}

pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: "forge.example".to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        federation: config::FederationConfig {
            enabled: true,
            signature_enforced: true,
            http_timeout_seconds: 5,
            key_bits: 1024,
            refresh_interval_seconds: 0,
            queue: config::QueueConfig {
                workers: 1,
                batch_size: 4,
                poll_interval_ms: 20,
                lease_seconds: 60,
                base_backoff_ms: 10,
                max_backoff_seconds: 1,
            },
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        forgefed::metrics::init_metrics();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        adjust(&mut config);

        let (fake, deliveries) = FakeFederationClient::new();
        let fake = Arc::new(fake);

        // Initialize app state
        let state = AppState::with_client(config, fake.clone()).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = forgefed::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
            federation: fake,
            deliveries: tokio::sync::Mutex::new(deliveries),
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public IRI of a local path, as remote servers see it
    pub fn public_url(&self, path: &str) -> String {
        format!("{}{}", self.state.config.server.base_url(), path)
    }

    pub async fn create_user(&self, name: &str) -> forgefed::data::User {
        self.state.create_local_user(name, None).await.unwrap()
    }

    /// POST `activity` to `path`, signed with `keys`.
    pub async fn post_signed(
        &self,
        path: &str,
        keys: &RemoteActorKeys,
        activity: &Value,
    ) -> reqwest::Response {
        let url = self.url(path);
        let body = serde_json::to_vec(activity).unwrap();
        let signed = sign_request(
            "POST",
            &url,
            Some(&body),
            &keys.private_key_pem,
            &keys.key_id(),
        )
        .unwrap();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }

    /// Wait for the next delivery POST.
    pub async fn next_delivery(&self) -> CapturedPost {
        let mut deliveries = self.deliveries.lock().await;
        tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .expect("delivery within 5s")
            .expect("delivery channel open")
    }
}
