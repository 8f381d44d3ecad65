//! forgefed - ForgeFed federation core for a self-hosted code forge
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor documents and inboxes                  │
//! │  - NodeInfo discovery                                       │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Actor identity, host registry, key resolution            │
//! │  - Inbox state machine                                      │
//! │  - Pending / delivery / refresh queues                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub, NodeInfo and metrics
//! - `federation`: identity, discovery, inbox and delivery
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use federation::{Federation, FederationClient, ReqwestClient};

/// Largest inbound activity body accepted.
pub const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and the federation services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Federation services and queue workers
    pub federation: Arc<Federation>,
}

impl AppState {
    /// Initialize application state with the production HTTP client
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let client = ReqwestClient::new(Duration::from_secs(
            config.federation.http_timeout_seconds,
        ))?;
        Self::with_client(config, Arc::new(client)).await
    }

    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the server actor keys
    /// 3. Start the federation queues
    pub async fn with_client(
        config: config::AppConfig,
        client: Arc<dyn FederationClient>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Server actor
        let server_keys = Self::ensure_server_actor(&db, &config).await?;

        // 3. Federation services
        let federation = Federation::start(
            db.clone(),
            &config.federation,
            &config.server.base_url(),
            client,
            server_keys,
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            federation: Arc::new(federation),
        })
    }

    /// Ensure the instance actor has a keypair
    ///
    /// Generates an RSA keypair on first start. A concurrent initializer may
    /// win the insert, so the stored row is re-read either way.
    async fn ensure_server_actor(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<data::ServerActorKeys, error::AppError> {
        if let Some(keys) = db.get_server_actor_keys().await? {
            tracing::info!("Server actor exists");
            return Ok(keys);
        }

        tracing::info!("Creating server actor...");
        let (private_key_pem, public_key_pem) =
            federation::generate_rsa_keypair(config.federation.key_bits)?;
        if db
            .insert_server_actor_keys_if_absent(&private_key_pem, &public_key_pem)
            .await?
        {
            tracing::info!("Server actor created");
        }

        db.get_server_actor_keys().await?.ok_or_else(|| {
            error::AppError::Internal(anyhow::anyhow!("server actor keys missing after insert"))
        })
    }

    /// Create a local user with a fresh signing keypair
    pub async fn create_local_user(
        &self,
        name: &str,
        full_name: Option<&str>,
    ) -> Result<data::User, error::AppError> {
        let (private_key_pem, public_key_pem) =
            federation::generate_rsa_keypair(self.config.federation.key_bits)?;
        let new_user = data::NewUser {
            name: name.to_string(),
            login_name: Some(name.to_string()),
            full_name: full_name.map(str::to_string),
            is_remote: false,
            private_key_pem: Some(private_key_pem),
            public_key_pem: Some(public_key_pem),
        };
        validation::is_valid(&new_user)?;

        let user = self.db.insert_user(&new_user).await?;
        tracing::info!(user_id = user.id, name = %user.name, "Local user created");
        Ok(user)
    }

    pub async fn create_repository(
        &self,
        owner: &data::User,
        name: &str,
    ) -> Result<data::Repository, error::AppError> {
        if owner.is_remote {
            return Err(error::AppError::Forbidden);
        }
        let repository = self.db.insert_repository(owner.id, name).await?;
        tracing::info!(
            repository_id = repository.id,
            owner = owner.id,
            "Repository created"
        );
        Ok(repository)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower::ServiceBuilder;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::metrics_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES)),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
