//! Forge federation
//!
//! Handles:
//! - Remote actor identity and host discovery
//! - Public key resolution and HTTP Signatures
//! - Inbox processing
//! - Outbound delivery through the pending and delivery queues
//! - Periodic refresh of known remote users

pub mod activity;
pub mod actor_id;
pub mod client;
pub mod delivery;
pub mod host_registry;
pub mod inbox;
pub mod key_resolver;
pub mod local_actor;
pub mod nodeinfo;
pub mod queue;
pub mod refresh;
pub mod remote_actor;
pub mod signature;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use activity::InboundActivity;
pub use actor_id::{ActorId, PersonId, RepositoryId, Source};
pub use client::{FederationClient, PostResponse, ReqwestClient, Signer};
pub use delivery::{
    DeliveryHandler, DeliveryItem, InboxTarget, MAX_DELIVERY_ATTEMPTS, Outbox, PendingHandler,
    PendingItem,
};
pub use host_registry::HostRegistry;
pub use inbox::{InboxOutcome, InboxOwner, InboxProcessor};
pub use key_resolver::{KeyOwner, KeyResolver, ResolvedKey};
pub use local_actor::LocalActorUrls;
pub use queue::{HandleOutcome, QueueHandler, WorkerQueue};
pub use refresh::{RefreshHandler, RefreshItem, RefreshQueue};
pub use remote_actor::{ActorDocument, RemoteActor, RemoteActors};
pub use signature::{
    extract_signature_key_id, generate_rsa_keypair, key_id_matches_actor, sign_request,
    verify_signature,
};

use crate::config::FederationConfig;
use crate::data::{Database, ServerActorKeys};
use crate::error::AppError;

pub const PENDING_QUEUE: &str = "pending";
pub const DELIVERY_QUEUE: &str = "delivery";
pub const REFRESH_QUEUE: &str = "refresh";

/// Federation services wired together, with their queue workers running.
pub struct Federation {
    pub urls: LocalActorUrls,
    /// Signs every outbound GET
    pub server_signer: Signer,
    pub server_public_key_pem: String,
    pub actors: RemoteActors,
    pub keys: KeyResolver,
    pub inbox: InboxProcessor,
    pub outbox: Outbox,
    pub refresh: RefreshQueue,
    db: Arc<Database>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Federation {
    /// Build the federation services and spawn the queue workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        db: Arc<Database>,
        config: &FederationConfig,
        base_url: &str,
        client: Arc<dyn FederationClient>,
        server_keys: ServerActorKeys,
    ) -> Self {
        let urls = LocalActorUrls::new(base_url);
        let server_signer = Signer {
            key_id: LocalActorUrls::key_id(&urls.server_actor()),
            private_key_pem: server_keys.private_key_pem,
        };

        let hosts = HostRegistry::new(db.clone(), client.clone(), server_signer.clone());
        let actors = RemoteActors::new(db.clone(), client.clone(), hosts, server_signer.clone());
        let keys = KeyResolver::new(
            db.clone(),
            client.clone(),
            actors.clone(),
            server_signer.clone(),
        );

        let shutdown = CancellationToken::new();
        let queue_config = &config.queue;

        let (deliveries, delivery_receiver) =
            WorkerQueue::<DeliveryItem>::new(DELIVERY_QUEUE, db.clone());
        let (pending, pending_receiver) = WorkerQueue::<PendingItem>::new(PENDING_QUEUE, db.clone());
        let (refresh, refresh_receiver) = WorkerQueue::<RefreshItem>::new(REFRESH_QUEUE, db.clone());

        let workers = vec![
            delivery_receiver.spawn(
                Arc::new(DeliveryHandler::new(db.clone(), client.clone(), urls.clone())),
                queue_config,
                shutdown.clone(),
            ),
            pending_receiver.spawn(
                Arc::new(PendingHandler::new(db.clone(), deliveries)),
                queue_config,
                shutdown.clone(),
            ),
            refresh_receiver.spawn(
                Arc::new(RefreshHandler::new(
                    db.clone(),
                    client.clone(),
                    server_signer.clone(),
                )),
                queue_config,
                shutdown.clone(),
            ),
        ];

        let outbox = Outbox::new(db.clone(), actors.clone(), urls.clone(), pending);
        let inbox = InboxProcessor::new(db.clone(), actors.clone(), urls.clone(), outbox.clone());

        tracing::info!(
            workers = queue_config.workers,
            batch_size = queue_config.batch_size,
            "Federation queues started"
        );

        Self {
            urls,
            server_signer,
            server_public_key_pem: server_keys.public_key_pem,
            actors,
            keys,
            inbox,
            outbox,
            refresh,
            db,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Periodically queue every known federated user for refresh.
    pub async fn start_refresh_scheduler(&self, interval: Duration) {
        let handle = refresh::spawn_refresh_scheduler(
            self.db.clone(),
            self.refresh.clone(),
            interval,
            self.shutdown.clone(),
        );
        self.workers.lock().await.push(handle);
        tracing::info!(interval_secs = interval.as_secs(), "Refresh scheduler spawned");
    }

    /// Queue a refresh of every known federated user now.
    pub async fn refresh_all(&self) -> Result<usize, AppError> {
        refresh::queue_refresh_sweep(&self.db, &self.refresh).await
    }

    /// Stored items per queue, leased ones included.
    pub async fn queue_depths(&self) -> Result<Vec<(&'static str, i64)>, AppError> {
        let mut depths = Vec::with_capacity(3);
        for queue in [PENDING_QUEUE, DELIVERY_QUEUE, REFRESH_QUEUE] {
            depths.push((queue, self.db.count_queue_jobs(queue).await?));
        }
        Ok(depths)
    }

    /// Stop the workers. Queued items and scheduled retries stay stored and
    /// are picked up by the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        futures::future::join_all(workers).await;
        tracing::info!("Federation stopped");
    }
}
