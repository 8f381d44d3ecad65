//! Federated user refresh
//!
//! A periodic sweep queues every known federated user; the handler re-fetches
//! each actor document and picks up moved inboxes and rotated keys.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::actor_id::ActorId;
use super::client::{FederationClient, Signer};
use super::queue::{HandleOutcome, QueueHandler, WorkerQueue};
use super::remote_actor::ActorDocument;
use super::signature::key_id_matches_actor;
use crate::data::Database;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshItem {
    pub federation_host_id: i64,
    pub external_id: String,
}

pub type RefreshQueue = WorkerQueue<RefreshItem>;

pub struct RefreshHandler {
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    signer: Signer,
}

impl RefreshHandler {
    pub fn new(db: Arc<Database>, client: Arc<dyn FederationClient>, signer: Signer) -> Self {
        Self { db, client, signer }
    }

    async fn refresh(&self, item: &RefreshItem) -> Result<(), AppError> {
        let Some(federated_user) = self
            .db
            .find_federated_user(&item.external_id, item.federation_host_id)
            .await?
        else {
            return Ok(());
        };

        let actor_uri = &federated_user.normalized_original_url;
        let body = self.client.get_body(&self.signer, actor_uri).await?;
        let document = ActorDocument::from_json(&body)?;

        let expected = ActorId::parse(actor_uri)?;
        let declared = ActorId::parse(&document.id)?;
        if !declared.same_identity(&expected) {
            return Err(AppError::TrustViolation(format!(
                "document at {actor_uri} claims to be {}",
                document.id
            )));
        }

        let inbox_path = document.inbox_path()?;
        if self
            .db
            .update_federated_user_inbox(federated_user.id, &inbox_path)
            .await?
        {
            tracing::info!(actor = %actor_uri, inbox = %inbox_path, "Inbox moved");
        }

        if let Some((key_id, der)) = document.public_key_der()? {
            if !key_id_matches_actor(&key_id, actor_uri) {
                return Err(AppError::TrustViolation(format!(
                    "key {key_id} is not owned by {actor_uri}"
                )));
            }
            let unchanged = federated_user.key_id.as_deref() == Some(key_id.as_str())
                && federated_user.public_key.as_deref() == Some(der.as_slice());
            if !unchanged {
                self.db
                    .update_federated_user_key(federated_user.id, &key_id, &der)
                    .await?;
                tracing::info!(actor = %actor_uri, key_id = %key_id, "Public key updated");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueueHandler<RefreshItem> for RefreshHandler {
    async fn handle(&self, items: Vec<RefreshItem>) -> HandleOutcome<RefreshItem> {
        for item in &items {
            if let Err(e) = self.refresh(item).await {
                // next sweep picks it up again
                tracing::warn!(
                    host = item.federation_host_id,
                    external_id = %item.external_id,
                    error = %e,
                    "Failed to refresh federated user"
                );
            }
        }
        HandleOutcome::new(items.len(), Vec::new())
    }
}

/// Queue every federated user for refresh.
///
/// A user that cannot be queued is logged and skipped; the rest of the sweep
/// still runs.
///
/// # Returns
/// Number of users queued.
pub async fn queue_refresh_sweep(db: &Database, queue: &RefreshQueue) -> Result<usize, AppError> {
    let users = db.list_federated_users().await?;
    let total = users.len();
    let mut queued = 0;
    for user in users {
        let item = RefreshItem {
            federation_host_id: user.federation_host_id,
            external_id: user.external_id,
        };
        match queue.push(item).await {
            Ok(()) => queued += 1,
            Err(e) => tracing::warn!(
                federated_user = user.id,
                error = %e,
                "Failed to queue federated user refresh"
            ),
        }
    }
    if queued < total {
        tracing::warn!(queued, total, "Refresh sweep queued only part of the known users");
    }
    Ok(queued)
}

pub fn spawn_refresh_scheduler(
    db: Arc<Database>,
    queue: RefreshQueue,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match queue_refresh_sweep(&db, &queue).await {
                        Ok(queued) => tracing::debug!(queued, "Queued federated user refresh"),
                        Err(e) => tracing::warn!(error = %e, "Refresh sweep incomplete"),
                    }
                }
            }
        }

        tracing::info!("Refresh scheduler stopped");
    })
}
