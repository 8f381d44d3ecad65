//! Activity delivery
//!
//! Outbound activities travel through two queues. The pending queue turns an
//! [`InboxTarget`] into a concrete inbox URL; the delivery queue POSTs the
//! signed payload there, retrying until [`MAX_DELIVERY_ATTEMPTS`] is reached.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use super::actor_id::RepositoryId;
use super::client::{FederationClient, MAX_LOGGED_RESPONSE_BYTES};
use super::local_actor::LocalActorUrls;
use super::queue::{HandleOutcome, QueueHandler, WorkerQueue};
use super::remote_actor::RemoteActors;
use crate::data::{Database, FederatedFollowing, User};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERIES_TOTAL};

/// A delivery is dropped after this many failed POSTs.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 10;

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxTarget {
    /// Already known inbox URL
    Url(String),
    /// Inbox of a federated user, looked up when the item is dequeued
    FederatedUser(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    /// Local user the activity is sent on behalf of
    pub doer_id: i64,
    pub target: InboxTarget,
    /// Serialized activity JSON
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryItem {
    pub doer_id: i64,
    pub inbox_url: String,
    pub payload: String,
    /// POSTs attempted so far
    pub delivery_count: u32,
}

pub type PendingQueue = WorkerQueue<PendingItem>;
pub type DeliveryQueue = WorkerQueue<DeliveryItem>;

/// Resolves pending items into deliveries.
pub struct PendingHandler {
    db: Arc<Database>,
    deliveries: DeliveryQueue,
}

impl PendingHandler {
    pub fn new(db: Arc<Database>, deliveries: DeliveryQueue) -> Self {
        Self { db, deliveries }
    }

    async fn resolve(&self, target: &InboxTarget) -> Result<Option<String>, AppError> {
        match target {
            InboxTarget::Url(url) => Ok(Some(url.clone())),
            InboxTarget::FederatedUser(id) => {
                let Some(federated_user) = self.db.get_federated_user(*id).await? else {
                    return Ok(None);
                };
                let host = self
                    .db
                    .get_federation_host(federated_user.federation_host_id)
                    .await?;
                Ok(host.map(|host| host.join_path(&federated_user.inbox_path)))
            }
        }
    }
}

#[async_trait]
impl QueueHandler<PendingItem> for PendingHandler {
    async fn handle(&self, items: Vec<PendingItem>) -> HandleOutcome<PendingItem> {
        let total = items.len();
        let mut retry = Vec::new();

        for item in items {
            match self.resolve(&item.target).await {
                Ok(Some(inbox_url)) => {
                    let delivery = DeliveryItem {
                        doer_id: item.doer_id,
                        inbox_url,
                        payload: item.payload.clone(),
                        delivery_count: 0,
                    };
                    if let Err(e) = self.deliveries.push(delivery).await {
                        tracing::warn!(error = %e, "Delivery queue rejected item, retrying");
                        retry.push(item);
                    }
                }
                Ok(None) => {
                    tracing::warn!(target = ?item.target, "Inbox target no longer exists, dropping");
                }
                Err(e) => {
                    tracing::warn!(target = ?item.target, error = %e, "Failed to resolve inbox, retrying");
                    retry.push(item);
                }
            }
        }

        HandleOutcome::new(total - retry.len(), retry)
    }
}

/// POSTs deliveries, signed as the doer.
pub struct DeliveryHandler {
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    urls: LocalActorUrls,
}

impl DeliveryHandler {
    pub fn new(db: Arc<Database>, client: Arc<dyn FederationClient>, urls: LocalActorUrls) -> Self {
        Self { db, client, urls }
    }

    async fn deliver(&self, item: DeliveryItem) -> Option<DeliveryItem> {
        let doer = match self.db.get_user(item.doer_id).await {
            Ok(Some(doer)) => doer,
            Ok(None) => {
                tracing::error!(doer_id = item.doer_id, "Doer vanished, dropping delivery");
                DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
                return None;
            }
            Err(e) => {
                tracing::warn!(doer_id = item.doer_id, error = %e, "Failed to load doer");
                return self.failed(item);
            }
        };
        let signer = match self.urls.signer_for(&doer) {
            Ok(signer) => signer,
            Err(e) => {
                tracing::error!(doer_id = doer.id, error = %e, "Doer cannot sign, dropping delivery");
                DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
                return None;
            }
        };

        match self
            .client
            .post(&signer, &item.inbox_url, item.payload.as_bytes())
            .await
        {
            Ok(response) if response.is_success() => {
                tracing::debug!(inbox = %item.inbox_url, status = response.status, "Delivered activity");
                DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                None
            }
            Ok(response) => {
                let body: String = response.body.chars().take(MAX_LOGGED_RESPONSE_BYTES).collect();
                tracing::warn!(
                    inbox = %item.inbox_url,
                    status = response.status,
                    body = %body,
                    attempt = item.delivery_count,
                    "Inbox rejected activity"
                );
                self.failed(item)
            }
            Err(e) => {
                tracing::warn!(
                    inbox = %item.inbox_url,
                    error = %e,
                    attempt = item.delivery_count,
                    "Delivery failed"
                );
                self.failed(item)
            }
        }
    }

    fn failed(&self, item: DeliveryItem) -> Option<DeliveryItem> {
        if item.delivery_count < MAX_DELIVERY_ATTEMPTS {
            DELIVERIES_TOTAL.with_label_values(&["retry"]).inc();
            Some(item)
        } else {
            tracing::error!(
                inbox = %item.inbox_url,
                attempts = item.delivery_count,
                "Giving up on delivery"
            );
            DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
            None
        }
    }
}

#[async_trait]
impl QueueHandler<DeliveryItem> for DeliveryHandler {
    async fn handle(&self, items: Vec<DeliveryItem>) -> HandleOutcome<DeliveryItem> {
        let total = items.len();
        let attempts = items.into_iter().map(|mut item| {
            item.delivery_count += 1;
            self.deliver(item)
        });

        let retry: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();
        HandleOutcome::new(total - retry.len(), retry)
    }
}

/// Activities originated by local users.
#[derive(Clone)]
pub struct Outbox {
    db: Arc<Database>,
    actors: RemoteActors,
    urls: LocalActorUrls,
    pending: PendingQueue,
}

impl Outbox {
    pub fn new(
        db: Arc<Database>,
        actors: RemoteActors,
        urls: LocalActorUrls,
        pending: PendingQueue,
    ) -> Self {
        Self {
            db,
            actors,
            urls,
            pending,
        }
    }

    /// Queue `activity` for delivery to `target` on behalf of `doer_id`.
    pub async fn enqueue(
        &self,
        doer_id: i64,
        target: InboxTarget,
        activity: &Value,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_string(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize activity: {e}")))?;
        self.pending
            .push(PendingItem {
                doer_id,
                target,
                payload,
            })
            .await?;

        let kind = activity.get("type").and_then(Value::as_str).unwrap_or("unknown");
        ACTIVITIES_SENT.with_label_values(&[kind]).inc();
        Ok(())
    }

    fn local_actor(&self, doer: &User) -> Result<String, AppError> {
        if doer.is_remote {
            tracing::warn!(doer = doer.id, "Remote user cannot send activities");
            return Err(AppError::Forbidden);
        }
        Ok(self.urls.person(doer.id))
    }

    /// Follow a remote person. Re-following resends a fresh Follow.
    pub async fn follow_remote(
        &self,
        doer: &User,
        actor_uri: &str,
    ) -> Result<FederatedFollowing, AppError> {
        let actor = self.local_actor(doer)?;
        let remote = self.actors.find_or_create(actor_uri).await?;

        let follow_id = format!("{actor}/follows/{}", Ulid::new());
        let following = self
            .db
            .upsert_following(doer.id, remote.federated_user.id, &follow_id)
            .await?;
        let activity = builder::follow(
            &follow_id,
            &actor,
            &remote.federated_user.normalized_original_url,
        );
        self.enqueue(
            doer.id,
            InboxTarget::FederatedUser(remote.federated_user.id),
            &activity,
        )
        .await?;

        tracing::info!(doer = doer.id, target = %actor_uri, "Queued Follow");
        Ok(following)
    }

    /// # Returns
    /// `false` if `doer` was not following `actor_uri`.
    pub async fn unfollow_remote(&self, doer: &User, actor_uri: &str) -> Result<bool, AppError> {
        let actor = self.local_actor(doer)?;
        let remote = self
            .actors
            .find(actor_uri)
            .await?
            .ok_or(AppError::NotFound)?;

        let Some(following) = self
            .db
            .delete_following(doer.id, remote.federated_user.id)
            .await?
        else {
            return Ok(false);
        };

        let follow = builder::follow(
            &following.follow_activity_id,
            &actor,
            &remote.federated_user.normalized_original_url,
        );
        let undo = builder::undo(&format!("{actor}/undo/{}", Ulid::new()), &actor, follow);
        self.enqueue(
            doer.id,
            InboxTarget::FederatedUser(remote.federated_user.id),
            &undo,
        )
        .await?;

        tracing::info!(doer = doer.id, target = %actor_uri, "Queued Undo Follow");
        Ok(true)
    }

    async fn repository_inbox(&self, repository_uri: &str) -> Result<String, AppError> {
        let host = self.actors.hosts().resolve(repository_uri).await?;
        let repository = RepositoryId::parse(repository_uri, &host.software_name)?;
        Ok(format!("{}/inbox", repository.as_uri()))
    }

    /// Star a remote repository.
    pub async fn send_like(&self, doer: &User, repository_uri: &str) -> Result<(), AppError> {
        let actor = self.local_actor(doer)?;
        let inbox = self.repository_inbox(repository_uri).await?;

        let like = self.like(&actor, repository_uri);
        self.enqueue(doer.id, InboxTarget::Url(inbox), &like).await?;
        Ok(())
    }

    /// Remove a star from a remote repository.
    pub async fn send_undo_like(&self, doer: &User, repository_uri: &str) -> Result<(), AppError> {
        let actor = self.local_actor(doer)?;
        let inbox = self.repository_inbox(repository_uri).await?;

        let like = self.like(&actor, repository_uri);
        let mut undo = builder::undo(&format!("{actor}/undo/{}", Ulid::new()), &actor, like);
        undo["startTime"] = Value::String(chrono::Utc::now().to_rfc3339());
        self.enqueue(doer.id, InboxTarget::Url(inbox), &undo).await?;
        Ok(())
    }

    fn like(&self, actor: &str, repository_uri: &str) -> Value {
        builder::like(
            &format!("{actor}/likes/{}", Ulid::new()),
            actor,
            repository_uri,
            &chrono::Utc::now().to_rfc3339(),
        )
    }

    /// Publish a Note to every follower of `doer`.
    ///
    /// # Returns
    /// Number of followers the activity was queued for.
    pub async fn send_user_activity(
        &self,
        doer: &User,
        content: &str,
        note_url: Option<&str>,
    ) -> Result<usize, AppError> {
        let actor = self.local_actor(doer)?;
        let followers = self.db.list_followers(doer.id).await?;

        let activity_id = format!("{actor}/activities/{}", Ulid::new());
        let published = chrono::Utc::now().to_rfc3339();
        let note = builder::note(
            &format!("{activity_id}/note"),
            &actor,
            content,
            note_url,
            &published,
            vec![PUBLIC_COLLECTION],
        );
        let create = builder::create(&activity_id, &actor, note, vec![PUBLIC_COLLECTION], &published);

        let mut queued = 0;
        for follower in followers {
            match self
                .enqueue(doer.id, InboxTarget::FederatedUser(follower.id), &create)
                .await
            {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!(
                    follower = follower.id,
                    error = %e,
                    "Failed to queue activity for follower"
                ),
            }
        }

        tracing::info!(doer = doer.id, followers = queued, "Queued Create");
        Ok(queued)
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (usually a Note)
    /// * `to` - Primary recipients
    /// * `published` - Publication timestamp (RFC3339)
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, published: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "published": published
        })
    }

    /// Build a Like activity. Forges order stars by `startTime`.
    pub fn like(id: &str, actor: &str, object: &str, start_time: &str) -> Value {
        serde_json::json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://forgefed.org/ns"],
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object,
            "startTime": start_time
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        url: Option<&str>,
        published: &str,
        to: Vec<&str>,
    ) -> Value {
        let mut note = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "to": to
        });
        if let Some(url) = url {
            note["url"] = Value::String(url.to_string());
        }
        note
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{NewFederatedUser, NewFederationHost, NewUser};
    use crate::federation::client::{MockFederationClient, PostResponse};
    use crate::federation::host_registry::HostRegistry;
    use crate::federation::host_registry::tests::{expect_discovery, server_signer, test_db};
    use crate::federation::queue::QueueReceiver;
    use crate::federation::remote_actor::tests::person_document;
    use crate::federation::signature::generate_rsa_keypair;

    const REMOTE: &str = "https://remote.example/api/v1/activitypub/user-id/1";

    fn urls() -> LocalActorUrls {
        LocalActorUrls::new("https://forge.example")
    }

    async fn local_user(db: &Database, name: &str) -> User {
        let (private_key_pem, public_key_pem) = generate_rsa_keypair(1024).unwrap();
        db.insert_user(&NewUser {
            name: name.to_string(),
            login_name: Some(name.to_string()),
            full_name: None,
            is_remote: false,
            private_key_pem: Some(private_key_pem),
            public_key_pem: Some(public_key_pem),
        })
        .await
        .unwrap()
    }

    async fn remote_follower(db: &Database, port: u16) -> i64 {
        let host = db
            .insert_federation_host(&NewFederationHost {
                host_fqdn: "remote.example".to_string(),
                host_port: port,
                host_schema: "https".to_string(),
                software_name: "forgejo".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        db.create_federated_user(
            &NewUser {
                name: "bob-remote.example".to_string(),
                login_name: Some("1-remote.example".to_string()),
                full_name: None,
                is_remote: true,
                private_key_pem: None,
                public_key_pem: None,
            },
            &NewFederatedUser {
                external_id: "1".to_string(),
                federation_host_id: host.id,
                inbox_path: "/api/v1/activitypub/user-id/1/inbox".to_string(),
                normalized_original_url: REMOTE.to_string(),
                key_id: None,
                public_key: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn outbox(
        db: Arc<Database>,
        client: MockFederationClient,
    ) -> (Outbox, QueueReceiver<PendingItem>) {
        let signer = server_signer();
        let client: Arc<dyn FederationClient> = Arc::new(client);
        let hosts = HostRegistry::new(db.clone(), client.clone(), signer.clone());
        let actors = RemoteActors::new(db.clone(), client, hosts, signer);
        let (pending, receiver) = WorkerQueue::new("pending", db.clone());
        (Outbox::new(db, actors, urls(), pending), receiver)
    }

    fn payload(item: &PendingItem) -> Value {
        serde_json::from_str(&item.payload).unwrap()
    }

    #[tokio::test]
    async fn pending_resolves_federated_user_inbox() {
        let (db, _temp_dir) = test_db().await;
        let follower = remote_follower(&db, 8443).await;
        let (deliveries, mut receiver) = WorkerQueue::new("delivery", db.clone());
        let handler = PendingHandler::new(db, deliveries);

        let retry = handler
            .handle(vec![PendingItem {
                doer_id: 1,
                target: InboxTarget::FederatedUser(follower),
                payload: "{}".to_string(),
            }])
            .await
            .to_retry;
        assert!(retry.is_empty());

        let queued = receiver.drain().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].inbox_url,
            "https://remote.example:8443/api/v1/activitypub/user-id/1/inbox"
        );
        assert_eq!(queued[0].delivery_count, 0);
    }

    #[tokio::test]
    async fn pending_drops_unknown_federated_user() {
        let (db, _temp_dir) = test_db().await;
        let (deliveries, mut receiver) = WorkerQueue::new("delivery", db.clone());
        let handler = PendingHandler::new(db, deliveries);

        let retry = handler
            .handle(vec![PendingItem {
                doer_id: 1,
                target: InboxTarget::FederatedUser(404),
                payload: String::new(),
            }])
            .await
            .to_retry;
        assert!(retry.is_empty());
        assert!(receiver.drain().await.is_empty());
    }

    #[tokio::test]
    async fn delivery_signs_as_doer() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;
        let key_id = format!("https://forge.example/api/v1/activitypub/user-id/{}#main-key", doer.id);

        let mut client = MockFederationClient::new();
        client
            .expect_post()
            .withf(move |signer, url, payload| {
                signer.key_id == key_id && url == "https://remote.example/inbox" && payload == b"{}"
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(PostResponse {
                    status: 202,
                    body: String::new(),
                })
            });
        let handler = DeliveryHandler::new(db, Arc::new(client), urls());

        let retry = handler
            .handle(vec![DeliveryItem {
                doer_id: doer.id,
                inbox_url: "https://remote.example/inbox".to_string(),
                payload: "{}".to_string(),
                delivery_count: 0,
            }])
            .await
            .to_retry;
        assert!(retry.is_empty());
    }

    #[tokio::test]
    async fn failing_delivery_is_attempted_exactly_ten_times() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;

        let mut client = MockFederationClient::new();
        client
            .expect_post()
            .times(MAX_DELIVERY_ATTEMPTS as usize)
            .returning(|_, _, _| {
                Ok(PostResponse {
                    status: 500,
                    body: "boom".to_string(),
                })
            });
        let handler = DeliveryHandler::new(db, Arc::new(client), urls());

        let mut items = vec![DeliveryItem {
            doer_id: doer.id,
            inbox_url: "https://remote.example/inbox".to_string(),
            payload: "{}".to_string(),
            delivery_count: 0,
        }];
        let mut rounds = 0;
        while !items.is_empty() {
            items = handler.handle(items).await.to_retry;
            rounds += 1;
            assert!(rounds <= MAX_DELIVERY_ATTEMPTS, "delivery was not dropped");
        }
        assert_eq!(rounds, MAX_DELIVERY_ATTEMPTS);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;

        let mut client = MockFederationClient::new();
        client
            .expect_post()
            .times(1)
            .returning(|_, _, _| Err(AppError::Federation("connection reset".to_string())));
        let handler = DeliveryHandler::new(db, Arc::new(client), urls());

        let retry = handler
            .handle(vec![DeliveryItem {
                doer_id: doer.id,
                inbox_url: "https://remote.example/inbox".to_string(),
                payload: String::new(),
                delivery_count: 3,
            }])
            .await
            .to_retry;
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].delivery_count, 4);
    }

    #[tokio::test]
    async fn follow_remote_records_following_and_queues_follow() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;
        let (_, public_key_pem) = generate_rsa_keypair(1024).unwrap();
        let document = person_document(REMOTE, "bob", &public_key_pem);

        let mut client = MockFederationClient::new();
        expect_discovery(&mut client, "https://remote.example", "forgejo", 1);
        client
            .expect_get_body()
            .withf(|_, url| url == REMOTE)
            .times(1)
            .returning(move |_, _| Ok(document.clone().into_bytes()));
        let (outbox, mut receiver) = outbox(db.clone(), client);

        let following = outbox.follow_remote(&doer, REMOTE).await.unwrap();
        assert!(!following.accepted);

        let queued = receiver.drain().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].target,
            InboxTarget::FederatedUser(following.federated_user_id)
        );
        let follow = payload(&queued[0]);
        assert_eq!(follow["type"], "Follow");
        assert_eq!(follow["id"], following.follow_activity_id.as_str());
        assert_eq!(follow["object"], REMOTE);

        assert!(outbox.unfollow_remote(&doer, REMOTE).await.unwrap());
        let undo = payload(&receiver.drain().await[0]);
        assert_eq!(undo["type"], "Undo");
        assert_eq!(undo["object"]["id"], following.follow_activity_id.as_str());
        assert!(!outbox.unfollow_remote(&doer, REMOTE).await.unwrap());
    }

    #[tokio::test]
    async fn like_targets_repository_inbox() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;
        let repository = "https://remote.example/api/v1/activitypub/repository-id/3";

        let mut client = MockFederationClient::new();
        expect_discovery(&mut client, "https://remote.example", "forgejo", 1);
        let (outbox, mut receiver) = outbox(db, client);

        outbox.send_like(&doer, repository).await.unwrap();
        outbox.send_undo_like(&doer, repository).await.unwrap();

        let queued = receiver.drain().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].target, InboxTarget::Url(format!("{repository}/inbox")));
        let like = payload(&queued[0]);
        assert_eq!(like["type"], "Like");
        assert!(like["startTime"].is_string());
        let undo = payload(&queued[1]);
        assert_eq!(undo["type"], "Undo");
        assert_eq!(undo["object"]["type"], "Like");
        assert!(undo["startTime"].is_string());
    }

    #[tokio::test]
    async fn user_activity_fans_out_to_followers() {
        let (db, _temp_dir) = test_db().await;
        let doer = local_user(&db, "alice").await;
        let follower = remote_follower(&db, 443).await;
        db.add_follower(doer.id, follower).await.unwrap();

        let (outbox, mut receiver) = outbox(db, MockFederationClient::new());
        let queued = outbox
            .send_user_activity(&doer, "pushed 3 commits", Some("https://forge.example/alice/repo"))
            .await
            .unwrap();
        assert_eq!(queued, 1);

        let items = receiver.drain().await;
        assert_eq!(items[0].target, InboxTarget::FederatedUser(follower));
        let create = payload(&items[0]);
        assert_eq!(create["type"], "Create");
        assert_eq!(create["object"]["type"], "Note");
        assert_eq!(create["object"]["content"], "pushed 3 commits");
    }

    #[tokio::test]
    async fn remote_users_cannot_send() {
        let (db, _temp_dir) = test_db().await;
        let follower = remote_follower(&db, 443).await;
        let shadow = db
            .get_user(db.get_federated_user(follower).await.unwrap().unwrap().user_id)
            .await
            .unwrap()
            .unwrap();

        let (outbox, _receiver) = outbox(db, MockFederationClient::new());
        assert!(matches!(
            outbox.send_user_activity(&shadow, "hi", None).await,
            Err(AppError::Forbidden)
        ));
    }
}
