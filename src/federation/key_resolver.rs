//! Public key resolution for inbound signatures
//!
//! Keys are looked up by key id in the stored federated users and hosts
//! first. A miss fetches the owning actor's document; its key is trusted only
//! if the document names the requested key id and describes the actor the
//! key id points at.

use rsa::RsaPublicKey;
use std::sync::Arc;

use super::actor_id::{ActorId, PersonId};
use super::client::{FederationClient, Signer};
use super::remote_actor::{ActorDocument, RemoteActors};
use super::signature::{decode_public_key_pem, public_key_from_der};
use crate::data::{Database, FederatedUser, FederationHost};
use crate::error::AppError;
use crate::metrics::{KEY_CACHE_HITS_TOTAL, KEY_CACHE_MISSES_TOTAL};

/// Entity a key is attached to.
#[derive(Debug, Clone)]
pub enum KeyOwner {
    /// A remote person
    FederatedUser(FederatedUser),
    /// A remote server actor
    FederationHost(FederationHost),
}

impl KeyOwner {
    fn label(&self) -> &'static str {
        match self {
            KeyOwner::FederatedUser(_) => "user",
            KeyOwner::FederationHost(_) => "host",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key_id: String,
    pub owner: KeyOwner,
    pub public_key: RsaPublicKey,
    /// Served from storage rather than freshly fetched
    pub from_cache: bool,
}

#[derive(Clone)]
pub struct KeyResolver {
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    actors: RemoteActors,
    signer: Signer,
}

impl KeyResolver {
    pub fn new(
        db: Arc<Database>,
        client: Arc<dyn FederationClient>,
        actors: RemoteActors,
        signer: Signer,
    ) -> Self {
        Self {
            db,
            client,
            actors,
            signer,
        }
    }

    pub async fn resolve_key(&self, key_id: &str) -> Result<ResolvedKey, AppError> {
        if let Some(cached) = self.cached(key_id).await? {
            KEY_CACHE_HITS_TOTAL
                .with_label_values(&[cached.owner.label()])
                .inc();
            return Ok(cached);
        }
        self.fetch_and_store(key_id).await
    }

    /// Skip storage and re-fetch, for keys that failed to verify.
    pub async fn refresh_key(&self, key_id: &str) -> Result<ResolvedKey, AppError> {
        self.fetch_and_store(key_id).await
    }

    async fn cached(&self, key_id: &str) -> Result<Option<ResolvedKey>, AppError> {
        if let Some(user) = self.db.find_federated_user_by_key_id(key_id).await? {
            if let Some(der) = &user.public_key {
                return Ok(Some(ResolvedKey {
                    key_id: key_id.to_string(),
                    public_key: public_key_from_der(der)?,
                    owner: KeyOwner::FederatedUser(user),
                    from_cache: true,
                }));
            }
        }

        if let Some(host) = self.db.find_federation_host_by_key_id(key_id).await? {
            if let Some(der) = &host.public_key {
                return Ok(Some(ResolvedKey {
                    key_id: key_id.to_string(),
                    public_key: public_key_from_der(der)?,
                    owner: KeyOwner::FederationHost(host),
                    from_cache: true,
                }));
            }
        }

        Ok(None)
    }

    async fn fetch_and_store(&self, key_id: &str) -> Result<ResolvedKey, AppError> {
        let actor = ActorId::from_key_id(key_id)?;
        let body = self.client.get_body(&self.signer, &actor.as_uri()).await?;
        let document = ActorDocument::from_json(&body)?;

        let block = document.public_key.as_ref().ok_or_else(|| {
            AppError::Federation(format!("actor {} publishes no public key", document.id))
        })?;
        if block.id != key_id {
            return Err(AppError::TrustViolation(format!(
                "document declares key {} but {} was requested",
                block.id, key_id
            )));
        }
        let declared = ActorId::parse(&document.id)?;
        if !declared.same_identity(&actor) {
            return Err(AppError::TrustViolation(format!(
                "key {} is served by {}",
                key_id, document.id
            )));
        }

        let der = decode_public_key_pem(&block.public_key_pem)?;
        let public_key = public_key_from_der(&der)?;

        let owner = match document.kind.as_str() {
            "Application" => self.store_host_key(&actor, key_id, &der).await?,
            "Person" => self.store_user_key(&actor, key_id, &der, &document).await?,
            other => {
                return Err(AppError::Federation(format!(
                    "cannot attach a key to actor type {other}"
                )));
            }
        };
        KEY_CACHE_MISSES_TOTAL
            .with_label_values(&[owner.label()])
            .inc();
        tracing::debug!(key_id = %key_id, owner = owner.label(), "Stored fetched public key");

        Ok(ResolvedKey {
            key_id: key_id.to_string(),
            owner,
            public_key,
            from_cache: false,
        })
    }

    async fn store_host_key(
        &self,
        actor: &ActorId,
        key_id: &str,
        der: &[u8],
    ) -> Result<KeyOwner, AppError> {
        let mut host = self.actors.hosts().resolve_actor(actor).await?;
        if host.host_fqdn != actor.host
            || host.host_port != actor.host_port
            || host.host_schema != actor.host_schema
        {
            return Err(AppError::TrustViolation(format!(
                "server key {} does not belong to host {}",
                key_id,
                host.as_url()
            )));
        }

        self.db.update_federation_host_key(host.id, key_id, der).await?;
        host.key_id = Some(key_id.to_string());
        host.public_key = Some(der.to_vec());
        Ok(KeyOwner::FederationHost(host))
    }

    async fn store_user_key(
        &self,
        actor: &ActorId,
        key_id: &str,
        der: &[u8],
        document: &ActorDocument,
    ) -> Result<KeyOwner, AppError> {
        let host = self.actors.hosts().resolve_actor(actor).await?;
        let person_id = PersonId::parse(&actor.as_uri(), &host.software_name)?;
        let remote = match self.actors.lookup(&person_id, host.clone()).await? {
            Some(remote) => remote,
            None => {
                self.actors
                    .create_from_document(&person_id, host, document)
                    .await?
            }
        };

        let mut federated_user = remote.federated_user;
        let declared = person_id.as_uri();
        if federated_user.normalized_original_url != declared {
            tracing::warn!(
                key_id = %key_id,
                stored = %federated_user.normalized_original_url,
                declared = %declared,
                "Key owner does not match the stored actor"
            );
            return Err(AppError::TrustViolation(format!(
                "key {} does not belong to federated user {}",
                key_id, federated_user.id
            )));
        }

        self.db
            .update_federated_user_key(federated_user.id, key_id, der)
            .await?;
        federated_user.key_id = Some(key_id.to_string());
        federated_user.public_key = Some(der.to_vec());
        Ok(KeyOwner::FederatedUser(federated_user))
    }
}
