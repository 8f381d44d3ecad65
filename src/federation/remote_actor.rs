//! Remote actors and their local shadow users

use serde::Deserialize;
use std::sync::Arc;

use super::actor_id::{ActorId, PersonId};
use super::client::{FederationClient, Signer};
use super::host_registry::HostRegistry;
use super::signature::decode_public_key_pem;
use crate::data::{Database, FederatedUser, FederationHost, NewFederatedUser, NewUser, User};
use crate::error::AppError;
use crate::validation::{Validate, is_valid, validate_not_empty, validate_one_of};

/// Actor document types we know how to attach keys to.
pub const ACTOR_TYPES: [&str; 2] = ["Person", "Application"];

/// Embedded `publicKey` block of an actor document.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBlock {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub public_key_pem: String,
}

/// The subset of a remote actor document we rely on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inbox: Option<String>,
    #[serde(default)]
    pub icon: Option<serde_json::Value>,
    #[serde(default)]
    pub public_key: Option<PublicKeyBlock>,
}

impl ActorDocument {
    pub fn from_json(body: &[u8]) -> Result<Self, AppError> {
        let document: Self = serde_json::from_slice(body)
            .map_err(|e| AppError::Federation(format!("Invalid actor document: {e}")))?;
        is_valid(&document)?;
        Ok(document)
    }

    /// Path component of the advertised inbox.
    pub fn inbox_path(&self) -> Result<String, AppError> {
        let inbox = self
            .inbox
            .as_deref()
            .ok_or_else(|| AppError::Federation(format!("actor {} has no inbox", self.id)))?;
        let parsed = url::Url::parse(inbox)
            .map_err(|e| AppError::Federation(format!("inbox {inbox:?} is not a URL: {e}")))?;
        Ok(parsed.path().to_string())
    }

    /// Key id and DER bytes of the embedded key, if any.
    pub fn public_key_der(&self) -> Result<Option<(String, Vec<u8>)>, AppError> {
        match &self.public_key {
            Some(block) => {
                let der = decode_public_key_pem(&block.public_key_pem)?;
                Ok(Some((block.id.clone(), der)))
            }
            None => Ok(None),
        }
    }
}

impl Validate for ActorDocument {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.id, "id");
        result.extend(validate_one_of(&self.kind.as_str(), &ACTOR_TYPES, "type"));
        if self.kind == "Person" {
            result.extend(validate_not_empty(
                self.preferred_username.as_deref().unwrap_or_default(),
                "preferredUsername",
            ));
            result.extend(validate_not_empty(
                self.inbox.as_deref().unwrap_or_default(),
                "inbox",
            ));
        }
        if let Some(block) = &self.public_key {
            result.extend(validate_not_empty(&block.id, "publicKey.id"));
            result.extend(validate_not_empty(&block.public_key_pem, "publicKey.publicKeyPem"));
            if !block.owner.is_empty() && block.owner != self.id {
                result.push(format!(
                    "publicKey.owner {} is not the actor {}",
                    block.owner, self.id
                ));
            }
        }
        result
    }
}

/// A remote person together with its shadow user and host.
#[derive(Debug, Clone)]
pub struct RemoteActor {
    pub user: User,
    pub federated_user: FederatedUser,
    pub host: FederationHost,
}

#[derive(Clone)]
pub struct RemoteActors {
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    hosts: HostRegistry,
    signer: Signer,
}

impl RemoteActors {
    pub fn new(
        db: Arc<Database>,
        client: Arc<dyn FederationClient>,
        hosts: HostRegistry,
        signer: Signer,
    ) -> Self {
        Self {
            db,
            client,
            hosts,
            signer,
        }
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    /// Known remote actor, without any network access.
    pub async fn find(&self, actor_uri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = ActorId::parse(actor_uri)?;
        let Some(host) = self
            .db
            .find_federation_host_by_fqdn_and_port(&actor.host, actor.host_port)
            .await?
        else {
            return Ok(None);
        };
        let person_id = PersonId::parse(actor_uri, &host.software_name)?;
        self.lookup(&person_id, host).await
    }

    /// Resolve the actor's host, then return its shadow user, creating it
    /// from the fetched actor document on first contact.
    pub async fn find_or_create(&self, actor_uri: &str) -> Result<RemoteActor, AppError> {
        let host = self.hosts.resolve(actor_uri).await?;
        let person_id = PersonId::parse(actor_uri, &host.software_name)?;
        if let Some(existing) = self.lookup(&person_id, host.clone()).await? {
            return Ok(existing);
        }

        let body = self
            .client
            .get_body(&self.signer, &person_id.as_uri())
            .await?;
        let document = ActorDocument::from_json(&body)?;
        self.create_from_document(&person_id, host, &document).await
    }

    pub(crate) async fn lookup(
        &self,
        person_id: &PersonId,
        host: FederationHost,
    ) -> Result<Option<RemoteActor>, AppError> {
        let Some(federated_user) = self.db.find_federated_user(&person_id.id, host.id).await?
        else {
            return Ok(None);
        };
        let user = self
            .db
            .get_user(federated_user.user_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "federated user {} has no user row",
                    federated_user.id
                ))
            })?;

        Ok(Some(RemoteActor {
            user,
            federated_user,
            host,
        }))
    }

    pub(crate) async fn create_from_document(
        &self,
        person_id: &PersonId,
        host: FederationHost,
        document: &ActorDocument,
    ) -> Result<RemoteActor, AppError> {
        if document.kind != "Person" {
            return Err(AppError::Federation(format!(
                "actor {} is a {}, not a Person",
                document.id, document.kind
            )));
        }
        let declared = ActorId::parse(&document.id)?;
        if !declared.same_identity(person_id) {
            return Err(AppError::TrustViolation(format!(
                "document at {} claims to be {}",
                person_id.as_uri(),
                document.id
            )));
        }

        let preferred_username = document
            .preferred_username
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        let (key_id, public_key) = match document.public_key_der()? {
            Some((key_id, der)) => (Some(key_id), Some(der)),
            None => (None, None),
        };

        let user = NewUser {
            name: format!("{}{}", preferred_username, person_id.host_suffix()),
            login_name: Some(person_id.as_login_name()),
            full_name: document.name.clone(),
            is_remote: true,
            private_key_pem: None,
            public_key_pem: None,
        };
        let federated_user = NewFederatedUser {
            external_id: person_id.id.clone(),
            federation_host_id: host.id,
            inbox_path: document.inbox_path()?,
            normalized_original_url: person_id.as_uri(),
            key_id,
            public_key,
        };

        let federated_user = self.db.create_federated_user(&user, &federated_user).await?;
        tracing::info!(
            actor = %person_id.as_uri(),
            federated_user_id = federated_user.id,
            "Created federated user"
        );

        self.lookup(person_id, host).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "federated user {} missing after creation",
                federated_user.id
            ))
        })
    }
}
