//! Local actors: IRIs, signing keys and their JSON documents

use crate::data::{Repository, User};
use crate::error::AppError;

use super::client::Signer;

/// IRIs of everything this instance exposes to the federation.
#[derive(Debug, Clone)]
pub struct LocalActorUrls {
    base_url: String,
}

impl LocalActorUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn person(&self, user_id: i64) -> String {
        format!("{}/api/v1/activitypub/user-id/{}", self.base_url, user_id)
    }

    pub fn person_inbox(&self, user_id: i64) -> String {
        format!("{}/inbox", self.person(user_id))
    }

    pub fn person_outbox(&self, user_id: i64) -> String {
        format!("{}/outbox", self.person(user_id))
    }

    pub fn repository(&self, repository_id: i64) -> String {
        format!(
            "{}/api/v1/activitypub/repository-id/{}",
            self.base_url, repository_id
        )
    }

    pub fn repository_inbox(&self, repository_id: i64) -> String {
        format!("{}/inbox", self.repository(repository_id))
    }

    /// The instance-level `Application` actor.
    pub fn server_actor(&self) -> String {
        format!("{}/api/v1/activitypub/actor", self.base_url)
    }

    pub fn server_actor_inbox(&self) -> String {
        format!("{}/inbox", self.server_actor())
    }

    pub fn key_id(actor: &str) -> String {
        format!("{actor}#main-key")
    }

    /// Signing identity of a local user.
    pub fn signer_for(&self, user: &User) -> Result<Signer, AppError> {
        if user.is_remote {
            return Err(AppError::Internal(anyhow::anyhow!(
                "user {} is a remote shadow and cannot sign",
                user.id
            )));
        }
        let private_key_pem = user.private_key_pem.clone().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("user {} has no private key", user.id))
        })?;

        Ok(Signer {
            key_id: Self::key_id(&self.person(user.id)),
            private_key_pem,
        })
    }

    pub fn person_document(&self, user: &User) -> serde_json::Value {
        let actor = self.person(user.id);
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "type": "Person",
            "id": actor,
            "preferredUsername": user.name,
            "name": user.full_name.clone().unwrap_or_else(|| user.name.clone()),
            "url": format!("{}/{}", self.base_url, user.name),
            "inbox": self.person_inbox(user.id),
            "outbox": self.person_outbox(user.id),
            "icon": {
                "type": "Image",
                "mediaType": "image/png",
                "url": format!("{}/{}.png", self.base_url, user.name),
            },
            "publicKey": {
                "id": Self::key_id(&actor),
                "owner": actor,
                "publicKeyPem": user.public_key_pem.clone().unwrap_or_default(),
            }
        })
    }

    pub fn repository_document(&self, repository: &Repository) -> serde_json::Value {
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://forgefed.org/ns"
            ],
            "type": "Repository",
            "id": self.repository(repository.id),
            "name": repository.name,
            "inbox": self.repository_inbox(repository.id),
        })
    }

    pub fn server_actor_document(&self, public_key_pem: &str) -> serde_json::Value {
        let actor = self.server_actor();
        serde_json::json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "type": "Application",
            "id": actor,
            "preferredUsername": "ghost",
            "inbox": self.server_actor_inbox(),
            "outbox": format!("{actor}/outbox"),
            "publicKey": {
                "id": Self::key_id(&actor),
                "owner": actor,
                "publicKeyPem": public_key_pem,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn local_user() -> User {
        User {
            id: 7,
            name: "alice".to_string(),
            login_name: None,
            full_name: None,
            is_remote: false,
            private_key_pem: Some("private".to_string()),
            public_key_pem: Some("public".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn iris_hang_off_the_base_url() {
        let urls = LocalActorUrls::new("https://forge.example/");
        assert_eq!(
            urls.person_inbox(7),
            "https://forge.example/api/v1/activitypub/user-id/7/inbox"
        );
        assert_eq!(
            LocalActorUrls::key_id(&urls.server_actor()),
            "https://forge.example/api/v1/activitypub/actor#main-key"
        );
        assert_eq!(
            urls.repository_inbox(3),
            "https://forge.example/api/v1/activitypub/repository-id/3/inbox"
        );
    }

    #[test]
    fn signer_uses_person_key_id() {
        let urls = LocalActorUrls::new("https://forge.example");
        let signer = urls.signer_for(&local_user()).expect("signer");
        assert_eq!(
            signer.key_id,
            "https://forge.example/api/v1/activitypub/user-id/7#main-key"
        );
    }

    #[test]
    fn remote_users_cannot_sign() {
        let urls = LocalActorUrls::new("https://forge.example");
        let mut user = local_user();
        user.is_remote = true;
        assert!(urls.signer_for(&user).is_err());
    }

    #[test]
    fn person_document_embeds_key_block() {
        let urls = LocalActorUrls::new("https://forge.example");
        let doc = urls.person_document(&local_user());
        assert_eq!(doc["type"], "Person");
        assert_eq!(doc["preferredUsername"], "alice");
        assert_eq!(
            doc["publicKey"]["owner"],
            "https://forge.example/api/v1/activitypub/user-id/7"
        );
        assert_eq!(doc["publicKey"]["publicKeyPem"], "public");
    }
}
