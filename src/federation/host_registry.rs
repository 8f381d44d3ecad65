//! Federation host registry
//!
//! One `federation_host` row per remote (fqdn, port), created lazily by
//! NodeInfo discovery on first contact.

use std::sync::Arc;

use super::actor_id::ActorId;
use super::client::{FederationClient, Signer};
use super::nodeinfo::{NodeInfo, NodeInfoWellKnown};
use crate::data::{Database, FederationHost, NewFederationHost};
use crate::error::AppError;

#[derive(Clone)]
pub struct HostRegistry {
    db: Arc<Database>,
    client: Arc<dyn FederationClient>,
    /// Server actor; discovery GETs are signed as the instance
    signer: Signer,
}

impl HostRegistry {
    pub fn new(db: Arc<Database>, client: Arc<dyn FederationClient>, signer: Signer) -> Self {
        Self { db, client, signer }
    }

    /// Host record for the server `actor_uri` lives on, discovering it if new.
    pub async fn resolve(&self, actor_uri: &str) -> Result<FederationHost, AppError> {
        let actor = ActorId::parse(actor_uri)?;
        self.resolve_actor(&actor).await
    }

    pub async fn resolve_actor(&self, actor: &ActorId) -> Result<FederationHost, AppError> {
        if let Some(host) = self
            .db
            .find_federation_host_by_fqdn_and_port(&actor.host, actor.host_port)
            .await?
        {
            return Ok(host);
        }

        let node_info = self.discover(actor).await?;
        let new_host = NewFederationHost {
            host_fqdn: actor.host.clone(),
            host_port: actor.host_port,
            host_schema: actor.host_schema.clone(),
            software_name: node_info.software_name,
        };

        match self.db.insert_federation_host(&new_host).await? {
            Some(host) => {
                tracing::info!(
                    host = %host.host_fqdn,
                    port = host.host_port,
                    software = %host.software_name,
                    "Registered federation host"
                );
                Ok(host)
            }
            None => {
                tracing::debug!(
                    host = %new_host.host_fqdn,
                    port = new_host.host_port,
                    "Federation host created concurrently; re-reading"
                );
                self.db
                    .find_federation_host_by_fqdn_and_port(&new_host.host_fqdn, new_host.host_port)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "federation host {} vanished after insert conflict",
                            new_host.host_fqdn
                        ))
                    })
            }
        }
    }

    async fn discover(&self, actor: &ActorId) -> Result<NodeInfo, AppError> {
        let well_known_uri = actor.as_well_known_nodeinfo_uri();
        let body = self.client.get_body(&self.signer, &well_known_uri).await?;
        let well_known = NodeInfoWellKnown::from_json(&body)?;

        let body = self.client.get_body(&self.signer, &well_known.href).await?;
        NodeInfo::from_json(&body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::federation::client::MockFederationClient;
    use tempfile::TempDir;

    pub(crate) async fn test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (Arc::new(db), temp_dir)
    }

    pub(crate) fn server_signer() -> Signer {
        Signer {
            key_id: "https://forge.example/api/v1/activitypub/actor#main-key".to_string(),
            private_key_pem: "unused".to_string(),
        }
    }

    /// Expect the two discovery GETs for `base` exactly `times` times.
    pub(crate) fn expect_discovery(
        client: &mut MockFederationClient,
        base: &'static str,
        software: &'static str,
        times: usize,
    ) {
        client
            .expect_get_body()
            .withf(move |_, url| url == format!("{base}/.well-known/nodeinfo"))
            .times(times)
            .returning(move |_, _| {
                Ok(format!(r#"{{"links":[{{"href":"{base}/api/v1/nodeinfo"}}]}}"#).into_bytes())
            });
        client
            .expect_get_body()
            .withf(move |_, url| url == format!("{base}/api/v1/nodeinfo"))
            .times(times)
            .returning(move |_, _| {
                Ok(format!(r#"{{"software":{{"name":"{software}","version":"1"}}}}"#).into_bytes())
            });
    }

    #[tokio::test]
    async fn first_contact_discovers_and_persists() {
        let (db, _temp_dir) = test_db().await;
        let mut client = MockFederationClient::new();
        expect_discovery(&mut client, "https://remote.example", "Forgejo", 1);
        let registry = HostRegistry::new(db.clone(), Arc::new(client), server_signer());

        let host = registry
            .resolve("https://remote.example/api/v1/activitypub/user-id/1")
            .await
            .unwrap();
        assert_eq!(host.host_fqdn, "remote.example");
        assert_eq!(host.host_port, 443);
        assert_eq!(host.software_name, "forgejo");

        let again = registry
            .resolve("https://remote.example/api/v1/activitypub/user-id/2")
            .await
            .unwrap();
        assert_eq!(again.id, host.id);
    }

    #[tokio::test]
    async fn explicit_port_is_a_different_host() {
        let (db, _temp_dir) = test_db().await;
        let mut client = MockFederationClient::new();
        expect_discovery(&mut client, "https://remote.example", "forgejo", 1);
        expect_discovery(&mut client, "https://remote.example:8443", "gitea", 1);
        let registry = HostRegistry::new(db, Arc::new(client), server_signer());

        let default_port = registry
            .resolve("https://remote.example/api/v1/activitypub/user-id/1")
            .await
            .unwrap();
        let other_port = registry
            .resolve("https://remote.example:8443/api/v1/activitypub/user-id/1")
            .await
            .unwrap();
        assert_ne!(default_port.id, other_port.id);
        assert_eq!(other_port.software_name, "gitea");
    }

    #[tokio::test]
    async fn invalid_actor_uri_does_not_touch_the_network() {
        let (db, _temp_dir) = test_db().await;
        let client = MockFederationClient::new();
        let registry = HostRegistry::new(db, Arc::new(client), server_signer());

        let result = registry.resolve("http://localhost:3000/api/v1/something").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn failed_discovery_creates_nothing() {
        let (db, _temp_dir) = test_db().await;
        let mut client = MockFederationClient::new();
        client
            .expect_get_body()
            .times(1)
            .returning(|_, _| Err(AppError::Federation("connection refused".to_string())));
        let registry = HostRegistry::new(db.clone(), Arc::new(client), server_signer());

        assert!(
            registry
                .resolve("https://remote.example/api/v1/activitypub/user-id/1")
                .await
                .is_err()
        );
        assert!(
            db.find_federation_host_by_fqdn_and_port("remote.example", 443)
                .await
                .unwrap()
                .is_none()
        );
    }

    /// Serves Forgejo discovery, holding every well-known GET until
    /// `concurrent` of them are in flight.
    struct RacingDiscovery {
        barrier: tokio::sync::Barrier,
        well_known_gets: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FederationClient for RacingDiscovery {
        async fn get_body(&self, _signer: &Signer, url: &str) -> Result<Vec<u8>, AppError> {
            if url.ends_with("/.well-known/nodeinfo") {
                self.well_known_gets
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                self.barrier.wait().await;
                Ok(br#"{"links":[{"href":"https://remote.example/api/v1/nodeinfo"}]}"#.to_vec())
            } else {
                Ok(br#"{"software":{"name":"forgejo","version":"1"}}"#.to_vec())
            }
        }

        async fn post(
            &self,
            _signer: &Signer,
            _url: &str,
            _payload: &[u8],
        ) -> Result<crate::federation::client::PostResponse, AppError> {
            Err(AppError::Federation("unexpected POST".to_string()))
        }
    }

    #[tokio::test]
    async fn concurrent_first_contact_yields_one_host() {
        let (db, _temp_dir) = test_db().await;
        let client = Arc::new(RacingDiscovery {
            barrier: tokio::sync::Barrier::new(2),
            well_known_gets: std::sync::atomic::AtomicUsize::new(0),
        });
        let registry = HostRegistry::new(db.clone(), client.clone(), server_signer());

        let (first, second) = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::join!(
                registry.resolve("https://remote.example/api/v1/activitypub/user-id/1"),
                registry.resolve("https://remote.example/api/v1/activitypub/user-id/2"),
            )
        })
        .await
        .expect("both discoveries finish");

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.id, second.id);
        // both went through discovery, so one of them hit the insert conflict
        assert_eq!(
            client
                .well_known_gets
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        let stored = db
            .find_federation_host_by_fqdn_and_port("remote.example", 443)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, first.id);
    }
}
