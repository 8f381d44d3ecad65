//! Data models
//!
//! Rust structs representing database rows. Integer ids are SQLite rowids;
//! timestamps use chrono, except `latest_activity` which is stored as unix
//! milliseconds so the ordering check can compare it inside SQL.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::{Validate, validate_max_len, validate_not_empty, validate_one_of};

/// Clock skew tolerated when a remote timestamp lies in the future.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

// =============================================================================
// Users
// =============================================================================

/// A local user or the shadow record of a remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    /// `id-host` for remote users
    pub login_name: Option<String>,
    pub full_name: Option<String>,
    pub is_remote: bool,
    /// RSA private key (PKCS#8 PEM), local users only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub login_name: Option<String>,
    pub full_name: Option<String>,
    pub is_remote: bool,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
}

impl Validate for NewUser {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.name, "name");
        result.extend(validate_max_len(&self.name, 255, "name"));
        if !self.is_remote
            && self
                .name
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            result.push(format!("name contains invalid characters: {}", self.name));
        }
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Repository {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Keys of the instance-level `Application` actor
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerActorKeys {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

// =============================================================================
// Federation host
// =============================================================================

/// One record per remote server instance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederationHost {
    pub id: i64,
    pub host_fqdn: String,
    pub host_port: u16,
    pub host_schema: String,
    pub software_name: String,
    /// Unix milliseconds of the newest accepted activity
    pub latest_activity: Option<i64>,
    pub key_id: Option<String>,
    /// DER-encoded SubjectPublicKeyInfo
    pub public_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FederationHost {
    pub fn latest_activity_at(&self) -> Option<DateTime<Utc>> {
        self.latest_activity
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Base URL of the host, with the port only when it is not the scheme default.
    pub fn as_url(&self) -> String {
        let default_port = match self.host_schema.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.host_port == default_port {
            format!("{}://{}", self.host_schema, self.host_fqdn)
        } else {
            format!("{}://{}:{}", self.host_schema, self.host_fqdn, self.host_port)
        }
    }

    /// Join a stored path (such as an inbox path) onto the host URL.
    pub fn join_path(&self, path: &str) -> String {
        format!("{}/{}", self.as_url(), path.trim_start_matches('/'))
    }
}

fn validate_host_fields(
    host_fqdn: &str,
    host_schema: &str,
    software_name: &str,
    latest_activity: Option<i64>,
) -> Vec<String> {
    let mut result = validate_not_empty(host_fqdn, "host_fqdn");
    result.extend(validate_max_len(host_fqdn, 255, "host_fqdn"));
    if host_fqdn != host_fqdn.to_lowercase() {
        result.push(format!("host_fqdn has to be lower case but was: {host_fqdn}"));
    }
    result.extend(validate_one_of(&host_schema, &["http", "https"], "host_schema"));
    result.extend(validate_not_empty(software_name, "software_name"));
    if let Some(ms) = latest_activity {
        let limit = Utc::now().timestamp_millis() + MAX_CLOCK_SKEW_SECONDS * 1000;
        if ms > limit {
            result.push("latest_activity may not be in the future".to_string());
        }
    }
    result
}

impl Validate for FederationHost {
    fn validate(&self) -> Vec<String> {
        validate_host_fields(
            &self.host_fqdn,
            &self.host_schema,
            &self.software_name,
            self.latest_activity,
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewFederationHost {
    pub host_fqdn: String,
    pub host_port: u16,
    pub host_schema: String,
    pub software_name: String,
}

impl Validate for NewFederationHost {
    fn validate(&self) -> Vec<String> {
        validate_host_fields(&self.host_fqdn, &self.host_schema, &self.software_name, None)
    }
}

// =============================================================================
// Federated user
// =============================================================================

/// Local shadow record of a remote actor, 1:1 with a `users` row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUser {
    pub id: i64,
    pub user_id: i64,
    pub external_id: String,
    pub federation_host_id: i64,
    pub inbox_path: String,
    pub normalized_original_url: String,
    pub key_id: Option<String>,
    pub public_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl Validate for FederatedUser {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.external_id, "external_id");
        result.extend(validate_not_empty(&self.inbox_path, "inbox_path"));
        result.extend(validate_not_empty(
            &self.normalized_original_url,
            "normalized_original_url",
        ));
        result
    }
}

#[derive(Debug, Clone)]
pub struct NewFederatedUser {
    pub external_id: String,
    pub federation_host_id: i64,
    pub inbox_path: String,
    pub normalized_original_url: String,
    pub key_id: Option<String>,
    pub public_key: Option<Vec<u8>>,
}

impl Validate for NewFederatedUser {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.external_id, "external_id");
        result.extend(validate_not_empty(&self.inbox_path, "inbox_path"));
        result.extend(validate_not_empty(
            &self.normalized_original_url,
            "normalized_original_url",
        ));
        result
    }
}

// =============================================================================
// Follow edges
// =============================================================================

/// A remote actor following a local user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUserFollower {
    pub id: i64,
    pub followed_user_id: i64,
    pub following_federated_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// A local user following a remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedFollowing {
    pub id: i64,
    pub local_user_id: i64,
    pub federated_user_id: i64,
    pub follow_activity_id: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Activity log
// =============================================================================

/// A Note received from a followed remote actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedUserActivity {
    pub id: i64,
    /// Shadow user of the remote actor
    pub user_id: i64,
    pub actor_id: String,
    pub original_activity_id: String,
    pub note_content: String,
    pub note_url: String,
    /// Raw activity JSON as received
    pub original_note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFederatedUserActivity {
    pub user_id: i64,
    pub actor_id: String,
    pub original_activity_id: String,
    pub note_content: String,
    pub note_url: String,
    pub original_note: String,
}

/// Outcome of recording a remote activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityRecord {
    Recorded,
    /// Same actor and activity id already on file
    Duplicate,
    /// Not newer than the latest activity from the host; nothing written
    Stale,
}

impl Validate for NewFederatedUserActivity {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor_id, "actor_id");
        result.extend(validate_not_empty(
            &self.original_activity_id,
            "original_activity_id",
        ));
        result.extend(validate_not_empty(&self.note_content, "note_content"));
        result.extend(validate_not_empty(&self.note_url, "note_url"));
        result.extend(validate_not_empty(&self.original_note, "original_note"));
        result
    }
}

// =============================================================================
// Queue jobs
// =============================================================================

/// A queued work item, as stored
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub queue: String,
    /// JSON encoded item
    pub payload: String,
    pub attempt: i64,
    /// Unix milliseconds
    pub run_at: i64,
    pub locked_until: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQueueJob {
    pub queue: String,
    pub payload: String,
    pub attempt: i64,
    pub run_at: i64,
}
