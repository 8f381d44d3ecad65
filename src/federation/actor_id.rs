//! Actor identities
//!
//! Every remote reference (actor IRI, key id, inbox owner) is parsed into one
//! of these types before anything else touches it. Construction always runs
//! full validation, so holding an `ActorId` means the URI was absolute,
//! pointed at a public DNS name and round-trips exactly.

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::AppError;
use crate::validation::{Validate, is_valid, validate_not_empty, validate_one_of};

/// Remote software family an identity was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Forgejo,
    Gitea,
    Mastodon,
    Gotosocial,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Forgejo,
        Source::Gitea,
        Source::Mastodon,
        Source::Gotosocial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Forgejo => "forgejo",
            Source::Gitea => "gitea",
            Source::Mastodon => "mastodon",
            Source::Gotosocial => "gotosocial",
        }
    }

    /// Forge family that shares our API path layout.
    pub fn is_forge(&self) -> bool {
        matches!(self, Source::Forgejo | Source::Gitea)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == normalized)
            .ok_or_else(|| {
                let names: Vec<&str> = Source::ALL.iter().map(Source::as_str).collect();
                AppError::Validation(
                    validate_one_of(&normalized.as_str(), &names, "source").join("; "),
                )
            })
    }
}

pub const PERSON_PATHS: [&str; 2] = ["api/v1/activitypub/user-id", "api/activitypub/user-id"];
pub const REPOSITORY_PATHS: [&str; 2] = [
    "api/v1/activitypub/repository-id",
    "api/activitypub/repository-id",
];

/// Generic actor identity parsed from an absolute URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId {
    /// Last path segment, lower-cased
    pub id: String,
    /// Declared software family; `None` for generic identities
    pub source: Option<Source>,
    pub host_schema: String,
    /// Path without leading/trailing slash and without the id
    pub path: String,
    pub host: String,
    pub host_port: u16,
    /// Case-normalized input the identity was parsed from
    pub unvalidated_input: String,
    /// True when the URI carried no port and the scheme default was supplied
    pub is_port_supplemented: bool,
}

impl ActorId {
    /// Parse and validate a generic actor identity.
    pub fn parse(uri: &str) -> Result<Self, AppError> {
        let actor = parse_unvalidated(uri)?;
        is_valid(&actor)?;
        Ok(actor)
    }

    /// Identity of the actor owning `key_id`. The `#fragment` naming the key
    /// is not part of the actor identity and is dropped before parsing.
    pub fn from_key_id(key_id: &str) -> Result<Self, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        Self::parse(actor_uri)
    }

    /// Host with the port appended only when the input spelled it out.
    pub fn authority(&self) -> String {
        if self.is_port_supplemented {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.host_port)
        }
    }

    pub fn host_base_url(&self) -> String {
        format!("{}://{}", self.host_schema, self.authority())
    }

    pub fn as_uri(&self) -> String {
        if self.path.is_empty() {
            format!("{}/{}", self.host_base_url(), self.id)
        } else {
            format!("{}/{}/{}", self.host_base_url(), self.path, self.id)
        }
    }

    pub fn as_well_known_nodeinfo_uri(&self) -> String {
        format!("{}/.well-known/nodeinfo", self.host_base_url())
    }

    /// Same remote actor, regardless of how the port was spelled.
    pub fn same_identity(&self, other: &ActorId) -> bool {
        self.host_schema == other.host_schema
            && self.host == other.host
            && self.host_port == other.host_port
            && self.path == other.path
            && self.id == other.id
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_uri())
    }
}

impl Validate for ActorId {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.id, "userId");
        result.extend(validate_not_empty(&self.host_schema, "schema"));
        result.extend(validate_not_empty(&self.path, "path"));
        result.extend(validate_not_empty(&self.host, "host"));
        result.extend(validate_not_empty(&self.unvalidated_input, "unvalidatedInput"));
        result.extend(validate_one_of(
            &self.host_schema.as_str(),
            &["http", "https"],
            "schema",
        ));
        if self.host_port == 0 {
            result.push("host port must not be 0".to_string());
        }
        if is_local_host(&self.host) {
            result.push(format!("host {} is not an external host", self.host));
        }
        if self.as_uri() != self.unvalidated_input {
            result.push(format!(
                "not all input was parsed, unvalidated input: {:?}, parsed URI: {:?}",
                self.unvalidated_input,
                self.as_uri()
            ));
        }
        result
    }
}

/// Identity of a remote person.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersonId {
    pub actor: ActorId,
}

impl PersonId {
    pub fn parse(uri: &str, source: &str) -> Result<Self, AppError> {
        let mut actor = parse_unvalidated(uri)?;
        actor.source = Some(source.parse()?);
        let person = PersonId { actor };
        is_valid(&person)?;
        Ok(person)
    }

    pub fn source(&self) -> Option<Source> {
        self.actor.source
    }

    /// `@id@host`, the handle a person is known by across instances.
    pub fn as_webfinger(&self) -> String {
        format!(
            "@{}@{}",
            self.actor.id.to_lowercase(),
            self.actor.host.to_lowercase()
        )
    }

    /// Local login name of the shadow user created for this person.
    pub fn as_login_name(&self) -> String {
        format!("{}{}", self.actor.id.to_lowercase(), self.host_suffix())
    }

    pub fn host_suffix(&self) -> String {
        format!("-{}", self.actor.host.to_lowercase())
    }
}

impl std::ops::Deref for PersonId {
    type Target = ActorId;

    fn deref(&self) -> &ActorId {
        &self.actor
    }
}

impl Validate for PersonId {
    fn validate(&self) -> Vec<String> {
        let mut result = self.actor.validate();
        match self.actor.source {
            None => result.push("field source should not be empty".to_string()),
            Some(source) if source.is_forge() => {
                if !PERSON_PATHS.contains(&self.actor.path.as_str()) {
                    result.push(format!(
                        "path: {:?} has to be a person specific api path",
                        self.actor.path
                    ));
                }
            }
            Some(_) => {}
        }
        result
    }
}

/// Identity of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryId {
    pub actor: ActorId,
}

impl RepositoryId {
    pub fn parse(uri: &str, source: &str) -> Result<Self, AppError> {
        let mut actor = parse_unvalidated(uri)?;
        actor.source = Some(source.parse()?);
        let repository = RepositoryId { actor };
        is_valid(&repository)?;
        Ok(repository)
    }
}

impl std::ops::Deref for RepositoryId {
    type Target = ActorId;

    fn deref(&self) -> &ActorId {
        &self.actor
    }
}

impl Validate for RepositoryId {
    fn validate(&self) -> Vec<String> {
        let mut result = self.actor.validate();
        match self.actor.source {
            None => result.push("field source should not be empty".to_string()),
            Some(source) if source.is_forge() => {
                if !REPOSITORY_PATHS.contains(&self.actor.path.as_str()) {
                    result.push(format!(
                        "path: {:?} has to be a repo specific api path",
                        self.actor.path
                    ));
                }
            }
            Some(_) => {}
        }
        result
    }
}

fn is_local_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.');
    normalized == "localhost" || normalized.ends_with(".localhost")
}

/// Port written in the authority component, if any.
///
/// `Url::port` hides ports equal to the scheme default, so the raw input is
/// inspected to tell `https://h/` from `https://h:443/`.
fn extract_explicit_port(input: &str) -> Option<u16> {
    let after_scheme = input.split_once("://")?.1;
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);

    if let Some(rest) = authority.strip_prefix('[') {
        let (_, tail) = rest.split_once(']')?;
        let port_str = tail.strip_prefix(':')?;
        return port_str.parse::<u16>().ok();
    }

    let (host_part, port_str) = authority.rsplit_once(':')?;
    if host_part.is_empty() || port_str.is_empty() || !port_str.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    port_str.parse::<u16>().ok()
}

fn parse_unvalidated(uri: &str) -> Result<ActorId, AppError> {
    let input = uri.trim().to_ascii_lowercase();
    if input.is_empty() {
        return Err(AppError::Validation("actor URI must not be empty".to_string()));
    }

    let parsed = Url::parse(&input)
        .map_err(|e| AppError::Validation(format!("invalid actor URI {input:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "unsupported actor URI scheme: {scheme}"
            )));
        }
    }

    let host = match parsed.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            return Err(AppError::Validation(format!(
                "actor URI {input:?} must use a DNS name, not an IP literal"
            )));
        }
        None => {
            return Err(AppError::Validation(format!(
                "actor URI {input:?} has no host"
            )));
        }
    };
    if is_local_host(&host) {
        return Err(AppError::Validation(format!(
            "actor URI {input:?} points at a local host"
        )));
    }

    let mut segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let id = segments
        .pop()
        .ok_or_else(|| AppError::Validation(format!("actor URI {input:?} has no path")))?
        .to_string();

    let explicit_port = extract_explicit_port(&input);
    let host_port = explicit_port
        .or_else(|| parsed.port_or_known_default())
        .ok_or_else(|| AppError::Validation(format!("actor URI {input:?} has no port")))?;

    Ok(ActorId {
        id,
        source: None,
        host_schema: parsed.scheme().to_string(),
        path: segments.join("/"),
        host,
        host_port,
        unvalidated_input: input,
        is_port_supplemented: explicit_port.is_none(),
    })
}
