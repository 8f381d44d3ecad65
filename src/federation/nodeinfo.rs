//! NodeInfo discovery documents
//!
//! `/.well-known/nodeinfo` only points at the real document; the software
//! name is read from the document it links to.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::validation::{Validate, is_valid, validate_max_len, validate_not_empty};

/// `GET /.well-known/nodeinfo`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfoWellKnown {
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct WellKnownLinks {
    #[serde(default)]
    links: Vec<WellKnownLink>,
}

#[derive(Debug, Deserialize)]
struct WellKnownLink {
    href: String,
    #[serde(default)]
    #[allow(dead_code)]
    rel: Option<String>,
}

impl NodeInfoWellKnown {
    /// Parse the well-known document. The first link wins.
    pub fn from_json(body: &[u8]) -> Result<Self, AppError> {
        let links: WellKnownLinks = serde_json::from_slice(body)
            .map_err(|e| AppError::Federation(format!("Invalid nodeinfo well-known document: {e}")))?;
        let href = links
            .links
            .into_iter()
            .next()
            .map(|link| link.href)
            .ok_or_else(|| {
                AppError::Federation("nodeinfo well-known document has no links".to_string())
            })?;

        let well_known = Self { href };
        is_valid(&well_known)?;
        Ok(well_known)
    }
}

impl Validate for NodeInfoWellKnown {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.href, "href");
        match url::Url::parse(&self.href) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                if parsed.query().is_some() || parsed.fragment().is_some() {
                    result.push(format!("href {:?} must not carry query or fragment", self.href));
                }
            }
            Ok(parsed) => result.push(format!(
                "href {:?} has unsupported scheme {}",
                self.href,
                parsed.scheme()
            )),
            Err(e) => result.push(format!("href {:?} is not a valid URL: {e}", self.href)),
        }
        result
    }
}

/// The subset of a NodeInfo document the registry stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub software_name: String,
}

#[derive(Debug, Deserialize)]
struct NodeInfoDocument {
    software: NodeInfoSoftware,
}

#[derive(Debug, Deserialize)]
struct NodeInfoSoftware {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
}

impl NodeInfo {
    pub fn from_json(body: &[u8]) -> Result<Self, AppError> {
        let document: NodeInfoDocument = serde_json::from_slice(body)
            .map_err(|e| AppError::Federation(format!("Invalid nodeinfo document: {e}")))?;
        let node_info = Self {
            software_name: document.software.name.trim().to_lowercase(),
        };
        is_valid(&node_info)?;
        Ok(node_info)
    }
}

impl Validate for NodeInfo {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.software_name, "software_name");
        result.extend(validate_max_len(&self.software_name, 255, "software_name"));
        result
    }
}

/// NodeInfo 2.1 document describing this instance.
pub fn local_nodeinfo_document(version: &str, users_total: i64) -> serde_json::Value {
    serde_json::json!({
        "version": "2.1",
        "software": {
            "name": "forgefed",
            "version": version,
        },
        "protocols": ["activitypub"],
        "services": { "inbound": [], "outbound": [] },
        "openRegistrations": false,
        "usage": { "users": { "total": users_total } },
        "metadata": {},
    })
}

/// Well-known pointer at [`local_nodeinfo_document`].
pub fn local_well_known_document(base_url: &str) -> serde_json::Value {
    serde_json::json!({
        "links": [{
            "href": format!("{base_url}/api/v1/nodeinfo"),
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
        }]
    })
}
