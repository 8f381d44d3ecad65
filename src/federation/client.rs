//! Outbound federation HTTP
//!
//! Every outbound request is signed. GETs are signed by the server actor,
//! POSTs by the local actor on whose behalf an activity is delivered.

use async_trait::async_trait;
use std::time::Duration;

use super::signature::{sign_request, validate_resolved_host_ips};
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

/// Largest document accepted from a remote GET.
const MAX_DOCUMENT_BYTES: usize = 1024 * 1024;
/// Portion of a failed delivery's response body kept for the log.
pub const MAX_LOGGED_RESPONSE_BYTES: usize = 16 * 1024;

/// Key material used to sign one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    /// `{actor}#main-key`
    pub key_id: String,
    pub private_key_pem: String,
}

/// Outcome of a delivery POST that reached the remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostResponse {
    pub status: u16,
    /// Leading part of the body, for diagnostics
    pub body: String,
}

impl PostResponse {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Outbound HTTP used by discovery, key resolution, refresh and delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FederationClient: Send + Sync {
    /// Signed GET returning the body of a successful response.
    ///
    /// # Errors
    /// Transport failures, non-2xx status and oversized bodies.
    async fn get_body(&self, signer: &Signer, url: &str) -> Result<Vec<u8>, AppError>;

    /// Signed POST of an activity payload.
    ///
    /// Any HTTP status is returned as `Ok`; only transport failures are errors.
    async fn post(
        &self,
        signer: &Signer,
        url: &str,
        payload: &[u8],
    ) -> Result<PostResponse, AppError>;
}

/// `reqwest` implementation with a per-request timeout and an SSRF check on
/// the resolved addresses of every target host.
pub struct ReqwestClient {
    http: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("forgefed/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self { http })
    }

    async fn check_target(url: &str) -> Result<(), AppError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("URL {url} has no host")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation(format!("URL {url} has no port")))?;
        validate_resolved_host_ips(host, port).await
    }
}

#[async_trait]
impl FederationClient for ReqwestClient {
    async fn get_body(&self, signer: &Signer, url: &str) -> Result<Vec<u8>, AppError> {
        Self::check_target(url).await?;
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["GET"])
            .start_timer();

        let headers = sign_request("GET", url, None, &signer.private_key_pem, &signer.key_id)?;
        let response = self
            .http
            .get(url)
            .header("Accept", "application/activity+json")
            .header("Date", headers.date)
            .header("Signature", headers.signature)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Federation(format!("GET {url} returned HTTP {status}")));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_DOCUMENT_BYTES as u64)
        {
            return Err(AppError::Federation(format!("GET {url} response is too large")));
        }

        let body = response.bytes().await?;
        if body.len() > MAX_DOCUMENT_BYTES {
            return Err(AppError::Federation(format!("GET {url} response is too large")));
        }

        tracing::debug!(url = %url, bytes = body.len(), "Fetched remote document");
        Ok(body.to_vec())
    }

    async fn post(
        &self,
        signer: &Signer,
        url: &str,
        payload: &[u8],
    ) -> Result<PostResponse, AppError> {
        Self::check_target(url).await?;
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["POST"])
            .start_timer();

        let headers = sign_request(
            "POST",
            url,
            Some(payload),
            &signer.private_key_pem,
            &signer.key_id,
        )?;
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(payload.to_vec()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.unwrap_or_default();
        let shown = &body[..body.len().min(MAX_LOGGED_RESPONSE_BYTES)];

        Ok(PostResponse {
            status,
            body: String::from_utf8_lossy(shown).into_owned(),
        })
    }
}
