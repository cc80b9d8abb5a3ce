//! # Signing Provider Client
//!
//! Two provider calls make one signing link:
//! 1. `POST {base}/template/send?templateId=..`: create a document from the template
//! 2. `GET {base}/document/getEmbeddedSignLink?..`: fetch the embedded signing URL
//!
//! Every request carries the `X-API-KEY` header. Provider failures keep their
//! HTTP status so the gateway route can pass it through.

use crate::config::SigningConfig;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const DOCUMENT_TITLE: &str = "Enrollment Contract";
const DOCUMENT_MESSAGE: &str = "Please review and sign the enrollment contract.";

/// Default link lifetime when the provider does not say.
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Longest link lifetime accepted from the provider (one year).
pub const MAX_EXPIRES_IN: i64 = DEFAULT_EXPIRES_IN * 24 * 365;

/// A failed provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    pub status: u16,
    pub message: String,
    pub details: Option<String>,
}

impl ProviderError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    /// Build from a non-2xx response body: `message`, then `error`, then `fallback`.
    fn from_body(status: u16, body: String, fallback: &str) -> Self {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|json| {
                ["message", "error"]
                    .iter()
                    .find_map(|key| json.get(*key).and_then(Value::as_str).map(str::to_string))
            })
            .unwrap_or_else(|| fallback.to_string());

        Self {
            status,
            message,
            details: Some(body),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(502);
        Self::new(status, err.to_string())
    }
}

/// Who signs the document.
#[derive(Debug, Clone, PartialEq)]
pub struct Signer {
    pub name: String,
    pub email: String,
}

impl Signer {
    /// The signer name falls back to the local part of the email.
    pub fn new(email: &str, name: Option<&str>) -> Self {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string());

        Self {
            name,
            email: email.to_string(),
        }
    }
}

/// The embedded link and its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedLink {
    pub url: String,
    pub expires_in: i64,
}

pub struct BoldSignClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    template_id: String,
}

impl BoldSignClient {
    pub fn new(config: &SigningConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: normalize_base_url(&config.provider_base_url),
            api_key: config.api_key.clone(),
            template_id: config.template_id.clone(),
        })
    }

    /// Create a document from the configured template; returns the document id.
    pub async fn send_template(&self, signer: &Signer, redirect_url: &str) -> Result<String, ProviderError> {
        let url = format!("{}/template/send", self.base_url);
        let body = json!({
            "title": DOCUMENT_TITLE,
            "message": DOCUMENT_MESSAGE,
            "roles": [{
                "roleIndex": 1,
                "signerName": signer.name,
                "signerEmail": signer.email,
                "signerOrder": 1,
                "signerType": "Signer",
                "redirectUrl": redirect_url,
            }],
            "disableEmails": true,
            "redirectUrl": redirect_url,
        });

        debug!(template_id = %self.template_id, "Creating document from template");
        let response = self
            .http
            .post(&url)
            .query(&[("templateId", self.template_id.as_str())])
            .header("X-API-KEY", &self.api_key)
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_body(
                status.as_u16(),
                text,
                "Failed to create document from template",
            ));
        }

        let data: Value = response.json().await?;
        let document_id = data
            .get("documentId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::new(500, "Failed to get document ID from Boldsign"))?;

        info!(document_id = %document_id, "Document created from template");
        Ok(document_id.to_string())
    }

    /// Fetch the embedded signing URL for a document.
    pub async fn embedded_sign_link(
        &self,
        document_id: &str,
        signer_email: &str,
        redirect_url: &str,
    ) -> Result<EmbeddedLink, ProviderError> {
        let url = format!("{}/document/getEmbeddedSignLink", self.base_url);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("documentId", document_id),
                ("signerEmail", signer_email),
                ("redirectUrl", redirect_url),
            ])
            .header("X-API-KEY", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_body(status.as_u16(), text, "Failed to get signing link"));
        }

        let data: Value = response.json().await?;
        let link = ["signLink", "signingUrl", "url"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_str))
            .filter(|link| !link.is_empty())
            .ok_or_else(|| ProviderError::new(500, "Failed to get signing link from Boldsign"))?;

        Ok(EmbeddedLink {
            url: link.to_string(),
            expires_in: data
                .get("expiresIn")
                .and_then(Value::as_i64)
                .filter(|seconds| *seconds > 0)
                .map_or(DEFAULT_EXPIRES_IN, |seconds| seconds.min(MAX_EXPIRES_IN)),
        })
    }
}

/// Strip a trailing slash and make sure the path ends in `/v1`.
pub fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}
