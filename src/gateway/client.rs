//! # Signing Gateway Client
//!
//! What the session controller sees of the signing provider and the persistence
//! layer: a single [`SigningGateway`] trait. The production implementation,
//! [`HttpSigningGateway`], talks JSON to the gateway routes served by this same
//! binary (`/api/boldsign/*`, `/api/conversations/save`).
//!
//! Calls are single-attempt; failures are returned, never retried here.

use crate::error::{AppError, AppResult};
use crate::gateway::store::ConversationRecord;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Body of `POST create-signing-link`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SigningLinkRequest {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A created signing link. Owned by the UI until cleared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningLinkResult {
    pub link: String,
    pub document_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SigningGateway: Send + Sync {
    async fn create_signing_link(&self, request: SigningLinkRequest) -> AppResult<SigningLinkResult>;

    async fn update_signing_status(&self, document_id: &str, status: &str) -> AppResult<()>;

    async fn save_conversation(&self, record: &ConversationRecord) -> AppResult<()>;
}

/// Gateway reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSigningGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSigningGateway {
    pub fn new(base_url: &str) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, route: &str, body: &impl Serialize) -> AppResult<Value> {
        let url = format!("{}{}", self.base_url, route);
        debug!(url = %url, "Calling signing gateway");

        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        let parsed = serde_json::from_str::<Value>(&text).ok();
        let succeeded = status.is_success()
            && parsed
                .as_ref()
                .and_then(|body| body.get("success"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

        match parsed {
            Some(body) if succeeded => Ok(body),
            Some(body) => Err(AppError::ExternalService(failure_message(&body))),
            None => Err(AppError::ExternalService(format!(
                "Server error: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ).trim_end().to_string())),
        }
    }
}

/// `error`, then `message`, then a generic text.
fn failure_message(body: &Value) -> String {
    ["error", "message"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .find(|message| !message.is_empty())
        .unwrap_or("Failed to create signing link")
        .to_string()
}

#[async_trait]
impl SigningGateway for HttpSigningGateway {
    async fn create_signing_link(&self, request: SigningLinkRequest) -> AppResult<SigningLinkResult> {
        let body = self.post("/boldsign/create-signing-link", &request).await?;

        let link = body
            .get("signingLink")
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .ok_or_else(|| AppError::ExternalService(failure_message(&body)))?;

        let expires_at = body
            .get("expiresIn")
            .and_then(Value::as_i64)
            .and_then(ChronoDuration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        Ok(SigningLinkResult {
            link: link.to_string(),
            document_id: body
                .get("documentId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            expires_at,
        })
    }

    async fn update_signing_status(&self, document_id: &str, status: &str) -> AppResult<()> {
        let body = serde_json::json!({ "documentId": document_id, "status": status });
        self.post("/boldsign/update-signing-status", &body).await?;
        Ok(())
    }

    async fn save_conversation(&self, record: &ConversationRecord) -> AppResult<()> {
        self.post("/conversations/save", record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SigningLinkRequest {
        SigningLinkRequest {
            email: "a@b.com".to_string(),
            name: Some("Jane Doe".to_string()),
            call_id: Some("call_1".to_string()),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_signing_link_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/create-signing-link"))
            .and(body_partial_json(json!({ "email": "a@b.com", "name": "Jane Doe", "callId": "call_1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "signingLink": "https://sign/1",
                "documentId": "doc-1",
                "expiresIn": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api/", server.uri())).unwrap();
        let result = gateway.create_signing_link(request()).await.unwrap();

        assert_eq!(result.link, "https://sign/1");
        assert_eq!(result.document_id, "doc-1");
        assert!(result.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/create-signing-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "signingLink": "https://sign/1",
                "documentId": "doc-1",
                "expiresIn": i64::MAX
            })))
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api", server.uri())).unwrap();
        let result = gateway.create_signing_link(request()).await.unwrap();

        assert_eq!(result.link, "https://sign/1");
        assert!(result.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_create_signing_link_reports_gateway_error_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/create-signing-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "Invalid email"
            })))
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api", server.uri())).unwrap();
        let err = gateway.create_signing_link(request()).await.unwrap_err();
        assert_eq!(err, AppError::ExternalService("Invalid email".to_string()));
    }

    #[tokio::test]
    async fn test_non_json_failure_uses_status_line() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/create-signing-link"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api", server.uri())).unwrap();
        let err = gateway.create_signing_link(request()).await.unwrap_err();
        assert_eq!(err.message(), "Server error: 503 Service Unavailable");
    }

    #[tokio::test]
    async fn test_update_signing_status_posts_document_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/update-signing-status"))
            .and(body_partial_json(json!({ "documentId": "doc-1", "status": "signed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api", server.uri())).unwrap();
        assert!(gateway.update_signing_status("doc-1", "signed").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_signing_status_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/boldsign/update-signing-status"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "success": false,
                "error": "Contract not found"
            })))
            .mount(&server)
            .await;

        let gateway = HttpSigningGateway::new(&format!("{}/api", server.uri())).unwrap();
        let err = gateway.update_signing_status("missing", "signed").await.unwrap_err();
        assert_eq!(err.message(), "Contract not found");
    }
}
