//! # Signing Gateway Routes
//!
//! - `POST /api/boldsign/create-signing-link`: document from template, then embedded link
//! - `POST /api/boldsign/update-signing-status`: mark a stored contract signed
//! - `GET /signing/complete`: the provider's post-signing redirect target
//!
//! Provider failures are returned with the provider's own HTTP status and its
//! message text, so the session can show the raw reason locally.

use crate::error::AppError;
use crate::gateway::boldsign::{BoldSignClient, ProviderError, Signer};
use crate::gateway::broadcast::SigningNotice;
use crate::gateway::store::{ContractMetadata, ContractRecord, ContractStatus};
use crate::state::AppState;
use crate::tools::mediator::is_valid_email;
use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const PROVIDER_HOSTS: [&str; 2] = ["boldsign.com", "boldsign.io"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSigningLinkBody {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSigningStatusBody {
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "signed".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningCompleteQuery {
    #[serde(default)]
    pub document_id: Option<String>,
}

fn provider_failure(err: ProviderError) -> HttpResponse {
    warn!(status = err.status, error = %err.message, "Signing provider call failed");
    let status = StatusCode::from_u16(err.status)
        .ok()
        .filter(|status| status.is_client_error() || status.is_server_error())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    HttpResponse::build(status).json(json!({
        "success": false,
        "error": err.message,
        "details": err.details,
    }))
}

pub async fn create_signing_link(
    state: web::Data<AppState>,
    body: web::Json<CreateSigningLinkBody>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let email = body
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or_else(|| AppError::BadRequest("Email is required".to_string()))?;
    if !is_valid_email(email) {
        return Err(AppError::BadRequest("Invalid email format".to_string()));
    }

    let config = state.get_config().signing;
    if config.api_key.trim().is_empty() {
        return Err(AppError::ConfigError(
            "Signing provider API key not configured. Please set APP_SIGNING__API_KEY.".to_string(),
        ));
    }
    if config.template_id.trim().is_empty() {
        return Err(AppError::ConfigError(
            "Signing template ID not configured. Please set APP_SIGNING__TEMPLATE_ID.".to_string(),
        ));
    }

    let client = match BoldSignClient::new(&config) {
        Ok(client) => client,
        Err(err) => return Ok(provider_failure(err)),
    };

    let signer = Signer::new(email, body.name.as_deref());
    let frontend = config.frontend_url.trim_end_matches('/');
    let document_id = match client.send_template(&signer, &format!("{}/", frontend)).await {
        Ok(id) => id,
        Err(err) => return Ok(provider_failure(err)),
    };

    let redirect_url = format!("{}/signing/complete?documentId={}", frontend, document_id);
    let link = match client.embedded_sign_link(&document_id, email, &redirect_url).await {
        Ok(link) => link,
        Err(err) => return Ok(provider_failure(err)),
    };

    let now = Utc::now();
    let expires_at = Duration::try_seconds(link.expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime));
    let record = ContractRecord {
        email: email.to_string(),
        name: signer.name.clone(),
        document_id: document_id.clone(),
        signing_link: link.url.clone(),
        status: ContractStatus::Pending,
        signed_at: None,
        created_at: now,
        expires_at,
        metadata: ContractMetadata {
            session_id: body.session_id.clone(),
            call_id: body.call_id.clone(),
            redirect_url: Some(redirect_url),
            expires_in: Some(link.expires_in),
        },
    };

    // The link exists at the provider; a failed save is reported, not fatal
    let contract_id = match state.contracts.upsert(record) {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(document_id = %document_id, error = %err, "Failed to save contract");
            None
        }
    };

    info!(document_id = %document_id, call_id = ?body.call_id, "Signing link created");

    let retry_data = contract_id.is_none().then(|| {
        json!({
            "email": email,
            "name": signer.name,
            "documentId": document_id,
            "signingLink": link.url,
            "callId": body.call_id,
            "sessionId": body.session_id,
            "expiresAt": expires_at.map(|at| at.to_rfc3339()),
            "expiresIn": link.expires_in,
        })
    });

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "signingLink": link.url,
        "documentId": document_id,
        "contractId": contract_id,
        "expiresIn": link.expires_in,
        "message": "Signing link created successfully",
        "dbSaveFailed": contract_id.is_none(),
        "retryData": retry_data,
    })))
}

pub async fn update_signing_status(
    state: web::Data<AppState>,
    body: web::Json<UpdateSigningStatusBody>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let document_id = body
        .document_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Document ID is required".to_string()))?;
    let status: ContractStatus = body.status.parse()?;

    let updated = state.contracts.update_status(&document_id, status)?;
    info!(document_id = %document_id, status = %body.status, updated, "Contract status updated");

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Contract status updated successfully",
        "updated": updated,
    })))
}

fn from_signing_provider(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |referer| PROVIDER_HOSTS.iter().any(|host| referer.contains(host)))
}

/// Post-signing redirect page.
///
/// Only a visit referred by the signing provider announces completion; the page
/// then closes its own tab after one second.
pub async fn signing_complete(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<SigningCompleteQuery>,
) -> HttpResponse {
    if !from_signing_provider(&req) {
        return HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(PLAIN_PAGE);
    }

    let document_id = query.into_inner().document_id;
    let receivers = state.signing.publish(SigningNotice::contract_signed(document_id.clone()));
    info!(document_id = ?document_id, receivers, "Contract signing completed");

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(COMPLETE_PAGE)
}

const PLAIN_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Signing</title></head>\
<body><p>You can return to the conversation.</p></body></html>";

const COMPLETE_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Contract signed</title></head>\
<body><p>Thank you! Your contract has been signed. This tab will close shortly.</p>\
<script>setTimeout(function () { window.close(); }, 1000);</script></body></html>";
