//! Serializable snapshot of everything the UI renders for one session.

use crate::session::state::SessionState;
use crate::tools::mediator::{FormState, SigningStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormView {
    pub visible: bool,
    pub email: String,
    pub name: String,
}

impl From<&FormState> for FormView {
    fn from(form: &FormState) -> Self {
        Self {
            visible: form.visible,
            email: form.email.clone(),
            name: form.name.clone(),
        }
    }
}

/// Signing link shown below the avatar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkView {
    pub url: String,
    pub document_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: SessionState,
    /// Microphone permission refused: show remediation instead of `error`.
    pub mic_denied: bool,
    pub error: Option<String>,
    pub transcript: String,
    pub muted: bool,
    pub signing_link: Option<LinkView>,
    pub signing_link_error: Option<String>,
    pub creating_signing_link: bool,
    pub contract_signed: bool,
    pub form: FormView,
}

impl SessionView {
    /// Split the signing status into the two UI fields. At most one is set.
    pub fn signing_fields(status: &SigningStatus) -> (Option<LinkView>, Option<String>) {
        match status {
            SigningStatus::Empty => (None, None),
            SigningStatus::Link(result) => (
                Some(LinkView {
                    url: result.link.clone(),
                    document_id: result.document_id.clone(),
                    expires_at: result.expires_at,
                }),
                None,
            ),
            SigningStatus::Failed(message) => (None, Some(message.clone())),
        }
    }
}
