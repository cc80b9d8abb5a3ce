//! # Tool-Invocation Mediator
//!
//! Resolves signing-link requests coming from the conversational engine without
//! blocking the conversation. The mediator is plain state: it decides, and returns
//! [`MediatorAction`]s that the session controller executes (engine replies,
//! gateway calls, timers, opening links).
//!
//! ## Resolution paths:
//! 1. **Tool call with email**: call the gateway, then acknowledge success or apologize
//! 2. **Tool call without email**: open the form and acknowledge "form opened" right away
//! 3. **Form submission**: validate locally, call the gateway, open the link,
//!    acknowledge the pending call naming the submitted email and name
//! 4. **Keyword fallback**: the assistant talks about contracts but never calls the
//!    tool; a debounced timer opens the form unless something preempts it
//!
//! ## Guarantees:
//! - A call id is resolved at most once, whichever channel reports it first
//! - A stored link and a stored error never coexist ([`SigningStatus`])

use crate::error::AppError;
use crate::gateway::client::SigningLinkResult;
use crate::tools::normalize::ToolCall;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const FORM_OPENED_MESSAGE: &str = "I've opened a form for you to enter your email and name. \
Once you fill it out and submit, I'll create your contract signing link immediately.";

pub const LINK_CREATED_MESSAGE: &str = "Perfect! I've created your contract signing link. \
You can see it below and click to sign the enrollment contract.";

pub const APOLOGY_MESSAGE: &str = "I'm sorry, I encountered an issue creating your signing link. \
Please try again or contact support.";

pub const INVALID_EMAIL_MESSAGE: &str = "Please enter a valid email address";
pub const MISSING_NAME_MESSAGE: &str = "Please enter your full name";

const DEFAULT_LINK_ERROR: &str = "Failed to create signing link";

/// Acknowledgment sent after a form submission succeeds.
pub fn form_success_message(email: &str, name: &str) -> String {
    format!(
        "The user has successfully provided their email ({}) and name ({}) through the form. \
         I've created the contract signing link and automatically opened it in a new tab for them. \
         The user can now complete the signing process in that new tab.",
        email, name
    )
}

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().map_or(false, |pattern| pattern.is_match(email))
}

/// Signing outcome shown to the user. One enum, so link and error are exclusive.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SigningStatus {
    #[default]
    Empty,
    Link(SigningLinkResult),
    Failed(String),
}

impl SigningStatus {
    pub fn link(&self) -> Option<&SigningLinkResult> {
        match self {
            SigningStatus::Link(result) => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SigningStatus::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// Contents of the email/name collection form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormState {
    pub visible: bool,
    pub email: String,
    pub name: String,
}

impl FormState {
    fn open(&mut self) {
        self.visible = true;
        self.email.clear();
        self.name.clear();
    }

    fn close(&mut self) {
        self.visible = false;
        self.email.clear();
        self.name.clear();
    }

    fn is_blank(&self) -> bool {
        self.email.is_empty() && self.name.is_empty()
    }
}

/// Where a gateway request came from; decides how its result is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOrigin {
    ToolCall { call_id: String },
    Form { call_id: Option<String>, email: String, name: String },
}

/// A gateway call the controller must perform.
///
/// `epoch` ties the request to the mediator generation that issued it; results
/// from before a reset are discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub email: String,
    pub name: Option<String>,
    pub origin: RequestOrigin,
    pub epoch: u64,
}

impl LinkRequest {
    pub fn call_id(&self) -> Option<&str> {
        match &self.origin {
            RequestOrigin::ToolCall { call_id } => Some(call_id),
            RequestOrigin::Form { call_id, .. } => call_id.as_deref(),
        }
    }
}

/// Side effects for the session controller to carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MediatorAction {
    Acknowledge { call_id: String, message: String },
    RequestLink(LinkRequest),
    ArmFallback,
    CancelFallback,
    OpenUrl(String),
}

pub struct ToolMediator {
    keywords: Vec<String>,
    resolved: HashSet<String>,
    processed: bool,
    pending_call_id: Option<String>,
    form: FormState,
    status: SigningStatus,
    creating: bool,
    contract_signed: bool,
    last_document_id: Option<String>,
    epoch: u64,
}

impl ToolMediator {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            resolved: HashSet::new(),
            processed: false,
            pending_call_id: None,
            form: FormState::default(),
            status: SigningStatus::Empty,
            creating: false,
            contract_signed: false,
            last_document_id: None,
            epoch: 0,
        }
    }

    /// Handle a normalized tool call from either engine channel.
    pub fn on_tool_call(&mut self, call: ToolCall) -> Vec<MediatorAction> {
        if !call.is_signing_link_request() {
            debug!(function = %call.function_name, "Ignoring unrelated function call");
            return Vec::new();
        }

        if !self.resolved.insert(call.call_id.clone()) {
            debug!(call_id = %call.call_id, channel = ?call.channel, "Duplicate tool call ignored");
            return Vec::new();
        }

        match call.email {
            None => {
                info!(call_id = %call.call_id, "Signing link requested without email, opening form");
                self.processed = true;
                self.pending_call_id = Some(call.call_id.clone());
                self.form.open();
                vec![
                    MediatorAction::CancelFallback,
                    MediatorAction::Acknowledge {
                        call_id: call.call_id,
                        message: FORM_OPENED_MESSAGE.to_string(),
                    },
                ]
            }
            Some(email) => {
                info!(call_id = %call.call_id, "Signing link requested by tool call");
                self.begin_request();
                vec![MediatorAction::RequestLink(LinkRequest {
                    email,
                    name: call.name,
                    origin: RequestOrigin::ToolCall { call_id: call.call_id },
                    epoch: self.epoch,
                })]
            }
        }
    }

    /// Handle the gateway's answer to a [`LinkRequest`].
    pub fn on_link_result(
        &mut self,
        request: &LinkRequest,
        result: Result<SigningLinkResult, AppError>,
    ) -> Vec<MediatorAction> {
        if request.epoch != self.epoch {
            debug!("Discarding signing link result from a previous session");
            return Vec::new();
        }
        self.creating = false;

        match result {
            Ok(link) => {
                info!(document_id = %link.document_id, "Signing link created");
                let url = link.link.clone();
                self.last_document_id = Some(link.document_id.clone());
                self.status = SigningStatus::Link(link);
                self.processed = true;
                self.form.close();

                let mut actions = vec![MediatorAction::CancelFallback];
                match &request.origin {
                    RequestOrigin::ToolCall { call_id } => {
                        actions.push(MediatorAction::Acknowledge {
                            call_id: call_id.clone(),
                            message: LINK_CREATED_MESSAGE.to_string(),
                        });
                    }
                    RequestOrigin::Form { call_id, email, name } => {
                        actions.push(MediatorAction::OpenUrl(url));
                        if let Some(call_id) = call_id {
                            actions.push(MediatorAction::Acknowledge {
                                call_id: call_id.clone(),
                                message: form_success_message(email, name),
                            });
                        }
                        self.pending_call_id = None;
                    }
                }
                actions
            }
            Err(err) => {
                warn!(error = %err, "Signing link request failed");
                let message = match err.message() {
                    "" => DEFAULT_LINK_ERROR.to_string(),
                    message => message.to_string(),
                };
                self.status = SigningStatus::Failed(message);

                if let RequestOrigin::Form { .. } = request.origin {
                    self.pending_call_id = None;
                }
                match request.call_id() {
                    Some(call_id) => vec![MediatorAction::Acknowledge {
                        call_id: call_id.to_string(),
                        message: APOLOGY_MESSAGE.to_string(),
                    }],
                    None => Vec::new(),
                }
            }
        }
    }

    /// Check an assistant transcript for signing keywords.
    ///
    /// Returns `ArmFallback` when the form should open after the debounce delay.
    pub fn on_assistant_transcript(&mut self, transcript: &str) -> Vec<MediatorAction> {
        let lowered = transcript.to_lowercase();
        let mentions_signing = self.keywords.iter().any(|keyword| lowered.contains(keyword.as_str()));

        if mentions_signing && self.fallback_allowed() {
            debug!("Assistant mentioned signing without a tool call, arming form fallback");
            vec![MediatorAction::ArmFallback]
        } else {
            Vec::new()
        }
    }

    /// Fallback timer fired. Conditions are re-read now, not when the timer was armed.
    ///
    /// Returns whether the form was opened.
    pub fn on_fallback_elapsed(&mut self) -> bool {
        if !self.fallback_allowed() {
            debug!("Form fallback preempted");
            return false;
        }
        info!("Opening signing form from keyword fallback");
        self.form.visible = true;
        true
    }

    fn fallback_allowed(&self) -> bool {
        !self.form.visible
            && self.status.link().is_none()
            && !self.creating
            && !self.processed
            && self.form.is_blank()
            && self.pending_call_id.is_none()
    }

    pub fn update_form(&mut self, email: String, name: String) {
        self.form.email = email;
        self.form.name = name;
    }

    /// Validate and submit the form.
    ///
    /// ## Errors:
    /// `ValidationError` for a malformed email or an empty name. The message is
    /// also stored as the local signing error; nothing reaches the engine.
    pub fn submit_form(&mut self) -> Result<Vec<MediatorAction>, AppError> {
        let email = self.form.email.trim().to_string();
        let name = self.form.name.trim().to_string();

        let invalid = if email.is_empty() || !is_valid_email(&email) {
            Some(INVALID_EMAIL_MESSAGE)
        } else if name.is_empty() {
            Some(MISSING_NAME_MESSAGE)
        } else {
            None
        };
        if let Some(message) = invalid {
            self.status = SigningStatus::Failed(message.to_string());
            return Err(AppError::ValidationError(message.to_string()));
        }

        self.processed = true;
        self.form.visible = false;
        self.begin_request();

        Ok(vec![
            MediatorAction::CancelFallback,
            MediatorAction::RequestLink(LinkRequest {
                email: email.clone(),
                name: Some(name.clone()),
                origin: RequestOrigin::Form {
                    call_id: self.pending_call_id.clone(),
                    email,
                    name,
                },
                epoch: self.epoch,
            }),
        ])
    }

    pub fn dismiss_form(&mut self) {
        self.form.close();
    }

    /// Whether a completion notice for `document_id` concerns this session.
    ///
    /// Notices without a document id match any session that created a link.
    pub fn awaits_signature(&self, document_id: Option<&str>) -> bool {
        let mine = self
            .status
            .link()
            .map(|link| link.document_id.as_str())
            .or(self.last_document_id.as_deref());
        match (document_id, mine) {
            (Some(theirs), Some(mine)) => theirs == mine,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// The signing page reported completion.
    ///
    /// Clears the stored link or error, raises the success banner and returns the
    /// document id whose status should be reported as signed.
    pub fn on_contract_signed(&mut self) -> Option<String> {
        let document_id = self
            .status
            .link()
            .map(|link| link.document_id.clone())
            .or_else(|| self.last_document_id.clone());
        self.status = SigningStatus::Empty;
        self.contract_signed = true;
        document_id
    }

    pub fn clear_signed_banner(&mut self) {
        self.contract_signed = false;
    }

    /// Forget everything; results of requests issued before the reset are dropped.
    pub fn reset(&mut self) {
        self.resolved.clear();
        self.processed = false;
        self.pending_call_id = None;
        self.form = FormState::default();
        self.status = SigningStatus::Empty;
        self.creating = false;
        self.last_document_id = None;
        self.epoch += 1;
    }

    fn begin_request(&mut self) {
        self.creating = true;
        if let SigningStatus::Failed(_) = self.status {
            self.status = SigningStatus::Empty;
        }
    }

    pub fn status(&self) -> &SigningStatus {
        &self.status
    }

    pub fn form(&self) -> &FormState {
        &self.form
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn contract_signed(&self) -> bool {
        self.contract_signed
    }

    pub fn pending_call_id(&self) -> Option<&str> {
        self.pending_call_id.as_deref()
    }
}
