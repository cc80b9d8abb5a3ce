//! # Signing Completion Channel
//!
//! Named broadcast channel (`contract-signing-channel`) connecting the
//! post-signing redirect page with every live session. Each session controller
//! subscribes when it starts; the redirect route publishes one notice.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const CHANNEL_NAME: &str = "contract-signing-channel";

const CAPACITY: usize = 16;

/// Payload published when a contract has been signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningNotice {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Signed document, when the redirect carried it.
    #[serde(rename = "documentId", default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl SigningNotice {
    pub const CONTRACT_SIGNED: &'static str = "CONTRACT_SIGNED";

    pub fn contract_signed(document_id: Option<String>) -> Self {
        Self {
            kind: Self::CONTRACT_SIGNED.to_string(),
            success: true,
            timestamp: Utc::now().timestamp_millis(),
            document_id,
        }
    }

    /// Only successful `CONTRACT_SIGNED` notices complete a signing.
    pub fn is_completion(&self) -> bool {
        self.kind == Self::CONTRACT_SIGNED && self.success
    }
}

#[derive(Debug, Clone)]
pub struct SigningChannel {
    sender: broadcast::Sender<SigningNotice>,
}

impl SigningChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SigningNotice> {
        self.sender.subscribe()
    }

    /// Publish to all subscribers; returns how many received it.
    pub fn publish(&self, notice: SigningNotice) -> usize {
        // No subscribers is not an error: no session is open
        self.sender.send(notice).unwrap_or(0)
    }
}

impl Default for SigningChannel {
    fn default() -> Self {
        Self::new()
    }
}
