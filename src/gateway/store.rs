//! # Record Stores
//!
//! Upsert-by-key persistence for signing contracts (keyed by document id) and
//! conversation logs (keyed by call id).
//!
//! ## Storage:
//! Records live in process memory behind `Arc<RwLock<HashMap>>`, shared by all
//! HTTP workers. Writes never block the user flow: callers log failures and move on.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Pending,
    Signed,
    Expired,
    Cancelled,
}

impl std::str::FromStr for ContractStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContractStatus::Pending),
            "signed" => Ok(ContractStatus::Signed),
            "expired" => Ok(ContractStatus::Expired),
            "cancelled" => Ok(ContractStatus::Cancelled),
            other => Err(AppError::BadRequest(format!("Unknown contract status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

/// One signing contract created through the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRecord {
    pub email: String,
    pub name: String,
    pub document_id: String,
    pub signing_link: String,
    pub status: ContractStatus,
    pub signed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: ContractMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
}

/// One finished conversation. Duration is in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub call_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: i64,
    pub transcript: String,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
    pub created_at: DateTime<Utc>,
}

/// Stored value plus the id handed out on first insert.
#[derive(Debug, Clone)]
struct Stored<T> {
    id: String,
    record: T,
}

/// Contract records keyed by provider document id.
#[derive(Debug, Clone, Default)]
pub struct ContractStore {
    records: Arc<RwLock<HashMap<String, Stored<ContractRecord>>>>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by document id; returns the contract id.
    pub fn upsert(&self, record: ContractRecord) -> AppResult<String> {
        let mut records = self
            .records
            .write()
            .map_err(|_| AppError::Internal("Contract store lock poisoned".to_string()))?;

        let id = records
            .get(&record.document_id)
            .map(|stored| stored.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        records.insert(record.document_id.clone(), Stored { id: id.clone(), record });
        Ok(id)
    }

    /// Set the status of an existing contract.
    ///
    /// ## Returns:
    /// - **Ok(true)**: the record changed
    /// - **Ok(false)**: it already had this status
    /// - **Err(NotFound)**: no contract with this document id
    pub fn update_status(&self, document_id: &str, status: ContractStatus) -> AppResult<bool> {
        let mut records = self
            .records
            .write()
            .map_err(|_| AppError::Internal("Contract store lock poisoned".to_string()))?;

        let stored = records
            .get_mut(document_id)
            .ok_or_else(|| AppError::NotFound("Contract not found".to_string()))?;

        let changed = stored.record.status != status;
        stored.record.status = status;
        if status == ContractStatus::Signed {
            stored.record.signed_at = Some(Utc::now());
        }
        Ok(changed)
    }

    pub fn get(&self, document_id: &str) -> Option<ContractRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(document_id).map(|stored| stored.record.clone()))
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }
}

/// Conversation records keyed by call id.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    records: Arc<RwLock<HashMap<String, Stored<ConversationRecord>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by call id; the conversation id survives updates.
    pub fn upsert(&self, record: ConversationRecord) -> AppResult<String> {
        let mut records = self
            .records
            .write()
            .map_err(|_| AppError::Internal("Conversation store lock poisoned".to_string()))?;

        let id = records
            .get(&record.call_id)
            .map(|stored| stored.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        records.insert(record.call_id.clone(), Stored { id: id.clone(), record });
        Ok(id)
    }

    pub fn get(&self, call_id: &str) -> Option<ConversationRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(call_id).map(|stored| stored.record.clone()))
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }
}
