//! `POST /api/conversations/save`: upsert a finished conversation by call id.

use crate::error::AppError;
use crate::gateway::store::{ConversationMessage, ConversationMetadata, ConversationRecord};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveConversationBody {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds; zero or absent means "derive from start and end".
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
}

impl SaveConversationBody {
    fn into_record(self) -> Result<ConversationRecord, AppError> {
        let call_id = self
            .call_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::BadRequest("Call ID is required".to_string()))?;

        let transcript = self.transcript.unwrap_or_default();
        if transcript.trim().is_empty() && self.messages.is_empty() {
            return Err(AppError::BadRequest("Transcript or messages are required".to_string()));
        }

        let (Some(start_time), Some(end_time)) = (self.start_time, self.end_time) else {
            return Err(AppError::BadRequest("Start time and end time are required".to_string()));
        };

        let duration = self
            .duration
            .filter(|seconds| *seconds > 0)
            .unwrap_or_else(|| (end_time - start_time).num_seconds());

        Ok(ConversationRecord {
            call_id,
            start_time,
            end_time,
            duration,
            transcript,
            messages: self.messages,
            metadata: self.metadata,
            created_at: Utc::now(),
        })
    }
}

pub async fn save_conversation(
    state: web::Data<AppState>,
    body: web::Json<SaveConversationBody>,
) -> Result<HttpResponse, AppError> {
    let record = body.into_inner().into_record()?;
    let call_id = record.call_id.clone();
    let duration = record.duration;

    let conversation_id = state.conversations.upsert(record)?;
    info!(call_id = %call_id, duration, "Conversation saved");

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Conversation saved successfully",
        "conversationId": conversation_id,
    })))
}
