//! # Conversation Log
//!
//! Collects final transcript lines of one call so they can be persisted when the
//! call ends or the session stops.

use crate::gateway::store::{ConversationMessage, ConversationMetadata, ConversationRecord, MessageRole};
use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct ConversationLog {
    started_at: Option<DateTime<Utc>>,
    messages: Vec<ConversationMessage>,
    error_count: u32,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the call start. A second call to `begin` keeps the first timestamp.
    pub fn begin(&mut self, at: DateTime<Utc>) {
        self.started_at.get_or_insert(at);
    }

    pub fn record(&mut self, role: MessageRole, content: &str, at: DateTime<Utc>) {
        self.messages.push(ConversationMessage {
            role,
            content: content.to_string(),
            timestamp: at,
        });
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Close the log and build the record to persist.
    ///
    /// ## Returns:
    /// `None` when the call never started or nothing was said; the log is
    /// cleared either way.
    pub fn finish(
        &mut self,
        call_id: &str,
        assistant_id: Option<String>,
        ended_at: DateTime<Utc>,
    ) -> Option<ConversationRecord> {
        let log = std::mem::take(self);
        let start_time = log.started_at?;
        if log.messages.is_empty() {
            return None;
        }

        let transcript = log
            .messages
            .iter()
            .map(|message| {
                let speaker = match message.role {
                    MessageRole::User => "User",
                    MessageRole::Assistant => "Assistant",
                };
                format!("{}: {}", speaker, message.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        Some(ConversationRecord {
            call_id: call_id.to_string(),
            start_time,
            end_time: ended_at,
            duration: (ended_at - start_time).num_seconds().max(0),
            transcript,
            messages: log.messages,
            metadata: ConversationMetadata {
                assistant_id,
                error_count: (log.error_count > 0).then_some(log.error_count),
            },
            created_at: ended_at,
        })
    }
}
