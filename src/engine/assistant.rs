//! # Assistant Targets
//!
//! The engine is started against the configured assistant id first. If that
//! fails it is started once more with an inline assistant definition built from
//! configuration, which carries the signing-link tool schema.

use crate::config::EngineConfig;
use crate::tools::normalize::SIGNING_LINK_FUNCTIONS;
use serde::Serialize;
use serde_json::{json, Value};

/// What the engine should run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineTarget {
    Assistant { id: String },
    Inline { assistant: Value },
}

impl EngineTarget {
    pub fn describe(&self) -> &'static str {
        match self {
            EngineTarget::Assistant { .. } => "assistant id",
            EngineTarget::Inline { .. } => "inline assistant",
        }
    }
}

/// Start attempts in order: the assistant id when configured, then the inline definition.
pub fn start_targets(config: &EngineConfig) -> Vec<EngineTarget> {
    let mut targets = Vec::with_capacity(2);
    if !config.assistant_id.trim().is_empty() {
        targets.push(EngineTarget::Assistant {
            id: config.assistant_id.clone(),
        });
    }
    targets.push(EngineTarget::Inline {
        assistant: inline_assistant(config),
    });
    targets
}

/// Inline assistant definition in the engine's schema.
pub fn inline_assistant(config: &EngineConfig) -> Value {
    json!({
        "name": config.assistant_name,
        "model": {
            "provider": config.model_provider,
            "model": config.model,
            "messages": [{ "role": "system", "content": config.system_prompt }],
        },
        "voice": {
            "provider": config.voice_provider,
            "voiceId": config.voice_id,
        },
        "transcriber": {
            "provider": config.transcriber_provider,
            "model": config.transcriber_model,
            "language": config.language,
            "endpointing": 300,
        },
        "tools": [signing_link_tool()],
        "firstMessage": config.first_message,
        "endCallMessage": config.end_call_message,
    })
}

/// Function tool the assistant calls to request a signing link.
pub fn signing_link_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SIGNING_LINK_FUNCTIONS[0],
            "description": "Get a signing link for the enrollment contract. This function creates a document \
                            from a template and returns an embedded signing link.",
            "parameters": {
                "type": "object",
                "properties": {
                    "email": {
                        "type": "string",
                        "description": "The user's email address. Required to create the signing link."
                    },
                    "name": {
                        "type": "string",
                        "description": "The user's full name. Optional - if not provided, the email prefix will be used."
                    }
                },
                "required": ["email"]
            }
        }
    })
}
