//! # Engine Events
//!
//! Events emitted by the conversational engine, as relayed by the client, and the
//! helpers that read the loosely-shaped payloads some of them carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One engine event. Tags match the engine's own event names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    CallStart {
        #[serde(default, rename = "callId")]
        call_id: Option<String>,
    },
    CallEnd,
    SpeechStart,
    SpeechEnd,
    ModelOutput {
        #[serde(default)]
        content: String,
    },
    Message {
        payload: Value,
    },
    Error {
        #[serde(default)]
        payload: Value,
    },
    FunctionCall {
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// A transcript line carried by a `message` event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub speaker: Speaker,
    pub text: String,
    /// Partial transcripts are shown but not logged.
    pub is_final: bool,
}

/// Read the transcript out of a `message` payload, if it has a non-blank one.
pub fn transcript(payload: &Value) -> Option<Transcript> {
    let text = payload.get("transcript").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }

    let speaker = match payload.get("role").and_then(Value::as_str) {
        Some("assistant") | Some("bot") => Speaker::Assistant,
        _ => Speaker::User,
    };
    let is_final = payload.get("transcriptType").and_then(Value::as_str) != Some("partial");

    Some(Transcript {
        speaker,
        text: text.to_string(),
        is_final,
    })
}

/// How an engine error should be presented.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Microphone permission problem: remediation UI, no generic banner.
    MicrophoneDenied,
    Generic(String),
}

const GENERIC_ENGINE_ERROR: &str = "Engine connection error";
const CONFIG_ENGINE_ERROR: &str = "Engine connection error - please check assistant configuration";

/// Classify an `error` event payload.
///
/// ## Payload shape:
/// ```json
/// { "errorMsg": "...", "error": { "name": "NotAllowedError", "message": "...", "body": "{\"message\":\"...\"}" } }
/// ```
/// `body` is the engine's HTTP error body, as a string or as an object.
pub fn classify_error(payload: &Value) -> ErrorClass {
    let text = |pointer: &str| payload.pointer(pointer).and_then(Value::as_str).unwrap_or("");

    let error_msg = text("/errorMsg");
    let error_name = text("/error/name");
    let error_message = text("/error/message");

    let lowered = error_msg.to_lowercase();
    let mic_denied = lowered.contains("microphone")
        || lowered.contains("permission")
        || error_name == "NotAllowedError"
        || error_name == "PermissionDeniedError"
        || error_message.to_lowercase().contains("microphone");
    if mic_denied {
        return ErrorClass::MicrophoneDenied;
    }

    if let Some(body) = payload.pointer("/error/body") {
        let parsed = match body {
            Value::String(raw) => serde_json::from_str::<Value>(raw).ok(),
            Value::Object(_) => Some(body.clone()),
            _ => None,
        };
        let message = parsed.as_ref().and_then(|json| {
            ["message", "error"]
                .iter()
                .find_map(|key| json.get(*key).and_then(Value::as_str))
                .filter(|message| !message.is_empty())
                .map(str::to_string)
        });
        return ErrorClass::Generic(message.unwrap_or_else(|| CONFIG_ENGINE_ERROR.to_string()));
    }

    if !error_msg.is_empty() {
        return ErrorClass::Generic(error_msg.to_string());
    }
    ErrorClass::Generic(GENERIC_ENGINE_ERROR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tags() {
        let event: EngineEvent = serde_json::from_value(json!({ "type": "call-start", "callId": "c1" })).unwrap();
        assert_eq!(event, EngineEvent::CallStart { call_id: Some("c1".to_string()) });

        let event: EngineEvent = serde_json::from_value(json!({ "type": "speech-end" })).unwrap();
        assert_eq!(event, EngineEvent::SpeechEnd);

        let event: EngineEvent = serde_json::from_value(json!({ "type": "model-output", "content": "Hi" })).unwrap();
        assert_eq!(event, EngineEvent::ModelOutput { content: "Hi".to_string() });
    }

    #[test]
    fn test_transcript_roles() {
        let line = transcript(&json!({ "transcript": " Hello ", "role": "bot" })).unwrap();
        assert_eq!(line.speaker, Speaker::Assistant);
        assert_eq!(line.text, "Hello");
        assert!(line.is_final);

        let line = transcript(&json!({ "transcript": "hi", "role": "user", "transcriptType": "partial" })).unwrap();
        assert_eq!(line.speaker, Speaker::User);
        assert!(!line.is_final);

        assert_eq!(transcript(&json!({ "transcript": "   " })), None);
        assert_eq!(transcript(&json!({ "type": "status-update" })), None);
    }

    #[test]
    fn test_microphone_errors() {
        for payload in [
            json!({ "errorMsg": "Microphone unavailable" }),
            json!({ "errorMsg": "permission dismissed" }),
            json!({ "error": { "name": "NotAllowedError" } }),
            json!({ "error": { "name": "PermissionDeniedError" } }),
            json!({ "error": { "message": "Could not open microphone" } }),
        ] {
            assert_eq!(classify_error(&payload), ErrorClass::MicrophoneDenied, "{}", payload);
        }
    }

    #[test]
    fn test_generic_error_message_extraction() {
        let nested = json!({ "error": { "body": "{\"message\":\"Assistant not found\"}" } });
        assert_eq!(classify_error(&nested), ErrorClass::Generic("Assistant not found".to_string()));

        let object = json!({ "error": { "body": { "error": "Bad key" } } });
        assert_eq!(classify_error(&object), ErrorClass::Generic("Bad key".to_string()));

        let unreadable = json!({ "error": { "body": "<html>" } });
        assert_eq!(classify_error(&unreadable), ErrorClass::Generic(CONFIG_ENGINE_ERROR.to_string()));

        assert_eq!(
            classify_error(&json!({ "errorMsg": "Meeting ended" })),
            ErrorClass::Generic("Meeting ended".to_string())
        );
        assert_eq!(classify_error(&Value::Null), ErrorClass::Generic(GENERIC_ENGINE_ERROR.to_string()));
    }
}
