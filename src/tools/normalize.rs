//! # Tool Call Normalization
//!
//! The conversational engine can report the same logical function call on two
//! independent channels, each with its own payload shape:
//!
//! ### Message channel (`message` event)
//! ```json
//! { "type": "tool-calls", "toolCalls": [
//!     { "id": "call_1", "function": { "name": "get_contract_signing_link",
//!                                     "arguments": "{\"email\":\"a@b.com\"}" } } ] }
//! ```
//!
//! ### Function-call channel (`function-call` event)
//! ```json
//! { "functionCall": { "id": "call_1", "name": "createSigningLink",
//!                     "parameters": { "userEmail": "a@b.com", "fullName": "Jane Doe" } } }
//! ```
//!
//! Both are reduced here to a single [`ToolCall`]. Deduplication happens later
//! in the mediator, keyed by the call id extracted here.

use serde_json::{Map, Value};

/// Function names that all mean "create a contract signing link".
pub const SIGNING_LINK_FUNCTIONS: [&str; 3] = [
    "get_contract_signing_link",
    "getContractSigningLink",
    "createSigningLink",
];

const EMAIL_KEYS: [&str; 2] = ["email", "userEmail"];
const NAME_KEYS: [&str; 3] = ["name", "userName", "fullName"];

/// Which engine channel a call was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChannel {
    Message,
    FunctionCall,
}

/// A function-call request reduced to what the mediator needs.
///
/// ## Fields:
/// - **email / name**: `None` when absent or blank, synonyms already resolved
/// - **function_name**: the name as the engine sent it (any synonym)
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub function_name: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub channel: ToolChannel,
}

impl ToolCall {
    pub fn is_signing_link_request(&self) -> bool {
        is_signing_link_function(&self.function_name)
    }
}

/// Why a payload that looked like a tool call could not be normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeError {
    /// The call has no id, so its result could never be delivered.
    MissingCallId { function_name: String },
    /// No function name anywhere in the payload.
    MissingFunctionName,
}

pub fn is_signing_link_function(name: &str) -> bool {
    SIGNING_LINK_FUNCTIONS.contains(&name)
}

/// Extract the first tool call from a `message` event payload.
///
/// ## Returns:
/// - **Ok(None)**: the message carries no tool calls (transcripts, status updates, ...)
/// - **Ok(Some(call))**: a normalized call
/// - **Err(..)**: a tool-call message that cannot be acted upon
pub fn from_message(payload: &Value) -> Result<Option<ToolCall>, NormalizeError> {
    let list = payload
        .get("toolCalls")
        .or_else(|| payload.get("tool_calls"))
        .and_then(Value::as_array);

    let is_tool_message = list.is_some() || payload.get("type").and_then(Value::as_str) == Some("tool-calls");
    if !is_tool_message {
        return Ok(None);
    }

    let Some(call) = list.and_then(|calls| calls.first()) else {
        return Ok(None);
    };

    let function_name = call
        .pointer("/function/name")
        .or_else(|| call.get("name"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingFunctionName)?
        .to_string();

    let arguments = match call.pointer("/function/arguments") {
        Some(arguments) => decode_arguments(arguments),
        None => call.get("parameters").map(decode_arguments).unwrap_or_default(),
    };

    let call_id = first_string(call, &["/id", "/callId"])
        .ok_or_else(|| NormalizeError::MissingCallId { function_name: function_name.clone() })?;

    Ok(Some(build(call_id, function_name, &arguments, ToolChannel::Message)))
}

/// Normalize a `function-call` event payload.
pub fn from_function_call(payload: &Value) -> Result<ToolCall, NormalizeError> {
    let function_name = first_string(payload, &["/functionCall/name", "/name"])
        .ok_or(NormalizeError::MissingFunctionName)?;

    let arguments = payload
        .pointer("/functionCall/parameters")
        .or_else(|| payload.get("parameters"))
        .map(decode_arguments)
        .unwrap_or_default();

    let call_id = first_string(payload, &["/functionCall/id", "/call/id", "/id"])
        .ok_or_else(|| NormalizeError::MissingCallId { function_name: function_name.clone() })?;

    Ok(build(call_id, function_name, &arguments, ToolChannel::FunctionCall))
}

fn build(call_id: String, function_name: String, arguments: &Map<String, Value>, channel: ToolChannel) -> ToolCall {
    ToolCall {
        call_id,
        function_name,
        email: pick(arguments, &EMAIL_KEYS),
        name: pick(arguments, &NAME_KEYS),
        channel,
    }
}

/// Arguments may arrive as an object or as a JSON-encoded string.
/// Anything undecodable is treated as "no arguments".
fn decode_arguments(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(map)) => map,
            _ => {
                tracing::debug!(arguments = %encoded, "Tool call arguments are not a JSON object");
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

fn pick(arguments: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| arguments.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn first_string(value: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|pointer| value.pointer(pointer))
        .find_map(|found| match found {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_channel_with_string_arguments() {
        let payload = json!({
            "type": "tool-calls",
            "toolCalls": [{
                "id": "call_1",
                "function": {
                    "name": "get_contract_signing_link",
                    "arguments": "{\"email\":\"a@b.com\",\"name\":\"Jane Doe\"}"
                }
            }]
        });

        let call = from_message(&payload).unwrap().unwrap();
        assert_eq!(call.call_id, "call_1");
        assert_eq!(call.email.as_deref(), Some("a@b.com"));
        assert_eq!(call.name.as_deref(), Some("Jane Doe"));
        assert_eq!(call.channel, ToolChannel::Message);
        assert!(call.is_signing_link_request());
    }

    #[test]
    fn test_function_call_channel_with_synonyms() {
        let payload = json!({
            "functionCall": {
                "id": "call_2",
                "name": "createSigningLink",
                "parameters": { "userEmail": "x@y.org", "fullName": "Sam Roe" }
            }
        });

        let call = from_function_call(&payload).unwrap();
        assert_eq!(call.call_id, "call_2");
        assert_eq!(call.function_name, "createSigningLink");
        assert_eq!(call.email.as_deref(), Some("x@y.org"));
        assert_eq!(call.name.as_deref(), Some("Sam Roe"));
    }

    #[test]
    fn test_both_channels_yield_the_same_call_id() {
        let message = json!({
            "toolCalls": [{ "callId": "same", "name": "getContractSigningLink", "parameters": {} }]
        });
        let function_call = json!({
            "name": "getContractSigningLink",
            "call": { "id": "same" },
            "parameters": "{}"
        });

        let a = from_message(&message).unwrap().unwrap();
        let b = from_function_call(&function_call).unwrap();
        assert_eq!(a.call_id, b.call_id);
        assert_eq!(a.email, None);
        assert_eq!(b.email, None);
    }

    #[test]
    fn test_blank_and_invalid_arguments_count_as_missing() {
        let payload = json!({
            "functionCall": { "id": "c", "name": "createSigningLink", "parameters": "not json" }
        });
        assert_eq!(from_function_call(&payload).unwrap().email, None);

        let payload = json!({
            "functionCall": { "id": "c", "name": "createSigningLink", "parameters": { "email": "  ", "userEmail": "u@v.io" } }
        });
        assert_eq!(from_function_call(&payload).unwrap().email.as_deref(), Some("u@v.io"));
    }

    #[test]
    fn test_messages_without_tool_calls_are_skipped() {
        let transcript = json!({ "type": "transcript", "role": "assistant", "transcript": "Hello" });
        assert_eq!(from_message(&transcript).unwrap(), None);

        let empty = json!({ "type": "tool-calls", "toolCalls": [] });
        assert_eq!(from_message(&empty).unwrap(), None);
    }

    #[test]
    fn test_missing_call_id_is_an_error() {
        let payload = json!({ "name": "createSigningLink", "parameters": { "email": "a@b.com" } });
        assert_eq!(
            from_function_call(&payload),
            Err(NormalizeError::MissingCallId { function_name: "createSigningLink".to_string() })
        );
        assert_eq!(from_function_call(&json!({})), Err(NormalizeError::MissingFunctionName));
    }

    #[test]
    fn test_unknown_function_is_normalized_but_not_a_signing_request() {
        let payload = json!({ "functionCall": { "id": "c", "name": "lookupWeather" } });
        let call = from_function_call(&payload).unwrap();
        assert!(!call.is_signing_link_request());
    }
}
