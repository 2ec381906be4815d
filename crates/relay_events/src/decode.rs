//! Wire payload normalization and JSON-RPC message classification.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{DecodeFailure, DecodeReason};

/// Protocol version marker required on classified messages.
pub const JSONRPC_VERSION: &str = "2.0";
/// JSON-RPC error code sent back for inbound requests this relay cannot serve.
pub const METHOD_NOT_SUPPORTED_CODE: i64 = -32601;
pub const METHOD_NOT_SUPPORTED_MESSAGE: &str = "Method not supported in non-interactive relay";

/// A transport frame as it arrives off the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    /// Fragmented binary frames, concatenated in order before parsing.
    Chunks(Vec<Vec<u8>>),
}

impl Payload {
    /// Collapses the payload into a single text blob (lossy UTF-8 for bytes).
    pub fn into_text(self) -> String {
        match self {
            Payload::Text(text) => text,
            Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Payload::Chunks(chunks) => String::from_utf8_lossy(&chunks.concat()).into_owned(),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<Vec<u8>>> for Payload {
    fn from(value: Vec<Vec<u8>>) -> Self {
        Payload::Chunks(value)
    }
}

/// Decodes one payload into one or more JSON objects.
///
/// A single object yields one message; a non-empty array of objects yields
/// them in order. Anything else is `invalid_shape`, unparsable text is
/// `invalid_json`. Never panics.
pub fn decode(payload: impl Into<Payload>) -> Result<Vec<Value>, DecodeFailure> {
    let text = payload.into().into_text();
    let parsed: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => return Err(DecodeFailure::new(DecodeReason::InvalidJson, text)),
    };

    match parsed {
        Value::Object(_) => Ok(vec![parsed]),
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            Ok(items)
        }
        _ => Err(DecodeFailure::new(DecodeReason::InvalidShape, text)),
    }
}

/// JSON-RPC role of a decoded message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Unknown,
}

/// Classifies with the `"jsonrpc": "2.0"` marker required.
pub fn classify(message: &Value) -> MessageKind {
    classify_with(message, true)
}

/// Classifies a message, optionally tolerating peers that omit the version
/// marker.
pub fn classify_with(message: &Value, require_marker: bool) -> MessageKind {
    let Some(object) = message.as_object() else {
        return MessageKind::Unknown;
    };

    if require_marker && object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return MessageKind::Unknown;
    }

    let has_id = object.contains_key("id");
    let has_method = object
        .get("method")
        .and_then(Value::as_str)
        .is_some_and(|method| !method.is_empty());
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    match (has_id, has_method) {
        // A response carries exactly one of `result` / `error`.
        (true, false) if has_result != has_error => MessageKind::Response,
        (true, false) => MessageKind::Unknown,
        (true, true) => MessageKind::Request,
        (false, true) => MessageKind::Notification,
        (false, false) => MessageKind::Unknown,
    }
}

/// Builds the error reply sent for inbound requests so the peer never stalls
/// waiting on us.
pub fn method_not_supported_reply(id: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_SUPPORTED_CODE,
            "message": METHOD_NOT_SUPPORTED_MESSAGE,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TURN_COMPLETED: &str = r#"{"jsonrpc":"2.0","method":"turn/completed"}"#;

    #[test]
    fn payload_variants_normalize_to_the_same_text() {
        let bytes = TURN_COMPLETED.as_bytes().to_vec();
        let chunks = vec![
            br#"{"jsonrpc":"2.0","#.to_vec(),
            br#""method":"turn/completed"}"#.to_vec(),
        ];

        assert_eq!(Payload::from(TURN_COMPLETED).into_text(), TURN_COMPLETED);
        assert_eq!(Payload::from(bytes).into_text(), TURN_COMPLETED);
        assert_eq!(Payload::from(chunks).into_text(), TURN_COMPLETED);
    }

    #[test]
    fn single_object_decodes_to_one_equal_message() {
        let messages = decode(TURN_COMPLETED).expect("decode");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            serde_json::from_str::<Value>(TURN_COMPLETED).unwrap()
        );
    }

    #[test]
    fn chunked_payload_decodes() {
        let chunks = vec![
            br#"{"jsonrpc":"2.0","#.to_vec(),
            br#""method":"turn/completed"}"#.to_vec(),
        ];
        let messages = decode(chunks).expect("decode chunks");
        assert_eq!(messages[0]["method"], "turn/completed");
    }

    #[test]
    fn batch_keeps_original_order() {
        let messages = decode(
            r#"[{"jsonrpc":"2.0","id":1,"result":{"ok":true}},{"jsonrpc":"2.0","method":"turn/completed"}]"#,
        )
        .expect("decode batch");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], 1);
        assert_eq!(messages[1]["method"], "turn/completed");
    }

    #[test]
    fn unparsable_text_is_invalid_json() {
        let failure = decode("{not-json").unwrap_err();
        assert_eq!(failure.reason, DecodeReason::InvalidJson);
        assert_eq!(failure.raw, "{not-json");
    }

    #[test]
    fn non_object_shapes_are_rejected() {
        for payload in ["null", "[]", "\"text\"", "123", "true"] {
            let failure = decode(payload).unwrap_err();
            assert_eq!(
                failure.reason,
                DecodeReason::InvalidShape,
                "expected invalid shape for {payload}"
            );
        }
    }

    #[test]
    fn batch_with_non_object_entry_is_rejected() {
        let failure = decode(r#"[{"jsonrpc":"2.0","method":"turn/completed"},null]"#).unwrap_err();
        assert_eq!(failure.reason, DecodeReason::InvalidShape);
    }

    #[test]
    fn classifies_request_response_notification_unknown() {
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            MessageKind::Response
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 2, "method": "turn/start"})),
            MessageKind::Request
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "method": "turn/completed"})),
            MessageKind::Notification
        );
        assert_eq!(classify(&json!({"jsonrpc": "2.0"})), MessageKind::Unknown);
    }

    #[test]
    fn response_needs_exactly_one_of_result_or_error() {
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 1}})),
            MessageKind::Response
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {}})),
            MessageKind::Unknown
        );
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "id": 1})),
            MessageKind::Unknown
        );
    }

    #[test]
    fn version_marker_is_required_unless_relaxed() {
        let bare = json!({"id": 1, "result": {}});
        assert_eq!(classify(&bare), MessageKind::Unknown);
        assert_eq!(
            classify(&json!({"jsonrpc": "1.0", "id": 1, "result": {}})),
            MessageKind::Unknown
        );
        assert_eq!(classify_with(&bare, false), MessageKind::Response);
    }

    #[test]
    fn empty_method_is_not_a_method() {
        assert_eq!(
            classify(&json!({"jsonrpc": "2.0", "method": ""})),
            MessageKind::Unknown
        );
    }

    #[test]
    fn not_supported_reply_echoes_id() {
        let reply = method_not_supported_reply(&json!("req-7"));
        assert_eq!(reply["id"], "req-7");
        assert_eq!(reply["error"]["code"], METHOD_NOT_SUPPORTED_CODE);
    }
}
