//! Raw upstream event -> semantic [`DerivedEvent`]s.
//!
//! Three rule families run over every event in a fixed order: exact method
//! matches, the extracted type tag, then free-text vocabulary over the whole
//! payload. All matching rules contribute; duplicates collapse afterwards and
//! an event nothing matched becomes a single `note`.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::derived::{AttentionCode, AttentionSeverity, DerivedEvent, EventKind};
use crate::error::DecodeFailure;
use crate::extract;
use crate::vocab;

/// High-frequency, low-information methods dropped before derivation.
pub const DEFAULT_NOISE_METHODS: &[&str] = &[
    "thread/tokenUsage/updated",
    "account/rateLimits/updated",
    "item/agentMessage/delta",
    "item/reasoning/textDelta",
    "item/reasoning/summaryTextDelta",
    "item/reasoning/summaryPartAdded",
    "item/commandExecution/outputDelta",
    "codex/event/token_count",
    "codex/event/agent_message_delta",
    "codex/event/agent_reasoning_delta",
];

const FILE_CHANGE_METHODS: &[&str] = &["item/filechange/outputdelta", "turn/diff/updated"];

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeriveConfig {
    /// Matched case-insensitively against the raw `method`.
    pub noise_methods: Vec<String>,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            noise_methods: DEFAULT_NOISE_METHODS
                .iter()
                .map(|method| method.to_string())
                .collect(),
        }
    }
}

/// Everything the rules look at, extracted once per raw event.
struct RawView<'a> {
    raw: &'a Value,
    ts: u64,
    raw_type: String,
    raw_type_lower: String,
    method: String,
    /// Type tag, method, and body; approval and stall cues can live in any.
    combined_lower: String,
    /// Body without the method name, so `item/completed` is not a success
    /// word on its own.
    body_lower: String,
    message: String,
    tool_name: Option<String>,
    file_paths: Vec<String>,
}

impl<'a> RawView<'a> {
    fn new(raw: &'a Value, received_at_ms: u64) -> Self {
        let raw_type = extract::event_type(raw);
        let raw_type_lower = raw_type.to_lowercase();
        let method = raw
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let combined_lower = format!(
            "{raw_type_lower} {method} {}",
            extract::match_text(raw)
        );
        let body_lower = match raw {
            Value::Object(map) if map.contains_key("method") => {
                let mut body = map.clone();
                body.remove("method");
                extract::match_text(&Value::Object(body))
            }
            _ => extract::match_text(raw),
        };
        let tool_name = extract::tool_name(raw, &combined_lower);

        Self {
            raw,
            ts: extract::timestamp_ms(raw, received_at_ms),
            raw_type,
            raw_type_lower,
            method,
            combined_lower,
            body_lower,
            message: extract::message(raw),
            tool_name,
            file_paths: extract::file_paths(raw),
        }
    }

    fn message_or(&self, fallback: &str) -> String {
        if self.message.is_empty() {
            fallback.to_string()
        } else {
            self.message.clone()
        }
    }

    fn event(&self, kind: EventKind, fallback: &str) -> DerivedEvent {
        DerivedEvent::new(kind, self.ts, self.raw_type.clone(), self.message_or(fallback))
    }

    fn error(&self, fallback: &str) -> DerivedEvent {
        let event = self.event(EventKind::Error, fallback);
        let signature = extract::error_signature(&event.message);
        event.with_signature(signature)
    }

    fn file_events(&self) -> Vec<DerivedEvent> {
        self.file_paths
            .iter()
            .map(|path| {
                self.event(EventKind::FileChanged, &self.raw_type)
                    .with_tool(self.tool_name.clone())
                    .with_file(path.clone())
            })
            .collect()
    }

    /// Status text of a finished item, if this is one.
    fn item_status(&self) -> Option<String> {
        if self.method != "item/completed" {
            return None;
        }
        let status = extract::lookup(self.raw, &["params", "item"])
            .or_else(|| self.raw.get("params"))
            .map(extract::match_text)
            .unwrap_or_else(|| extract::match_text(self.raw));
        Some(status)
    }

    fn item_failed(&self) -> bool {
        self.item_status()
            .is_some_and(|status| vocab::item_failure().is_match(&status))
    }

    fn is_file_change_method(&self) -> bool {
        FILE_CHANGE_METHODS.contains(&self.method.as_str())
    }
}

struct Rule {
    name: &'static str,
    matches: fn(&RawView<'_>) -> bool,
    emit: fn(&RawView<'_>) -> Vec<DerivedEvent>,
}

const METHOD_RULES: &[Rule] = &[
    Rule {
        name: "turn-started",
        matches: |view| view.method == "turn/started",
        emit: |view| vec![view.event(EventKind::StepStarted, "Turn started")],
    },
    Rule {
        name: "turn-completed",
        matches: |view| view.method == "turn/completed",
        emit: |view| vec![view.event(EventKind::StepEnded, "Turn completed")],
    },
    Rule {
        name: "item-started",
        matches: |view| view.method == "item/started",
        emit: |view| {
            vec![view
                .event(EventKind::ToolActivity, "Item started")
                .with_tool(view.tool_name.clone())]
        },
    },
    Rule {
        name: "item-completed",
        matches: |view| view.method == "item/completed",
        emit: |view| {
            let status = view.item_status().unwrap_or_default();
            let activity = view
                .event(EventKind::ToolActivity, "Item completed")
                .with_tool(view.tool_name.clone());
            if vocab::item_failure().is_match(&status) {
                vec![activity, view.error("Item failed")]
            } else if vocab::item_success().is_match(&status) {
                vec![activity, view.event(EventKind::Success, "Item completed")]
            } else {
                vec![activity]
            }
        },
    },
    Rule {
        name: "file-change",
        matches: |view| view.is_file_change_method(),
        emit: |view| view.file_events(),
    },
    Rule {
        name: "error-method",
        matches: |view| view.method == "error",
        emit: |view| vec![view.error(&view.raw_type)],
    },
];

const TYPE_TAG_RULES: &[Rule] = &[
    Rule {
        name: "type-started",
        matches: |view| vocab::started_tag().is_match(&view.raw_type_lower),
        emit: |view| vec![view.event(EventKind::StepStarted, "Step started")],
    },
    Rule {
        name: "type-ended",
        matches: |view| vocab::ended_tag().is_match(&view.raw_type_lower),
        emit: |view| vec![view.event(EventKind::StepEnded, "Step ended")],
    },
    Rule {
        name: "type-tool",
        matches: |view| vocab::tool_tag().is_match(&view.raw_type_lower),
        emit: |view| {
            vec![view
                .event(EventKind::ToolActivity, &view.raw_type)
                .with_tool(view.tool_name.clone())]
        },
    },
    Rule {
        name: "type-approval",
        matches: |view| vocab::approval().is_match(&view.raw_type_lower),
        emit: |view| vec![view.event(EventKind::HumanGate, "Approval requested")],
    },
];

const FULL_TEXT_RULES: &[Rule] = &[
    Rule {
        name: "text-error",
        matches: |view| vocab::error().is_match(&view.body_lower),
        emit: |view| vec![view.error(&view.raw_type)],
    },
    Rule {
        name: "text-success",
        matches: |view| {
            vocab::success().is_match(&view.body_lower)
                && !vocab::error().is_match(&view.body_lower)
                && !view.item_failed()
        },
        emit: |view| vec![view.event(EventKind::Success, &view.raw_type)],
    },
    Rule {
        name: "text-approval",
        matches: |view| vocab::approval().is_match(&view.combined_lower),
        emit: |view| vec![view.event(EventKind::HumanGate, "Approval requested")],
    },
    Rule {
        name: "text-stall",
        matches: |view| vocab::stall().is_match(&view.combined_lower),
        emit: |view| vec![view.event(EventKind::Stall, &view.raw_type)],
    },
    Rule {
        name: "embedded-paths",
        matches: |view| !view.is_file_change_method() && !view.file_paths.is_empty(),
        emit: |view| view.file_events(),
    },
];

const RULE_FAMILIES: &[&[Rule]] = &[METHOD_RULES, TYPE_TAG_RULES, FULL_TEXT_RULES];

/// Stateless mapper from raw upstream events to derived events.
#[derive(Debug, Clone)]
pub struct DerivationEngine {
    noise_methods: HashSet<String>,
}

impl Default for DerivationEngine {
    fn default() -> Self {
        Self::new(&DeriveConfig::default())
    }
}

impl DerivationEngine {
    pub fn new(config: &DeriveConfig) -> Self {
        Self {
            noise_methods: config
                .noise_methods
                .iter()
                .map(|method| method.to_lowercase())
                .collect(),
        }
    }

    pub fn is_noise(&self, raw: &Value) -> bool {
        raw.get("method")
            .and_then(Value::as_str)
            .is_some_and(|method| self.noise_methods.contains(&method.to_lowercase()))
    }

    /// Derives zero or more events from one raw message.
    ///
    /// Noise methods and empty payloads yield nothing; any other input yields
    /// at least one event. `received_at_ms` stands in for missing timestamps.
    pub fn derive(&self, raw: &Value, received_at_ms: u64) -> Vec<DerivedEvent> {
        if is_empty(raw) {
            return Vec::new();
        }
        if self.is_noise(raw) {
            trace!(method = ?raw.get("method"), "dropping noise event");
            return Vec::new();
        }

        let view = RawView::new(raw, received_at_ms);
        let mut derived = Vec::new();
        for family in RULE_FAMILIES {
            for rule in family.iter().filter(|rule| (rule.matches)(&view)) {
                trace!(rule = rule.name, raw_type = %view.raw_type, "rule matched");
                derived.extend((rule.emit)(&view));
            }
        }

        let mut derived = dedup(derived);
        if derived.is_empty() {
            derived.push(view.event(EventKind::Note, &view.raw_type));
        }
        derived
    }

    /// Error event recorded when the peer sends a request this relay refuses.
    pub fn unsupported_request(&self, method: &str, received_at_ms: u64) -> DerivedEvent {
        self.protocol_error(method, format!("Unsupported upstream request: {method}"), received_at_ms)
    }

    /// Error event for a failure reported by, or while talking to, the peer.
    pub fn protocol_error(
        &self,
        raw_type: &str,
        message: impl Into<String>,
        received_at_ms: u64,
    ) -> DerivedEvent {
        let message = message.into();
        let signature = extract::error_signature(&message);
        DerivedEvent::new(EventKind::Error, received_at_ms, raw_type, message).with_signature(signature)
    }

    /// Turns a decode failure into a visible diagnostic event.
    pub fn decode_failure(&self, failure: &DecodeFailure, received_at_ms: u64) -> DerivedEvent {
        debug!(reason = %failure.reason, "surfacing decode failure");
        let mut event = DerivedEvent::new(
            EventKind::Note,
            received_at_ms,
            "decode_error",
            format!("Undecodable upstream payload ({})", failure.reason),
        );
        event.attention_severity = AttentionSeverity::Warn;
        event.attention_code = AttentionCode::DecodeError;
        event
    }
}

fn is_empty(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn dedup(events: Vec<DerivedEvent>) -> Vec<DerivedEvent> {
    let mut seen = BTreeSet::new();
    let mut keep: Vec<DerivedEvent> = Vec::with_capacity(events.len());
    for event in events {
        let (kind, file, tool, signature, message) = event.dedup_key();
        let key = (
            kind,
            file.map(str::to_string),
            tool.map(str::to_string),
            signature.map(str::to_string),
            message.to_string(),
        );
        if seen.insert(key) {
            keep.push(event);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::decode::decode;

    fn engine() -> DerivationEngine {
        DerivationEngine::default()
    }

    fn kinds(events: &[DerivedEvent]) -> Vec<EventKind> {
        events.iter().map(|event| event.kind).collect()
    }

    #[test]
    fn turn_started_becomes_step_started() {
        let events = engine().derive(
            &json!({"jsonrpc": "2.0", "method": "turn/started", "params": {"threadId": "t1"}}),
            10,
        );
        assert_eq!(kinds(&events), vec![EventKind::StepStarted]);
        assert_eq!(events[0].message, "Turn started");
        assert_eq!(events[0].ts, 10);
    }

    #[test]
    fn failed_item_becomes_signed_error() {
        let events = engine().derive(
            &json!({
                "method": "item/completed",
                "params": {"item": {"type": "commandExecution", "status": "failed", "text": "Tests FAILED"}}
            }),
            10,
        );
        let error = events
            .iter()
            .find(|event| event.kind == EventKind::Error)
            .expect("error derived");
        assert_eq!(error.message, "Tests FAILED");
        assert_eq!(error.signature.as_deref(), Some("tests failed"));
        assert_eq!(error.attention_severity, AttentionSeverity::Critical);
        assert_eq!(error.attention_code, AttentionCode::Error);
    }

    #[test]
    fn failed_item_is_activity_and_error_but_never_success() {
        let events = engine().derive(
            &json!({
                "method": "item/completed",
                "params": {"item": {"status": "failed", "text": "same failure"}}
            }),
            10,
        );
        assert_eq!(kinds(&events), vec![EventKind::ToolActivity, EventKind::Error]);
    }

    #[test]
    fn completed_method_name_alone_is_not_success() {
        let events = engine().derive(
            &json!({"method": "item/completed", "params": {"item": {"type": "reasoning"}}}),
            10,
        );
        assert_eq!(kinds(&events), vec![EventKind::ToolActivity]);

        let events = engine().derive(
            &json!({"method": "item/completed", "params": {"item": {"status": "completed"}}}),
            10,
        );
        assert!(kinds(&events).contains(&EventKind::Success));
    }

    #[test]
    fn overlapping_rules_do_not_duplicate() {
        let events = engine().derive(
            &json!({"method": "error", "params": {"message": "fatal: boom"}}),
            10,
        );
        let errors = events
            .iter()
            .filter(|event| event.kind == EventKind::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn file_change_method_emits_per_path() {
        let events = engine().derive(
            &json!({
                "method": "turn/diff/updated",
                "params": {"files": ["src/a.rs", "src/b.rs"]}
            }),
            10,
        );
        let files: Vec<_> = events
            .iter()
            .filter(|event| event.kind == EventKind::FileChanged)
            .filter_map(|event| event.file_path.as_deref())
            .collect();
        assert_eq!(files, vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn approval_text_raises_human_gate() {
        let events = engine().derive(
            &json!({"method": "codex/event/exec_approval_request", "params": {"reason": "requires approval"}}),
            10,
        );
        assert!(kinds(&events).contains(&EventKind::HumanGate));
    }

    #[test]
    fn stall_text_raises_stall() {
        let events = engine().derive(
            &json!({"type": "status", "detail": "agent is stuck"}),
            10,
        );
        assert_eq!(kinds(&events), vec![EventKind::Stall]);
        assert_eq!(events[0].attention_code, AttentionCode::Stalled);
    }

    #[test]
    fn unmatched_event_becomes_one_note() {
        let events = engine().derive(&json!({"foo": "bar"}), 10);
        assert_eq!(kinds(&events), vec![EventKind::Note]);
        assert_eq!(events[0].raw_type, "unknown");
    }

    #[test]
    fn noise_is_dropped_case_insensitively() {
        let events = engine().derive(
            &json!({"method": "THREAD/TOKENUSAGE/UPDATED", "params": {"error": "x"}}),
            10,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn custom_noise_list_replaces_default() {
        let engine = DerivationEngine::new(&DeriveConfig {
            noise_methods: vec!["custom/ping".to_string()],
        });
        assert!(engine.derive(&json!({"method": "custom/ping"}), 1).is_empty());
        assert!(!engine
            .derive(&json!({"method": "thread/tokenUsage/updated"}), 1)
            .is_empty());
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(engine().derive(&Value::Null, 1).is_empty());
        assert!(engine().derive(&json!({}), 1).is_empty());
    }

    #[test]
    fn null_error_slots_do_not_read_as_failures() {
        let events = engine().derive(
            &json!({
                "method": "turn/completed",
                "params": {"threadId": "t", "turn": {"status": "completed", "error": null}}
            }),
            10,
        );
        assert!(!kinds(&events).contains(&EventKind::Error));
        assert!(kinds(&events).contains(&EventKind::StepEnded));
    }

    #[test]
    fn unsupported_requests_are_critical_errors() {
        let event = engine().unsupported_request("item/tool/call", 5);
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.attention_severity, AttentionSeverity::Critical);
        assert_eq!(event.raw_type, "item/tool/call");
    }

    #[test]
    fn protocol_errors_carry_a_normalized_signature() {
        let event = engine().protocol_error("thread/start", "Server   Overloaded", 7);
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.signature.as_deref(), Some("server overloaded"));
    }

    #[test]
    fn decode_failures_become_diagnostic_notes() {
        let failure = decode("{broken").unwrap_err();
        let note = engine().decode_failure(&failure, 99);
        assert_eq!(note.kind, EventKind::Note);
        assert_eq!(note.attention_code, AttentionCode::DecodeError);
        assert!(note.message.contains("invalid_json"));
        assert_eq!(note.ts, 99);
    }
}
