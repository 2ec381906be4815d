use std::fmt;

use serde::{Deserialize, Serialize};

use crate::vocab;

/// Semantic category of a derived event.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.ended")]
    StepEnded,
    #[serde(rename = "tool.activity")]
    ToolActivity,
    #[serde(rename = "file.changed")]
    FileChanged,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "human.gate")]
    HumanGate,
    #[serde(rename = "stall")]
    Stall,
    #[serde(rename = "note")]
    Note,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StepStarted => "step.started",
            EventKind::StepEnded => "step.ended",
            EventKind::ToolActivity => "tool.activity",
            EventKind::FileChanged => "file.changed",
            EventKind::Error => "error",
            EventKind::Success => "success",
            EventKind::HumanGate => "human.gate",
            EventKind::Stall => "stall",
            EventKind::Note => "note",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered so that `max` picks the most urgent level.
#[derive(
    Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AttentionSeverity {
    #[default]
    None,
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionCode {
    #[default]
    None,
    Step,
    Success,
    Error,
    NeedsHuman,
    Stalled,
    DecodeError,
}

pub(crate) type DedupKey<'a> = (
    EventKind,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    &'a str,
);

/// Normalized semantic event produced from one raw upstream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedEvent {
    /// Epoch milliseconds.
    pub ts: u64,
    pub raw_type: String,
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Populated on coalesced file batches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub attention_severity: AttentionSeverity,
    pub attention_code: AttentionCode,
}

impl DerivedEvent {
    pub fn new(kind: EventKind, ts: u64, raw_type: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let (attention_severity, attention_code) = assess_attention(kind, &message);
        Self {
            ts,
            raw_type: raw_type.into(),
            kind,
            message,
            tool_name: None,
            file_path: None,
            file_paths: Vec::new(),
            signature: None,
            attention_severity,
            attention_code,
        }
    }

    pub fn with_tool(mut self, tool_name: Option<String>) -> Self {
        self.tool_name = tool_name;
        self
    }

    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Every path this event touches, whether single or batched.
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        self.file_path
            .iter()
            .chain(self.file_paths.iter())
            .map(String::as_str)
    }

    /// Identity used to collapse duplicates produced by overlapping rules.
    pub(crate) fn dedup_key(&self) -> DedupKey<'_> {
        (
            self.kind,
            self.file_path.as_deref(),
            self.tool_name.as_deref(),
            self.signature.as_deref(),
            self.message.as_str(),
        )
    }

    pub fn is_critical(&self) -> bool {
        if matches!(
            self.kind,
            EventKind::Error | EventKind::HumanGate | EventKind::Stall
        ) {
            return true;
        }
        let text = self.message.to_lowercase();
        vocab::approval().is_match(&text) || vocab::stall().is_match(&text)
    }
}

/// Attention level and code for an event of `kind` carrying `message`.
pub fn assess_attention(kind: EventKind, message: &str) -> (AttentionSeverity, AttentionCode) {
    match kind {
        EventKind::Error => return (AttentionSeverity::Critical, AttentionCode::Error),
        EventKind::HumanGate => return (AttentionSeverity::Warn, AttentionCode::NeedsHuman),
        EventKind::Stall => return (AttentionSeverity::Warn, AttentionCode::Stalled),
        _ => {}
    }

    let text = message.to_lowercase();
    if vocab::approval().is_match(&text) {
        return (AttentionSeverity::Warn, AttentionCode::NeedsHuman);
    }
    if vocab::stall().is_match(&text) {
        return (AttentionSeverity::Warn, AttentionCode::Stalled);
    }

    match kind {
        EventKind::Success => (AttentionSeverity::Info, AttentionCode::Success),
        EventKind::StepStarted | EventKind::StepEnded => (AttentionSeverity::Info, AttentionCode::Step),
        _ => (AttentionSeverity::None, AttentionCode::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_events_are_critical() {
        let event = DerivedEvent::new(EventKind::Error, 1, "error", "boom");
        assert_eq!(event.attention_severity, AttentionSeverity::Critical);
        assert_eq!(event.attention_code, AttentionCode::Error);
        assert!(event.is_critical());
    }

    #[test]
    fn approval_text_on_a_note_warns() {
        let event = DerivedEvent::new(EventKind::Note, 1, "x", "Awaiting approval from operator");
        assert_eq!(event.attention_severity, AttentionSeverity::Warn);
        assert_eq!(event.attention_code, AttentionCode::NeedsHuman);
        assert!(event.is_critical());
    }

    #[test]
    fn plain_tool_activity_is_quiet() {
        let event = DerivedEvent::new(EventKind::ToolActivity, 1, "item/started", "Item started");
        assert_eq!(event.attention_severity, AttentionSeverity::None);
        assert!(!event.is_critical());
    }

    #[test]
    fn serializes_with_wire_names() {
        let event = DerivedEvent::new(EventKind::FileChanged, 5, "turn/diff/updated", "diff")
            .with_file("src/lib.rs");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "file.changed");
        assert_eq!(value["rawType"], "turn/diff/updated");
        assert_eq!(value["filePath"], "src/lib.rs");
        assert_eq!(value["attentionSeverity"], "none");
        assert!(value.get("filePaths").is_none());
    }

    #[test]
    fn severities_order_by_urgency() {
        assert!(AttentionSeverity::Critical > AttentionSeverity::Warn);
        assert!(AttentionSeverity::Warn > AttentionSeverity::Info);
        assert!(AttentionSeverity::Info > AttentionSeverity::None);
    }
}
