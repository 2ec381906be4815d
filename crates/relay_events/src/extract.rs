//! Best-effort field extraction from loosely shaped upstream events.
//!
//! Upstream payloads nest the interesting fields at varying depths, so most
//! lookups walk the tree breadth-last with an ordered key list and take the
//! first string or number they find.

use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::vocab;

pub const TYPE_KEYS: &[&str] = &["method", "type", "event", "name", "kind", "status"];
pub const TIME_KEYS: &[&str] = &[
    "ts",
    "timestamp",
    "time",
    "created_at",
    "createdAt",
    "updated_at",
    "updatedAt",
    "startedAt",
    "completedAt",
];
pub const MESSAGE_KEYS: &[&str] = &[
    "message",
    "text",
    "error",
    "reason",
    "detail",
    "summary",
    "output",
    "stderr",
    "description",
];
pub const TOOL_KEYS: &[&str] = &["tool", "tool_name", "toolName", "name", "title"];
pub const RUN_KEYS: &[&str] = &[
    "threadId",
    "thread_id",
    "turnId",
    "turn_id",
    "itemId",
    "item_id",
    "run_id",
    "runId",
    "session_id",
    "sessionId",
    "conversation_id",
    "conversationId",
    "trace_id",
    "traceId",
];

const ITEM_TOOL_PATHS: &[&[&str]] = &[
    &["title"],
    &["name"],
    &["toolName"],
    &["tool"],
    &["action", "name"],
    &["action", "type"],
];

const DIRECT_FILE_PATHS: &[&[&str]] = &[
    &["path"],
    &["file"],
    &["filePath"],
    &["filepath"],
    &["target"],
    &["payload", "path"],
    &["payload", "file"],
    &["data", "path"],
    &["arguments", "path"],
    &["params", "path"],
    &["params", "file"],
    &["params", "filePath"],
    &["params", "filepath"],
    &["params", "item", "path"],
    &["params", "item", "file"],
    &["params", "item", "target"],
    &["params", "delta", "path"],
    &["params", "delta", "file"],
];

const LISTED_FILE_PATHS: &[&[&str]] = &[
    &["paths"],
    &["files"],
    &["payload", "paths"],
    &["payload", "files"],
    &["data", "files"],
    &["params", "paths"],
    &["params", "files"],
    &["params", "delta", "files"],
    &["params", "turn", "diff", "files"],
    &["params", "turn", "changedFiles"],
];

const SIGNATURE_LIMIT: usize = 90;
const UNKNOWN_SIGNATURE: &str = "error:unknown";
/// Epoch values below this are treated as seconds.
const SECONDS_CUTOFF: f64 = 1e11;

/// Returns the first string/number found under any of `keys`, checking the
/// current level before descending up to `max_depth` levels.
pub fn deep_pick(value: &Value, keys: &[&str], max_depth: usize) -> Option<String> {
    let children: Box<dyn Iterator<Item = &Value> + '_> = match value {
        Value::Object(map) => {
            for key in keys {
                match map.get(*key) {
                    Some(Value::String(text)) => return Some(text.clone()),
                    Some(Value::Number(number)) => return Some(number.to_string()),
                    _ => {}
                }
            }
            Box::new(map.values())
        }
        Value::Array(items) => Box::new(items.iter()),
        _ => return None,
    };

    if max_depth == 0 {
        return None;
    }

    children
        .filter(|child| child.is_object() || child.is_array())
        .find_map(|child| deep_pick(child, keys, max_depth - 1))
}

/// Walks a fixed key path through nested objects.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn trimmed(text: Option<String>) -> Option<String> {
    text.map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

pub fn event_type(raw: &Value) -> String {
    trimmed(deep_pick(raw, TYPE_KEYS, 3)).unwrap_or_else(|| "unknown".to_string())
}

/// Event timestamp in epoch milliseconds, falling back to `fallback_ms` when
/// nothing usable is present.
pub fn timestamp_ms(raw: &Value, fallback_ms: u64) -> u64 {
    let Some(picked) = trimmed(deep_pick(raw, TIME_KEYS, 4)) else {
        return fallback_ms;
    };

    if let Ok(number) = picked.parse::<f64>() {
        if number.is_finite() && number > 0.0 {
            let millis = if number < SECONDS_CUTOFF {
                number * 1000.0
            } else {
                number
            };
            return millis.floor() as u64;
        }
    }

    match OffsetDateTime::parse(&picked, &Rfc3339) {
        Ok(parsed) => {
            let millis = parsed.unix_timestamp_nanos() / 1_000_000;
            u64::try_from(millis).unwrap_or(fallback_ms)
        }
        Err(_) => fallback_ms,
    }
}

/// Identifier used to group events into runs.
pub fn run_identity(raw: &Value) -> Option<String> {
    const PREFERRED: &[&[&str]] = &[
        &["threadId"],
        &["thread_id"],
        &["params", "threadId"],
        &["params", "thread_id"],
        &["params", "turnId"],
        &["params", "turn_id"],
    ];

    PREFERRED
        .iter()
        .filter_map(|path| lookup(raw, path).and_then(Value::as_str))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| trimmed(deep_pick(raw, RUN_KEYS, 4)))
}

pub fn message(raw: &Value) -> String {
    trimmed(deep_pick(raw, MESSAGE_KEYS, 4)).unwrap_or_default()
}

/// Tool name from the work item, then from generic keys, then inferred from
/// vocabulary in `text_lower`.
pub fn tool_name(raw: &Value, text_lower: &str) -> Option<String> {
    if let Some(item) = lookup(raw, &["params", "item"]) {
        let from_item = ITEM_TOOL_PATHS
            .iter()
            .filter_map(|path| lookup(item, path).and_then(Value::as_str))
            .map(str::trim)
            .find(|name| !name.is_empty());
        if let Some(name) = from_item {
            return Some(name.to_string());
        }
    }

    if let Some(name) = trimmed(deep_pick(raw, TOOL_KEYS, 3)) {
        return Some(name);
    }

    if vocab::tool_read().is_match(text_lower) {
        Some("Read".to_string())
    } else if vocab::tool_edit().is_match(text_lower) {
        Some("Edit".to_string())
    } else if vocab::tool_bash().is_match(text_lower) {
        Some("Bash".to_string())
    } else {
        None
    }
}

fn push_path(found: &mut Vec<String>, candidate: Option<&Value>) {
    let Some(text) = candidate.and_then(Value::as_str).map(str::trim) else {
        return;
    };
    if vocab::file_extension().is_match(text) && !found.iter().any(|known| known == text) {
        found.push(text.to_string());
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_text(item, out)),
        Value::Object(map) => {
            for (key, child) in map {
                out.push(key.clone());
                collect_text(child, out);
            }
        }
        _ => {}
    }
}

/// Unique file paths referenced by the event, in discovery order.
///
/// Known path fields are checked first; afterwards every string (keys
/// included) is scanned for path-like tokens with a recognized extension.
pub fn file_paths(raw: &Value) -> Vec<String> {
    let mut found = Vec::new();

    for path in DIRECT_FILE_PATHS {
        push_path(&mut found, lookup(raw, path));
    }

    for path in LISTED_FILE_PATHS {
        let Some(Value::Array(entries)) = lookup(raw, path) else {
            continue;
        };
        for entry in entries {
            match entry {
                Value::String(_) => push_path(&mut found, Some(entry)),
                Value::Object(_) => {
                    push_path(&mut found, entry.get("path"));
                    push_path(&mut found, entry.get("file"));
                    push_path(&mut found, entry.get("filePath"));
                }
                _ => {}
            }
        }
    }

    let mut strings = Vec::new();
    collect_text(raw, &mut strings);
    for text in &strings {
        for caps in vocab::file_path().captures_iter(text) {
            let candidate = &caps[1];
            if !found.iter().any(|known| known == candidate) {
                found.push(candidate.to_string());
            }
        }
    }

    found
}

/// Stable grouping key for repeated failures: lower-cased, whitespace
/// collapsed, first 90 characters.
pub fn error_signature(message: &str) -> String {
    if message.trim().is_empty() {
        return UNKNOWN_SIGNATURE.to_string();
    }
    let lowered = message.to_lowercase();
    let collapsed = vocab::whitespace().replace_all(&lowered, " ");
    collapsed.chars().take(SIGNATURE_LIMIT).collect()
}

/// Lower-cased serialization with null members removed, used for vocabulary
/// matching. Empty `"error": null` slots would otherwise read as failures.
pub fn match_text(raw: &Value) -> String {
    serde_json::to_string(&without_nulls(raw))
        .unwrap_or_default()
        .to_lowercase()
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, child)| !child.is_null())
                .map(|(key, child)| (key.clone(), without_nulls(child)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}
