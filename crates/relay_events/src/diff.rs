//! Diff snapshots from an external change tracker, as an alternate source of
//! `file.changed` events.

use serde::{Deserialize, Serialize};

use crate::derived::{DerivedEvent, EventKind};

pub const DIFF_RAW_TYPE: &str = "diff.snapshot";

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffFile {
    pub path: String,
    #[serde(default)]
    pub added: u64,
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSnapshot {
    #[serde(default)]
    pub files: Vec<DiffFile>,
    #[serde(default)]
    pub changed_files: usize,
}

impl DiffSnapshot {
    /// One `file.changed` per distinct non-empty path.
    pub fn derive_events(&self, ts: u64) -> Vec<DerivedEvent> {
        let mut seen: Vec<&str> = Vec::new();
        self.files
            .iter()
            .filter(|file| {
                let path = file.path.trim();
                if path.is_empty() || seen.contains(&path) {
                    return false;
                }
                seen.push(path);
                true
            })
            .map(|file| {
                DerivedEvent::new(
                    EventKind::FileChanged,
                    ts,
                    DIFF_RAW_TYPE,
                    format!("+{} -{}", file.added, file.deleted),
                )
                .with_file(file.path.trim())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_shape_parses_and_maps_per_path() {
        let snapshot: DiffSnapshot = serde_json::from_str(
            r#"{"files":[{"path":"src/a.rs","added":3,"deleted":1},{"path":"src/a.rs"},{"path":" "},{"path":"README.md","added":2}],"changedFiles":2}"#,
        )
        .unwrap();
        assert_eq!(snapshot.changed_files, 2);

        let events = snapshot.derive_events(42);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].file_path.as_deref(), Some("src/a.rs"));
        assert_eq!(events[0].message, "+3 -1");
        assert_eq!(events[1].message, "+2 -0");
        assert!(events.iter().all(|event| event.kind == EventKind::FileChanged && event.ts == 42));
    }
}
