//! Per-run lifecycle state folded from derived events.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derived::{AttentionSeverity, DerivedEvent, EventKind};
use crate::extract;
use crate::vocab;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Working,
    Error,
    Done,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerClass {
    #[default]
    None,
    VerifyLoop,
    ToolFailLoop,
    DependencyWait,
    NoProgress,
}

/// What an operator should make of a run right now.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationalStatus {
    Active,
    #[default]
    Waiting,
    NeedsHuman,
    Blocked,
    Loop,
    Failed,
    Done,
}

/// Timing and count thresholds behind the blocker heuristics. All durations
/// are milliseconds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunThresholds {
    pub recent_window_ms: u64,
    pub error_signature_window_ms: u64,
    pub signature_repeat: usize,
    pub verify_failures: usize,
    pub stall_threshold_ms: u64,
    pub idle_after_ms: u64,
    pub idle_warn_after_ms: u64,
    /// How many trailing timeline events the text heuristics look at.
    pub lookback_events: usize,
    pub timeline_limit: usize,
    pub signature_limit: usize,
}

impl Default for RunThresholds {
    fn default() -> Self {
        Self {
            recent_window_ms: 5 * 60_000,
            error_signature_window_ms: 10 * 60_000,
            signature_repeat: 2,
            verify_failures: 2,
            stall_threshold_ms: 2 * 60_000,
            idle_after_ms: 60_000,
            idle_warn_after_ms: 3 * 60_000,
            lookback_events: 8,
            timeline_limit: 200,
            signature_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureHit {
    pub ts: u64,
    pub signature: String,
}

/// Aggregated state of one run. Timestamps are epoch milliseconds, `0` when
/// unset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub id: String,
    pub label: String,
    pub status: RunStatus,
    pub current_phase: String,
    pub tool_count: u64,
    pub file_count: u64,
    pub error_count: u64,
    pub success_count: u64,
    pub failure_streak: u32,
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_tool_at: u64,
    pub last_file_change_at: u64,
    pub last_success_at: u64,
    pub blocked_since: u64,
    pub blocker_class: BlockerClass,
    pub operational_status: OperationalStatus,
    pub attention_severity: AttentionSeverity,
    pub awaiting_approval: bool,
    /// Set by an explicit stall signal, cleared by later progress.
    pub stalled_at: u64,
    #[serde(skip)]
    signatures: VecDeque<SignatureHit>,
    #[serde(skip)]
    timeline: VecDeque<DerivedEvent>,
}

/// Fields whose change is worth announcing downstream.
type Classification = (RunStatus, BlockerClass, OperationalStatus, AttentionSeverity);

impl RunState {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            status: RunStatus::Idle,
            current_phase: "idle".to_string(),
            tool_count: 0,
            file_count: 0,
            error_count: 0,
            success_count: 0,
            failure_streak: 0,
            first_seen: 0,
            last_seen: 0,
            last_tool_at: 0,
            last_file_change_at: 0,
            last_success_at: 0,
            blocked_since: 0,
            blocker_class: BlockerClass::None,
            operational_status: OperationalStatus::Waiting,
            attention_severity: AttentionSeverity::None,
            awaiting_approval: false,
            stalled_at: 0,
            signatures: VecDeque::new(),
            timeline: VecDeque::new(),
        }
    }

    pub fn timeline(&self) -> impl Iterator<Item = &DerivedEvent> {
        self.timeline.iter()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &SignatureHit> {
        self.signatures.iter()
    }

    fn classification(&self) -> Classification {
        (
            self.status,
            self.blocker_class,
            self.operational_status,
            self.attention_severity,
        )
    }

    fn mark_working(&mut self) {
        if self.status != RunStatus::Done {
            self.status = RunStatus::Working;
        }
    }

    fn clear_waits(&mut self) {
        self.awaiting_approval = false;
        self.stalled_at = 0;
    }

    /// Folds one event into counters and timestamps. Derived fields are
    /// recomputed separately by [`RunState::reclassify`].
    pub fn apply(&mut self, event: &DerivedEvent, thresholds: &RunThresholds) {
        let ts = event.ts;
        if self.first_seen == 0 || ts < self.first_seen {
            self.first_seen = ts;
        }
        self.last_seen = self.last_seen.max(ts);

        match event.kind {
            EventKind::StepStarted => {
                self.status = RunStatus::Working;
                self.failure_streak = 0;
                self.current_phase = event.message.clone();
                self.clear_waits();
            }
            EventKind::StepEnded => {
                self.status = if self.failure_streak > 0 {
                    RunStatus::Error
                } else {
                    RunStatus::Done
                };
                self.current_phase = event.message.clone();
            }
            EventKind::ToolActivity => {
                self.tool_count += 1;
                self.last_tool_at = self.last_tool_at.max(ts);
                self.current_phase = event
                    .tool_name
                    .clone()
                    .unwrap_or_else(|| "tool".to_string());
                self.mark_working();
                self.clear_waits();
            }
            EventKind::FileChanged => {
                self.file_count += event.touched_paths().count().max(1) as u64;
                self.last_file_change_at = self.last_file_change_at.max(ts);
                self.current_phase = "editing".to_string();
                self.mark_working();
                self.clear_waits();
            }
            EventKind::Error => {
                self.error_count += 1;
                self.failure_streak += 1;
                self.current_phase = "error".to_string();
                let signature = event
                    .signature
                    .clone()
                    .unwrap_or_else(|| extract::error_signature(&event.message));
                self.signatures.push_back(SignatureHit { ts, signature });
                while self.signatures.len() > thresholds.signature_limit {
                    self.signatures.pop_front();
                }
                self.mark_working();
            }
            EventKind::Success => {
                self.success_count += 1;
                self.failure_streak = 0;
                self.last_success_at = self.last_success_at.max(ts);
                self.mark_working();
                self.clear_waits();
            }
            EventKind::HumanGate => {
                self.awaiting_approval = true;
                self.current_phase = "awaiting approval".to_string();
            }
            EventKind::Stall => {
                self.stalled_at = ts.max(1);
            }
            EventKind::Note => {}
        }

        self.timeline.push_back(event.clone());
        while self.timeline.len() > thresholds.timeline_limit {
            self.timeline.pop_front();
        }
    }

    /// A worker-level failure outside the event stream (spawn/connect/exit).
    pub fn mark_failed(&mut self, reason: &str, now: u64) {
        self.status = RunStatus::Error;
        self.current_phase = reason.to_string();
        self.last_seen = self.last_seen.max(now);
    }

    /// Events that still count as evidence at `now`: inside the recent window,
    /// after the last success, and among the trailing lookback.
    fn recent_evidence(&self, now: u64, thresholds: &RunThresholds) -> impl Iterator<Item = &DerivedEvent> {
        let floor = now.saturating_sub(thresholds.recent_window_ms);
        let after_success = self.last_success_at;
        self.timeline
            .iter()
            .rev()
            .take(thresholds.lookback_events)
            .filter(move |event| event.ts >= floor && event.ts > after_success)
    }

    fn evidence_text(event: &DerivedEvent) -> String {
        let mut text = event.message.to_lowercase();
        if let Some(tool) = &event.tool_name {
            text.push(' ');
            text.push_str(&tool.to_lowercase());
        }
        text
    }

    fn detect_blocker(&self, now: u64, thresholds: &RunThresholds) -> BlockerClass {
        if matches!(self.status, RunStatus::Done) {
            return BlockerClass::None;
        }

        let dependency_wait = self
            .recent_evidence(now, thresholds)
            .any(|event| vocab::dependency().is_match(&Self::evidence_text(event)));
        if dependency_wait {
            return BlockerClass::DependencyWait;
        }

        let verify_failures = self
            .recent_evidence(now, thresholds)
            .filter(|event| event.kind == EventKind::Error)
            .filter(|event| vocab::verify().is_match(&Self::evidence_text(event)))
            .count();
        if verify_failures >= thresholds.verify_failures {
            return BlockerClass::VerifyLoop;
        }

        let signature_floor = now.saturating_sub(thresholds.error_signature_window_ms);
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for hit in &self.signatures {
            if hit.ts >= signature_floor && hit.ts > self.last_success_at {
                *counts.entry(hit.signature.as_str()).or_default() += 1;
            }
        }
        if counts.values().any(|count| *count >= thresholds.signature_repeat) {
            return BlockerClass::ToolFailLoop;
        }

        let tool_recent = self.last_tool_at > 0
            && now.saturating_sub(self.last_tool_at) <= thresholds.recent_window_ms;
        let progress_mark = if self.last_file_change_at > 0 {
            self.last_file_change_at
        } else {
            self.first_seen
        };
        if tool_recent && self.last_tool_at > progress_mark + thresholds.stall_threshold_ms {
            return BlockerClass::NoProgress;
        }

        BlockerClass::None
    }

    /// Recomputes blocker, operational status and attention for `now`.
    /// Returns whether any of the announced fields changed.
    pub fn reclassify(&mut self, now: u64, thresholds: &RunThresholds) -> bool {
        let before = self.classification();

        self.blocker_class = self.detect_blocker(now, thresholds);
        let blocked = self.blocker_class != BlockerClass::None || self.stalled_at != 0;
        if blocked {
            if self.blocked_since == 0 {
                self.blocked_since = now;
            }
        } else {
            self.blocked_since = 0;
        }

        let idle_for = now.saturating_sub(self.last_seen);
        self.operational_status = if self.awaiting_approval {
            OperationalStatus::NeedsHuman
        } else if self.status == RunStatus::Error {
            OperationalStatus::Failed
        } else if matches!(
            self.blocker_class,
            BlockerClass::VerifyLoop | BlockerClass::ToolFailLoop
        ) {
            OperationalStatus::Loop
        } else if blocked {
            OperationalStatus::Blocked
        } else if self.status == RunStatus::Done {
            OperationalStatus::Done
        } else if self.status == RunStatus::Working && idle_for <= thresholds.idle_after_ms {
            OperationalStatus::Active
        } else {
            OperationalStatus::Waiting
        };

        self.attention_severity = match self.operational_status {
            OperationalStatus::Failed | OperationalStatus::Loop | OperationalStatus::Blocked => {
                AttentionSeverity::Critical
            }
            OperationalStatus::NeedsHuman => AttentionSeverity::Warn,
            OperationalStatus::Waiting
                if self.status == RunStatus::Working && idle_for > thresholds.idle_warn_after_ms =>
            {
                AttentionSeverity::Warn
            }
            OperationalStatus::Active => AttentionSeverity::Info,
            _ => AttentionSeverity::None,
        };

        let changed = before != self.classification();
        if changed {
            debug!(
                run = %self.id,
                status = ?self.status,
                blocker = ?self.blocker_class,
                operational = ?self.operational_status,
                "run reclassified"
            );
        }
        changed
    }
}

/// A run together with its recent timeline, for export.
#[derive(Debug, Serialize)]
pub struct RunExport<'a> {
    #[serde(flatten)]
    pub run: &'a RunState,
    pub timeline: Vec<&'a DerivedEvent>,
}

/// All known runs, keyed by run id.
#[derive(Debug, Default)]
pub struct RunStore {
    thresholds: RunThresholds,
    runs: BTreeMap<String, RunState>,
}

impl RunStore {
    pub fn new(thresholds: RunThresholds) -> Self {
        Self {
            thresholds,
            runs: BTreeMap::new(),
        }
    }

    pub fn thresholds(&self) -> &RunThresholds {
        &self.thresholds
    }

    fn entry(&mut self, run_id: &str, label: &str) -> &mut RunState {
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunState::new(run_id, label))
    }

    /// Applies an event then reclassifies; `true` when the announced
    /// classification changed (or the run is new).
    pub fn apply(&mut self, run_id: &str, event: &DerivedEvent, now: u64) -> bool {
        self.apply_labeled(run_id, run_id, event, now)
    }

    /// Like [`RunStore::apply`], naming the run `label` if it is new.
    pub fn apply_labeled(&mut self, run_id: &str, label: &str, event: &DerivedEvent, now: u64) -> bool {
        let is_new = !self.runs.contains_key(run_id);
        let thresholds = self.thresholds;
        let run = self.entry(run_id, label);
        run.apply(event, &thresholds);
        run.reclassify(now, &thresholds) || is_new
    }

    pub fn mark_failed(&mut self, run_id: &str, reason: &str, now: u64) -> bool {
        let thresholds = self.thresholds;
        let run = self.entry(run_id, run_id);
        run.mark_failed(reason, now);
        run.reclassify(now, &thresholds)
    }

    /// Periodic reclassification; returns ids whose classification changed.
    pub fn tick(&mut self, now: u64) -> Vec<String> {
        let thresholds = self.thresholds;
        self.runs
            .values_mut()
            .filter_map(|run| run.reclassify(now, &thresholds).then(|| run.id.clone()))
            .collect()
    }

    pub fn get(&self, run_id: &str) -> Option<&RunState> {
        self.runs.get(run_id)
    }

    pub fn runs(&self) -> impl Iterator<Item = &RunState> {
        self.runs.values()
    }

    pub fn export(&self) -> Vec<RunExport<'_>> {
        self.runs
            .values()
            .map(|run| RunExport {
                run,
                timeline: run.timeline().collect(),
            })
            .collect()
    }
}
