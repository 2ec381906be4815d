//! Per-source pacing and file-change coalescing.
//!
//! [`Pacer`] is synchronous and clock-agnostic: callers pass `now` into
//! [`Pacer::admit`] and [`Pacer::drain_due`], and sleep until
//! [`Pacer::next_deadline`] between calls.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derived::{DerivedEvent, EventKind};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Minimum spacing between non-critical emissions of one source.
    pub min_gap_ms: u64,
    /// Quiet period that closes a file-change batch.
    pub coalesce_window_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_gap_ms: 850,
            coalesce_window_ms: 1000,
        }
    }
}

impl PacingConfig {
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// An event released downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub source: String,
    pub event: DerivedEvent,
}

#[derive(Debug)]
struct Pending {
    event: DerivedEvent,
    due: Instant,
}

#[derive(Debug)]
struct FileBatch {
    latest: DerivedEvent,
    paths: Vec<String>,
    due: Instant,
}

impl FileBatch {
    fn merge(self) -> DerivedEvent {
        let message = match self.paths.len() {
            1 => self.latest.message.clone(),
            count => format!("{count} files changed"),
        };
        let mut merged = DerivedEvent::new(
            EventKind::FileChanged,
            self.latest.ts,
            self.latest.raw_type.clone(),
            message,
        )
        .with_tool(self.latest.tool_name.clone());
        merged.file_path = self.paths.first().cloned();
        merged.file_paths = self.paths;
        merged
    }
}

/// Pacing bookkeeping for one source.
#[derive(Debug, Default)]
pub struct PacingState {
    last_emit: Option<Instant>,
    pending: Option<Pending>,
    files: Option<FileBatch>,
}

impl PacingState {
    fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref().map(|pending| pending.due);
        let files = self.files.as_ref().map(|batch| batch.due);
        pending.into_iter().chain(files).min()
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.files.is_none()
    }
}

/// Rate-limits and coalesces derived events for any number of sources.
#[derive(Debug, Default)]
pub struct Pacer {
    config: PacingConfig,
    sources: HashMap<String, PacingState>,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            sources: HashMap::new(),
        }
    }

    /// Admits one event; returns whatever must go out immediately.
    pub fn admit(&mut self, source: &str, event: DerivedEvent, now: Instant) -> Vec<Emission> {
        let window = self.config.coalesce_window();
        let min_gap = self.config.min_gap();
        let state = self.sources.entry(source.to_string()).or_default();

        if event.kind == EventKind::FileChanged {
            let batch = state.files.get_or_insert_with(|| FileBatch {
                latest: event.clone(),
                paths: Vec::new(),
                due: now + window,
            });
            for path in event.touched_paths() {
                if !batch.paths.iter().any(|known| known == path) {
                    batch.paths.push(path.to_string());
                }
            }
            batch.latest = event;
            batch.due = now + window;
            return Vec::new();
        }

        if event.is_critical() {
            if let Some(stale) = state.pending.take() {
                debug!(source, kind = %stale.event.kind, "dropping superseded pending event");
            }
            state.last_emit = Some(now);
            return vec![emission(source, event)];
        }

        match state.last_emit {
            Some(last) if now.saturating_duration_since(last) < min_gap => {
                state.pending = Some(Pending {
                    event,
                    due: last + min_gap,
                });
                Vec::new()
            }
            _ => {
                state.last_emit = Some(now);
                vec![emission(source, event)]
            }
        }
    }

    /// Earliest instant at which [`Pacer::drain_due`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sources
            .values()
            .filter_map(PacingState::next_deadline)
            .min()
    }

    /// Releases every pending event and file batch whose deadline has passed,
    /// ordered by deadline.
    pub fn drain_due(&mut self, now: Instant) -> Vec<Emission> {
        let mut due = Vec::new();
        for (source, state) in &mut self.sources {
            if state.pending.as_ref().is_some_and(|pending| pending.due <= now) {
                if let Some(pending) = state.pending.take() {
                    state.last_emit = Some(now);
                    due.push((pending.due, emission(source, pending.event)));
                }
            }
            if state.files.as_ref().is_some_and(|batch| batch.due <= now) {
                if let Some(batch) = state.files.take() {
                    due.push((batch.due, emission(source, batch.merge())));
                }
            }
        }
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, emission)| emission).collect()
    }

    /// Releases everything held for `source` right away.
    pub fn flush(&mut self, source: &str, now: Instant) -> Vec<Emission> {
        let Some(state) = self.sources.get_mut(source) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(pending) = state.pending.take() {
            state.last_emit = Some(now);
            out.push(emission(source, pending.event));
        }
        if let Some(batch) = state.files.take() {
            out.push(emission(source, batch.merge()));
        }
        out
    }

    /// Forgets a source, discarding anything still pending.
    pub fn reset(&mut self, source: &str) {
        if let Some(state) = self.sources.remove(source) {
            if !state.is_idle() {
                debug!(source, "discarding pending events on reset");
            }
        }
    }
}

fn emission(source: &str, event: DerivedEvent) -> Emission {
    Emission {
        source: source.to_string(),
        event,
    }
}
