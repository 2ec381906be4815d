//! Single-writer owner of the run store.
//!
//! Pipelines send commands over a channel; the actor applies them in arrival
//! order, reclassifies on a fixed tick, and publishes `swarm.run.state`
//! whenever a run's classification changes.

use std::time::Duration;

use relay_events::{DerivedEvent, RunState, RunStore, RunThresholds};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    feed::{FeedMessage, FeedSink},
    unix_ms,
};

const COMMAND_BUFFER: usize = 1024;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Apply {
        run_id: String,
        label: String,
        event: DerivedEvent,
    },
    WorkerFailed {
        run_id: String,
        reason: String,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<RunState>>,
    },
    Export {
        reply: oneshot::Sender<Value>,
    },
}

/// Cloneable sender side of the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AggregatorHandle {
    pub async fn apply(&self, run_id: &str, label: &str, event: DerivedEvent) {
        self.send(Command::Apply {
            run_id: run_id.to_string(),
            label: label.to_string(),
            event,
        })
        .await;
    }

    pub async fn worker_failed(&self, run_id: &str, reason: &str) {
        self.send(Command::WorkerFailed {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        })
        .await;
    }

    /// Current state of every run; empty once the actor is gone.
    pub async fn snapshot(&self) -> Vec<RunState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// Runs with their timelines as one JSON document.
    pub async fn export(&self) -> Value {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Export { reply }).await;
        rx.await.unwrap_or(Value::Null)
    }

    async fn send(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            debug!("run aggregator stopped; dropping command");
        }
    }
}

/// Starts the actor. It exits once every handle is dropped.
pub fn spawn(thresholds: RunThresholds, tick: Duration, feed: FeedSink) -> (AggregatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run(RunStore::new(thresholds), tick, rx, feed));
    (AggregatorHandle { tx }, task)
}

async fn run(mut store: RunStore, tick: Duration, mut rx: mpsc::Receiver<Command>, feed: FeedSink) {
    let mut ticker = time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle(&mut store, command, &feed);
            }
            _ = ticker.tick() => {
                let now = unix_ms();
                for run_id in store.tick(now) {
                    publish(&store, &run_id, now, &feed);
                }
            }
        }
    }
    debug!("run aggregator exiting");
}

fn handle(store: &mut RunStore, command: Command, feed: &FeedSink) {
    let now = unix_ms();
    match command {
        Command::Apply {
            run_id,
            label,
            event,
        } => {
            if store.apply_labeled(&run_id, &label, &event, now) {
                publish(store, &run_id, now, feed);
            }
        }
        Command::WorkerFailed { run_id, reason } => {
            if store.mark_failed(&run_id, &reason, now) {
                publish(store, &run_id, now, feed);
            }
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(store.runs().cloned().collect());
        }
        Command::Export { reply } => {
            let export = serde_json::to_value(store.export()).unwrap_or(Value::Null);
            let _ = reply.send(export);
        }
    }
}

fn publish(store: &RunStore, run_id: &str, now: u64, feed: &FeedSink) {
    if let Some(run) = store.get(run_id) {
        feed.publish(&FeedMessage::RunState {
            run: run.clone(),
            ts: now,
        });
    }
}
