//! Downstream feed: a broadcast fan-out of JSON messages plus the WebSocket
//! server that relays it to subscribers.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use relay_events::{DerivedEvent, RunState};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::{error::FeedError, unix_ms};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Everything published on the feed. Lifecycle notices bypass pacing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    #[serde(rename = "swarm.started")]
    Started {
        agents: usize,
        continuous: bool,
        ts: u64,
    },
    #[serde(rename = "swarm.agent.started", rename_all = "camelCase")]
    AgentStarted {
        agent: String,
        app_server_port: u16,
        cycle: u32,
        pid: Option<u32>,
        ts: u64,
    },
    #[serde(rename = "swarm.upstream.connected", rename_all = "camelCase")]
    UpstreamConnected {
        agent: String,
        url: String,
        cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.child.log")]
    ChildLog {
        agent: String,
        stream: LogStream,
        line: String,
        ts: u64,
    },
    #[serde(rename = "swarm.child.exit")]
    ChildExit {
        agent: String,
        code: Option<i32>,
        cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.upstream.closed")]
    UpstreamClosed {
        agent: String,
        reason: Option<String>,
        cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.upstream.error")]
    UpstreamError {
        agent: String,
        error: String,
        cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.agent.restarting", rename_all = "camelCase")]
    AgentRestarting {
        agent: String,
        delay_ms: u64,
        next_cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.agent.failed")]
    AgentFailed {
        agent: String,
        error: String,
        cycle: u32,
        ts: u64,
    },
    #[serde(rename = "swarm.stopped")]
    Stopped { reason: String, ts: u64 },
    #[serde(rename = "swarm.run.state")]
    RunState { run: RunState, ts: u64 },
    #[serde(rename = "swarm.event", rename_all = "camelCase")]
    Event {
        agent: String,
        run_id: String,
        event: DerivedEvent,
    },
}

impl FeedMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            FeedMessage::Started { .. } => "swarm.started",
            FeedMessage::AgentStarted { .. } => "swarm.agent.started",
            FeedMessage::UpstreamConnected { .. } => "swarm.upstream.connected",
            FeedMessage::ChildLog { .. } => "swarm.child.log",
            FeedMessage::ChildExit { .. } => "swarm.child.exit",
            FeedMessage::UpstreamClosed { .. } => "swarm.upstream.closed",
            FeedMessage::UpstreamError { .. } => "swarm.upstream.error",
            FeedMessage::AgentRestarting { .. } => "swarm.agent.restarting",
            FeedMessage::AgentFailed { .. } => "swarm.agent.failed",
            FeedMessage::Stopped { .. } => "swarm.stopped",
            FeedMessage::RunState { .. } => "swarm.run.state",
            FeedMessage::Event { .. } => "swarm.event",
        }
    }

    pub fn stopped(reason: impl Into<String>) -> Self {
        FeedMessage::Stopped {
            reason: reason.into(),
            ts: unix_ms(),
        }
    }
}

/// Append-only fan-out shared by every pipeline. Publishing never waits on
/// subscribers; slow ones skip ahead.
#[derive(Debug, Clone)]
pub struct FeedSink {
    tx: broadcast::Sender<String>,
}

impl FeedSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn publish(&self, message: &FeedMessage) {
        match serde_json::to_string(message) {
            Ok(serialized) => self.send(serialized),
            Err(err) => warn!(kind = message.type_name(), "failed to serialize feed message: {err}"),
        }
    }

    /// Publishes an already-shaped JSON value (raw forwarding).
    pub fn publish_value(&self, value: &Value) -> Result<(), FeedError> {
        self.send(serde_json::to_string(value)?);
        Ok(())
    }

    fn send(&self, serialized: String) {
        // No subscribers is not an error.
        let _ = self.tx.send(serialized);
    }
}

/// Binds the feed listener.
pub async fn bind(addr: &str) -> Result<TcpListener, FeedError> {
    TcpListener::bind(addr).await.map_err(|source| FeedError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Accepts subscribers until `shutdown` flips to `true`.
pub async fn serve(listener: TcpListener, sink: FeedSink, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "feed listening");
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(relay_to_subscriber(stream, peer, sink.subscribe(), shutdown.clone()));
                }
                Err(err) => warn!("feed accept failed: {err}"),
            },
        }
    }
}

async fn relay_to_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut feed: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%peer, "feed handshake failed: {err}");
            return;
        }
    };
    debug!(%peer, "feed subscriber connected");
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            received = feed.recv() => match received {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%peer, skipped, "feed subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(%peer, "feed subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use relay_events::EventKind;

    use super::*;

    #[test]
    fn lifecycle_messages_carry_their_type() {
        let message = FeedMessage::AgentRestarting {
            agent: "agent-2".into(),
            delay_ms: 3000,
            next_cycle: 2,
            ts: 1,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "swarm.agent.restarting");
        assert_eq!(value["delayMs"], 3000);
        assert_eq!(value["nextCycle"], 2);
        assert_eq!(message.type_name(), "swarm.agent.restarting");
    }

    #[test]
    fn events_embed_the_derived_event() {
        let message = FeedMessage::Event {
            agent: "agent-1".into(),
            run_id: "th-1".into(),
            event: DerivedEvent::new(EventKind::Error, 5, "error", "boom"),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "swarm.event");
        assert_eq!(value["runId"], "th-1");
        assert_eq!(value["event"]["kind"], "error");
        assert_eq!(value["event"]["attentionSeverity"], "critical");
    }

    #[tokio::test]
    async fn subscribers_receive_published_messages_in_order() {
        let sink = FeedSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(&FeedMessage::stopped("first"));
        sink.publish(&FeedMessage::stopped("second"));

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["reason"], "first");
        assert_eq!(second["reason"], "second");
    }

    #[tokio::test]
    async fn lagging_subscribers_skip_instead_of_blocking() {
        let sink = FeedSink::new(2);
        let mut rx = sink.subscribe();
        for index in 0..5 {
            sink.publish(&FeedMessage::stopped(format!("m{index}")));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        let next: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(next["reason"], "m3");
    }
}
