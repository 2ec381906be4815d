//! JSON-RPC client over a WebSocket upstream.
//!
//! Requests are correlated through a pending map resolved by the reader task;
//! everything else the peer sends is handed to the caller as [`Inbound`]
//! items. Inbound requests get an immediate "not supported" reply.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use relay_events::{
    classify_with, decode, method_not_supported_reply, DecodeFailure, MessageKind, Payload,
    JSONRPC_VERSION,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::error::RpcError;

pub type RequestId = u64;

type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>>>;
type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Traffic surfaced to the owner of a connection, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded message. Responses only arrive here when no pending request
    /// claimed them.
    Message { kind: MessageKind, message: Value },
    Undecodable(DecodeFailure),
    /// The connection is gone; nothing follows.
    Closed { reason: Option<String> },
}

/// Handle for issuing requests on an open upstream connection.
pub struct RpcClient {
    writer: mpsc::UnboundedSender<WsMessage>,
    pending: PendingRequests,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcClient {
    /// Opens one connection attempt bounded by `attempt_timeout`.
    pub async fn connect(
        url: &str,
        attempt_timeout: Duration,
        require_marker: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), RpcError> {
        let stream = match time::timeout(attempt_timeout, connect_async(url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(source)) => {
                return Err(RpcError::Connect {
                    url: url.to_string(),
                    source,
                })
            }
            Err(_) => return Err(RpcError::Timeout(attempt_timeout)),
        };
        Ok(Self::from_stream(stream, require_marker))
    }

    /// Retries [`RpcClient::connect`] up to `attempts` times with a fixed
    /// backoff; the worker may still be starting its listener.
    pub async fn connect_with_retry(
        url: &str,
        attempts: u32,
        attempt_timeout: Duration,
        backoff: Duration,
        require_marker: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), (u32, RpcError)> {
        let attempts = attempts.max(1);
        let mut last_error = RpcError::ChannelClosed;
        for attempt in 1..=attempts {
            match Self::connect(url, attempt_timeout, require_marker).await {
                Ok(connected) => {
                    debug!(url, attempt, "upstream connected");
                    return Ok(connected);
                }
                Err(err) => {
                    debug!(url, attempt, "upstream connect attempt failed: {err}");
                    last_error = err;
                }
            }
            if attempt < attempts {
                time::sleep(backoff).await;
            }
        }
        Err((attempts, last_error))
    }

    fn from_stream(stream: Upstream, require_marker: bool) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (sink, source) = stream.split();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_task(sink, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            source,
            pending.clone(),
            writer_tx.clone(),
            inbound_tx,
            require_marker,
        ));

        let client = Self {
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            tasks: vec![writer_handle, reader_handle],
        };
        (client, inbound_rx)
    }

    /// Sends a request and returns the receiver its response resolves.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(RequestId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params
        });
        let serialized = serde_json::to_string(&message)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if self.writer.send(WsMessage::Text(serialized.into())).is_err() {
            let mut guard = self.pending.lock().await;
            guard.remove(&id);
            return Err(RpcError::ChannelClosed);
        }

        Ok((id, rx))
    }

    /// Request plus bounded wait for its response.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        let (_, rx) = self.request(method, params).await?;
        recv_with_timeout(rx, timeout).await
    }

    /// Asks the peer to close; the reader reports [`Inbound::Closed`] once it
    /// has.
    pub fn close(&self) {
        let _ = self.writer.send(WsMessage::Close(Some(CloseFrame {
            code: 1000.into(),
            reason: "relay shutting down".into(),
        })));
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
    }
}

async fn writer_task<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<WsMessage>)
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!("upstream write failed: {err}");
            break;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}

async fn reader_task<S>(
    mut source: S,
    pending: PendingRequests,
    writer: mpsc::UnboundedSender<WsMessage>,
    inbound: mpsc::UnboundedSender<Inbound>,
    require_marker: bool,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut reason = None;
    while let Some(frame) = source.next().await {
        let payload = match frame {
            Ok(WsMessage::Text(text)) => Payload::Text(text.as_str().to_string()),
            Ok(WsMessage::Binary(bytes)) => Payload::Binary(bytes.to_vec()),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => continue,
            Ok(WsMessage::Close(frame)) => {
                reason = frame.map(|frame| frame.reason.as_str().to_string()).filter(|text| !text.is_empty());
                break;
            }
            Err(err) => {
                warn!("upstream read failed: {err}");
                reason = Some(err.to_string());
                break;
            }
        };

        let messages = match decode(payload) {
            Ok(messages) => messages,
            Err(failure) => {
                warn!(reason = %failure.reason, "dropping undecodable upstream payload");
                let _ = inbound.send(Inbound::Undecodable(failure));
                continue;
            }
        };

        for message in messages {
            let kind = classify_with(&message, require_marker);
            match kind {
                MessageKind::Response => {
                    if handle_response(&message, &pending).await {
                        continue;
                    }
                }
                MessageKind::Request => {
                    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
                    debug!(method, "rejecting inbound request");
                    let reply = method_not_supported_reply(message.get("id").unwrap_or(&Value::Null));
                    if let Ok(serialized) = serde_json::to_string(&reply) {
                        let _ = writer.send(WsMessage::Text(serialized.into()));
                    }
                }
                MessageKind::Notification | MessageKind::Unknown => {}
            }
            let _ = inbound.send(Inbound::Message { kind, message });
        }
    }

    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(RpcError::ChannelClosed));
    }
    drop(guard);
    let _ = inbound.send(Inbound::Closed { reason });
}

/// Resolves the pending request `message` answers. Returns `false` for
/// responses nobody is waiting on, which the caller passes along.
async fn handle_response(message: &Value, pending: &PendingRequests) -> bool {
    let Some(id) = message.get("id").and_then(parse_request_id) else {
        warn!("received response without numeric id");
        return false;
    };

    let sender = { pending.lock().await.remove(&id) };
    let Some(tx) = sender else {
        debug!(id, "response for unknown or expired request");
        return false;
    };

    if let Some(err) = message.get("error") {
        let _ = tx.send(Err(RpcError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: err.get("data").cloned(),
        }));
    } else {
        let result = message.get("result").cloned().unwrap_or(Value::Null);
        let _ = tx.send(Ok(result));
    }
    true
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    if let Some(num) = value.as_u64() {
        return Some(num);
    }

    value.as_str().and_then(|s| s.parse::<RequestId>().ok())
}

async fn recv_with_timeout(
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    timeout: Duration,
) -> Result<Value, RpcError> {
    match time::timeout(timeout, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(err),
        Ok(Err(_)) => Err(RpcError::ChannelClosed),
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}
