//! Worker supervision.
//!
//! Each worker is an owned task cycling through spawn -> connect ->
//! handshake -> relay -> teardown. Cycles end on turn completion, upstream
//! loss, or shutdown; in continuous mode only the affected worker restarts.

use std::{
    future::Future,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use relay_events::{extract, DerivationEngine, DerivedEvent, MessageKind, Pacer};
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    aggregator::AggregatorHandle,
    config::{SwarmConfig, WorkerSpec},
    error::WorkerError,
    feed::{FeedMessage, FeedSink, LogStream},
    jsonrpc::{Inbound, RpcClient},
    unix_ms,
};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_COMPLETED: &str = "turn/completed";

/// Longest we wait for the peer to acknowledge a close frame.
const CLOSE_WAIT: Duration = Duration::from_millis(200);
/// Sleep target when nothing is pending in the pacer.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Owns every worker pipeline for the lifetime of the swarm.
pub struct Supervisor {
    config: Arc<SwarmConfig>,
    feed: FeedSink,
    aggregator: AggregatorHandle,
}

impl Supervisor {
    pub fn new(config: SwarmConfig, feed: FeedSink, aggregator: AggregatorHandle) -> Self {
        Self {
            config: Arc::new(config),
            feed,
            aggregator,
        }
    }

    /// Runs until every worker has stopped or `shutdown` resolves, then tears
    /// everything down within the configured grace period.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let workers = self.config.workers();
        info!(count = workers.len(), continuous = self.config.swarm.continuous, "starting swarm");
        self.feed.publish(&FeedMessage::Started {
            agents: workers.len(),
            continuous: self.config.swarm.continuous,
            ts: unix_ms(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for spec in workers {
            let initial_delay = self.config.stagger().saturating_mul(spec.index as u32);
            let worker = Worker::new(
                spec,
                self.config.clone(),
                self.feed.clone(),
                self.aggregator.clone(),
                stop_rx.clone(),
            );
            tasks.spawn(worker.run(initial_delay));
        }

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => break "shutdown requested",
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(err)) => warn!("worker task ended abnormally: {err}"),
                    None => break "all workers stopped",
                },
            }
        };

        info!(reason, "stopping swarm");
        let _ = stop_tx.send(true);
        let grace = self.config.shutdown_grace();
        let drained = time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("workers did not stop within {grace:?}; aborting");
            // Aborted workers drop their children, which are killed on drop.
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.feed.publish(&FeedMessage::stopped(reason));
    }
}

/// How one worker cycle ended.
#[derive(Debug)]
enum CycleEnd {
    Completed,
    Disconnected,
    Failed(WorkerError),
    Stopped,
}

/// A spawned child with its log forwarders.
struct Launched {
    child: Child,
    exited: bool,
    log_tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct HandshakeParams {
    client_name: String,
    client_version: String,
    cwd: String,
    approval_policy: String,
    prompt: String,
    timeout: Duration,
}

struct Worker {
    spec: WorkerSpec,
    config: Arc<SwarmConfig>,
    feed: FeedSink,
    aggregator: AggregatorHandle,
    engine: DerivationEngine,
    stop: watch::Receiver<bool>,
    /// Run id most recently observed from this worker.
    current_run: String,
}

impl Worker {
    fn new(
        spec: WorkerSpec,
        config: Arc<SwarmConfig>,
        feed: FeedSink,
        aggregator: AggregatorHandle,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let engine = DerivationEngine::new(&config.derivation);
        let current_run = spec.tag.clone();
        Self {
            spec,
            config,
            feed,
            aggregator,
            engine,
            stop,
            current_run,
        }
    }

    async fn run(mut self, initial_delay: Duration) {
        if !self.pause(initial_delay).await {
            return;
        }

        let mut cycle = 1;
        loop {
            let end = self.run_cycle(cycle).await;
            debug!(agent = %self.spec.tag, cycle, ?end, "worker cycle ended");
            match end {
                CycleEnd::Stopped => return,
                CycleEnd::Failed(err) => {
                    warn!(agent = %self.spec.tag, cycle, "worker failed: {err}");
                    let error = err.to_string();
                    self.feed.publish(&FeedMessage::AgentFailed {
                        agent: self.spec.tag.clone(),
                        error: error.clone(),
                        cycle,
                        ts: unix_ms(),
                    });
                    self.aggregator.worker_failed(&self.current_run, &error).await;
                }
                CycleEnd::Completed | CycleEnd::Disconnected => {}
            }

            if !self.config.swarm.continuous {
                return;
            }

            let delay = self.config.restart_delay();
            info!(agent = %self.spec.tag, next_cycle = cycle + 1, "restarting worker in {delay:?}");
            self.feed.publish(&FeedMessage::AgentRestarting {
                agent: self.spec.tag.clone(),
                delay_ms: self.config.swarm.restart_delay_ms,
                next_cycle: cycle + 1,
                ts: unix_ms(),
            });
            if !self.pause(delay).await {
                return;
            }
            cycle += 1;
        }
    }

    /// Sleeps unless shutdown arrives first; `false` means stop.
    async fn pause(&mut self, delay: Duration) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = time::sleep(delay) => !*self.stop.borrow(),
            _ = stop_requested(&mut self.stop) => false,
        }
    }

    async fn run_cycle(&mut self, cycle: u32) -> CycleEnd {
        self.current_run = self.spec.tag.clone();
        let mut launched = match self.launch(cycle) {
            Ok(launched) => launched,
            Err(err) => return CycleEnd::Failed(err),
        };

        let end = self.drive(&mut launched, cycle).await;

        self.terminate(&mut launched, cycle).await;
        for task in &launched.log_tasks {
            task.abort();
        }
        end
    }

    fn launch(&self, cycle: u32) -> Result<Launched, WorkerError> {
        let launch = &self.config.worker;
        let mut command = Command::new(&launch.binary);
        command
            .args(launch.args_for(self.spec.port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &launch.current_dir {
            command.current_dir(dir);
        }

        for (key, value) in &launch.env {
            command.env(key, value);
        }

        let command_debug = format!("{command:?}");
        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            command: command_debug,
            source,
        })?;

        let pid = child.id();
        info!(agent = %self.spec.tag, port = self.spec.port, cycle, ?pid, "worker spawned");
        self.feed.publish(&FeedMessage::AgentStarted {
            agent: self.spec.tag.clone(),
            app_server_port: self.spec.port,
            cycle,
            pid,
            ts: unix_ms(),
        });

        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(forward_lines(
                stdout,
                self.spec.tag.clone(),
                LogStream::Stdout,
                self.feed.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(forward_lines(
                stderr,
                self.spec.tag.clone(),
                LogStream::Stderr,
                self.feed.clone(),
            )));
        }

        Ok(Launched {
            child,
            exited: false,
            log_tasks,
        })
    }

    fn handshake_params(&self) -> HandshakeParams {
        HandshakeParams {
            client_name: self.config.protocol.client_name.clone(),
            client_version: self.config.protocol.client_version.clone(),
            cwd: self.config.thread_cwd(),
            approval_policy: self.config.protocol.approval_policy.clone(),
            prompt: self.spec.prompt.clone(),
            timeout: self.config.request_timeout(),
        }
    }

    async fn drive(&mut self, launched: &mut Launched, cycle: u32) -> CycleEnd {
        let url = self.config.upstream_url(self.spec.port);
        let connection = &self.config.connection;
        let connect = RpcClient::connect_with_retry(
            &url,
            connection.connect_attempts,
            self.config.connect_attempt_timeout(),
            self.config.connect_backoff(),
            self.config.protocol.require_jsonrpc_marker,
        );

        let (client, mut inbound) = tokio::select! {
            connected = connect => match connected {
                Ok(connected) => connected,
                Err((attempts, source)) => {
                    let err = WorkerError::Connect { url, attempts, source };
                    self.publish_upstream_error(&err, cycle);
                    return CycleEnd::Failed(err);
                }
            },
            status = launched.child.wait() => {
                launched.exited = true;
                let code = exit_code(&status);
                self.publish_exit(code, cycle);
                return CycleEnd::Failed(WorkerError::ExitedEarly { code });
            }
            _ = stop_requested(&mut self.stop) => return CycleEnd::Stopped,
        };

        info!(agent = %self.spec.tag, %url, cycle, "upstream connected");
        self.feed.publish(&FeedMessage::UpstreamConnected {
            agent: self.spec.tag.clone(),
            url,
            cycle,
            ts: unix_ms(),
        });

        let mut pacer = Pacer::new(self.config.pacing);
        let setup = handshake(&client, self.handshake_params());
        tokio::pin!(setup);
        let mut handshake_done = false;

        let end = loop {
            let deadline = pacer.next_deadline().map(Instant::from_std);
            let wake = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                _ = stop_requested(&mut self.stop) => break CycleEnd::Stopped,
                result = &mut setup, if !handshake_done => {
                    handshake_done = true;
                    match result {
                        Ok(thread_id) => {
                            info!(agent = %self.spec.tag, %thread_id, "turn started");
                        }
                        Err(err) => {
                            self.publish_upstream_error(&err, cycle);
                            let event = self.engine.protocol_error("handshake", err.to_string(), unix_ms());
                            let run_id = self.current_run.clone();
                            self.forward(&mut pacer, &run_id, event).await;
                            break CycleEnd::Failed(err);
                        }
                    }
                }
                received = inbound.recv() => match received {
                    Some(Inbound::Message { kind: MessageKind::Response, message }) => {
                        if let Some(event) = self.orphan_error(&message) {
                            let run_id = self.current_run.clone();
                            self.forward(&mut pacer, &run_id, event).await;
                        }
                    }
                    Some(Inbound::Message { kind, message }) => {
                        if self.relay(&mut pacer, kind, message, cycle).await {
                            info!(agent = %self.spec.tag, cycle, "turn completed");
                            break CycleEnd::Completed;
                        }
                    }
                    Some(Inbound::Undecodable(failure)) => {
                        let event = self.engine.decode_failure(&failure, unix_ms());
                        let run_id = self.current_run.clone();
                        self.forward(&mut pacer, &run_id, event).await;
                    }
                    Some(Inbound::Closed { reason }) => {
                        self.publish_closed(reason, cycle);
                        break CycleEnd::Disconnected;
                    }
                    None => {
                        self.publish_closed(None, cycle);
                        break CycleEnd::Disconnected;
                    }
                },
                status = launched.child.wait() => {
                    launched.exited = true;
                    self.publish_exit(exit_code(&status), cycle);
                    break CycleEnd::Disconnected;
                }
                _ = time::sleep_until(wake), if deadline.is_some() => {
                    for emission in pacer.drain_due(Instant::now().into_std()) {
                        self.publish_event(emission.event);
                    }
                }
            }
        };

        if matches!(end, CycleEnd::Stopped) {
            pacer.reset(&self.spec.tag);
        } else {
            for emission in pacer.flush(&self.spec.tag, Instant::now().into_std()) {
                self.publish_event(emission.event);
            }
        }

        if !matches!(end, CycleEnd::Disconnected) {
            client.close();
            let wait = CLOSE_WAIT.min(self.config.shutdown_grace());
            let _ = time::timeout(wait, drain_until_closed(&mut inbound)).await;
        }
        end
    }

    /// Tags, derives, and forwards one upstream message. Returns `true` when
    /// it completes the turn.
    async fn relay(
        &mut self,
        pacer: &mut Pacer,
        kind: MessageKind,
        mut message: Value,
        cycle: u32,
    ) -> bool {
        let received_at = unix_ms();
        if let Some(run_id) = tag_run_id(&mut message, &self.spec.tag) {
            self.current_run = run_id;
        }

        if self.config.feed.forward_raw {
            let mut raw = message.clone();
            if let Some(object) = raw.as_object_mut() {
                object.insert(
                    "swarm".to_string(),
                    json!({
                        "agent": self.spec.tag,
                        "appServerPort": self.spec.port,
                        "cycle": cycle,
                    }),
                );
            }
            if let Err(err) = self.feed.publish_value(&raw) {
                warn!(agent = %self.spec.tag, "failed to forward raw message: {err}");
            }
        }

        let run_id = self.current_run.clone();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut events = self.engine.derive(&message, received_at);
        if kind == MessageKind::Request {
            events.push(self.engine.unsupported_request(&method, received_at));
        }
        for event in events {
            self.forward(pacer, &run_id, event).await;
        }

        kind == MessageKind::Notification && method == METHOD_TURN_COMPLETED
    }

    /// Error event for a JSON-RPC error response no pending request claimed.
    fn orphan_error(&self, message: &Value) -> Option<DerivedEvent> {
        let error = message.get("error")?;
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        warn!(agent = %self.spec.tag, code, "unclaimed upstream error response: {detail}");
        Some(self.engine.protocol_error(
            "rpc.error",
            format!("Upstream JSON-RPC error {code}: {detail}"),
            unix_ms(),
        ))
    }

    /// Every derived event reaches the aggregator; the feed sees it paced.
    async fn forward(&mut self, pacer: &mut Pacer, run_id: &str, event: DerivedEvent) {
        self.aggregator
            .apply(run_id, &self.spec.tag, event.clone())
            .await;
        for emission in pacer.admit(&self.spec.tag, event, Instant::now().into_std()) {
            self.publish_event(emission.event);
        }
    }

    async fn terminate(&mut self, launched: &mut Launched, cycle: u32) {
        if launched.exited {
            return;
        }
        if let Err(err) = launched.child.start_kill() {
            debug!(agent = %self.spec.tag, "kill failed: {err}");
        }
        let code = match time::timeout(self.config.shutdown_grace(), launched.child.wait()).await {
            Ok(status) => exit_code(&status),
            Err(_) => {
                warn!(agent = %self.spec.tag, "worker did not exit after kill");
                None
            }
        };
        launched.exited = true;
        self.publish_exit(code, cycle);
    }

    fn publish_event(&self, event: DerivedEvent) {
        self.feed.publish(&FeedMessage::Event {
            agent: self.spec.tag.clone(),
            run_id: self.current_run.clone(),
            event,
        });
    }

    fn publish_exit(&self, code: Option<i32>, cycle: u32) {
        info!(agent = %self.spec.tag, cycle, ?code, "worker exited");
        self.feed.publish(&FeedMessage::ChildExit {
            agent: self.spec.tag.clone(),
            code,
            cycle,
            ts: unix_ms(),
        });
    }

    fn publish_closed(&self, reason: Option<String>, cycle: u32) {
        info!(agent = %self.spec.tag, cycle, ?reason, "upstream closed");
        self.feed.publish(&FeedMessage::UpstreamClosed {
            agent: self.spec.tag.clone(),
            reason,
            cycle,
            ts: unix_ms(),
        });
    }

    fn publish_upstream_error(&self, err: &WorkerError, cycle: u32) {
        warn!(agent = %self.spec.tag, cycle, "upstream error: {err}");
        self.feed.publish(&FeedMessage::UpstreamError {
            agent: self.spec.tag.clone(),
            error: err.to_string(),
            cycle,
            ts: unix_ms(),
        });
    }
}

/// Resolves once shutdown is requested or the supervisor is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn drain_until_closed(inbound: &mut mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        if matches!(item, Inbound::Closed { .. }) {
            break;
        }
    }
}

fn exit_code(status: &std::io::Result<ExitStatus>) -> Option<i32> {
    status.as_ref().ok().and_then(ExitStatus::code)
}

/// Ensures `params.run_id` is set, defaulting to the worker tag. Returns the
/// run identity the message carried before tagging, if any.
fn tag_run_id(message: &mut Value, tag: &str) -> Option<String> {
    let carried = extract::run_identity(message);
    let Some(object) = message.as_object_mut() else {
        return carried;
    };
    let params = object
        .entry("params")
        .or_insert_with(|| Value::Object(Map::new()));
    if !params.is_object() {
        *params = Value::Object(Map::new());
    }
    if let Some(params) = params.as_object_mut() {
        let missing = params
            .get("run_id")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty);
        if missing {
            params.insert("run_id".to_string(), Value::String(tag.to_string()));
        }
    }
    carried
}

async fn handshake(client: &RpcClient, params: HandshakeParams) -> Result<String, WorkerError> {
    let step = |step: &'static str| move |source| WorkerError::Handshake { step, source };

    client
        .call(
            METHOD_INITIALIZE,
            json!({
                "clientInfo": {
                    "name": params.client_name,
                    "version": params.client_version,
                }
            }),
            params.timeout,
        )
        .await
        .map_err(step(METHOD_INITIALIZE))?;

    let thread = client
        .call(
            METHOD_THREAD_START,
            json!({
                "cwd": params.cwd,
                "approvalPolicy": params.approval_policy,
            }),
            params.timeout,
        )
        .await
        .map_err(step(METHOD_THREAD_START))?;
    let thread_id = thread
        .pointer("/thread/id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(WorkerError::MissingThreadId)?
        .to_string();

    client
        .call(
            METHOD_TURN_START,
            json!({
                "threadId": thread_id,
                "input": [{"type": "text", "text": params.prompt}],
                "approvalPolicy": params.approval_policy,
            }),
            params.timeout,
        )
        .await
        .map_err(step(METHOD_TURN_START))?;

    Ok(thread_id)
}

async fn forward_lines<R>(reader: R, agent: String, stream: LogStream, feed: FeedSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!(agent = %agent, ?stream, "{line}");
        feed.publish(&FeedMessage::ChildLog {
            agent: agent.clone(),
            stream,
            line,
            ts: unix_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_defaults_to_worker_tag() {
        let mut message = json!({"jsonrpc": "2.0", "method": "turn/started"});
        assert_eq!(tag_run_id(&mut message, "agent-2"), None);
        assert_eq!(message["params"]["run_id"], "agent-2");
    }

    #[test]
    fn existing_run_id_is_kept() {
        let mut message = json!({"method": "x", "params": {"run_id": "custom"}});
        assert_eq!(tag_run_id(&mut message, "agent-2").as_deref(), Some("custom"));
        assert_eq!(message["params"]["run_id"], "custom");
    }

    #[test]
    fn injected_tag_is_not_reported_as_an_identity() {
        let mut message = json!({"method": "item/started", "params": {"threadId": "th-7"}});
        assert_eq!(tag_run_id(&mut message, "agent-1").as_deref(), Some("th-7"));

        let mut message = json!({"method": "item/started", "params": {"item": {}}});
        assert_eq!(tag_run_id(&mut message, "agent-1"), None);
        assert_eq!(message["params"]["run_id"], "agent-1");
    }

    #[test]
    fn non_object_params_are_replaced() {
        let mut message = json!({"method": "x", "params": [1, 2]});
        assert_eq!(tag_run_id(&mut message, "agent-1"), None);
        assert_eq!(message["params"]["run_id"], "agent-1");
    }

    #[tokio::test]
    async fn stop_requested_resolves_when_sender_drops() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        time::timeout(Duration::from_secs(1), stop_requested(&mut rx))
            .await
            .expect("resolves");
    }
}
