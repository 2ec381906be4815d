use std::{io, path::PathBuf, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors from the upstream JSON-RPC connection.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to `{url}`: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("websocket transport failed: {0}")]
    Transport(String),
    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
}

/// Failures that end one worker cycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no upstream connection to `{url}` after {attempts} attempts: {source}")]
    Connect {
        url: String,
        attempts: u32,
        #[source]
        source: RpcError,
    },
    #[error("worker exited before accepting a connection (code {code:?})")]
    ExitedEarly { code: Option<i32> },
    #[error("`{step}` failed during handshake: {source}")]
    Handshake {
        step: &'static str,
        #[source]
        source: RpcError,
    },
    #[error("`thread/start` response did not carry a thread id")]
    MissingThreadId,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to bind feed listener on `{addr}`: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize feed message: {0}")]
    Serialization(#[from] serde_json::Error),
}
