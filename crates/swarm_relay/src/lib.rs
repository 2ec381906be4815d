//! Supervises a swarm of codex `app-server` workers and relays their traffic
//! to WebSocket subscribers.
//!
//! Each worker gets its own pipeline: spawn the child, connect to its
//! JSON-RPC listener, run the initialize/thread/turn handshake, then decode,
//! derive, and pace everything it says. Derived events also feed a single
//! run-state aggregator whose classifications are published alongside.

pub mod aggregator;
pub mod config;
mod error;
pub mod feed;
pub mod jsonrpc;
pub mod supervisor;

use std::time::{SystemTime, UNIX_EPOCH};

pub use aggregator::AggregatorHandle;
pub use config::{SwarmConfig, WorkerSpec};
pub use error::{ConfigError, FeedError, RpcError, WorkerError};
pub use feed::{FeedMessage, FeedSink};
pub use jsonrpc::{Inbound, RpcClient};
pub use supervisor::Supervisor;

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
