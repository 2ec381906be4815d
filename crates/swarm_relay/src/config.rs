//! Swarm configuration: TOML file plus CLI overrides.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use relay_events::{DeriveConfig, PacingConfig, RunThresholds};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const PORT_PLACEHOLDER: &str = "{port}";
const MIN_PORT: u16 = 1025;

pub const DEFAULT_PROMPTS: &[&str] = &[
    "Run tests and fix the first failure.",
    "Find one reliability risk and patch it with tests.",
    "Improve performance in one hotspot and explain tradeoffs.",
    "Audit error handling and harden one weak path.",
    "Reduce complexity in one module without changing behavior.",
];

/// How a worker process is launched. `{port}` in any argument is replaced by
/// the worker's app-server port.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLaunch {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Working directory of each worker, also sent as the thread `cwd`.
    pub current_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerLaunch {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("codex"),
            args: vec![
                "app-server".to_string(),
                "--listen".to_string(),
                format!("ws://127.0.0.1:{PORT_PLACEHOLDER}"),
            ],
            current_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl WorkerLaunch {
    pub fn args_for(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmShape {
    pub count: usize,
    /// Cycled by worker index; empty means the built-in prompts.
    pub prompts: Vec<String>,
    pub app_server_base_port: u16,
    pub stagger_ms: u64,
    pub restart_delay_ms: u64,
    pub continuous: bool,
}

impl Default for SwarmShape {
    fn default() -> Self {
        Self {
            count: 3,
            prompts: Vec::new(),
            app_server_base_port: 11800,
            stagger_ms: 1200,
            restart_delay_ms: 3000,
            continuous: false,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Host the workers listen on.
    pub upstream_host: String,
    pub connect_attempts: u32,
    pub connect_attempt_timeout_ms: u64,
    pub connect_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            connect_attempts: 60,
            connect_attempt_timeout_ms: 1200,
            connect_backoff_ms: 250,
            request_timeout_ms: 15_000,
            shutdown_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Off by default: the codex app-server omits `"jsonrpc": "2.0"`.
    pub require_jsonrpc_marker: bool,
    pub approval_policy: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            require_jsonrpc_marker: false,
            approval_policy: "never".to_string(),
            client_name: "agent-viz-relay".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
    /// Messages buffered per subscriber before it starts skipping.
    pub capacity: usize,
    /// Also forward every raw upstream message, tagged with its source.
    pub forward_raw: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            capacity: 256,
            forward_raw: false,
        }
    }
}

impl FeedConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmConfig {
    pub worker: WorkerLaunch,
    pub swarm: SwarmShape,
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub feed: FeedConfig,
    pub pacing: PacingConfig,
    pub derivation: DeriveConfig,
    pub thresholds: RunThresholds,
}

/// Identity and parameters of one supervised worker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WorkerSpec {
    pub index: usize,
    pub tag: String,
    pub port: u16,
    pub prompt: String,
}

impl SwarmConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.swarm.count == 0 {
            return Err(ConfigError::Invalid("count must be at least 1".into()));
        }
        if self.worker.binary.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker binary must not be empty".into()));
        }
        if self.feed.port < MIN_PORT {
            return Err(ConfigError::Invalid(format!(
                "feed port {} is below {MIN_PORT}",
                self.feed.port
            )));
        }
        if self.swarm.app_server_base_port < MIN_PORT {
            return Err(ConfigError::Invalid(format!(
                "app server base port {} is below {MIN_PORT}",
                self.swarm.app_server_base_port
            )));
        }
        let last_port = usize::from(self.swarm.app_server_base_port) + self.swarm.count - 1;
        if last_port > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "{} workers starting at port {} exceed the port range",
                self.swarm.count, self.swarm.app_server_base_port
            )));
        }
        if self.feed.capacity == 0 {
            return Err(ConfigError::Invalid("feed capacity must be at least 1".into()));
        }
        if let Some(dir) = &self.worker.current_dir {
            if !dir.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "repo directory `{}` does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn prompt_for(&self, index: usize) -> String {
        if self.swarm.prompts.is_empty() {
            DEFAULT_PROMPTS[index % DEFAULT_PROMPTS.len()].to_string()
        } else {
            self.swarm.prompts[index % self.swarm.prompts.len()].clone()
        }
    }

    /// Worker specs in launch order. Call after [`SwarmConfig::validate`].
    pub fn workers(&self) -> Vec<WorkerSpec> {
        (0..self.swarm.count)
            .map(|index| WorkerSpec {
                index,
                tag: format!("agent-{}", index + 1),
                port: self
                    .swarm
                    .app_server_base_port
                    .saturating_add(u16::try_from(index).unwrap_or(u16::MAX)),
                prompt: self.prompt_for(index),
            })
            .collect()
    }

    pub fn upstream_url(&self, port: u16) -> String {
        format!("ws://{}:{port}", self.connection.upstream_host)
    }

    /// Working directory reported to workers in `thread/start`.
    pub fn thread_cwd(&self) -> String {
        self.worker
            .current_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .display()
            .to_string()
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.swarm.stagger_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.swarm.restart_delay_ms)
    }

    pub fn connect_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_attempt_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connection.connect_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.connection.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SwarmConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.feed.addr(), "0.0.0.0:8787");
        assert_eq!(config.connection.connect_attempts, 60);
        assert_eq!(config.pacing.min_gap_ms, 850);
        assert!(!config.protocol.require_jsonrpc_marker);
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[swarm]
count = 2
prompts = ["only prompt"]
continuous = true

[worker]
binary = "/usr/local/bin/codex"

[pacing]
min_gap_ms = 100

[derivation]
noise_methods = ["custom/ping"]
"#
        )
        .unwrap();

        let config = SwarmConfig::load(file.path()).unwrap();
        assert_eq!(config.swarm.count, 2);
        assert!(config.swarm.continuous);
        assert_eq!(config.swarm.app_server_base_port, 11800);
        assert_eq!(config.pacing.min_gap_ms, 100);
        assert_eq!(config.pacing.coalesce_window_ms, 1000);
        assert_eq!(config.derivation.noise_methods, vec!["custom/ping"]);
        assert_eq!(config.prompt_for(1), "only prompt");
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bogus]\nvalue = 1").unwrap();
        assert!(matches!(
            SwarmConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SwarmConfig::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let mut config = SwarmConfig::default();
        config.swarm.count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SwarmConfig::default();
        config.feed.port = 80;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.swarm.app_server_base_port = 65_535;
        config.swarm.count = 2;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.worker.current_dir = Some(PathBuf::from("/definitely/not/here"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn workers_get_tags_ports_and_cycled_prompts() {
        let mut config = SwarmConfig::default();
        config.swarm.count = 6;
        let workers = config.workers();
        assert_eq!(workers[0].tag, "agent-1");
        assert_eq!(workers[5].port, 11805);
        assert_eq!(workers[5].prompt, DEFAULT_PROMPTS[0]);
        assert_eq!(workers[2].prompt, DEFAULT_PROMPTS[2]);
    }

    #[test]
    fn port_placeholder_is_substituted() {
        let launch = WorkerLaunch::default();
        assert_eq!(
            launch.args_for(11801),
            vec!["app-server", "--listen", "ws://127.0.0.1:11801"]
        );
    }
}
