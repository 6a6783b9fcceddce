use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    core::{coordinator::CoordinatorSettings, domain::ExecutionLimits, logs::LogLimits},
    native::{
        sandbox::{NodeSandboxSettings, SYSTEM_READ_PATHS},
        scope::ScopeBus,
    },
    storage::fs::FsStoreSettings,
};

const DEFAULT_CONFIG_FILE: &str = "playground.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix of every artifact URL handed to clients.
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_waiting: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_waiting: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub run_timeout_ms: u64,
    pub teardown_grace_ms: u64,
    pub max_source_bytes: usize,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub pids_count: Option<u32>,
    pub scratch_bytes: Option<u64>,
    pub log_bytes_per_run: u64,
    pub log_bytes_total: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: 30_000,
            teardown_grace_ms: 2_000,
            max_source_bytes: 64 * 1024,
            cpu_time_ms: Some(60_000),
            memory_bytes: Some(1024 * 1024 * 1024),
            pids_count: Some(256),
            scratch_bytes: Some(256 * 1024 * 1024),
            log_bytes_per_run: 1024 * 1024,
            log_bytes_total: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub retention_secs: u64,
    pub max_total_bytes: u64,
    pub reap_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/artifacts"),
            retention_secs: 3600,
            max_total_bytes: 1024 * 1024 * 1024,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Node,
    Stub,
}

impl FromStr for SandboxBackend {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "node" => Ok(SandboxBackend::Node),
            "stub" => Ok(SandboxBackend::Stub),
            _ => Err(()),
        }
    }
}

impl FromStr for ScopeBus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "off" => Ok(ScopeBus::Off),
            "user" => Ok(ScopeBus::User),
            "system" => Ok(ScopeBus::System),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    pub node_bin: PathBuf,
    pub node_path: Option<PathBuf>,
    pub browsers_path: Option<PathBuf>,
    pub scratch_root: PathBuf,
    pub path_env: String,
    pub landlock: bool,
    pub systemd_scope: ScopeBus,
    pub extra_read_paths: Vec<PathBuf>,
    /// Restricts outbound TCP of the whole sandbox tree to `allowed_ports`.
    pub restrict_network: bool,
    pub allowed_ports: Vec<u16>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Node,
            node_bin: PathBuf::from("node"),
            node_path: None,
            browsers_path: None,
            scratch_root: PathBuf::from("./data/runs"),
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            landlock: true,
            systemd_scope: ScopeBus::Off,
            extra_read_paths: Vec::new(),
            restrict_network: true,
            allowed_ports: vec![80, 443],
        }
    }
}

impl Config {
    /// Reads `PLAYGROUND_CONFIG` or `./playground.toml` when present,
    /// otherwise builds the configuration from `PLAYGROUND_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("PLAYGROUND_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                default.exists().then(|| default.to_path_buf())
            });

        match path {
            Some(path) => Self::from_file(&path),
            None => Self::from_env_with(|key| env::var(key).ok()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let vars = EnvReader { lookup };

        vars.set("PLAYGROUND_HOST", &mut config.server.host)?;
        vars.set("PLAYGROUND_PORT", &mut config.server.port)?;
        vars.set("PLAYGROUND_PUBLIC_BASE_URL", &mut config.server.public_base_url)?;

        vars.set("PLAYGROUND_CONCURRENCY", &mut config.queue.concurrency)?;
        vars.set_opt("PLAYGROUND_MAX_WAITING", &mut config.queue.max_waiting)?;

        let limits = &mut config.limits;
        vars.set("PLAYGROUND_RUN_TIMEOUT_MS", &mut limits.run_timeout_ms)?;
        vars.set("PLAYGROUND_TEARDOWN_GRACE_MS", &mut limits.teardown_grace_ms)?;
        vars.set("PLAYGROUND_MAX_SOURCE_BYTES", &mut limits.max_source_bytes)?;
        vars.set_opt("PLAYGROUND_CPU_TIME_MS", &mut limits.cpu_time_ms)?;
        vars.set_opt("PLAYGROUND_MEMORY_BYTES", &mut limits.memory_bytes)?;
        vars.set_opt("PLAYGROUND_PIDS_COUNT", &mut limits.pids_count)?;
        vars.set_opt("PLAYGROUND_SCRATCH_BYTES", &mut limits.scratch_bytes)?;
        vars.set("PLAYGROUND_LOG_BYTES_PER_RUN", &mut limits.log_bytes_per_run)?;
        vars.set("PLAYGROUND_LOG_BYTES_TOTAL", &mut limits.log_bytes_total)?;

        let storage = &mut config.storage;
        vars.set("PLAYGROUND_ARTIFACTS_DIR", &mut storage.root)?;
        vars.set("PLAYGROUND_RETENTION_SECS", &mut storage.retention_secs)?;
        vars.set("PLAYGROUND_STORAGE_MAX_BYTES", &mut storage.max_total_bytes)?;
        vars.set("PLAYGROUND_REAP_INTERVAL_SECS", &mut storage.reap_interval_secs)?;

        let sandbox = &mut config.sandbox;
        vars.set("PLAYGROUND_SANDBOX", &mut sandbox.backend)?;
        vars.set("PLAYGROUND_NODE_BIN", &mut sandbox.node_bin)?;
        vars.set_opt("PLAYGROUND_NODE_PATH", &mut sandbox.node_path)?;
        vars.set_opt("PLAYGROUND_BROWSERS_PATH", &mut sandbox.browsers_path)?;
        vars.set("PLAYGROUND_SCRATCH_DIR", &mut sandbox.scratch_root)?;
        vars.set("PLAYGROUND_SANDBOX_PATH", &mut sandbox.path_env)?;
        vars.set("PLAYGROUND_LANDLOCK", &mut sandbox.landlock)?;
        vars.set("PLAYGROUND_SYSTEMD_SCOPE", &mut sandbox.systemd_scope)?;
        vars.set("PLAYGROUND_RESTRICT_NETWORK", &mut sandbox.restrict_network)?;
        if let Some(ports) = vars.read::<String>("PLAYGROUND_ALLOWED_PORTS")? {
            sandbox.allowed_ports = ports
                .split(',')
                .map(|port| port.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: "PLAYGROUND_ALLOWED_PORTS",
                    value: ports.clone(),
                })?;
        }

        Ok(config)
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: self.limits.run_timeout_ms,
            teardown_grace_ms: self.limits.teardown_grace_ms,
            cpu_time_ms: self.limits.cpu_time_ms,
            memory_bytes: self.limits.memory_bytes,
            pids_count: self.limits.pids_count,
            scratch_size_bytes: self.limits.scratch_bytes,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_source_bytes: self.limits.max_source_bytes,
            limits: self.execution_limits(),
        }
    }

    pub fn log_limits(&self) -> LogLimits {
        LogLimits {
            run_bytes: self.limits.log_bytes_per_run,
            total_bytes: self.limits.log_bytes_total,
        }
    }

    pub fn store_settings(&self) -> FsStoreSettings {
        FsStoreSettings {
            root: self.storage.root.clone(),
            public_base_url: self.server.public_base_url.clone(),
            retention: Duration::from_secs(self.storage.retention_secs),
            max_total_bytes: self.storage.max_total_bytes,
        }
    }

    pub fn node_settings(&self) -> NodeSandboxSettings {
        let mut readable_paths: Vec<PathBuf> =
            SYSTEM_READ_PATHS.iter().map(PathBuf::from).collect();
        readable_paths.extend(self.sandbox.extra_read_paths.iter().cloned());

        NodeSandboxSettings {
            node_bin: self.sandbox.node_bin.clone(),
            node_modules: self.sandbox.node_path.clone(),
            browsers_path: self.sandbox.browsers_path.clone(),
            scratch_root: self.sandbox.scratch_root.clone(),
            path_env: self.sandbox.path_env.clone(),
            landlock: self.sandbox.landlock,
            readable_paths,
            connect_ports: self
                .sandbox
                .restrict_network
                .then(|| self.sandbox.allowed_ports.clone()),
        }
    }

    /// JSON escaping can grow the code up to six times, plus the envelope.
    pub fn max_body_bytes(&self) -> usize {
        self.limits.max_source_bytes.saturating_mul(6).saturating_add(1024)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.storage.reap_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.storage.retention_secs)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn read<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(value) = (self.lookup)(key).filter(|value| !value.trim().is_empty()) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value })
    }

    fn set<T: FromStr>(&self, key: &'static str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.read(key)? {
            *target = value;
        }
        Ok(())
    }

    fn set_opt<T: FromStr>(
        &self,
        key: &'static str,
        target: &mut Option<T>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = self.read(key)? {
            *target = Some(value);
        }
        Ok(())
    }
}
