use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Default seed of a run.
pub const DEFAULT_SEED: u64 = 0;
/// Default cap on virtual time before a run is stopped.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(60);
/// Latency of links configured without an explicit latency shape.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a server waits for the final ACK of a handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;
/// Time a stopped service gets to exit on its own before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Seed for every random decision of the run.
    #[arg(long, env = "SIMNET_SEED")]
    pub seed: Option<u64>,

    /// TOML file with a full or partial configuration.
    #[arg(long, env = "SIMNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stop the run once virtual time passes this many milliseconds.
    #[arg(long, env = "SIMNET_MAX_TIME_MS")]
    pub max_time_ms: Option<u64>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Record every routed packet in the event log.
    #[arg(long)]
    pub trace_network: bool,
}

impl ConfigArgs {
    /// Builds the run configuration: file first, then command line
    /// overrides on top.
    pub fn build(&self) -> anyhow::Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) => SimConfig::load(path)?,
            None => SimConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(ms) = self.max_time_ms {
            config.max_time = Duration::from_millis(ms);
        }
        if self.trace_network {
            config.trace_network = true;
        }
        Ok(config)
    }
}

/// Durations are written as whole milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings of one simulation run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    pub seed: u64,
    #[serde(rename = "max_time_ms", with = "serde_millis")]
    pub max_time: Duration,
    #[serde(rename = "default_latency_ms", with = "serde_millis")]
    pub default_latency: Duration,
    #[serde(rename = "connect_timeout_ms", with = "serde_millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "handshake_timeout_ms", with = "serde_millis")]
    pub handshake_timeout: Duration,
    pub accept_backlog: usize,
    #[serde(rename = "shutdown_grace_ms", with = "serde_millis")]
    pub shutdown_grace: Duration,
    /// Log every routed packet, regardless of link profiles.
    pub trace_network: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            max_time: DEFAULT_MAX_TIME,
            default_latency: DEFAULT_LATENCY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            trace_network: false,
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.accept_backlog == 0 {
            anyhow::bail!("accept_backlog must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize config")
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn with_default_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Clamped to at least one pending connection.
    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_trace_network(mut self, enabled: bool) -> Self {
        self.trace_network = enabled;
        self
    }
}

/// Installs the global tracing subscriber once per process.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::AtomicBool;

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
