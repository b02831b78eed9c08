//! Configuration management for otpguard.
//!
//! Configuration is read from an optional YAML file and overridden by
//! `OTPGUARD__<SECTION>__<KEY>` environment variables. Invalid settings are
//! rejected by [`OtpGuardConfig::validate`] before anything starts serving.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{OtpGuardError, Result};
use crate::ratelimit::{AdapterSettings, CountMode, PolicyConfig, ReaperConfig};

/// Main configuration for the otpguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtpGuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Local admission policy
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Stale entry sweeping
    #[serde(default)]
    pub reaper: ReaperSettings,

    /// External decision service
    #[serde(default)]
    pub external: ExternalConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50061))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whether the request counter resets on its own at the end of a window
    #[serde(default)]
    pub count_mode: CountMode,

    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Minimum spacing between two admitted requests, in seconds
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            count_mode: CountMode::default(),
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

fn default_max_requests() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_min_interval_secs() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Build the policy parameters used by the limiter.
    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            count_mode: self.count_mode,
            max_requests: self.max_requests,
            window: Duration::from_secs(self.window_secs),
            min_interval: Duration::from_secs(self.min_interval_secs),
        }
    }
}

/// Reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSettings {
    /// Sweep interval in seconds
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    /// Entries idle for longer than this many seconds are evicted
    #[serde(default = "default_reaper_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            max_age_secs: default_reaper_max_age_secs(),
        }
    }
}

fn default_reaper_interval_secs() -> u64 {
    10 * 60
}

fn default_reaper_max_age_secs() -> u64 {
    15 * 60
}

impl ReaperSettings {
    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

/// External decision service configuration.
///
/// The adapter is enabled when `endpoint` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// gRPC endpoint of the decision service, e.g. `http://127.0.0.1:50071`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Credential sent with every decision request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-decision timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Retry-after reported for external denials that carry none
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            default_retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_retry_after_secs() -> u64 {
    15 * 60
}

impl ExternalConfig {
    /// Whether an external decision service is configured.
    pub fn is_enabled(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            default_retry_after_secs: self.default_retry_after_secs,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl OtpGuardConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: OtpGuardConfig = builder
            .add_source(config::Environment::with_prefix("OTPGUARD").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: OtpGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| OtpGuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.max_requests == 0 {
            return Err(OtpGuardError::Config(
                "rate_limiting.max_requests must be greater than zero".to_string(),
            ));
        }
        if rl.count_mode == CountMode::Windowed && rl.window_secs == 0 {
            return Err(OtpGuardError::Config(
                "rate_limiting.window_secs must be greater than zero in windowed mode".to_string(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(OtpGuardError::Config(
                "reaper.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.external.is_enabled() {
            if self.external.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                return Err(OtpGuardError::Config(
                    "external.api_key is required when external.endpoint is set".to_string(),
                ));
            }
            if self.external.timeout_ms == 0 {
                return Err(OtpGuardError::Config(
                    "external.timeout_ms must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}
