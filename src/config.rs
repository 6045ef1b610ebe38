//! Configuration types, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// How often workers are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is declared dead. Must exceed `heartbeat_interval`.
    pub worker_timeout: Duration,
    /// How long a fetched task stays reserved before it must be acknowledged.
    pub lease_duration: Duration,
    /// Liveness monitor tick.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/taskgrid.db"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            heartbeat_interval: Duration::from_secs(5),
            worker_timeout: Duration::from_secs(15),
            lease_duration: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Build config from `TASKGRID_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            db_path: std::env::var("TASKGRID_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            bind_addr: env_parse("TASKGRID_BIND")?.unwrap_or(defaults.bind_addr),
            heartbeat_interval: env_secs("TASKGRID_HEARTBEAT_INTERVAL_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            worker_timeout: env_secs("TASKGRID_WORKER_TIMEOUT_SECS")?
                .unwrap_or(defaults.worker_timeout),
            lease_duration: env_secs("TASKGRID_LEASE_SECS")?.unwrap_or(defaults.lease_duration),
            sweep_interval: env_secs("TASKGRID_SWEEP_INTERVAL_SECS")?
                .unwrap_or(defaults.sweep_interval),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timing combinations that would declare healthy workers dead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_WORKER_TIMEOUT_SECS".into(),
                message: format!(
                    "worker timeout ({:?}) must be greater than the heartbeat interval ({:?})",
                    self.worker_timeout, self.heartbeat_interval
                ),
            });
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_LEASE_SECS".into(),
                message: "lease duration must be positive".into(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_SWEEP_INTERVAL_SECS".into(),
                message: "sweep interval must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Worker agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the coordinator, e.g. `http://localhost:5000`.
    pub coordinator_url: String,
    /// Heartbeat send interval.
    pub heartbeat_interval: Duration,
    /// Registration attempts before giving up.
    pub max_register_attempts: u32,
    /// First registration retry delay; doubles per attempt.
    pub register_backoff_base: Duration,
    /// Upper bound for registration retry delay.
    pub register_backoff_max: Duration,
    /// Fetch poll interval after a successful fetch.
    pub poll_min: Duration,
    /// Fetch poll interval ceiling while the queue stays empty.
    pub poll_max: Duration,
    /// Completion report attempts on transient failure.
    pub max_complete_attempts: u32,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Failure probability for the simulated executor.
    pub failure_rate: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:5000".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            max_register_attempts: 5,
            register_backoff_base: Duration::from_secs(2),
            register_backoff_max: Duration::from_secs(30),
            poll_min: Duration::from_secs(1),
            poll_max: Duration::from_secs(30),
            max_complete_attempts: 5,
            request_timeout: Duration::from_secs(10),
            failure_rate: 0.1,
        }
    }
}

impl AgentConfig {
    /// Build config from `TASKGRID_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            coordinator_url: std::env::var("TASKGRID_COORDINATOR_URL")
                .unwrap_or(defaults.coordinator_url),
            heartbeat_interval: env_secs("TASKGRID_HEARTBEAT_INTERVAL_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            max_register_attempts: env_parse("TASKGRID_REGISTER_ATTEMPTS")?
                .unwrap_or(defaults.max_register_attempts),
            poll_min: env_millis("TASKGRID_POLL_MIN_MS")?.unwrap_or(defaults.poll_min),
            poll_max: env_millis("TASKGRID_POLL_MAX_MS")?.unwrap_or(defaults.poll_max),
            failure_rate: env_parse("TASKGRID_FAILURE_RATE")?.unwrap_or(defaults.failure_rate),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_register_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_REGISTER_ATTEMPTS".into(),
                message: "at least one registration attempt is required".into(),
            });
        }
        if self.poll_min > self.poll_max {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_POLL_MIN_MS".into(),
                message: format!(
                    "minimum poll interval ({:?}) exceeds maximum ({:?})",
                    self.poll_min, self.poll_max
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::InvalidValue {
                key: "TASKGRID_FAILURE_RATE".into(),
                message: format!("{} is not a probability", self.failure_rate),
            });
        }
        Ok(())
    }
}

/// Parse an optional environment variable. Unset means `None`; unparseable is an error.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("{key}: {e}"))),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
