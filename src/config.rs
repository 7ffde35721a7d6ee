use std::env;
use std::str::FromStr;

use crate::time::{TimeOfDay, MINUTES_PER_DAY};
use crate::tls::TlsFiles;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("inconsistent scheduling config: {0}")]
    Inconsistent(&'static str),
    #[error("CARESCHED_TLS_CERT and CARESCHED_TLS_KEY must be set together")]
    HalfTls,
}

/// Scheduling rules of one practice. Passed explicitly to every engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    pub window_start: TimeOfDay,
    pub window_end: TimeOfDay,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub min_lead_time_minutes: u32,
    pub slot_granularity_minutes: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            window_start: TimeOfDay::hm(8, 0),
            window_end: TimeOfDay::hm(20, 0),
            min_duration_minutes: 15,
            max_duration_minutes: 480,
            min_lead_time_minutes: 60,
            slot_granularity_minutes: 30,
        }
    }
}

impl SchedulingConfig {
    /// Read overrides from `CARESCHED_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            window_start: env_or("CARESCHED_WINDOW_START", defaults.window_start)?,
            window_end: env_or("CARESCHED_WINDOW_END", defaults.window_end)?,
            min_duration_minutes: env_or("CARESCHED_MIN_DURATION", defaults.min_duration_minutes)?,
            max_duration_minutes: env_or("CARESCHED_MAX_DURATION", defaults.max_duration_minutes)?,
            min_lead_time_minutes: env_or("CARESCHED_MIN_LEAD_TIME", defaults.min_lead_time_minutes)?,
            slot_granularity_minutes: env_or(
                "CARESCHED_SLOT_GRANULARITY",
                defaults.slot_granularity_minutes,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_start >= self.window_end {
            return Err(ConfigError::Inconsistent("window start must precede window end"));
        }
        if self.min_duration_minutes == 0 {
            return Err(ConfigError::Inconsistent("minimum duration must be positive"));
        }
        if self.max_duration_minutes > MINUTES_PER_DAY as u32 {
            return Err(ConfigError::Inconsistent("maximum duration exceeds one day"));
        }
        if self.min_duration_minutes > self.max_duration_minutes {
            return Err(ConfigError::Inconsistent("minimum duration exceeds maximum"));
        }
        if self.slot_granularity_minutes == 0 {
            return Err(ConfigError::Inconsistent("slot granularity must be positive"));
        }
        Ok(())
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
    pub scheduling: SchedulingConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind: env::var("CARESCHED_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("CARESCHED_PORT", 5433)?,
            data_dir: env::var("CARESCHED_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            password: env::var("CARESCHED_PASSWORD").unwrap_or_else(|_| "caresched".into()),
            max_connections: env_or("CARESCHED_MAX_CONNECTIONS", 256)?,
            compact_threshold: env_or("CARESCHED_COMPACT_THRESHOLD", 1000)?,
            metrics_port: env_opt("CARESCHED_METRICS_PORT")?,
            tls: tls_files(
                env::var("CARESCHED_TLS_CERT").ok(),
                env::var("CARESCHED_TLS_KEY").ok(),
            )?,
            scheduling: SchedulingConfig::from_env()?,
        })
    }
}

fn tls_files(cert: Option<String>, key: Option<String>) -> Result<Option<TlsFiles>, ConfigError> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsFiles {
            cert: cert.into(),
            key: key.into(),
        })),
        _ => Err(ConfigError::HalfTls),
    }
}

fn env_opt<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => {
            let parsed = value.trim().parse();
            match parsed {
                Ok(v) => Ok(Some(v)),
                Err(_) => Err(ConfigError::Invalid { var, value }),
            }
        }
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(env_opt(var)?.unwrap_or(default))
}
