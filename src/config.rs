//! Service configuration loaded from the environment.

use crate::queue::QueueSettings;
use crate::store::DEFAULT_ARTIFACT_TTL_SECONDS;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_WORKERS: usize = 10;
const DEFAULT_MAX_CONVERSION_QUEUE: usize = 50;
const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 90;
const DEFAULT_CONVERSION_CMD: &str = "htmlconverter -S -T 120";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    /// Shared key callers must pass as the `auth` query parameter.
    pub auth_key: Option<String>,
    pub max_workers: usize,
    pub max_conversion_queue: usize,
    pub worker_timeout: Duration,
    /// How long draining waits for outstanding jobs on shutdown.
    pub shutdown_grace: Duration,
    pub conversion_cmd: String,
    /// Artifacts are stored in Redis when set.
    pub redis_url: Option<String>,
    pub upload_ttl_seconds: u64,
    pub log_format: LogFormat,
}

impl Config {
    /// Reads the `WEAVER_*` variables and `REDIS_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_workers = parse(&get, "WEAVER_MAX_WORKERS", DEFAULT_MAX_WORKERS)?;
        if max_workers == 0 {
            return Err(invalid("WEAVER_MAX_WORKERS", "0", "must be greater than zero"));
        }

        let max_conversion_queue = parse(
            &get,
            "WEAVER_MAX_CONVERSION_QUEUE",
            DEFAULT_MAX_CONVERSION_QUEUE,
        )?;

        let timeout_secs = parse(&get, "WEAVER_WORKER_TIMEOUT", DEFAULT_WORKER_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(invalid("WEAVER_WORKER_TIMEOUT", "0", "must be greater than zero"));
        }
        let grace_secs = parse(&get, "WEAVER_SHUTDOWN_GRACE", timeout_secs)?;

        let conversion_cmd = get("WEAVER_CONVERSION_CMD")
            .unwrap_or_else(|| DEFAULT_CONVERSION_CMD.to_string());

        let log_format = match get("WEAVER_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(invalid("WEAVER_LOG_FORMAT", other, "expected 'text' or 'json'"))
            }
        };

        Ok(Self {
            http_addr: get("WEAVER_HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            auth_key: get("WEAVER_AUTH_KEY"),
            max_workers,
            max_conversion_queue,
            worker_timeout: Duration::from_secs(timeout_secs),
            shutdown_grace: Duration::from_secs(grace_secs),
            conversion_cmd,
            redis_url: get("REDIS_URL"),
            upload_ttl_seconds: parse(&get, "WEAVER_UPLOAD_TTL", DEFAULT_ARTIFACT_TTL_SECONDS)?,
            log_format,
        })
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_workers: self.max_workers,
            max_queue: self.max_conversion_queue,
            worker_timeout: self.worker_timeout,
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
