//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Queue names, one lane each.
    pub queues: Vec<String>,
    /// How long an idle lane waits before polling again.
    pub lane_poll_interval: Duration,
    /// HTTP port. `0` disables the HTTP surface.
    pub http_port: u16,
    /// Root folder for notes written by `create_note`.
    pub vault_path: PathBuf,
    /// Inbox address → owner id, seeded at startup.
    pub inboxes: Vec<(String, String)>,
    /// Pending-event sweep interval. `0` disables the sweep scheduler.
    pub sweep_interval_secs: u64,
    /// Directory for daily rolling log files, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/substrate.db"),
            queues: vec!["default".to_string(), "email".to_string()],
            lane_poll_interval: Duration::from_millis(1000),
            http_port: 8080,
            vault_path: PathBuf::from("./vault"),
            inboxes: Vec::new(),
            sweep_interval_secs: 300,
            log_dir: None,
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Parse `SUBSTRATE_QUEUES`: comma-separated, deduplicated, order kept.
pub fn parse_queues(raw: &str) -> Vec<String> {
    let mut queues: Vec<String> = Vec::new();
    for q in raw.split(',').map(str::trim).filter(|q| !q.is_empty()) {
        if !queues.iter().any(|existing| existing == q) {
            queues.push(q.to_string());
        }
    }
    queues
}

/// Parse `SUBSTRATE_INBOXES`: `addr=owner,addr=owner`. Addresses are lowercased.
pub fn parse_inboxes(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (addr, owner) = entry
                .split_once('=')
                .map(|(a, o)| (a.trim(), o.trim()))
                .filter(|(a, o)| !a.is_empty() && !o.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "SUBSTRATE_INBOXES".to_string(),
                    message: format!("expected addr=owner, got '{entry}'"),
                })?;
            Ok((addr.to_lowercase(), owner.to_string()))
        })
        .collect()
}

impl Config {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let queues = match env("SUBSTRATE_QUEUES") {
            Some(raw) => parse_queues(&raw),
            None => defaults.queues,
        };
        if queues.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SUBSTRATE_QUEUES".to_string(),
                message: "at least one queue is required".to_string(),
            });
        }

        let inboxes = match env("SUBSTRATE_INBOXES") {
            Some(raw) => parse_inboxes(&raw)?,
            None => defaults.inboxes,
        };

        Ok(Self {
            db_path: env("SUBSTRATE_DB_PATH").map_or(defaults.db_path, PathBuf::from),
            queues,
            lane_poll_interval: Duration::from_millis(parse_env("SUBSTRATE_LANE_POLL_MS", 1000)?),
            http_port: parse_env("SUBSTRATE_HTTP_PORT", defaults.http_port)?,
            vault_path: env("SUBSTRATE_VAULT_PATH").map_or(defaults.vault_path, PathBuf::from),
            inboxes,
            sweep_interval_secs: parse_env(
                "SUBSTRATE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            log_dir: env("SUBSTRATE_LOG_DIR").map(PathBuf::from),
        })
    }
}
