//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `REPORTQ_DATABASE_URL`: PostgreSQL connection string (required)
//! - `REPORTQ_POLL_INTERVAL_SECONDS`: worker poll interval (default: 3)
//! - `REPORTQ_WORKER_ID`: explicit worker identity (default: derived from
//!   hostname, pid and a random suffix)
//! - `REPORTQ_JOB_TIMEOUT_SECONDS`: hard execution timeout (default: 3600)
//! - `REPORTQ_LOCK_HEARTBEAT_SECONDS`: report lock heartbeat interval (default: 10)
//! - `REPORTQ_LOCK_STALE_SECONDS`: staleness threshold after which a lock is
//!   reclaimable; must exceed the heartbeat interval (default: 60)
//! - `REPORTQ_LOG_DIR`: directory for per-request execution logs
//!   (default: ./runtime/worker_logs)
//! - `REPORTQ_USE_SHELL`: run commands through the shell as a single string
//!   instead of a tokenized argv (default: true)
//! - `REPORTQ_ACTIVE_START_HOUR` / `REPORTQ_ACTIVE_END_HOUR`: admission
//!   window bounds; equal values mean always open (default: 0/0)
//! - `REPORTQ_ACTIVE_TIMEZONE`: IANA timezone the window is evaluated in
//!   (default: UTC)

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;

use crate::admission::ActiveHours;

/// Worker configuration, resolved once at startup and injected explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Sleep between empty polls (and after loop-level errors)
    pub poll_interval: Duration,

    /// Identity recorded as the lock holder and in status messages
    pub worker_id: String,

    /// Hard wall-clock limit for one external command
    pub job_timeout: Duration,

    /// How often a running job refreshes its report lock
    pub heartbeat_interval: Duration,

    /// Heartbeat age beyond which another worker may reclaim the lock
    pub lock_stale_after: Duration,

    /// Directory receiving one log file per request correlation id
    pub log_dir: PathBuf,

    /// Shell string execution vs tokenized argv
    pub use_shell: bool,

    /// Admission window gating new claims
    pub active_hours: ActiveHours,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("REPORTQ_DATABASE_URL")
            .context("REPORTQ_DATABASE_URL environment variable is required")?;

        let poll_interval_secs: u64 = parse_env("REPORTQ_POLL_INTERVAL_SECONDS", 3)?;
        if poll_interval_secs == 0 {
            bail!("REPORTQ_POLL_INTERVAL_SECONDS must be >= 1");
        }

        let worker_id = match env::var("REPORTQ_WORKER_ID") {
            Ok(id) if !id.trim().is_empty() => id,
            _ => derive_worker_id(),
        };

        let job_timeout_secs: u64 = parse_env("REPORTQ_JOB_TIMEOUT_SECONDS", 3600)?;
        let heartbeat_secs: u64 = parse_env("REPORTQ_LOCK_HEARTBEAT_SECONDS", 10)?;
        let stale_secs: u64 = parse_env("REPORTQ_LOCK_STALE_SECONDS", 60)?;
        if heartbeat_secs == 0 || stale_secs == 0 {
            bail!("lock heartbeat and staleness thresholds must be >= 1 second");
        }
        if stale_secs <= heartbeat_secs {
            bail!(
                "REPORTQ_LOCK_STALE_SECONDS ({stale_secs}) must exceed \
                 REPORTQ_LOCK_HEARTBEAT_SECONDS ({heartbeat_secs})"
            );
        }

        let log_dir = env::var("REPORTQ_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./runtime/worker_logs"));

        let use_shell = env::var("REPORTQ_USE_SHELL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let start_hour: u32 = parse_env("REPORTQ_ACTIVE_START_HOUR", 0)?;
        let end_hour: u32 = parse_env("REPORTQ_ACTIVE_END_HOUR", 0)?;
        if start_hour > 23 || end_hour > 23 {
            bail!("active window hours must be in 0..=23");
        }

        let timezone = env::var("REPORTQ_ACTIVE_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());
        let tz = Tz::from_str(&timezone)
            .map_err(|_| anyhow::anyhow!("invalid REPORTQ_ACTIVE_TIMEZONE: {timezone}"))?;

        Ok(Self {
            database_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            worker_id,
            job_timeout: Duration::from_secs(job_timeout_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            lock_stale_after: Duration::from_secs(stale_secs),
            log_dir,
            use_shell,
            active_hours: ActiveHours::new(start_hour, end_hour, tz),
        })
    }

    /// Staleness threshold in whole seconds, as bound into lock SQL.
    pub fn lock_stale_seconds(&self) -> i64 {
        self.lock_stale_after.as_secs() as i64
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            poll_interval: Duration::from_millis(50),
            worker_id: "test-worker".to_string(),
            job_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            lock_stale_after: Duration::from_secs(5),
            log_dir: std::env::temp_dir().join("reportq-test-logs"),
            use_shell: false,
            active_hours: ActiveHours::new(0, 0, chrono_tz::UTC),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Build a worker identity from host, pid and a random suffix so that
/// multiple workers on one machine never collide.
fn derive_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_worker_id_has_host_pid_suffix() {
        let id = derive_worker_id();
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        // middle part is the pid
        assert!(parts[1].parse::<u32>().is_ok());
        // trailing part is the 6-char random suffix
        assert_eq!(parts[0].len(), 6);
    }

    #[test]
    fn derived_ids_are_unique() {
        assert_ne!(derive_worker_id(), derive_worker_id());
    }

    #[test]
    fn test_config_windows_are_valid() {
        let config = Config::test_config("postgres://test");
        assert!(config.lock_stale_after > config.heartbeat_interval);
        assert!(config.active_hours.is_always_open());
    }
}
