//! Mesh client configuration.
//!
//! Loaded from `MESH_*` environment variables with defaults for every knob.

use crate::errors::MeshError;
use crate::orchestrator::RetryPolicy;
use crate::transport::{BackoffPolicy, PullConfig};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default signal store base URL.
pub const DEFAULT_SIGNAL_BASE_URL: &str = "http://localhost:8080";

/// Default interval between watermark pulls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default watermark overlap absorbing clock skew between writers.
pub const DEFAULT_WATERMARK_OVERLAP_MS: i64 = 2_000;

/// Default processed-id window size.
pub const DEFAULT_DEDUP_CAPACITY: usize = 500;

/// Default per-attempt connection timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 10_000;

/// Default reconnect offsets, relative to the close event.
pub const DEFAULT_RETRY_SCHEDULE_MS: [u64; 3] = [0, 2_000, 4_000];

/// Default push stream reconnect budget.
pub const DEFAULT_PUSH_MAX_ATTEMPTS: u32 = 5;

/// Default push stream base reconnect delay.
pub const DEFAULT_PUSH_BASE_DELAY_MS: u64 = 1_000;

/// Default push stream reconnect delay cap.
pub const DEFAULT_PUSH_MAX_DELAY_MS: u64 = 16_000;

/// Signal delivery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Poll `listSignals` with a watermark.
    #[default]
    Pull,
    /// Long-lived WebSocket push stream.
    Push,
}

impl FromStr for TransportKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pull" => Ok(TransportKind::Pull),
            "push" => Ok(TransportKind::Push),
            other => Err(MeshError::Config(format!(
                "MESH_TRANSPORT must be 'pull' or 'push', got '{other}'"
            ))),
        }
    }
}

/// Mesh client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Signal store base URL (default: `http://localhost:8080`).
    pub signal_base_url: String,

    /// Delivery strategy (default: pull).
    pub transport: TransportKind,

    /// Watermark pull interval (default: 500 ms).
    pub poll_interval: Duration,

    /// Watermark overlap in milliseconds (default: 2000).
    pub watermark_overlap_ms: i64,

    /// Processed-id window size (default: 500).
    pub dedup_capacity: usize,

    /// Time allowed for remote media to arrive (default: 10 s).
    pub attempt_timeout: Duration,

    /// Reconnect offsets from the close event (default: 0, 2000, 4000 ms).
    pub retry_schedule: Vec<Duration>,

    /// Push stream reconnect budget (default: 5).
    pub push_max_attempts: u32,

    /// Push stream base reconnect delay (default: 1 s).
    pub push_base_delay: Duration,

    /// Push stream reconnect delay cap (default: 16 s).
    pub push_max_delay: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signal_base_url: DEFAULT_SIGNAL_BASE_URL.to_string(),
            transport: TransportKind::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            watermark_overlap_ms: DEFAULT_WATERMARK_OVERLAP_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            retry_schedule: DEFAULT_RETRY_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            push_max_attempts: DEFAULT_PUSH_MAX_ATTEMPTS,
            push_base_delay: Duration::from_millis(DEFAULT_PUSH_BASE_DELAY_MS),
            push_max_delay: Duration::from_millis(DEFAULT_PUSH_MAX_DELAY_MS),
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` if a value fails to parse.
    pub fn from_env() -> Result<Self, MeshError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Config` if a value fails to parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, MeshError> {
        let signal_base_url = vars
            .get("MESH_SIGNAL_BASE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNAL_BASE_URL.to_string());

        let transport = match vars.get("MESH_TRANSPORT") {
            Some(value) => value.parse()?,
            None => TransportKind::default(),
        };

        let poll_interval_ms = parse_var(vars, "MESH_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_interval_ms == 0 {
            return Err(MeshError::Config(
                "MESH_POLL_INTERVAL_MS must be at least 1".to_string(),
            ));
        }

        let watermark_overlap_ms =
            parse_var(vars, "MESH_WATERMARK_OVERLAP_MS", DEFAULT_WATERMARK_OVERLAP_MS)?;
        if watermark_overlap_ms < 0 {
            return Err(MeshError::Config(format!(
                "MESH_WATERMARK_OVERLAP_MS must not be negative, got {watermark_overlap_ms}"
            )));
        }

        let dedup_capacity = parse_var(vars, "MESH_DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY)?;
        if dedup_capacity < 2 {
            return Err(MeshError::Config(
                "MESH_DEDUP_CAPACITY must be at least 2".to_string(),
            ));
        }

        let attempt_timeout_ms =
            parse_var(vars, "MESH_ATTEMPT_TIMEOUT_MS", DEFAULT_ATTEMPT_TIMEOUT_MS)?;

        let retry_schedule = match vars.get("MESH_RETRY_SCHEDULE_MS") {
            Some(raw) => parse_schedule(raw)?,
            None => Self::default().retry_schedule,
        };

        let push_max_attempts =
            parse_var(vars, "MESH_PUSH_MAX_ATTEMPTS", DEFAULT_PUSH_MAX_ATTEMPTS)?;
        let push_base_delay_ms =
            parse_var(vars, "MESH_PUSH_BASE_DELAY_MS", DEFAULT_PUSH_BASE_DELAY_MS)?;
        let push_max_delay_ms =
            parse_var(vars, "MESH_PUSH_MAX_DELAY_MS", DEFAULT_PUSH_MAX_DELAY_MS)?;
        if push_max_delay_ms < push_base_delay_ms {
            return Err(MeshError::Config(format!(
                "MESH_PUSH_MAX_DELAY_MS ({push_max_delay_ms}) is below MESH_PUSH_BASE_DELAY_MS ({push_base_delay_ms})"
            )));
        }

        Ok(MeshConfig {
            signal_base_url,
            transport,
            poll_interval: Duration::from_millis(poll_interval_ms),
            watermark_overlap_ms,
            dedup_capacity,
            attempt_timeout: Duration::from_millis(attempt_timeout_ms),
            retry_schedule,
            push_max_attempts,
            push_base_delay: Duration::from_millis(push_base_delay_ms),
            push_max_delay: Duration::from_millis(push_max_delay_ms),
        })
    }

    /// Reconnect schedule for the orchestrator.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_schedule.clone())
    }

    /// Push stream backoff.
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.push_base_delay,
            self.push_max_delay,
            self.push_max_attempts,
        )
    }

    /// Watermark pull settings.
    #[must_use]
    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            poll_interval: self.poll_interval,
            overlap_ms: self.watermark_overlap_ms,
            dedup_capacity: self.dedup_capacity,
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, MeshError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MeshError::Config(format!("{name} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn parse_schedule(raw: &str) -> Result<Vec<Duration>, MeshError> {
    let schedule = raw
        .split(',')
        .map(|part| {
            part.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
                MeshError::Config(format!("MESH_RETRY_SCHEDULE_MS has invalid entry '{part}'"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if schedule.windows(2).any(|w| matches!(w, [a, b] if b < a)) {
        return Err(MeshError::Config(
            "MESH_RETRY_SCHEDULE_MS must be non-decreasing".to_string(),
        ));
    }
    Ok(schedule)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = MeshConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config, MeshConfig::default());
        assert_eq!(config.transport, TransportKind::Pull);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.watermark_overlap_ms, 2_000);
        assert_eq!(config.dedup_capacity, 500);
        assert_eq!(config.attempt_timeout, Duration::from_secs(10));
        assert_eq!(
            config.retry_schedule,
            vec![
                Duration::ZERO,
                Duration::from_millis(2_000),
                Duration::from_millis(4_000)
            ]
        );
        assert_eq!(config.push_max_attempts, 5);
    }

    #[test]
    fn test_overrides() {
        let config = MeshConfig::from_vars(&vars(&[
            ("MESH_SIGNAL_BASE_URL", "https://signals.example.test"),
            ("MESH_TRANSPORT", "Push"),
            ("MESH_POLL_INTERVAL_MS", "250"),
            ("MESH_RETRY_SCHEDULE_MS", "0, 500 ,1500,3000"),
            ("MESH_PUSH_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.signal_base_url, "https://signals.example.test");
        assert_eq!(config.transport, TransportKind::Push);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_policy().max_retries(), 4);
        assert_eq!(config.backoff_policy().max_attempts(), 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(MeshConfig::from_vars(&vars(&[("MESH_TRANSPORT", "carrier-pigeon")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[("MESH_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[("MESH_WATERMARK_OVERLAP_MS", "-1")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[("MESH_DEDUP_CAPACITY", "1")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[("MESH_RETRY_SCHEDULE_MS", "0,x")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[("MESH_RETRY_SCHEDULE_MS", "4000,0")])).is_err());
        assert!(MeshConfig::from_vars(&vars(&[
            ("MESH_PUSH_BASE_DELAY_MS", "5000"),
            ("MESH_PUSH_MAX_DELAY_MS", "1000"),
        ]))
        .is_err());
    }
}
