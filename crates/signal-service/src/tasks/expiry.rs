//! Signal expiry background task.
//!
//! Deletes every signal older than the TTL on a fixed interval, whether or
//! not it was ever delivered. Runs independently of callers and is safe to
//! overlap with concurrent send/list.
//!
//! # Graceful Shutdown
//!
//! When the cancellation token is cancelled the task finishes its current
//! sweep and exits.

use crate::config::Config;
use crate::store::SignalService;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default sweep interval in seconds.
const DEFAULT_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub interval_seconds: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
        }
    }
}

impl From<&Config> for ExpiryConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval_seconds: config.expiry_interval_seconds,
        }
    }
}

/// Start the expiry loop. Returns when `cancel_token` is cancelled.
#[instrument(skip_all, name = "signal.task.expiry")]
pub async fn start_signal_expiry(
    service: SignalService,
    config: ExpiryConfig,
    cancel_token: CancellationToken,
) {
    info!(
        target: "signal.task.expiry",
        interval_seconds = config.interval_seconds,
        ttl_ms = service.ttl_ms(),
        "Starting signal expiry task"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_seconds.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_expiry(&service).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "signal.task.expiry",
                    "Signal expiry task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "signal.task.expiry", "Signal expiry task stopped");
}

/// Run a single sweep. Failures are logged and retried on the next tick.
pub(crate) async fn run_expiry(service: &SignalService) -> u64 {
    match service.expire().await {
        Ok(removed) => {
            debug!(target: "signal.task.expiry", removed = removed, "Expiry sweep complete");
            removed
        }
        Err(e) => {
            warn!(target: "signal.task.expiry", error = %e, "Expiry sweep failed");
            0
        }
    }
}
