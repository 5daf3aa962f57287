//! Per-peer connection state.

use crate::errors::MeshError;
use std::fmt;
use std::time::Duration;

/// Connection state of one remote peer.
///
/// ```text
/// Idle ──► Connecting ──► Connected ──► Disconnected ──► Connecting ...
///              │                              │
///              └──────────► Failed ◄──────────┘ (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tracked peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionState {
    pub state: ConnectionState,
    /// Reconnect attempts made since the last close.
    pub retry_count: u32,
    pub last_error: Option<MeshError>,
    /// Whether the peer is in the current target membership set.
    pub in_target: bool,
}

/// Reconnect offsets, measured from the close event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_millis(2_000),
            Duration::from_millis(4_000),
        ])
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Offset of retry `attempt` (0-based), or `None` once the budget is spent.
    #[must_use]
    pub fn offset(&self, attempt: u32) -> Option<Duration> {
        usize::try_from(attempt)
            .ok()
            .and_then(|i| self.schedule.get(i))
            .copied()
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.schedule.len()).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.offset(0), Some(Duration::ZERO));
        assert_eq!(policy.offset(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.offset(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.offset(3), None);
    }

    #[test]
    fn test_empty_schedule_never_retries() {
        let policy = RetryPolicy::new(Vec::new());
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.offset(0), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Failed.as_str(), "failed");
    }
}
