//! Lifecycle phase and health tracking for MCP plugin instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of an instance's lifecycle state machine.
///
/// `Disposed` is terminal and reachable from every other phase; `Stopped`
/// only ends the current start/stop cycle and a later start re-enters
/// `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstancePhase {
    Uninitialized,
    Starting,
    Started,
    Initializing,
    Initialized,
    Stopping,
    Stopped,
    Disposed,
}

impl InstancePhase {
    /// True while a live client handle is expected to exist.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Initialized)
    }

    /// True for the in-between phases a concurrent reader can observe.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Stopping)
    }

    /// True once the instance can never be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// Rolling connection-health record for one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub handshake_latency_ms: Option<u64>,
}

impl HealthStatus {
    /// Records a successful connect with its handshake latency.
    pub fn mark_healthy(&mut self, latency_ms: u64) {
        self.healthy = true;
        self.last_check = Some(Utc::now());
        self.consecutive_failures = 0;
        self.handshake_latency_ms = Some(latency_ms);
    }

    /// Records a failed connect or listing attempt.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
        self.last_check = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.handshake_latency_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_predicates() {
        assert!(InstancePhase::Started.is_active());
        assert!(InstancePhase::Initialized.is_active());
        assert!(!InstancePhase::Stopped.is_active());
        assert!(InstancePhase::Starting.is_transitional());
        assert!(InstancePhase::Stopping.is_transitional());
        assert!(!InstancePhase::Initialized.is_transitional());
        assert!(InstancePhase::Disposed.is_terminal());
        assert!(!InstancePhase::Stopped.is_terminal());
    }

    #[test]
    fn health_tracks_consecutive_failures() {
        let mut health = HealthStatus::default();
        health.mark_unhealthy();
        health.mark_unhealthy();
        assert_eq!(health.consecutive_failures, 2);
        assert!(!health.healthy);

        health.mark_healthy(12);
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.handshake_latency_ms, Some(12));
        assert!(health.last_check.is_some());
    }
}
