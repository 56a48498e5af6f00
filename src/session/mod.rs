//! Multipath sessions.
//!
//! A [`SessionController`] owns everything needed to talk to one peer over
//! several paths at once:
//!
//! ```text
//!   PathLookup ──▶ PathQualityDatabase ──▶ Selector ──▶ reconcile
//!                        ▲                                 │
//!                        │ metrics tick                    ▼
//!                  ConnMetrics ◀── Connection ◀── ConnectionSet ──▶ Scheduler
//! ```
//!
//! Every reselection round refreshes the peer's paths, selects a target
//! set, converges the [`ConnectionSet`] to it through the multi-port
//! [`handshake`], and hands the result to the [`Scheduler`].

mod connection_set;
mod controller;
pub mod handshake;
mod scheduler;

pub use connection_set::{ConnectionSet, ReconcilePlan, TrackedConnection};
pub use controller::SessionController;
pub use handshake::{Acceptor, HandshakeConfig, HandshakeOutcome, HandshakeState, Initiator};
pub use scheduler::{FirstPathScheduler, RoundRobinScheduler, Scheduler, SchedulingStrategy};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::path::PathId;
use crate::selection::SelectorKind;
use crate::types::PeerAddr;

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of paths to keep connections on.
    #[serde(default = "default_path_count")]
    pub path_count: usize,

    /// Metrics tick interval.
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Interval between reselection rounds.
    #[serde(default = "default_reselect_interval", with = "humantime_serde")]
    pub reselect_interval: Duration,

    /// Path selection strategy.
    #[serde(default)]
    pub selector: SelectorKind,

    /// Exploring slots of the disjoint selector.
    #[serde(default = "default_explore_slots")]
    pub disjoint_explore_slots: usize,

    /// Connection choice for reads and writes.
    #[serde(default)]
    pub scheduler: SchedulingStrategy,

    /// Session event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Run reselection rounds in the background.
    #[serde(default = "default_true")]
    pub periodic_reselection: bool,

    /// Run the metrics tick in the background.
    #[serde(default = "default_true")]
    pub collect_metrics: bool,
}

fn default_path_count() -> usize {
    2
}
fn default_metrics_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_reselect_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_explore_slots() -> usize {
    1
}
fn default_event_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path_count: default_path_count(),
            metrics_interval: default_metrics_interval(),
            reselect_interval: default_reselect_interval(),
            selector: SelectorKind::default(),
            disjoint_explore_slots: default_explore_slots(),
            scheduler: SchedulingStrategy::default(),
            event_capacity: default_event_capacity(),
            periodic_reselection: default_true(),
            collect_metrics: default_true(),
        }
    }
}

/// Per-call overrides for [`SessionController::connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Do not start the metrics tick.
    pub no_metrics_collection: bool,
    /// Do not start background reselection rounds.
    pub no_periodic_reselection: bool,
}

/// Session change notification.
///
/// Delivered best-effort: a receiver that falls behind loses the oldest
/// events instead of stalling the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The active dialed path set changed.
    PathSetChanged(Vec<PathId>),
    /// Connections were added or removed.
    ConnectionSetChanged { listening: usize, dialed: usize },
    /// A handshake finished with `connections` established.
    HandshakeCompleted { peer: PeerAddr, connections: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.path_count, 2);
        assert_eq!(config.metrics_interval, Duration::from_secs(1));
        assert_eq!(config.reselect_interval, Duration::from_secs(5));
        assert_eq!(config.selector, SelectorKind::Latency);
        assert_eq!(config.scheduler, SchedulingStrategy::FirstPath);
        assert!(config.periodic_reselection);
    }

    #[test]
    fn test_session_config_partial_toml() {
        let config: SessionConfig = toml::from_str(
            r#"
            path_count = 3
            selector = "disjoint"
            reselect_interval = "500ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.path_count, 3);
        assert_eq!(config.selector, SelectorKind::Disjoint);
        assert_eq!(config.reselect_interval, Duration::from_millis(500));
        assert_eq!(config.disjoint_explore_slots, 1);
        assert!(config.collect_metrics);
    }
}
