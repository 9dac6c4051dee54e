//! Connection manager: a pure state machine over the peer transport.
//!
//! ```text
//!            Start                 ConnectSucceeded
//!   Idle ───────────► Connecting ───────────────────► Connected
//!                       ▲    │                           │
//!       RetryTimerFired │    │ ConnectFailed             │ TransportLost
//!                       │    ▼                           │ HealthCheckFailed
//!                    Disconnected ◄──────────────────────┘
//!                       │
//!                       │ retry budget exceeded
//!                       ▼
//!                    Offline ── ForceReconnect / NetworkOnline ──► Connecting
//! ```
//!
//! The machine never sleeps or touches the network. Each [`ConnectionEvent`]
//! returns the [`ConnectionAction`]s the session driver must execute; timers
//! are actions too, so tests drive the machine without a clock.

use std::time::Duration;

use crate::config::{BackoffConfig, SessionConfig};

/// Connection state of a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Offline,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    ConnectSucceeded,
    ConnectFailed,
    TransportLost,
    HealthCheckFailed,
    RetryTimerFired,
    NetworkOnline,
    NetworkOffline,
    ForceReconnect,
    Teardown,
}

/// Side effects requested from the driver, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new transport link.
    Connect,
    /// Drop the current link, if any.
    Disconnect,
    /// Fire `RetryTimerFired` after the delay.
    ScheduleRetry(Duration),
    /// Probe the link on this period while connected.
    ScheduleHealthCheck(Duration),
    /// Cancel the retry timer and health checks.
    CancelTimers,
    /// The visible status changed.
    StatusChanged(ConnectionStatus),
}

pub struct ConnectionManager {
    status: ConnectionStatus,
    retry_count: u32,
    network_available: bool,
    torn_down: bool,
    backoff: BackoffConfig,
    health_check_interval: Duration,
}

impl ConnectionManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            status: ConnectionStatus::Idle,
            retry_count: 0,
            network_available: true,
            torn_down: false,
            backoff: config.backoff.clone(),
            health_check_interval: config.health_check_interval(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Consecutive failures since the last success or reset.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Last environment signal; starts out available.
    pub fn network_available(&self) -> bool {
        self.network_available
    }

    /// Feed an event; returns the actions to execute.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        if self.torn_down {
            return Vec::new();
        }

        let before = self.status;
        let mut actions = Vec::new();

        match event {
            ConnectionEvent::Start => {
                if self.status == ConnectionStatus::Idle {
                    if self.network_available {
                        self.status = ConnectionStatus::Connecting;
                        actions.push(ConnectionAction::Connect);
                    } else {
                        self.status = ConnectionStatus::Offline;
                    }
                }
            }

            ConnectionEvent::ConnectSucceeded => {
                if self.status == ConnectionStatus::Connecting {
                    self.status = ConnectionStatus::Connected;
                    self.retry_count = 0;
                    actions.push(ConnectionAction::ScheduleHealthCheck(self.health_check_interval));
                } else {
                    // A connect that completed after we moved on is stale.
                    actions.push(ConnectionAction::Disconnect);
                }
            }

            ConnectionEvent::ConnectFailed
            | ConnectionEvent::TransportLost
            | ConnectionEvent::HealthCheckFailed => {
                if matches!(
                    self.status,
                    ConnectionStatus::Connecting | ConnectionStatus::Connected
                ) {
                    actions.push(ConnectionAction::CancelTimers);
                    actions.push(ConnectionAction::Disconnect);
                    self.retry_count += 1;
                    if self.retry_count > self.backoff.max_retries {
                        log::warn!(
                            "Giving up after {} consecutive failures, going offline",
                            self.retry_count - 1
                        );
                        self.status = ConnectionStatus::Offline;
                    } else {
                        self.status = ConnectionStatus::Disconnected;
                        actions.push(ConnectionAction::ScheduleRetry(
                            self.backoff.delay_for(self.retry_count),
                        ));
                    }
                }
            }

            ConnectionEvent::RetryTimerFired => {
                if self.status == ConnectionStatus::Disconnected {
                    self.status = ConnectionStatus::Connecting;
                    actions.push(ConnectionAction::Connect);
                }
            }

            ConnectionEvent::NetworkOnline => {
                self.network_available = true;
                self.retry_count = 0;
                if !matches!(
                    self.status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                ) {
                    self.status = ConnectionStatus::Connecting;
                    actions.push(ConnectionAction::CancelTimers);
                    actions.push(ConnectionAction::Connect);
                }
            }

            ConnectionEvent::NetworkOffline => {
                self.network_available = false;
                self.retry_count = 0;
                self.status = ConnectionStatus::Offline;
                actions.push(ConnectionAction::CancelTimers);
                actions.push(ConnectionAction::Disconnect);
            }

            ConnectionEvent::ForceReconnect => {
                self.retry_count = 0;
                self.status = ConnectionStatus::Connecting;
                actions.push(ConnectionAction::CancelTimers);
                actions.push(ConnectionAction::Disconnect);
                actions.push(ConnectionAction::Connect);
            }

            ConnectionEvent::Teardown => {
                self.torn_down = true;
                actions.push(ConnectionAction::CancelTimers);
                actions.push(ConnectionAction::Disconnect);
            }
        }

        if self.status != before {
            log::debug!("Connection {before:?} -> {:?} on {event:?}", self.status);
            actions.push(ConnectionAction::StatusChanged(self.status));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(&SessionConfig::for_testing())
    }

    fn retry_delay(actions: &[ConnectionAction]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::ScheduleRetry(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn test_happy_path() {
        let mut m = manager();
        assert_eq!(m.status(), ConnectionStatus::Idle);

        let actions = m.handle(ConnectionEvent::Start);
        assert!(actions.contains(&ConnectionAction::Connect));
        assert!(actions.contains(&ConnectionAction::StatusChanged(ConnectionStatus::Connecting)));

        let actions = m.handle(ConnectionEvent::ConnectSucceeded);
        assert_eq!(m.status(), ConnectionStatus::Connected);
        assert!(actions.contains(&ConnectionAction::ScheduleHealthCheck(Duration::from_millis(1_000))));
    }

    #[test]
    fn test_failure_schedules_backoff_retry() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        let actions = m.handle(ConnectionEvent::ConnectFailed);
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert_eq!(retry_delay(&actions), Some(Duration::from_millis(100)));

        let actions = m.handle(ConnectionEvent::RetryTimerFired);
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert!(actions.contains(&ConnectionAction::Connect));
    }

    #[test]
    fn test_backoff_non_decreasing_then_offline() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);

        let mut delays = Vec::new();
        loop {
            let actions = m.handle(ConnectionEvent::ConnectFailed);
            match retry_delay(&actions) {
                Some(d) => {
                    delays.push(d);
                    m.handle(ConnectionEvent::RetryTimerFired);
                }
                None => break,
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(m.status(), ConnectionStatus::Offline);

        // No automatic retries once offline
        assert!(m.handle(ConnectionEvent::RetryTimerFired).is_empty());
        assert_eq!(m.status(), ConnectionStatus::Offline);
    }

    #[test]
    fn test_success_resets_retry_count() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        m.handle(ConnectionEvent::ConnectFailed);
        m.handle(ConnectionEvent::RetryTimerFired);
        assert_eq!(m.retry_count(), 1);
        m.handle(ConnectionEvent::ConnectSucceeded);
        assert_eq!(m.retry_count(), 0);

        let actions = m.handle(ConnectionEvent::HealthCheckFailed);
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert_eq!(retry_delay(&actions), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_force_reconnect_from_offline() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        for _ in 0..4 {
            m.handle(ConnectionEvent::ConnectFailed);
            m.handle(ConnectionEvent::RetryTimerFired);
        }
        assert_eq!(m.status(), ConnectionStatus::Offline);

        let actions = m.handle(ConnectionEvent::ForceReconnect);
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert_eq!(m.retry_count(), 0);
        assert!(actions.contains(&ConnectionAction::Connect));
        assert!(retry_delay(&actions).is_none());
    }

    #[test]
    fn test_force_reconnect_while_connected() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        m.handle(ConnectionEvent::ConnectSucceeded);

        let actions = m.handle(ConnectionEvent::ForceReconnect);
        assert_eq!(
            actions[..3],
            [
                ConnectionAction::CancelTimers,
                ConnectionAction::Disconnect,
                ConnectionAction::Connect
            ]
        );
        assert_eq!(m.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_network_signals() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        m.handle(ConnectionEvent::ConnectSucceeded);

        let actions = m.handle(ConnectionEvent::NetworkOffline);
        assert_eq!(m.status(), ConnectionStatus::Offline);
        assert!(actions.contains(&ConnectionAction::Disconnect));

        let actions = m.handle(ConnectionEvent::NetworkOnline);
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert!(actions.contains(&ConnectionAction::Connect));
    }

    #[test]
    fn test_start_without_network_goes_offline() {
        let mut m = manager();
        m.handle(ConnectionEvent::NetworkOffline);
        let actions = m.handle(ConnectionEvent::Start);
        assert_eq!(m.status(), ConnectionStatus::Offline);
        assert!(!actions.contains(&ConnectionAction::Connect));
    }

    #[test]
    fn test_stale_connect_is_dropped() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        m.handle(ConnectionEvent::NetworkOffline);
        let actions = m.handle(ConnectionEvent::ConnectSucceeded);
        assert_eq!(actions, vec![ConnectionAction::Disconnect]);
        assert_eq!(m.status(), ConnectionStatus::Offline);
    }

    #[test]
    fn test_teardown_is_terminal() {
        let mut m = manager();
        m.handle(ConnectionEvent::Start);
        let actions = m.handle(ConnectionEvent::Teardown);
        assert!(actions.contains(&ConnectionAction::CancelTimers));
        assert!(m.is_torn_down());

        assert!(m.handle(ConnectionEvent::ForceReconnect).is_empty());
        assert!(m.handle(ConnectionEvent::NetworkOnline).is_empty());
    }
}
