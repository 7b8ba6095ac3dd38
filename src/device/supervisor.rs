//! Per-device connection lifecycle.
//!
//! The supervisor performs no I/O. Each input returns the [`Action`]s the
//! device must carry out, and the results of those actions are fed back in
//! as further inputs.
//!
//! ```text
//! Disconnected ──start──▶ Discovering ──found──▶ Connecting ──alive──▶ Connected
//!      ▲                    │    ▲                   │                      │
//!      │                    └60s─┘ (not found)       │ error                │ disconnect / error /
//!      └──────────── delay ◀─────────────────────────┴──────────────────────┘ missed heartbeats
//! ```

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_MISSED_HEARTBEATS: u32 = 3;
pub const REDISCOVER_DELAY: Duration = Duration::from_secs(60);
pub const LIVENESS_DELAY: Duration = Duration::from_secs(1);
pub const ERROR_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DISCONNECT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
}

/// Timers the supervisor asks to be fed back after a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Retry discovery after a failed search.
    Rediscover,
    /// Re-enter discovery after a lost or failed connection.
    Reconnect,
    /// Check that a reported connection is real.
    ConfirmLiveness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Find,
    Connect,
    Disconnect,
    Schedule(Duration, Timer),
    PublishStatus { online: bool, reason: String },
    /// Run the device variant's initialization.
    Initialize,
    LogError(String),
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    missed_heartbeats: u32,
    /// Collapses concurrent reconnect triggers into one attempt.
    reconnect_pending: bool,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            missed_heartbeats: 0,
            reconnect_pending: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[cfg(test)]
    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    pub fn start(&mut self) -> Vec<Action> {
        self.discover()
    }

    fn discover(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Discovering;
        vec![Action::Find]
    }

    pub fn discovery_result(&mut self, result: Result<(), String>) -> Vec<Action> {
        if self.state != ConnectionState::Discovering {
            return Vec::new();
        }
        match result {
            Ok(()) => {
                self.state = ConnectionState::Connecting;
                vec![Action::Connect]
            }
            Err(e) => vec![
                Action::LogError(e),
                Action::LogError(format!(
                    "Will attempt to find device again in {} seconds",
                    REDISCOVER_DELAY.as_secs()
                )),
                Action::Schedule(REDISCOVER_DELAY, Timer::Rediscover),
            ],
        }
    }

    pub fn connect_failed(&mut self, error: String) -> Vec<Action> {
        self.state = ConnectionState::Disconnected;
        let mut actions = vec![Action::LogError(error)];
        actions.extend(self.request_reconnect(ERROR_RECONNECT_DELAY));
        actions
    }

    /// The client claims a connection. Trust it only after a short delay.
    pub fn connected_reported(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                vec![Action::Schedule(LIVENESS_DELAY, Timer::ConfirmLiveness)]
            }
            _ => Vec::new(),
        }
    }

    pub fn timer_fired(&mut self, timer: Timer) -> Vec<Action> {
        match timer {
            Timer::Rediscover if self.state == ConnectionState::Discovering => vec![Action::Find],
            Timer::Reconnect => {
                self.reconnect_pending = false;
                if self.state == ConnectionState::Disconnected {
                    self.discover()
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Outcome of the liveness check scheduled by [`Self::connected_reported`].
    pub fn liveness_checked(&mut self, alive: bool) -> Vec<Action> {
        if self.state == ConnectionState::Connected {
            return Vec::new();
        }
        if alive {
            self.state = ConnectionState::Connected;
            self.missed_heartbeats = 0;
            vec![
                Action::PublishStatus {
                    online: true,
                    reason: "device connected".into(),
                },
                Action::Initialize,
            ]
        } else {
            self.state = ConnectionState::Disconnected;
            let mut actions = vec![Action::LogError("connection reported but device is not reachable".into())];
            actions.extend(self.request_reconnect(ERROR_RECONNECT_DELAY));
            actions
        }
    }

    pub fn heartbeat(&mut self) {
        self.missed_heartbeats = 0;
    }

    /// Periodic heartbeat check, every [`HEARTBEAT_INTERVAL`].
    pub fn heartbeat_tick(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        self.missed_heartbeats += 1;
        if self.missed_heartbeats > MAX_MISSED_HEARTBEATS {
            self.missed_heartbeats = 0;
            self.state = ConnectionState::Disconnected;
            let mut actions = vec![
                Action::LogError("device not responding to heartbeats...disconnecting".into()),
                Action::Disconnect,
                Action::PublishStatus {
                    online: false,
                    reason: "heartbeat timeout".into(),
                },
            ];
            actions.extend(self.request_reconnect(ERROR_RECONNECT_DELAY));
            actions
        } else if self.missed_heartbeats > 1 {
            vec![Action::LogError(format!(
                "device has missed {} heartbeats",
                self.missed_heartbeats - 1
            ))]
        } else {
            Vec::new()
        }
    }

    pub fn disconnected(&mut self) -> Vec<Action> {
        self.lost("device disconnected".into(), None)
    }

    pub fn error(&mut self, error: String) -> Vec<Action> {
        self.lost(error.clone(), Some(error))
    }

    fn lost(&mut self, reason: String, error: Option<String>) -> Vec<Action> {
        let mut actions: Vec<Action> = error.into_iter().map(Action::LogError).collect();
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnected;
                self.missed_heartbeats = 0;
                actions.push(Action::PublishStatus {
                    online: false,
                    reason,
                });
                actions.extend(self.request_reconnect(DISCONNECT_RECONNECT_DELAY));
            }
            ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnected;
                actions.extend(self.request_reconnect(ERROR_RECONNECT_DELAY));
            }
            ConnectionState::Disconnected => {
                actions.extend(self.request_reconnect(ERROR_RECONNECT_DELAY));
            }
            // A search is already underway.
            ConnectionState::Discovering => {}
        }
        actions
    }

    fn request_reconnect(&mut self, delay: Duration) -> Vec<Action> {
        if self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = true;
        vec![Action::Schedule(delay, Timer::Reconnect)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionSupervisor {
        let mut s = ConnectionSupervisor::new();
        assert_eq!(s.start(), vec![Action::Find]);
        assert_eq!(s.discovery_result(Ok(())), vec![Action::Connect]);
        assert_eq!(
            s.connected_reported(),
            vec![Action::Schedule(LIVENESS_DELAY, Timer::ConfirmLiveness)]
        );
        let actions = s.liveness_checked(true);
        assert!(actions.contains(&Action::Initialize));
        assert_eq!(s.state(), ConnectionState::Connected);
        s
    }

    fn schedules(actions: &[Action]) -> Vec<(Duration, Timer)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Schedule(d, t) => Some((*d, *t)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn discovery_failure_retries_forever() {
        let mut s = ConnectionSupervisor::new();
        s.start();
        for _ in 0..5 {
            let actions = s.discovery_result(Err("not found".into()));
            assert_eq!(schedules(&actions), vec![(REDISCOVER_DELAY, Timer::Rediscover)]);
            assert_eq!(s.timer_fired(Timer::Rediscover), vec![Action::Find]);
        }
        assert_eq!(s.state(), ConnectionState::Discovering);
    }

    #[test]
    fn four_missed_heartbeats_force_rediscovery() {
        let mut s = connected();
        for _ in 0..3 {
            assert!(!s.heartbeat_tick().contains(&Action::Disconnect));
        }
        let actions = s.heartbeat_tick();
        assert!(actions.contains(&Action::Disconnect));
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(schedules(&actions), vec![(ERROR_RECONNECT_DELAY, Timer::Reconnect)]);
        assert_eq!(s.timer_fired(Timer::Reconnect), vec![Action::Find]);
        assert_eq!(s.state(), ConnectionState::Discovering);
    }

    #[test]
    fn heartbeat_resets_missed_counter() {
        let mut s = connected();
        s.heartbeat_tick();
        s.heartbeat_tick();
        s.heartbeat_tick();
        assert_eq!(s.missed_heartbeats(), 3);
        s.heartbeat();
        assert_eq!(s.missed_heartbeats(), 0);
        for _ in 0..3 {
            assert!(!s.heartbeat_tick().contains(&Action::Disconnect));
        }
        assert!(s.is_connected());
    }

    #[test]
    fn heartbeat_ticks_ignored_while_disconnected() {
        let mut s = ConnectionSupervisor::new();
        for _ in 0..10 {
            assert!(s.heartbeat_tick().is_empty());
        }
        assert_eq!(s.missed_heartbeats(), 0);
    }

    #[test]
    fn disconnect_publishes_offline_then_waits() {
        let mut s = connected();
        let actions = s.disconnected();
        assert!(actions.contains(&Action::PublishStatus {
            online: false,
            reason: "device disconnected".into()
        }));
        assert_eq!(
            schedules(&actions),
            vec![(DISCONNECT_RECONNECT_DELAY, Timer::Reconnect)]
        );
    }

    #[test]
    fn simultaneous_error_and_disconnect_collapse() {
        let mut s = connected();
        let first = s.error("socket reset".into());
        let second = s.disconnected();
        assert_eq!(schedules(&first).len(), 1);
        assert!(schedules(&second).is_empty());
        assert!(!second.iter().any(|a| matches!(a, Action::PublishStatus { .. })));

        assert_eq!(s.timer_fired(Timer::Reconnect), vec![Action::Find]);
        // The guard is released once the reconnect runs.
        s.discovery_result(Ok(()));
        assert_eq!(schedules(&s.connect_failed("refused".into())).len(), 1);
    }

    #[test]
    fn false_positive_connection_reconnects() {
        let mut s = ConnectionSupervisor::new();
        s.start();
        s.discovery_result(Ok(()));
        s.connected_reported();
        let actions = s.liveness_checked(false);
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(!actions.contains(&Action::Initialize));
        assert_eq!(schedules(&actions), vec![(ERROR_RECONNECT_DELAY, Timer::Reconnect)]);
    }

    #[test]
    fn connect_error_waits_then_reconnects() {
        let mut s = ConnectionSupervisor::new();
        s.start();
        s.discovery_result(Ok(()));
        let actions = s.connect_failed("timeout".into());
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(schedules(&actions), vec![(ERROR_RECONNECT_DELAY, Timer::Reconnect)]);
    }

    #[test]
    fn initializes_once_per_episode() {
        let mut s = connected();
        assert!(s.liveness_checked(true).is_empty());
        s.disconnected();
        s.timer_fired(Timer::Reconnect);
        s.discovery_result(Ok(()));
        s.connected_reported();
        assert!(s.liveness_checked(true).contains(&Action::Initialize));
    }
}
