//! Session status types and statistics.

use std::sync::Arc;
use std::time::Instant;

use crate::error::LinkError;
use crate::types::Identity;

/// Connection status of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// An open is in progress.
    Connecting,
    /// The channel is open and usable.
    Connected,
    /// The connection was lost; a reopen is scheduled or in flight.
    DisconnectedRetrying,
    /// The connection was lost and will not come back. Terminal.
    Disconnected,
    /// The session was closed by the caller. Terminal.
    Disabled,
}

impl ConnectionStatus {
    /// Check if the session is usable.
    pub fn is_connected(&self) -> bool {
        *self == ConnectionStatus::Connected
    }

    /// Check if a reopen is scheduled or in flight.
    pub fn is_retrying(&self) -> bool {
        *self == ConnectionStatus::DisconnectedRetrying
    }

    /// Check if the session accepts no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Disabled
        )
    }
}

/// Why a session's status changed. Paired with every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeReason {
    /// The connection was established or re-established.
    ConnectionOk,
    /// The active credential passed its expiry.
    ExpiredCredential,
    /// The credential was rejected or could not be renewed.
    BadCredential,
    /// The retry policy gave up.
    RetryExpired,
    /// The transport reported a failure.
    CommunicationError,
    /// The caller closed the session.
    ClientClose,
    /// The shared network connection went down.
    NoNetwork,
}

/// A single status transition, delivered synchronously to the listener.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// The session this event belongs to.
    pub identity: Identity,
    /// The status entered by the transition.
    pub status: ConnectionStatus,
    /// Why the transition happened.
    pub reason: StatusChangeReason,
    /// The failure behind the transition, when there was one.
    pub error: Option<LinkError>,
}

/// Caller-facing status callback.
///
/// Runs synchronously on the execution unit that triggered the transition;
/// a slow listener delays only its own session's subsequent transitions.
pub trait StatusListener: Send + Sync {
    /// Called once per accepted transition, in per-session order.
    fn on_status_change(&self, event: &StatusEvent);
}

impl<F> StatusListener for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status_change(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Shared handle to a registered listener slot.
pub(crate) type ListenerSlot = Arc<std::sync::Mutex<Option<Arc<dyn StatusListener>>>>;

/// Per-session connection statistics.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Number of successful opens, initial and reopens alike.
    pub connect_count: u64,
    /// Number of failed open attempts.
    pub failure_count: u64,
    /// Number of reopen attempts made.
    pub reconnect_count: u64,
    /// Number of messages sent.
    pub messages_sent: u64,
    /// Total payload bytes sent.
    pub bytes_sent: u64,
    /// Time of last successful open.
    pub last_connected: Option<Instant>,
    /// Time of last disconnect.
    pub last_disconnected: Option<Instant>,
    /// Time of last failure.
    pub last_error: Option<Instant>,
}

impl SessionStats {
    /// Record a successful open.
    pub(crate) fn record_connect(&mut self) {
        self.connect_count += 1;
        self.last_connected = Some(Instant::now());
    }

    /// Record a disconnection.
    pub(crate) fn record_disconnect(&mut self) {
        self.last_disconnected = Some(Instant::now());
    }

    /// Record a failed attempt.
    pub(crate) fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_error = Some(Instant::now());
    }

    /// Record a reopen attempt.
    pub(crate) fn record_reconnect(&mut self) {
        self.reconnect_count += 1;
    }

    /// Record a sent message.
    pub(crate) fn record_send(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Time since the last successful open, if any.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.last_connected.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        assert!(ConnectionStatus::Connected.is_connected());
        assert!(!ConnectionStatus::Connecting.is_connected());
        assert!(ConnectionStatus::DisconnectedRetrying.is_retrying());
        assert!(ConnectionStatus::Disconnected.is_terminal());
        assert!(ConnectionStatus::Disabled.is_terminal());
        assert!(!ConnectionStatus::DisconnectedRetrying.is_terminal());
    }

    #[test]
    fn test_session_stats() {
        let mut stats = SessionStats::default();

        stats.record_connect();
        assert_eq!(stats.connect_count, 1);
        assert!(stats.last_connected.is_some());
        assert!(stats.uptime().is_some());

        stats.record_send(256);
        stats.record_send(128);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 384);

        stats.record_failure();
        stats.record_reconnect();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.reconnect_count, 1);
        assert!(stats.last_error.is_some());
    }
}
