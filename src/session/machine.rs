//! Connection status state machine.
//!
//! One machine per session. Transitions follow a fixed edge set; each
//! accepted transition emits exactly one status event, synchronously, to the
//! registered listener. Callers serialize access through the session lock,
//! so per-session event order matches transition order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{LinkError, Result};
use crate::types::Identity;

use super::state::{
    ConnectionStatus, ListenerSlot, StatusChangeReason, StatusEvent, StatusListener,
};

/// Per-session status plus transition logic.
pub struct ConnectionStateMachine {
    identity: Identity,
    status: ConnectionStatus,
    /// False until the first open; a fresh session reads as `Disconnected`
    /// without being terminal yet.
    started: bool,
    listener: ListenerSlot,
    dispatching: Arc<AtomicBool>,
}

impl ConnectionStateMachine {
    /// Create a machine for `identity`. Fresh sessions report
    /// [`ConnectionStatus::Disconnected`] until their first open.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            status: ConnectionStatus::Disconnected,
            started: false,
            listener: Arc::new(std::sync::Mutex::new(None)),
            dispatching: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// The identity this machine belongs to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the session has ever begun opening.
    pub(crate) fn has_started(&self) -> bool {
        self.started
    }

    pub(crate) fn listener_slot(&self) -> ListenerSlot {
        Arc::clone(&self.listener)
    }

    pub(crate) fn dispatch_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dispatching)
    }

    /// Register the status listener, replacing any previous one.
    ///
    /// Rejected while a callback is in progress: swapping the listener from
    /// inside its own notification would make delivery order ambiguous.
    pub fn set_listener(&self, listener: Arc<dyn StatusListener>) -> Result<()> {
        set_listener_in(&self.listener, &self.dispatching, listener)
    }

    /// Whether a transition to `to` is a legal edge from the current status.
    pub fn can_transition(&self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if !self.started {
            // A fresh session can only start opening or be closed.
            return matches!(to, Connecting | Disabled);
        }

        match (self.status, to) {
            (Connecting, Connected)
            | (Connecting, DisconnectedRetrying)
            | (Connecting, Disconnected)
            | (Connected, DisconnectedRetrying)
            | (Connected, Disconnected)
            | (DisconnectedRetrying, Connected)
            | (DisconnectedRetrying, DisconnectedRetrying)
            | (DisconnectedRetrying, Disconnected) => true,
            // Any non-terminal status accepts a user close.
            (from, Disabled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Perform a transition, emitting exactly one status event.
    ///
    /// Illegal edges are rejected and emit nothing.
    pub fn transition(
        &mut self,
        to: ConnectionStatus,
        reason: StatusChangeReason,
        error: Option<LinkError>,
    ) -> Result<()> {
        if !self.can_transition(to) {
            return Err(LinkError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        debug!(
            identity = %self.identity,
            from = ?self.status,
            to = ?to,
            reason = ?reason,
            "status transition"
        );

        self.started = true;
        self.status = to;

        let event = StatusEvent {
            identity: self.identity.clone(),
            status: to,
            reason,
            error,
        };
        self.dispatch(&event);
        Ok(())
    }

    fn dispatch(&self, event: &StatusEvent) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            self.dispatching.store(true, Ordering::SeqCst);
            listener.on_status_change(event);
            self.dispatching.store(false, Ordering::SeqCst);
        }
    }
}

/// Shared implementation for listener registration; also used by the
/// session handle, which can be asked to register from a callback.
pub(crate) fn set_listener_in(
    slot: &ListenerSlot,
    dispatching: &AtomicBool,
    listener: Arc<dyn StatusListener>,
) -> Result<()> {
    if dispatching.load(Ordering::SeqCst) {
        return Err(LinkError::ListenerBusy);
    }
    *slot.lock().unwrap() = Some(listener);
    Ok(())
}
