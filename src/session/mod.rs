//! Device sessions.
//!
//! A [`DeviceSession`] is one identity's connection lifecycle: status state
//! machine, retry bookkeeping, credential renewal, and the binding to a
//! transport channel. Sessions run concurrently; each session's own
//! transitions are serialized through its state lock, and status callbacks
//! run synchronously on the unit that triggered the transition.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use iotlink::{DerivedKeyProvider, DeviceSession, Identity, RetryPolicy, SessionConfig};
//!
//! # async fn example(transport: Arc<dyn iotlink::Transport>) -> iotlink::Result<()> {
//! let provider = Arc::new(DerivedKeyProvider::new(|identity, lifetime| {
//!     format!("sig({identity},{})", lifetime.as_secs())
//! }));
//!
//! let config = SessionConfig::default()
//!     .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(100)));
//! let session = DeviceSession::new(transport, provider, Identity::device("sensor-7"), config);
//!
//! session.set_status_listener(Arc::new(|event: &iotlink::StatusEvent| {
//!     println!("{}: {:?} ({:?})", event.identity, event.status, event.reason);
//! }))?;
//!
//! session.open().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod machine;
mod orchestrator;
mod state;

pub use config::{KeepAliveConfig, MultiplexConfig, SessionConfig};
pub use machine::ConnectionStateMachine;
pub use state::{
    ConnectionStatus, SessionStats, StatusChangeReason, StatusEvent, StatusListener,
};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{ErrorKind, LinkError, Result};
use crate::message::Message;
use crate::token::{CredentialProvider, RenewalMode, TokenLifecycle};
use crate::transport::{Transport, TransportEvent, TransportSession};
use crate::types::Identity;

use orchestrator::{ReconnectOrchestrator, TimerSlot};
use state::ListenerSlot;

/// Mutable session state, serialized by the session lock.
pub(crate) struct SessionState {
    pub(crate) machine: ConnectionStateMachine,
    pub(crate) orchestrator: ReconnectOrchestrator,
    pub(crate) renewal: TimerSlot,
    pub(crate) stats: SessionStats,
    pump: Option<JoinHandle<()>>,
}

/// State shared between the session handle and its background tasks.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) channel: TransportSession,
    pub(crate) tokens: TokenLifecycle,
    listener: ListenerSlot,
    dispatching: Arc<AtomicBool>,
    /// Structural-operation gate for the underlying transport. Swapped for
    /// the shared gate when the session joins a multiplexed connection.
    gate: std::sync::Mutex<Arc<RwLock<()>>>,
    pub(crate) state: Mutex<SessionState>,
}

impl SessionShared {
    pub(crate) fn gate(&self) -> Arc<RwLock<()>> {
        self.gate.lock().unwrap().clone()
    }

    pub(crate) fn renewal_mode(&self) -> RenewalMode {
        self.config
            .renewal_mode
            .unwrap_or_else(|| RenewalMode::default_for(self.channel.transport_kind()))
    }
}

/// One device or module identity's session over a transport.
///
/// Cheap to clone; all clones drive the same underlying session. The
/// creating caller owns the lifecycle — a multiplexed connection only keeps
/// a registry handle.
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<SessionShared>,
}

impl DeviceSession {
    /// Create a session for `identity` over `transport`, with credentials
    /// from `provider`.
    pub fn new(
        transport: Arc<dyn Transport>,
        provider: Arc<dyn CredentialProvider>,
        identity: Identity,
        config: SessionConfig,
    ) -> Self {
        let machine = ConnectionStateMachine::new(identity.clone());
        let listener = machine.listener_slot();
        let dispatching = machine.dispatch_flag();
        let tokens = TokenLifecycle::new(
            identity.clone(),
            provider,
            config.renewal_skew,
            config.requested_lifetime,
            config.provider_timeout,
        );
        let channel = TransportSession::new(transport, identity);

        Self {
            shared: Arc::new(SessionShared {
                config,
                channel,
                tokens,
                listener,
                dispatching,
                gate: std::sync::Mutex::new(Arc::new(RwLock::new(()))),
                state: Mutex::new(SessionState {
                    machine,
                    orchestrator: ReconnectOrchestrator::new(),
                    renewal: TimerSlot::default(),
                    stats: SessionStats::default(),
                    pump: None,
                }),
            }),
        }
    }

    /// The identity this session authenticates as.
    pub fn identity(&self) -> &Identity {
        self.shared.channel.identity()
    }

    /// Current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.shared.state.lock().await.machine.status()
    }

    /// Snapshot of the session's connection statistics.
    pub async fn stats(&self) -> SessionStats {
        self.shared.state.lock().await.stats.clone()
    }

    /// Register the status listener, replacing any previous one.
    ///
    /// Rejected from inside an in-progress status callback.
    pub fn set_status_listener(&self, listener: Arc<dyn StatusListener>) -> Result<()> {
        machine::set_listener_in(&self.shared.listener, &self.shared.dispatching, listener)
    }

    /// Open the session.
    ///
    /// The first attempt runs inline and its error is returned directly.
    /// When the failure is retryable and the policy approves, a background
    /// reopen is already scheduled by the time this returns; recovery is
    /// observed through the status listener.
    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        match state.machine.status() {
            ConnectionStatus::Disabled => return Err(LinkError::SessionClosed),
            ConnectionStatus::Disconnected if state.machine.has_started() => {
                return Err(LinkError::SessionClosed);
            }
            ConnectionStatus::Connected
            | ConnectionStatus::Connecting
            | ConnectionStatus::DisconnectedRetrying => return Ok(()),
            _ => {}
        }

        state.machine.transition(
            ConnectionStatus::Connecting,
            StatusChangeReason::ConnectionOk,
            None,
        )?;
        spawn_pump(shared, &mut state);

        let credential = match shared.tokens.current().await {
            Ok(credential) => credential,
            Err(err) => {
                state.stats.record_failure();
                orchestrator::handle_failure(
                    shared,
                    &mut state,
                    err.clone(),
                    StatusChangeReason::BadCredential,
                );
                return Err(err);
            }
        };

        let gate = shared.gate();
        let result = {
            let _structural = gate.write().await;
            let attempt = async {
                shared.channel.transport().connect().await?;
                shared.channel.open(&credential).await
            };
            match tokio::time::timeout(shared.config.open_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::Timeout),
            }
        };

        match result {
            Ok(()) => {
                state.machine.transition(
                    ConnectionStatus::Connected,
                    StatusChangeReason::ConnectionOk,
                    None,
                )?;
                state.orchestrator.reset();
                state.stats.record_connect();
                orchestrator::schedule_renewal(shared, &mut state, &credential);
                info!(identity = %self.identity(), "session opened");
                Ok(())
            }
            Err(err) => {
                state.stats.record_failure();
                orchestrator::handle_failure(
                    shared,
                    &mut state,
                    err.clone(),
                    StatusChangeReason::CommunicationError,
                );
                Err(err)
            }
        }
    }

    /// Close the session.
    ///
    /// Cancels any pending reopen or renewal timer. Idempotent: closing an
    /// already-disabled session is a no-op and emits nothing.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        state.orchestrator.timer.cancel();
        state.renewal.cancel();

        if state.machine.status().is_terminal() {
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            return Ok(());
        }

        let was_connected = state.machine.status().is_connected();
        state.machine.transition(
            ConnectionStatus::Disabled,
            StatusChangeReason::ClientClose,
            None,
        )?;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }

        if was_connected {
            state.stats.record_disconnect();
            let gate = shared.gate();
            let _shared_ops = gate.read().await;
            shared.channel.close().await?;
        }
        info!(identity = %self.identity(), "session closed");
        Ok(())
    }

    /// Send a message on the session's channel.
    ///
    /// Requires [`ConnectionStatus::Connected`]. A retryable send failure
    /// additionally feeds the reconnect path, exactly as a transport drop
    /// would.
    pub async fn send(&self, message: Message) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        match state.machine.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Disabled => return Err(LinkError::SessionClosed),
            _ => return Err(LinkError::NotConnected),
        }

        let gate = shared.gate();
        let result = {
            let _shared_ops = gate.read().await;
            shared.channel.send(message.payload().clone()).await
        };

        match result {
            Ok(()) => {
                state.stats.record_send(message.len());
                Ok(())
            }
            Err(err) => {
                if err.is_retryable() {
                    state.stats.record_disconnect();
                    state.stats.record_failure();
                    state.renewal.cancel();
                    orchestrator::handle_failure(
                        shared,
                        &mut state,
                        err.clone(),
                        StatusChangeReason::CommunicationError,
                    );
                }
                Err(err)
            }
        }
    }

    /// Whether the session has never begun opening. Registration on a
    /// multiplexed connection requires a fresh session.
    pub(crate) async fn is_fresh(&self) -> bool {
        !self.shared.state.lock().await.machine.has_started()
    }

    /// Adopt the structural gate of a multiplexed connection.
    pub(crate) fn bind_gate(&self, gate: Arc<RwLock<()>>) {
        *self.shared.gate.lock().unwrap() = gate;
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        self.shared.channel.transport()
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", self.identity())
            .finish()
    }
}

/// Start the event pump that feeds transport drops into the session.
fn spawn_pump(shared: &Arc<SessionShared>, state: &mut SessionState) {
    if state.pump.is_some() {
        return;
    }

    let mut events = shared.channel.subscribe();
    let identity = shared.channel.identity().clone();
    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Dropped {
                    identity: dropped,
                    kind,
                }) => match dropped {
                    None => handle_drop(&shared, kind, true).await,
                    Some(dropped) if dropped == identity => {
                        handle_drop(&shared, kind, false).await;
                    }
                    Some(_) => {}
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(identity = %identity, skipped, "transport event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    state.pump = Some(handle);
}

/// React to a transport-reported drop of this session's channel or of the
/// shared connection underneath it.
async fn handle_drop(shared: &Arc<SessionShared>, kind: ErrorKind, shared_drop: bool) {
    let mut state = shared.state.lock().await;
    if !state.machine.status().is_connected() {
        // Failures while connecting or retrying surface through the attempt
        // itself; drops in terminal states are stale.
        return;
    }

    state.stats.record_disconnect();
    state.renewal.cancel();

    let identity = shared.channel.identity().clone();
    let (error, reason) = if shared.tokens.is_expired().await {
        (
            LinkError::CredentialExpired(identity),
            StatusChangeReason::ExpiredCredential,
        )
    } else if shared_drop {
        (LinkError::NoNetwork, StatusChangeReason::NoNetwork)
    } else {
        let error = match kind {
            ErrorKind::Authentication => LinkError::CredentialRejected("dropped by remote".into()),
            ErrorKind::Protocol => LinkError::Protocol("dropped by remote".into()),
            _ => LinkError::ConnectionDropped,
        };
        (error, StatusChangeReason::CommunicationError)
    };

    orchestrator::handle_failure(shared, &mut state, error, reason);
}
