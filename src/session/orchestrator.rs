//! Reopen scheduling and retry bookkeeping.
//!
//! The orchestrator owns the attempt counter and the first-failure
//! timestamp, evaluates the session's retry policy on every failure, and
//! schedules reopen attempts on deferred timer tasks so the protocol stack
//! is never re-entered from the unit that detected the failure. All state
//! is touched under the session lock; a generation ticket makes every
//! scheduled timer cancelable exactly once without racing its own firing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, LinkError};
use crate::retry::RetryDecision;
use crate::token::RenewalMode;

use super::state::{ConnectionStatus, StatusChangeReason};
use super::{SessionShared, SessionState};

/// A scheduled timer task guarded by a generation ticket.
struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Cancel-safe one-shot timer slot.
///
/// `arm` hands out a ticket; the timer task must `claim` it under the
/// session lock before acting. `cancel` bumps the generation and aborts, so
/// a concurrently firing timer finds its ticket stale and exits.
#[derive(Default)]
pub(crate) struct TimerSlot {
    generation: u64,
    pending: Option<PendingTimer>,
}

impl TimerSlot {
    pub(crate) fn arm(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn store(&mut self, generation: u64, handle: JoinHandle<()>) {
        self.pending = Some(PendingTimer { generation, handle });
    }

    pub(crate) fn claim(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.generation += 1;
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }
}

/// Retry bookkeeping for one session.
pub(crate) struct ReconnectOrchestrator {
    /// Reopen attempts made during the current outage.
    pub(crate) attempt_count: u32,
    /// Start of the current outage, for elapsed-time policy ceilings.
    first_failure_at: Option<Instant>,
    /// The scheduled reopen, when one is pending.
    pub(crate) timer: TimerSlot,
}

impl ReconnectOrchestrator {
    pub(crate) fn new() -> Self {
        Self {
            attempt_count: 0,
            first_failure_at: None,
            timer: TimerSlot::default(),
        }
    }

    /// Evaluate the policy for the current attempt, stamping the outage
    /// start on first use.
    pub(crate) fn decide(
        &mut self,
        shared: &SessionShared,
        last_failure: ErrorKind,
    ) -> RetryDecision {
        let first = *self.first_failure_at.get_or_insert_with(Instant::now);
        shared
            .config
            .retry_policy
            .decide(self.attempt_count, last_failure, first.elapsed())
    }

    /// Record a failed reopen attempt.
    pub(crate) fn record_attempt_failure(&mut self) {
        self.attempt_count += 1;
    }

    /// Clear outage bookkeeping. Called exactly when the session reaches
    /// [`ConnectionStatus::Connected`].
    pub(crate) fn reset(&mut self) {
        self.attempt_count = 0;
        self.first_failure_at = None;
    }
}

/// Status reason for entering the retrying state after a failure.
fn retry_reason(kind: ErrorKind) -> StatusChangeReason {
    match kind {
        ErrorKind::Authentication => StatusChangeReason::BadCredential,
        _ => StatusChangeReason::CommunicationError,
    }
}

/// Status reason for giving up on a failure of `kind`.
fn give_up_reason(kind: ErrorKind) -> StatusChangeReason {
    match kind {
        ErrorKind::Transient => StatusChangeReason::RetryExpired,
        ErrorKind::Authentication => StatusChangeReason::BadCredential,
        ErrorKind::Protocol | ErrorKind::Fatal => StatusChangeReason::CommunicationError,
    }
}

/// Consult the policy for a failure and transition accordingly: into the
/// retrying state with a scheduled reopen, or to the terminal state.
///
/// `entry_reason` labels the retrying transition; the terminal reason is
/// derived from the failure classification.
pub(crate) fn handle_failure(
    shared: &Arc<SessionShared>,
    state: &mut SessionState,
    error: LinkError,
    entry_reason: StatusChangeReason,
) {
    let kind = error.kind();

    if kind.is_retryable() {
        let decision = state.orchestrator.decide(shared, kind);
        if decision.should_retry {
            if let Err(err) = state.machine.transition(
                ConnectionStatus::DisconnectedRetrying,
                entry_reason,
                Some(error),
            ) {
                warn!(identity = %shared.channel.identity(), error = %err, "transition rejected");
                return;
            }
            schedule_reopen(shared, state, decision.wait);
            return;
        }
    }

    let reason = give_up_reason(kind);
    if let Err(err) =
        state
            .machine
            .transition(ConnectionStatus::Disconnected, reason, Some(error))
    {
        warn!(identity = %shared.channel.identity(), error = %err, "transition rejected");
    }
}

/// Schedule a reopen attempt after `wait` on a deferred timer task.
pub(crate) fn schedule_reopen(shared: &Arc<SessionShared>, state: &mut SessionState, wait: Duration) {
    let ticket = state.orchestrator.timer.arm();
    debug!(
        identity = %shared.channel.identity(),
        attempt = state.orchestrator.attempt_count,
        ?wait,
        "reopen scheduled"
    );

    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        sleep(wait).await;
        run_reopen(shared, ticket).await;
    });
    state.orchestrator.timer.store(ticket, handle);
}

/// Body of a fired reopen timer.
async fn run_reopen(shared: Arc<SessionShared>, ticket: u64) {
    let mut state = shared.state.lock().await;
    if !state.orchestrator.timer.claim(ticket) {
        return;
    }
    if state.machine.status() != ConnectionStatus::DisconnectedRetrying {
        return;
    }

    // Fresh, non-expired credential before every reopen.
    let credential = match shared.tokens.current().await {
        Ok(credential) => credential,
        Err(err) => {
            state.stats.record_failure();
            state.orchestrator.record_attempt_failure();
            handle_failure(&shared, &mut state, err, StatusChangeReason::BadCredential);
            return;
        }
    };

    state.stats.record_reconnect();
    let gate = shared.gate();
    let result = {
        let _structural = gate.write().await;
        match timeout(shared.config.open_timeout, shared.channel.reopen(&credential)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    };

    match result {
        Ok(()) => {
            if let Err(err) = state.machine.transition(
                ConnectionStatus::Connected,
                StatusChangeReason::ConnectionOk,
                None,
            ) {
                warn!(identity = %shared.channel.identity(), error = %err, "transition rejected");
                return;
            }
            state.orchestrator.reset();
            state.stats.record_connect();
            schedule_renewal(&shared, &mut state, &credential);
            info!(identity = %shared.channel.identity(), "session reconnected");
        }
        Err(err) => {
            state.stats.record_failure();
            state.orchestrator.record_attempt_failure();
            let reason = retry_reason(err.kind());
            handle_failure(&shared, &mut state, err, reason);
        }
    }
}

/// Schedule proactive credential renewal for a freshly opened session.
pub(crate) fn schedule_renewal(
    shared: &Arc<SessionShared>,
    state: &mut SessionState,
    credential: &crate::token::Credential,
) {
    let delay = shared.tokens.renewal_due_in(credential);
    let ticket = state.renewal.arm();
    debug!(
        identity = %shared.channel.identity(),
        ?delay,
        "credential renewal scheduled"
    );

    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        run_renewal(shared, ticket).await;
    });
    state.renewal.store(ticket, handle);
}

/// Body of a fired renewal timer.
async fn run_renewal(shared: Arc<SessionShared>, ticket: u64) {
    let mut state = shared.state.lock().await;
    if !state.renewal.claim(ticket) {
        return;
    }
    if state.machine.status() != ConnectionStatus::Connected {
        return;
    }

    match shared.tokens.renew().await {
        Ok(fresh) => match shared.renewal_mode() {
            RenewalMode::LiveRenewable => {
                let gate = shared.gate();
                let refreshed = {
                    let _shared_ops = gate.read().await;
                    shared.channel.refresh_credential(&fresh).await
                };
                match refreshed {
                    Ok(()) => {
                        // In-band renewal is invisible: no status event.
                        debug!(identity = %shared.channel.identity(), "credential refreshed in-band");
                        schedule_renewal(&shared, &mut state, &fresh);
                    }
                    Err(err) => {
                        warn!(
                            identity = %shared.channel.identity(),
                            error = %err,
                            "in-band refresh failed, reconnecting"
                        );
                        state.stats.record_disconnect();
                        state.stats.record_failure();
                        let reason = retry_reason(err.kind());
                        handle_failure(&shared, &mut state, err, reason);
                    }
                }
            }
            RenewalMode::ReconnectRequired => {
                force_renewal_reopen(&shared, &mut state).await;
            }
        },
        Err(err) => {
            // Stale credential is kept by the lifecycle; the policy decides
            // whether the session keeps trying with it.
            warn!(
                identity = %shared.channel.identity(),
                error = %err,
                "credential renewal failed"
            );
            state.stats.record_disconnect();
            state.stats.record_failure();
            handle_failure(&shared, &mut state, err, StatusChangeReason::BadCredential);
        }
    }
}

/// Reconnect-required renewal: tear the channel down, surface the expiry,
/// and reopen immediately with the fresh credential.
async fn force_renewal_reopen(shared: &Arc<SessionShared>, state: &mut SessionState) {
    let gate = shared.gate();
    {
        let _structural = gate.write().await;
        let _ = shared.channel.close().await;
    }
    state.stats.record_disconnect();

    if let Err(err) = state.machine.transition(
        ConnectionStatus::DisconnectedRetrying,
        StatusChangeReason::ExpiredCredential,
        None,
    ) {
        warn!(identity = %shared.channel.identity(), error = %err, "transition rejected");
        return;
    }
    schedule_reopen(shared, state, Duration::ZERO);
}
