//! Multiplexed connections: many sessions over one shared transport.
//!
//! A [`MultiplexedConnection`] owns the shared network connection plus a
//! registry of sessions keyed by identity. Structural operations on the
//! shared transport (open, close, reopen) are mutually exclusive; session
//! sends proceed concurrently with each other but never with a structural
//! operation. A shared-connection drop fans out to every registered
//! session, each of which recovers under its own retry policy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{LinkError, Result};
use crate::session::{DeviceSession, MultiplexConfig};
use crate::transport::Transport;
use crate::types::{Identity, TransportKind};

struct MuxState {
    sessions: HashMap<Identity, DeviceSession>,
    open: bool,
}

/// Many logical device sessions sharing one network connection.
///
/// Sessions stay owned by their creators; the registry holds non-owning
/// handles. Closing the connection force-closes every registered session.
pub struct MultiplexedConnection {
    transport: Arc<dyn Transport>,
    config: MultiplexConfig,
    /// Structural-operation gate shared with every registered session.
    gate: Arc<RwLock<()>>,
    inner: Mutex<MuxState>,
}

impl MultiplexedConnection {
    /// Create an empty multiplexed connection over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: MultiplexConfig) -> Self {
        Self {
            transport,
            config,
            gate: Arc::new(RwLock::new(())),
            inner: Mutex::new(MuxState {
                sessions: HashMap::new(),
                open: false,
            }),
        }
    }

    /// The wire protocol underneath.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Whether the shared connection is open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    /// Register a session on this connection.
    ///
    /// Rejects duplicate identities and sessions bound to a different
    /// transport. Registration while the connection is open requires the
    /// transport's declared capability and opens the session immediately;
    /// an open failure leaves the session registered, recovering under its
    /// own retry policy.
    pub async fn register(&self, session: &DeviceSession) -> Result<()> {
        if !Arc::ptr_eq(session.transport(), &self.transport) {
            return Err(LinkError::UnsupportedOperation(
                "session is bound to a different transport",
            ));
        }
        if !session.is_fresh().await {
            return Err(LinkError::UnsupportedOperation(
                "session has already been opened",
            ));
        }

        let mut inner = self.inner.lock().await;
        if inner.sessions.len() >= self.config.max_sessions {
            return Err(LinkError::UnsupportedOperation("session limit reached"));
        }
        let identity = session.identity().clone();
        if inner.sessions.contains_key(&identity) {
            return Err(LinkError::DuplicateIdentity(identity));
        }
        if inner.open && !self.transport.supports_registration_while_open() {
            return Err(LinkError::UnsupportedOperation(
                "registration while the connection is open",
            ));
        }

        session.bind_gate(Arc::clone(&self.gate));
        inner.sessions.insert(identity.clone(), session.clone());
        info!(identity = %identity, "session registered");

        if inner.open {
            if let Err(err) = session.open().await {
                warn!(identity = %identity, error = %err, "late-registered session open failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove a session from the registry.
    ///
    /// Any in-flight reopen attempt is canceled or awaited before removal
    /// completes; the session ends up closed.
    pub async fn unregister(&self, identity: &Identity) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock().await;
            inner
                .sessions
                .remove(identity)
                .ok_or_else(|| LinkError::UnknownIdentity(identity.clone()))?
        };
        session.close().await?;
        info!(identity = %identity, "session unregistered");
        Ok(())
    }

    /// Open the shared connection, then every registered session.
    ///
    /// Each session open is governed by its own retry policy and state
    /// machine; individual failures surface through the session's status
    /// listener, not through this call.
    pub async fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.open {
            return Ok(());
        }

        {
            let _structural = self.gate.write().await;
            self.transport.connect().await?;
        }
        inner.open = true;
        info!(sessions = inner.sessions.len(), "shared connection opened");

        for session in inner.sessions.values() {
            if let Err(err) = session.open().await {
                warn!(identity = %session.identity(), error = %err, "session open failed");
            }
        }
        Ok(())
    }

    /// Close every registered session, then the shared connection.
    ///
    /// The registry is emptied; the connection can be reused by registering
    /// fresh sessions.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        for session in inner.sessions.values() {
            if let Err(err) = session.close().await {
                warn!(identity = %session.identity(), error = %err, "session close failed");
            }
        }
        inner.sessions.clear();

        {
            let _structural = self.gate.write().await;
            self.transport.disconnect().await?;
        }
        inner.open = false;
        info!("shared connection closed");
        Ok(())
    }
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("transport", &self.transport.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::RetryPolicy;
    use crate::session::{
        ConnectionStatus, SessionConfig, StatusChangeReason, StatusEvent, StatusListener,
    };
    use crate::token::{Credential, CredentialProvider};
    use crate::transport::testing::MockTransport;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    struct HourProvider;

    #[async_trait]
    impl CredentialProvider for HourProvider {
        async fn credential(&self, identity: &Identity, _: Duration) -> Result<Credential> {
            Credential::new(
                "tok",
                identity.clone(),
                Instant::now(),
                Duration::from_secs(3600),
            )
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<(ConnectionStatus, StatusChangeReason)>>,
    }

    impl Recorder {
        fn snapshot(&self) -> Vec<(ConnectionStatus, StatusChangeReason)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl StatusListener for Recorder {
        fn on_status_change(&self, event: &StatusEvent) {
            self.events
                .lock()
                .unwrap()
                .push((event.status, event.reason));
        }
    }

    fn session_on(
        transport: &Arc<MockTransport>,
        name: &str,
        policy: RetryPolicy,
    ) -> (DeviceSession, Arc<Recorder>) {
        let session = DeviceSession::new(
            transport.clone(),
            Arc::new(HourProvider),
            Identity::device(name),
            SessionConfig::default().with_retry_policy(policy),
        );
        let recorder = Arc::new(Recorder::default());
        session.set_status_listener(recorder.clone()).unwrap();
        (session, recorder)
    }

    async fn wait_for_status(session: &DeviceSession, status: ConnectionStatus) {
        for _ in 0..200 {
            if session.status().await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {status:?}", session.identity());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_identity() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());

        let (first, _) = session_on(&transport, "d1", RetryPolicy::NoRetry);
        let (second, _) = session_on(&transport, "d1", RetryPolicy::NoRetry);

        mux.register(&first).await.unwrap();
        let err = mux.register(&second).await.unwrap_err();
        assert!(matches!(err, LinkError::DuplicateIdentity(_)));
        assert_eq!(mux.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_foreign_transport() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let other = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport, MultiplexConfig::default());

        let (foreign, _) = session_on(&other, "d1", RetryPolicy::NoRetry);
        let err = mux.register(&foreign).await.unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(
            transport.clone(),
            MultiplexConfig::default().with_max_sessions(1),
        );

        let (first, _) = session_on(&transport, "d1", RetryPolicy::NoRetry);
        let (second, _) = session_on(&transport, "d2", RetryPolicy::NoRetry);

        mux.register(&first).await.unwrap();
        assert!(mux.register(&second).await.is_err());
    }

    #[tokio::test]
    async fn test_open_brings_up_all_sessions() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());

        let mut sessions = Vec::new();
        for name in ["d1", "d2", "d3"] {
            let (session, _) = session_on(&transport, name, RetryPolicy::NoRetry);
            mux.register(&session).await.unwrap();
            sessions.push(session);
        }

        mux.open().await.unwrap();
        assert!(mux.is_open().await);
        for session in &sessions {
            assert!(session.status().await.is_connected());
            assert!(transport.is_channel_open(session.identity()));
        }
        // One shared connection, not one per session.
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_registration_while_open_requires_capability() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());
        mux.open().await.unwrap();

        let (late, _) = session_on(&transport, "late", RetryPolicy::NoRetry);
        let err = mux.register(&late).await.unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedOperation(_)));

        let capable = MockTransport::with_late_registration(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(capable.clone(), MultiplexConfig::default());
        mux.open().await.unwrap();

        let (late, _) = session_on(&capable, "late", RetryPolicy::NoRetry);
        mux.register(&late).await.unwrap();
        assert!(late.status().await.is_connected());
    }

    #[tokio::test]
    async fn test_shared_drop_fans_out_per_policy() {
        // Five sessions share the connection; a single shared drop reaches
        // all of them. NoRetry sessions terminate, backoff sessions
        // schedule independent reopens and recover.
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());

        let mut no_retry = Vec::new();
        let mut retrying = Vec::new();
        for index in 0..2 {
            let pair = session_on(&transport, &format!("nr-{index}"), RetryPolicy::NoRetry);
            mux.register(&pair.0).await.unwrap();
            no_retry.push(pair);
        }
        for index in 0..3 {
            let policy = RetryPolicy::exponential_with(
                Duration::from_millis(20),
                Duration::from_millis(100),
                Duration::from_millis(10),
                Duration::from_secs(10),
            );
            let pair = session_on(&transport, &format!("eb-{index}"), policy);
            mux.register(&pair.0).await.unwrap();
            retrying.push(pair);
        }

        mux.open().await.unwrap();
        transport.emit_shared_drop(ErrorKind::Transient);

        for (session, recorder) in &no_retry {
            wait_for_status(session, ConnectionStatus::Disconnected).await;
            let events = recorder.snapshot();
            // Straight to terminal, never through the retrying state.
            assert!(
                !events
                    .iter()
                    .any(|(status, _)| *status == ConnectionStatus::DisconnectedRetrying)
            );
        }
        for (session, recorder) in &retrying {
            wait_for_status(session, ConnectionStatus::Connected).await;
            let events = recorder.snapshot();
            assert!(events.contains(&(
                ConnectionStatus::DisconnectedRetrying,
                StatusChangeReason::NoNetwork
            )));
        }
    }

    #[tokio::test]
    async fn test_close_force_closes_every_session() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());

        let (first, _) = session_on(&transport, "d1", RetryPolicy::NoRetry);
        let (second, _) = session_on(&transport, "d2", RetryPolicy::NoRetry);
        mux.register(&first).await.unwrap();
        mux.register(&second).await.unwrap();

        mux.open().await.unwrap();
        mux.close().await.unwrap();

        assert!(!mux.is_open().await);
        assert_eq!(mux.session_count().await, 0);
        assert_eq!(first.status().await, ConnectionStatus::Disabled);
        assert_eq!(second.status().await, ConnectionStatus::Disabled);
    }

    #[tokio::test]
    async fn test_unregister_settles_pending_reopen() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let identity = Identity::device("d1");
        transport.fail_next_opens(&identity, 10, ErrorKind::Transient);

        let mux = MultiplexedConnection::new(transport.clone(), MultiplexConfig::default());
        let (session, _) = session_on(
            &transport,
            "d1",
            RetryPolicy::fixed(5, Duration::from_secs(30)),
        );
        mux.register(&session).await.unwrap();
        mux.open().await.unwrap();

        assert_eq!(
            session.status().await,
            ConnectionStatus::DisconnectedRetrying
        );
        mux.unregister(&identity).await.unwrap();
        assert_eq!(mux.session_count().await, 0);
        assert_eq!(session.status().await, ConnectionStatus::Disabled);

        // The canceled reopen never fires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_count(&identity), 1);

        let err = mux.unregister(&identity).await.unwrap_err();
        assert!(matches!(err, LinkError::UnknownIdentity(_)));
    }
}
