//! Protocol-layer boundary.
//!
//! The core never sees wire frames. A [`Transport`] adapter (AMQP, MQTT,
//! HTTPS) exposes open/close/send outcomes plus an upward stream of drop
//! events; a [`TransportSession`] binds one identity's logical channel to an
//! adapter and classifies raw failures before they reach the state machine.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::{ErrorKind, LinkError, Result};
use crate::token::Credential;
use crate::types::{Identity, TransportKind};

/// An event reported upward by a transport adapter.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection was lost. `identity` names the dropped channel, or is
    /// `None` when the shared network connection itself went down.
    Dropped {
        identity: Option<Identity>,
        kind: ErrorKind,
    },
}

/// A protocol adapter carrying one or more session channels over a single
/// network connection.
///
/// Adapters report outcomes only; the core never interprets wire frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The wire protocol this adapter speaks.
    fn kind(&self) -> TransportKind;

    /// Whether session channels can be added while the shared connection is
    /// already open.
    fn supports_registration_while_open(&self) -> bool {
        false
    }

    /// Establish the shared network connection. Idempotent: a no-op when
    /// already connected.
    async fn connect(&self) -> Result<()>;

    /// Tear down the shared network connection and every channel on it.
    async fn disconnect(&self) -> Result<()>;

    /// Open `identity`'s channel, authenticating with `credential`.
    async fn open_channel(&self, identity: &Identity, credential: &Credential) -> Result<()>;

    /// Close `identity`'s channel.
    async fn close_channel(&self, identity: &Identity) -> Result<()>;

    /// Send an opaque payload on `identity`'s channel.
    async fn send(&self, identity: &Identity, payload: Bytes) -> Result<()>;

    /// Push a fresh credential onto an open channel without teardown.
    ///
    /// Only live-renewable transports implement this.
    async fn refresh_credential(
        &self,
        identity: &Identity,
        credential: &Credential,
    ) -> Result<()> {
        let _ = (identity, credential);
        Err(LinkError::UnsupportedOperation("in-band credential refresh"))
    }

    /// Subscribe to drop events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// One identity's logical channel over a transport.
///
/// All failures crossing this boundary are `LinkError`s carrying an
/// [`ErrorKind`] classification; the state machine consults only the kind's
/// retryable flag, never error internals.
#[derive(Clone)]
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    identity: Identity,
}

impl TransportSession {
    /// Bind `identity` to a transport adapter.
    pub fn new(transport: Arc<dyn Transport>, identity: Identity) -> Self {
        Self {
            transport,
            identity,
        }
    }

    /// The bound identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The wire protocol underneath.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// The adapter this channel runs on.
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Open this channel. The credential must not be expired at handoff.
    pub async fn open(&self, credential: &Credential) -> Result<()> {
        if credential.is_expired() {
            return Err(LinkError::CredentialExpired(self.identity.clone()));
        }
        self.transport.open_channel(&self.identity, credential).await
    }

    /// Reopen this channel after a drop: re-establish the shared connection
    /// if needed, then open the channel with a fresh credential.
    pub async fn reopen(&self, credential: &Credential) -> Result<()> {
        if credential.is_expired() {
            return Err(LinkError::CredentialExpired(self.identity.clone()));
        }
        // Best effort; the old channel may already be gone.
        let _ = self.transport.close_channel(&self.identity).await;
        self.transport.connect().await?;
        self.transport.open_channel(&self.identity, credential).await
    }

    /// Close this channel.
    pub async fn close(&self) -> Result<()> {
        self.transport.close_channel(&self.identity).await
    }

    /// Send an opaque payload on this channel.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.transport.send(&self.identity, payload).await
    }

    /// Push a fresh credential in-band.
    pub async fn refresh_credential(&self, credential: &Credential) -> Result<()> {
        if credential.is_expired() {
            return Err(LinkError::CredentialExpired(self.identity.clone()));
        }
        self.transport
            .refresh_credential(&self.identity, credential)
            .await
    }

    /// Subscribe to the adapter's drop events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;
    use std::time::{Duration, Instant};

    fn credential(identity: &Identity, lifetime: Duration) -> Credential {
        Credential::new("tok", identity.clone(), Instant::now(), lifetime).unwrap()
    }

    #[tokio::test]
    async fn test_channel_open_and_send() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let identity = Identity::device("d1");
        let channel = TransportSession::new(transport.clone(), identity.clone());

        transport.connect().await.unwrap();
        channel
            .open(&credential(&identity, Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(transport.is_channel_open(&identity));

        channel.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(transport.sent_payloads(&identity).len(), 1);

        channel.close().await.unwrap();
        assert!(!transport.is_channel_open(&identity));
    }

    #[tokio::test]
    async fn test_expired_credential_rejected_at_handoff() {
        let transport = MockTransport::new(TransportKind::Mqtt);
        let identity = Identity::device("d1");
        let channel = TransportSession::new(transport.clone(), identity.clone());
        transport.connect().await.unwrap();

        let expired = Credential::new(
            "tok",
            identity.clone(),
            Instant::now() - Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = channel.open(&expired).await.unwrap_err();
        assert!(matches!(err, LinkError::CredentialExpired(_)));
        // The adapter never saw the open.
        assert_eq!(transport.open_count(&identity), 0);
    }

    #[tokio::test]
    async fn test_reopen_reestablishes_shared_connection() {
        let transport = MockTransport::new(TransportKind::Amqp);
        let identity = Identity::device("d1");
        let channel = TransportSession::new(transport.clone(), identity.clone());

        transport.connect().await.unwrap();
        channel
            .open(&credential(&identity, Duration::from_secs(60)))
            .await
            .unwrap();

        transport.emit_shared_drop(ErrorKind::Transient);
        channel
            .reopen(&credential(&identity, Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(transport.is_channel_open(&identity));
        assert_eq!(transport.connect_count(), 2);
    }
}
