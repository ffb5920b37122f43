//! Device-side connection lifecycle for IoT clients.
//!
//! This crate implements the hard part of a device-connectivity SDK:
//! keeping logical device sessions alive across heterogeneous transports.
//! It reconciles protocols that tear their connection down on credential
//! change with protocols that renew credentials in-band into one uniform
//! reconnect/backoff model, guarantees at most one live session per device
//! identity, and delivers deterministic status notifications under
//! concurrent network failures.
//!
//! # Features
//!
//! - Pluggable retry policies: none, fixed interval, exponential backoff
//!   with jitter, or user-defined
//! - A per-session connection status state machine with synchronous
//!   status-change callbacks
//! - Credential lifecycle with skew-driven proactive renewal, delivered
//!   in-band or via forced reconnect depending on the transport type
//! - Multiplexing of many device sessions over one shared connection,
//!   with per-session failure recovery
//!
//! Wire framing, sockets, TLS, and token cryptography live behind the
//! [`Transport`] and [`CredentialProvider`] traits; this crate consumes
//! outcomes only.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use iotlink::{
//!     DerivedKeyProvider, DeviceSession, Identity, Message, RetryPolicy, SessionConfig,
//! };
//!
//! # async fn example(transport: Arc<dyn iotlink::Transport>) -> iotlink::Result<()> {
//! let provider = Arc::new(DerivedKeyProvider::new(|identity, lifetime| {
//!     format!("sig({identity},{})", lifetime.as_secs())
//! }));
//!
//! let session = DeviceSession::new(
//!     transport,
//!     provider,
//!     Identity::device("sensor-7"),
//!     SessionConfig::default().with_retry_policy(RetryPolicy::exponential()),
//! );
//!
//! session.open().await?;
//! session.send(Message::new(&b"{\"t\":21.5}"[..])).await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod message;
pub mod multiplex;
pub mod retry;
pub mod session;
pub mod token;
pub mod transport;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{ErrorKind, LinkError, Result};
pub use message::{Message, MessageProperty};
pub use multiplex::MultiplexedConnection;
pub use retry::{RetryDecision, RetryPolicy, UserRetryFn};
pub use session::{
    ConnectionStateMachine, ConnectionStatus, DeviceSession, KeepAliveConfig, MultiplexConfig,
    SessionConfig, SessionStats, StatusChangeReason, StatusEvent, StatusListener,
};
pub use token::{Credential, CredentialProvider, DerivedKeyProvider, RenewalMode, TokenLifecycle};
pub use transport::{Transport, TransportEvent, TransportSession};
pub use types::{DeviceId, Identity, ModuleId, TransportKind};
