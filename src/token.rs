//! Credential lifecycle and renewal.
//!
//! A [`TokenLifecycle`] tracks the current credential for one identity and
//! renews it proactively (inside the renewal-skew window) or on demand. How
//! a renewed credential reaches the transport is a per-transport-type
//! configuration choice, never inferred at runtime.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{LinkError, Result};
use crate::types::{Identity, TransportKind};

/// How a renewed credential reaches the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalMode {
    /// The fresh credential is pushed onto the established connection
    /// without teardown. No status event is emitted.
    LiveRenewable,
    /// The transport has no in-band renewal. The connection is force-closed
    /// and reopened with the fresh credential.
    ReconnectRequired,
}

impl RenewalMode {
    /// Default delivery mode for a transport type. AMQP renews in-band;
    /// MQTT and HTTPS authenticate only at connect time.
    pub fn default_for(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Amqp => RenewalMode::LiveRenewable,
            TransportKind::Mqtt | TransportKind::Https => RenewalMode::ReconnectRequired,
        }
    }
}

/// A time-bounded proof of identity.
///
/// The token material is opaque to the core; deriving and signing it is the
/// provider's concern.
#[derive(Clone)]
pub struct Credential {
    token: Arc<str>,
    issued_at: Instant,
    expires_at: Instant,
    scope: Identity,
}

impl Credential {
    /// Create a credential valid for `lifetime` from `issued_at`.
    ///
    /// Rejects a zero lifetime: a credential must expire strictly after it
    /// was issued.
    pub fn new(
        token: impl Into<Arc<str>>,
        scope: Identity,
        issued_at: Instant,
        lifetime: Duration,
    ) -> Result<Self> {
        if lifetime.is_zero() {
            return Err(LinkError::InvalidCredential(
                "lifetime must be greater than zero",
            ));
        }
        Ok(Self {
            token: token.into(),
            issued_at,
            expires_at: issued_at + lifetime,
            scope,
        })
    }

    /// The opaque token material.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The identity this credential authenticates.
    pub fn scope(&self) -> &Identity {
        &self.scope
    }

    /// When the credential was issued.
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// When the credential stops being valid.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the credential has already expired.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Whether the credential expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        Instant::now() + window >= self.expires_at
    }

    /// Remaining validity, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Token material stays out of logs.
        f.debug_struct("Credential")
            .field("scope", &self.scope)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// A source of fresh credentials.
///
/// External providers may block and fail; they are governed by their own
/// timeout, independent of retry backoff.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produce a credential for `identity`, valid for roughly `lifetime`.
    ///
    /// Providers that cannot honor a runtime-requested lifetime must return
    /// [`LinkError::UnsupportedOperation`], which the core treats as fatal.
    async fn credential(&self, identity: &Identity, lifetime: Duration) -> Result<Credential>;
}

/// Derives credentials deterministically from a long-lived key.
///
/// The signing function is supplied by the embedder (token cryptography is
/// outside the core); derivation itself performs no I/O and cannot block.
pub struct DerivedKeyProvider {
    sign: Arc<dyn Fn(&Identity, Duration) -> String + Send + Sync>,
}

impl DerivedKeyProvider {
    /// Wrap a signing function mapping (identity, lifetime) to token
    /// material.
    pub fn new(sign: impl Fn(&Identity, Duration) -> String + Send + Sync + 'static) -> Self {
        Self {
            sign: Arc::new(sign),
        }
    }
}

#[async_trait]
impl CredentialProvider for DerivedKeyProvider {
    async fn credential(&self, identity: &Identity, lifetime: Duration) -> Result<Credential> {
        let token = (self.sign)(identity, lifetime);
        Credential::new(token, identity.clone(), Instant::now(), lifetime)
    }
}

/// Tracks the current credential for one identity and renews it.
pub struct TokenLifecycle {
    identity: Identity,
    provider: Arc<dyn CredentialProvider>,
    renewal_skew: Duration,
    requested_lifetime: Duration,
    provider_timeout: Duration,
    current: Mutex<Option<Credential>>,
}

impl TokenLifecycle {
    /// Create a lifecycle for `identity` backed by `provider`.
    pub fn new(
        identity: Identity,
        provider: Arc<dyn CredentialProvider>,
        renewal_skew: Duration,
        requested_lifetime: Duration,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            provider,
            renewal_skew,
            requested_lifetime,
            provider_timeout,
            current: Mutex::new(None),
        }
    }

    /// The lead time before expiry at which proactive renewal triggers.
    pub fn renewal_skew(&self) -> Duration {
        self.renewal_skew
    }

    /// Current credential, renewed in place when inside the renewal window.
    ///
    /// The returned credential is never expired: if renewal fails and the
    /// stale credential has lapsed, the provider failure is surfaced
    /// instead.
    pub async fn current(&self) -> Result<Credential> {
        let mut slot = self.current.lock().await;

        if let Some(credential) = slot.as_ref() {
            if !credential.expires_within(self.renewal_skew) {
                return Ok(credential.clone());
            }
        }

        match self.fetch().await {
            Ok(fresh) => {
                debug!(identity = %self.identity, "credential renewed");
                *slot = Some(fresh.clone());
                Ok(fresh)
            }
            Err(err) => {
                // Keep the stale credential while it is still usable.
                match slot.as_ref() {
                    Some(stale) if !stale.is_expired() => {
                        warn!(identity = %self.identity, error = %err, "renewal failed, keeping stale credential");
                        Ok(stale.clone())
                    }
                    _ => Err(err),
                }
            }
        }
    }

    /// Renew unconditionally. On failure the stale credential is kept and
    /// the provider error is surfaced; the caller decides whether to retry.
    pub async fn renew(&self) -> Result<Credential> {
        let fresh = self.fetch().await?;
        debug!(identity = %self.identity, "credential renewed");
        *self.current.lock().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Whether the active credential has already expired. Used to classify
    /// whether a disconnect was credential-driven.
    pub async fn is_expired(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(Credential::is_expired)
    }

    /// Delay until proactive renewal should fire for `credential`.
    pub fn renewal_due_in(&self, credential: &Credential) -> Duration {
        credential.remaining().saturating_sub(self.renewal_skew)
    }

    async fn fetch(&self) -> Result<Credential> {
        let request = self
            .provider
            .credential(&self.identity, self.requested_lifetime);
        let credential = match timeout(self.provider_timeout, request).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LinkError::Provider(format!(
                    "provider timed out after {:?}",
                    self.provider_timeout
                )));
            }
        };

        if credential.is_expired() {
            return Err(LinkError::Provider(
                "provider returned an already-expired credential".into(),
            ));
        }
        Ok(credential)
    }
}

impl fmt::Debug for TokenLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLifecycle")
            .field("identity", &self.identity)
            .field("renewal_skew", &self.renewal_skew)
            .field("requested_lifetime", &self.requested_lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lifecycle_with(
        provider: Arc<dyn CredentialProvider>,
        skew: Duration,
        lifetime: Duration,
    ) -> TokenLifecycle {
        TokenLifecycle::new(
            Identity::device("d1"),
            provider,
            skew,
            lifetime,
            Duration::from_secs(5),
        )
    }

    struct CountingProvider {
        calls: AtomicU32,
        lifetime: Duration,
        fail: bool,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn credential(&self, identity: &Identity, _: Duration) -> Result<Credential> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LinkError::Provider("unavailable".into()));
            }
            Credential::new(
                format!("token-{call}"),
                identity.clone(),
                Instant::now(),
                self.lifetime,
            )
        }
    }

    #[test]
    fn test_credential_rejects_zero_lifetime() {
        let err = Credential::new(
            "t",
            Identity::device("d1"),
            Instant::now(),
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::InvalidCredential(_)));
    }

    #[test]
    fn test_credential_expiry_window() {
        let credential = Credential::new(
            "t",
            Identity::device("d1"),
            Instant::now(),
            Duration::from_secs(60),
        )
        .unwrap();

        assert!(!credential.is_expired());
        assert!(!credential.expires_within(Duration::from_secs(30)));
        assert!(credential.expires_within(Duration::from_secs(120)));
        assert!(credential.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential::new(
            "very-secret",
            Identity::device("d1"),
            Instant::now(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(!format!("{credential:?}").contains("very-secret"));
    }

    #[tokio::test]
    async fn test_current_reuses_fresh_credential() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            lifetime: Duration::from_secs(3600),
            fail: false,
        });
        let lifecycle = lifecycle_with(
            provider.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );

        let first = lifecycle.current().await.unwrap();
        let second = lifecycle.current().await.unwrap();
        assert_eq!(first.token(), second.token());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_current_renews_inside_skew_window() {
        // Lifetime shorter than the skew: every call is inside the window.
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            lifetime: Duration::from_secs(1),
            fail: false,
        });
        let lifecycle = lifecycle_with(
            provider.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );

        let first = lifecycle.current().await.unwrap();
        let second = lifecycle.current().await.unwrap();
        assert_ne!(first.token(), second.token());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_stale_credential() {
        let good = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            lifetime: Duration::from_secs(2),
            fail: false,
        });
        let lifecycle = lifecycle_with(good, Duration::from_secs(5), Duration::from_secs(2));
        let stale = lifecycle.current().await.unwrap();

        // Swap in a failing provider by building a new lifecycle that
        // shares the slot semantics: renew() must keep the stale value.
        let failing = lifecycle_with(
            Arc::new(CountingProvider {
                calls: AtomicU32::new(0),
                lifetime: Duration::from_secs(2),
                fail: true,
            }),
            Duration::from_secs(5),
            Duration::from_secs(2),
        );
        *failing.current.lock().await = Some(stale.clone());

        // Renewal fails, but the stale credential is still valid, so
        // current() falls back to it.
        let kept = failing.current().await.unwrap();
        assert_eq!(kept.token(), stale.token());
        assert!(failing.renew().await.is_err());
        assert_eq!(
            failing.current.lock().await.as_ref().unwrap().token(),
            stale.token()
        );
    }

    #[tokio::test]
    async fn test_provider_failure_with_expired_stale_surfaces_error() {
        let lifecycle = lifecycle_with(
            Arc::new(CountingProvider {
                calls: AtomicU32::new(0),
                lifetime: Duration::from_secs(2),
                fail: true,
            }),
            Duration::from_secs(5),
            Duration::from_secs(2),
        );
        let expired = Credential::new(
            "old",
            Identity::device("d1"),
            Instant::now() - Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .unwrap();
        *lifecycle.current.lock().await = Some(expired);

        let err = lifecycle.current().await.unwrap_err();
        assert!(matches!(err, LinkError::Provider(_)));
        assert!(lifecycle.is_expired().await);
    }

    #[test]
    fn test_default_renewal_modes() {
        assert_eq!(
            RenewalMode::default_for(TransportKind::Amqp),
            RenewalMode::LiveRenewable
        );
        assert_eq!(
            RenewalMode::default_for(TransportKind::Mqtt),
            RenewalMode::ReconnectRequired
        );
        assert_eq!(
            RenewalMode::default_for(TransportKind::Https),
            RenewalMode::ReconnectRequired
        );
    }

    #[tokio::test]
    async fn test_derived_key_provider_is_deterministic() {
        let provider = DerivedKeyProvider::new(|identity, lifetime| {
            format!("{identity}:{}", lifetime.as_secs())
        });
        let identity = Identity::device("d1");
        let credential = provider
            .credential(&identity, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(credential.token(), "d1:60");
        assert_eq!(credential.scope(), &identity);
    }
}
