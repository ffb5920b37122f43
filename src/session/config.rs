//! Session and multiplexer configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::token::RenewalMode;

/// Keep-alive configuration, consumed by transport adapters.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between keep-alive probes.
    pub interval: Duration,
    /// Timeout waiting for a probe response.
    pub timeout: Duration,
    /// Failed probes before the connection is considered dead.
    pub probes: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            probes: 3,
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Retry policy governing reopen attempts.
    pub retry_policy: RetryPolicy,
    /// Lead time before credential expiry at which proactive renewal fires.
    pub renewal_skew: Duration,
    /// Credential lifetime requested from the provider.
    pub requested_lifetime: Duration,
    /// Timeout on credential-provider calls, independent of retry backoff.
    pub provider_timeout: Duration,
    /// Timeout on a single open or reopen attempt.
    pub open_timeout: Duration,
    /// Credential-renewal delivery mode. `None` selects the default for the
    /// session's transport type.
    pub renewal_mode: Option<RenewalMode>,
    /// Keep-alive settings handed to the transport adapter.
    pub keep_alive: Option<KeepAliveConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            renewal_skew: Duration::from_secs(120),
            requested_lifetime: Duration::from_secs(3600),
            provider_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(60),
            renewal_mode: None,
            keep_alive: Some(KeepAliveConfig::default()),
        }
    }
}

impl SessionConfig {
    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the renewal skew.
    pub fn with_renewal_skew(mut self, skew: Duration) -> Self {
        self.renewal_skew = skew;
        self
    }

    /// Set the credential lifetime requested from the provider.
    pub fn with_requested_lifetime(mut self, lifetime: Duration) -> Self {
        self.requested_lifetime = lifetime;
        self
    }

    /// Set the credential-provider timeout.
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Set the per-attempt open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Force a renewal delivery mode instead of the transport default.
    pub fn with_renewal_mode(mut self, mode: RenewalMode) -> Self {
        self.renewal_mode = Some(mode);
        self
    }

    /// Set the keep-alive configuration.
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Disable keep-alive probes.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }
}

/// Multiplexed-connection configuration.
#[derive(Debug, Clone)]
pub struct MultiplexConfig {
    /// Maximum number of sessions sharing the connection.
    pub max_sessions: usize,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self { max_sessions: 1000 }
    }
}

impl MultiplexConfig {
    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}
