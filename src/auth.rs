//! Stream admission authentication.
//!
//! The core only depends on the narrow [`AuthGate`] contract. The gateway
//! binary ships [`StaticTokenGate`], which accepts a fixed set of bearer
//! tokens from configuration; deployments with a real identity provider
//! plug in their own implementation.

use std::fmt;
use std::net::IpAddr;

use subtle::ConstantTimeEq;

/// Outcome of an [`AuthGate::validate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerdict {
    /// Whether the token is accepted.
    pub valid: bool,
    /// Human-readable rejection reason when `valid` is `false`.
    pub error: Option<String>,
}

impl AuthVerdict {
    /// An accepting verdict.
    #[must_use]
    pub const fn accept() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    /// A rejecting verdict with the given reason.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Token validation collaborator consulted on every admission.
pub trait AuthGate: Send + Sync {
    /// Validates a bearer token presented from `source_ip`.
    fn validate(&self, token: &str, source_ip: IpAddr) -> AuthVerdict;
}

/// Accepts any token from a fixed allow-list.
///
/// Comparison is constant-time per candidate. An empty allow-list rejects
/// every token.
#[derive(Clone, Default)]
pub struct StaticTokenGate {
    tokens: Vec<String>,
}

impl StaticTokenGate {
    /// Creates a gate accepting the given tokens. Blank entries are ignored.
    #[must_use]
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.trim().is_empty())
            .collect();
        Self { tokens }
    }

    /// Number of accepted tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if no token is accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Debug for StaticTokenGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenGate")
            .field("tokens", &format_args!("[{} redacted]", self.tokens.len()))
            .finish()
    }
}

impl AuthGate for StaticTokenGate {
    fn validate(&self, token: &str, source_ip: IpAddr) -> AuthVerdict {
        if token.is_empty() {
            tracing::debug!(%source_ip, "stream token missing");
            return AuthVerdict::reject("missing token");
        }
        let known = self
            .tokens
            .iter()
            .fold(false, |found, candidate| {
                found | bool::from(candidate.as_bytes().ct_eq(token.as_bytes()))
            });
        if known {
            AuthVerdict::accept()
        } else {
            tracing::debug!(%source_ip, "stream token rejected");
            AuthVerdict::reject("invalid token")
        }
    }
}
