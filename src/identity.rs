//! Resolved request identity and admission-key derivation.
//!
//! The gateway's authentication middleware resolves who the caller is before
//! admission control runs. This module only consumes that result; nothing
//! here reads or trusts inbound headers.

use std::fmt;
use std::net::IpAddr;

/// Identity context attached to an inbound request by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Stable subject id when the caller authenticated.
    pub subject_id: Option<String>,
    /// Optional role claim, forwarded to the downstream.
    pub role: Option<String>,
    /// Network peer the connection came from.
    pub peer_addr: IpAddr,
}

impl RequestIdentity {
    pub fn authenticated(subject_id: impl Into<String>, peer_addr: IpAddr) -> Self {
        Self { subject_id: Some(subject_id.into()), role: None, peer_addr }
    }

    pub fn anonymous(peer_addr: IpAddr) -> Self {
        Self { subject_id: None, role: None, peer_addr }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.subject_id.is_some()
    }
}

/// Key addressing one logical quota counter.
///
/// Derived as `{environment}:ratelimit:user:{subject}` for authenticated
/// callers and `{environment}:ratelimit:ip:{addr}` otherwise, so the two
/// classes never share a counter and staging never collides with prod in a
/// shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn derive(environment: &str, identity: &RequestIdentity) -> Self {
        match &identity.subject_id {
            Some(subject) => Self(format!("{environment}:ratelimit:user:{subject}")),
            None => Self(format!("{environment}:ratelimit:ip:{}", identity.peer_addr)),
        }
    }

    /// Escape hatch for callers with their own key scheme (API tokens,
    /// per-route buckets). The caller owns collision avoidance.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
