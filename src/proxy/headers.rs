//! Header names and rewriting rules for forwarded traffic.
//!
//! Identity headers are server-derived only. Whatever the caller sent under
//! those names is dropped before the downstream sees the request; the
//! correlation id is the one inbound header that survives, and only after
//! it proves usable.

use http::header::{HeaderMap, HeaderValue};
use tracing::debug;
use uuid::Uuid;

use crate::identity::RequestIdentity;

/// Reused from the inbound request when present, generated otherwise.
pub const X_CORRELATION_ID: &str = "x-correlation-id";
/// Peer address of the connection, set by the gateway.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Authenticated subject id, set by the gateway.
pub const X_USER_ID: &str = "x-user-id";
/// Role claim of the authenticated subject, set by the gateway.
pub const X_USER_ROLE: &str = "x-user-role";

pub const X_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Window reset time in epoch seconds.
pub const X_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Pick the correlation id for this request: the inbound one when it is
/// non-empty visible ASCII, a fresh v4 uuid otherwise.
pub(crate) fn correlation_id(inbound: &HeaderMap) -> String {
    inbound
        .get(X_CORRELATION_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Rewrite `headers` for forwarding: strip whatever the caller sent under
/// the gateway-owned names, then attach the server-derived values.
pub(crate) fn apply_forwarding(
    headers: &mut HeaderMap,
    identity: &RequestIdentity,
    correlation_id: &str,
) {
    headers.remove(X_CORRELATION_ID);
    headers.remove(X_FORWARDED_FOR);
    headers.remove(X_USER_ID);
    headers.remove(X_USER_ROLE);

    insert_str(headers, X_CORRELATION_ID, correlation_id);
    insert_str(headers, X_FORWARDED_FOR, &identity.peer_addr.to_string());
    if let Some(subject) = &identity.subject_id {
        insert_str(headers, X_USER_ID, subject);
    }
    if let Some(role) = &identity.role {
        insert_str(headers, X_USER_ROLE, role);
    }
}

/// Quota headers carried on every decided response, admitted or denied.
pub(crate) fn apply_quota(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    reset_at_millis: u64,
) {
    insert_str(headers, X_RATE_LIMIT_LIMIT, &limit.to_string());
    insert_str(headers, X_RATE_LIMIT_REMAINING, &remaining.to_string());
    insert_str(headers, X_RATE_LIMIT_RESET, &reset_at_millis.div_ceil(1000).to_string());
}

pub(crate) fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = name, "dropping unrepresentable header value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn inbound_correlation_id_is_reused() {
        let mut headers = HeaderMap::new();
        headers.insert(X_CORRELATION_ID, HeaderValue::from_static("req-8842"));
        assert_eq!(correlation_id(&headers), "req-8842");
    }

    #[test]
    fn missing_or_empty_correlation_id_is_generated() {
        let generated = correlation_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&generated).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(X_CORRELATION_ID, HeaderValue::from_static(""));
        assert!(Uuid::parse_str(&correlation_id(&headers)).is_ok());
    }

    #[test]
    fn forwarding_strips_spoofed_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(X_USER_ID, HeaderValue::from_static("intruder"));
        headers.insert(X_USER_ROLE, HeaderValue::from_static("admin"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.9.9.9"));

        let identity = RequestIdentity::anonymous(peer());
        apply_forwarding(&mut headers, &identity, "cid-1");

        assert!(headers.get(X_USER_ID).is_none());
        assert!(headers.get(X_USER_ROLE).is_none());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
        assert_eq!(headers.get(X_CORRELATION_ID).unwrap(), "cid-1");
    }

    #[test]
    fn forwarding_attaches_resolved_identity() {
        let mut headers = HeaderMap::new();
        let identity = RequestIdentity::authenticated("u-42", peer()).with_role("editor");
        apply_forwarding(&mut headers, &identity, "cid-2");

        assert_eq!(headers.get(X_USER_ID).unwrap(), "u-42");
        assert_eq!(headers.get(X_USER_ROLE).unwrap(), "editor");
    }

    #[test]
    fn quota_headers_render_numbers_and_reset_seconds() {
        let mut headers = HeaderMap::new();
        apply_quota(&mut headers, 100, 37, 1_700_000_500_250);

        assert_eq!(headers.get(X_RATE_LIMIT_LIMIT).unwrap(), "100");
        assert_eq!(headers.get(X_RATE_LIMIT_REMAINING).unwrap(), "37");
        assert_eq!(headers.get(X_RATE_LIMIT_RESET).unwrap(), "1700000501");
    }
}
