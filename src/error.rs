//! Domain error taxonomy shared by every component.
//!
//! The router and the route controller match on these variants directly —
//! never on a formatted message — so fallback behaviour never depends on
//! string contents (see `CoreError::is_retryable` and the `ForwardFailed`
//! reason below).

use thiserror::Error;

/// Reason carried by a `forward_failed:{reason}` error from an external-onion
/// style transport. Drives the router's fallback-ladder selection in §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardFailReason {
    NoRouteTarget,
    NoRoute,
    ProxyUnreachable,
    NoProxy,
    Other,
}

impl ForwardFailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardFailReason::NoRouteTarget => "no_route_target",
            ForwardFailReason::NoRoute => "no_route",
            ForwardFailReason::ProxyUnreachable => "proxy_unreachable",
            ForwardFailReason::NoProxy => "no_proxy",
            ForwardFailReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "no_route_target" => ForwardFailReason::NoRouteTarget,
            "no_route" => ForwardFailReason::NoRoute,
            "proxy_unreachable" => ForwardFailReason::ProxyUnreachable,
            "no_proxy" => ForwardFailReason::NoProxy,
            _ => ForwardFailReason::Other,
        }
    }
}

impl std::fmt::Display for ForwardFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Missing destination, invalid proxy URL, destination cannot be routed.
    /// Never retried via the outbox.
    #[error("fatal misconfiguration: {0}")]
    FatalMisconfig(String),

    /// Transient inability to deliver now; outbox retains the record.
    #[error("retryable send failure: {0}")]
    RetryableSendFailure(String),

    #[error("tor transport not ready")]
    TorNotReady,

    #[error("internal onion circuit not ready")]
    InternalOnionNotReady,

    #[error("request aborted: timeout")]
    AbortedTimeout,

    #[error("request aborted: parent cancelled")]
    AbortedParent,

    #[error("forward failed: {0}")]
    ForwardFailed(ForwardFailReason),

    #[error("direct channel not open")]
    DirectNotOpen,

    #[error("sync code expired")]
    PairingExpired,

    #[error("sync code already used")]
    PairingReused,

    #[error("http error: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether this error should count toward the route controller's rolling
    /// failure-rate and fail-streak statistics (§4.6, §7.1). `FatalMisconfig`
    /// never reaches the outbox or the route controller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RetryableSendFailure(_)
                | CoreError::AbortedTimeout
                | CoreError::AbortedParent
                | CoreError::ForwardFailed(_)
                | CoreError::TorNotReady
                | CoreError::InternalOnionNotReady
                | CoreError::DirectNotOpen
                | CoreError::Http(_)
        )
    }

    pub fn forward_failed(reason: &str) -> Self {
        CoreError::ForwardFailed(ForwardFailReason::parse(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_misconfig_is_not_retryable() {
        assert!(!CoreError::FatalMisconfig("no destination".into()).is_retryable());
    }

    #[test]
    fn forward_failed_round_trips_reason() {
        let e = CoreError::forward_failed("no_route_target");
        match e {
            CoreError::ForwardFailed(r) => assert_eq!(r.as_str(), "no_route_target"),
            _ => panic!("expected ForwardFailed"),
        }
    }

    #[test]
    fn unknown_forward_reason_maps_to_other() {
        assert_eq!(ForwardFailReason::parse("whatever"), ForwardFailReason::Other);
    }
}
