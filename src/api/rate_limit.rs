//! Per-source request-spacing middleware.
//!
//! The limiter enforces a minimum interval between requests from one source
//! IP. A request arriving before the interval has elapsed is rejected with:
//! - `429 Too Many Requests`
//! - `Retry-After: <seconds>` — exact wait until the source is admitted again
//!
//! Disabled entirely when no `rate_limit_ms` is configured (the common case
//! for a loopback-only deployment).

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use crate::facade::RouterFacade;

/// Tracks the last admitted request per source IP.
pub struct RateSpacer {
    min_interval: Duration,
    last_seen: DashMap<IpAddr, Instant>,
}

impl RateSpacer {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            last_seen: DashMap::new(),
        }
    }

    /// Admit or reject a request from `ip`.
    ///
    /// Returns `Err(retry_after_secs)` when the source must wait.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        match self.last_seen.entry(ip) {
            dashmap::Entry::Occupied(mut entry) => {
                let elapsed = now.duration_since(*entry.get());
                if elapsed < self.min_interval {
                    let wait = self.min_interval - elapsed;
                    return Err(wait.as_secs_f64().ceil() as u64);
                }
                entry.insert(now);
                Ok(())
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(now);
                Ok(())
            }
        }
    }
}

/// Axum middleware enforcing the spacing. No-op when the limiter is disabled.
/// Falls back to `127.0.0.1` if `ConnectInfo` is unavailable (e.g. in tests).
pub async fn rate_limit_middleware(
    State(facade): State<Arc<RouterFacade>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(spacer) = &facade.rate_spacer {
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip())
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

        if let Err(retry_after) = spacer.check(ip) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("retry-after", retry_after.to_string()),
                    ("content-type", "text/plain".into()),
                ],
                "Request spacing limit exceeded. Please retry after the indicated delay.",
            )
                .into_response();
        }
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, a))
    }

    #[test]
    fn first_request_is_always_admitted() {
        let spacer = RateSpacer::new(1_000);
        assert!(spacer.check(ip(1)).is_ok());
    }

    #[test]
    fn immediate_second_request_is_rejected_with_retry_after() {
        let spacer = RateSpacer::new(60_000);
        let source = ip(2);
        assert!(spacer.check(source).is_ok());
        let retry = spacer.check(source).unwrap_err();
        assert!(retry >= 1, "retry-after must be at least a second, got {retry}");
    }

    #[test]
    fn spacing_elapsed_admits_again() {
        let spacer = RateSpacer::new(10);
        let source = ip(3);
        assert!(spacer.check(source).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert!(spacer.check(source).is_ok());
    }

    #[test]
    fn sources_are_tracked_independently() {
        let spacer = RateSpacer::new(60_000);
        assert!(spacer.check(ip(10)).is_ok());
        assert!(spacer.check(ip(11)).is_ok(), "a different source is unaffected");
    }
}
