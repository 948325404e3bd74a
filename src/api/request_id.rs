//! Request correlation IDs.
//!
//! Every inbound request gets an `X-Request-ID`: the caller's, when one is
//! presented and sane, or a fresh UUID otherwise. The ID is stored as an
//! axum [`Extension`], echoed in the response header, and attached to a
//! tracing span so the conversation log, server log, and client response can
//! all be correlated through one identifier.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

const HEADER: &str = "x-request-id";

/// Caller-supplied IDs longer than this are replaced, not truncated —
/// an oversized value is more likely garbage than an identifier.
const MAX_CALLER_ID_LEN: usize = 64;

/// Newtype wrapper carrying the assigned request ID, readable from any
/// handler via `Extension<RequestId>`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Axum middleware assigning a [`RequestId`] to every request.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_CALLER_ID_LEN)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::debug_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(HEADER, header_value);
    }

    response
}
