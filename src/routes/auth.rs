use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::services::auth::{SignatureHeaders, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Largest body the middleware will buffer for signature checks.
const MAX_SIGNED_BODY_BYTES: usize = 1024 * 1024;

/// Reject requests without a valid HMAC signature.
///
/// The body is buffered so it can be part of the signed string, then handed
/// on to the handler unchanged.
pub async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(auth) = state.auth.clone() else {
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();
    if auth.is_exempt(&path) {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES)
        .await
        .map_err(|e| AppError::Validation(format!("Unreadable request body: {e}")))?;
    let body_text = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::Validation("Request body must be UTF-8".into()))?;

    let headers = SignatureHeaders {
        signature: parts.headers.get(SIGNATURE_HEADER).map(|v| v.as_bytes()),
        timestamp: parts.headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()),
    };

    if let Err(e) = auth.verify(parts.method.as_str(), &path, headers, body_text) {
        metrics::counter!("auth_rejections_total", "reason" => e.to_string()).increment(1);
        tracing::warn!(method = %parts.method, path = %path, reason = %e, "Rejected request signature");
        return Err(e.into());
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
