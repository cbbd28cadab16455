use std::fmt;

/// Request-path errors that carry an HTTP status back to the client.
///
/// Mirrors the outcomes enumerated in the error-handling design: admission
/// denials, upstream handshake/transport failures, and size-cap violations
/// each map to a fixed status.
#[derive(Debug)]
pub enum GatewayError {
    /// Per-request backend URL was syntactically invalid.
    Config(String),
    /// IP rate limiter rejected the connection. Carries `Retry-After` seconds.
    RateLimited { retry_after_secs: u64 },
    /// Identity-session manager rejected the connection.
    IdentityLimited,
    /// Upstream handshake/transport failed on every retry attempt.
    UpstreamFailure { last_status: Option<u16>, detail: String },
    /// Subscription fetch exceeded the byte cap.
    SizeLimitExceeded,
    /// Subscription fetch timed out.
    UpstreamTimeout,
    /// Subscription fetch could not reach the upstream at all.
    UpstreamUnreachable(String),
    /// Malformed client input (bad `ed`, bad `mode`, non-GET upgrade, ...).
    BadRequest(String),
    /// Method not allowed on a route that only accepts GET.
    MethodNotAllowed,
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Config(_) => 500,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::IdentityLimited => 403,
            GatewayError::UpstreamFailure { .. } => 502,
            GatewayError::SizeLimitExceeded => 502,
            GatewayError::UpstreamTimeout => 502,
            GatewayError::UpstreamUnreachable(_) => 502,
            GatewayError::BadRequest(_) => 400,
            GatewayError::MethodNotAllowed => 405,
            GatewayError::Internal(_) => 500,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "configuration error: {msg}"),
            GatewayError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            GatewayError::IdentityLimited => write!(f, "identity session limit reached"),
            GatewayError::UpstreamFailure { last_status, detail } => {
                write!(f, "upstream failure (status={last_status:?}): {detail}")
            }
            GatewayError::SizeLimitExceeded => write!(f, "size limit exceeded"),
            GatewayError::UpstreamTimeout => write!(f, "timed out"),
            GatewayError::UpstreamUnreachable(msg) => write!(f, "unable to reach: {msg}"),
            GatewayError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            GatewayError::MethodNotAllowed => write!(f, "method not allowed"),
            GatewayError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}
