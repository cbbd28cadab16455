pub mod bridge;
pub mod handlers;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Ws,
    Xhttp,
    HttpUpgrade,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ws => "ws",
            TransportKind::Xhttp => "xhttp",
            TransportKind::HttpUpgrade => "httpupgrade",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ws" => Some(TransportKind::Ws),
            "xhttp" => Some(TransportKind::Xhttp),
            "httpupgrade" => Some(TransportKind::HttpUpgrade),
            _ => None,
        }
    }
}

/// Resolve the transport for this request: `transport` query param, then
/// `x-transport-type` header, then a leading path-prefix segment
/// (`/ws`, `/xhttp`, `/httpupgrade`), falling back to the configured
/// default.
pub fn resolve_transport(path: &str, query: Option<&str>, headers: &HeaderMap, default: &str) -> TransportKind {
    if let Some(q) = query {
        for pair in q.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == "transport" {
                    if let Some(t) = TransportKind::parse(v) {
                        return t;
                    }
                }
            }
        }
    }
    if let Some(h) = headers.get("x-transport-type").and_then(|v| v.to_str().ok()) {
        if let Some(t) = TransportKind::parse(h) {
            return t;
        }
    }
    let trimmed = path.trim_start_matches('/');
    let first_segment = trimmed.split('/').next().unwrap_or("");
    if let Some(t) = TransportKind::parse(first_segment) {
        return t;
    }
    TransportKind::parse(default).unwrap_or(TransportKind::Xhttp)
}

/// Strips a leading `/ws`, `/xhttp`, or `/httpupgrade` prefix segment from
/// the path, if present. `/ws` alone becomes `/`.
pub fn strip_transport_prefix(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let first = parts.next().unwrap_or("");
    if TransportKind::parse(first).is_some() {
        match parts.next() {
            Some(rest) => format!("/{rest}"),
            None => "/".to_string(),
        }
    } else {
        path.to_string()
    }
}

/// Removes the `transport` query parameter and `x-transport-type` header
/// so the upstream never sees the selectors used to route here.
pub fn strip_selector_query(query: &str) -> Option<String> {
    let remaining: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.starts_with("transport="))
        .collect();
    if remaining.is_empty() {
        None
    } else {
        Some(remaining.join("&"))
    }
}

pub fn strip_selector_headers(headers: &mut HeaderMap) {
    headers.remove("x-transport-type");
}

/// Resolves the real client IP behind a trusted reverse proxy: prefers
/// `cf-connecting-ip`, then the left-most `x-forwarded-for` entry, then
/// `x-real-ip`, falling back to `"unknown"` when none are present or parse.
pub fn resolve_client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers
        .get("cf-connecting-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    "unknown".to_string()
}

/// Sanitizes a close code to the permitted range, falling back to 1011.
pub fn sanitize_close_code(code: u16) -> u16 {
    if (1000..=4999).contains(&code) && code != 1005 && code != 1006 {
        code
    } else {
        1011
    }
}

pub fn truncate_reason(reason: &str) -> HeaderValue {
    let bytes = reason.as_bytes();
    let truncated = if bytes.len() > 123 { &bytes[..123] } else { bytes };
    HeaderValue::from_bytes(truncated).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn test_resolve_from_query() {
        let headers = HeaderMap::new();
        let t = resolve_transport("/", Some("transport=ws"), &headers, "xhttp");
        assert_eq!(t, TransportKind::Ws);
    }

    #[test]
    fn test_resolve_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-transport-type", "httpupgrade".parse().unwrap());
        let t = resolve_transport("/", None, &headers, "xhttp");
        assert_eq!(t, TransportKind::HttpUpgrade);
    }

    #[test]
    fn test_resolve_from_path_prefix() {
        let headers = HeaderMap::new();
        let t = resolve_transport("/xhttp/foo", None, &headers, "ws");
        assert_eq!(t, TransportKind::Xhttp);
    }

    #[test]
    fn test_resolve_default() {
        let headers = HeaderMap::new();
        let t = resolve_transport("/foo/bar", None, &headers, "ws");
        assert_eq!(t, TransportKind::Ws);
    }

    #[test]
    fn test_strip_prefix_with_remainder() {
        assert_eq!(strip_transport_prefix("/ws/foo/bar"), "/foo/bar");
    }

    #[test]
    fn test_strip_prefix_alone() {
        assert_eq!(strip_transport_prefix("/ws"), "/");
    }

    #[test]
    fn test_strip_prefix_no_match() {
        assert_eq!(strip_transport_prefix("/foo/bar"), "/foo/bar");
    }

    #[test]
    fn test_resolve_client_ip_prefers_cf_connecting_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "1.1.1.1".parse().unwrap());
        headers.insert("x-forwarded-for", "2.2.2.2, 3.3.3.3".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers), "1.1.1.1");
    }

    #[test]
    fn test_resolve_client_ip_falls_back_to_leftmost_xff() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "2.2.2.2, 3.3.3.3".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers), "2.2.2.2");
    }

    #[test]
    fn test_resolve_client_ip_falls_back_to_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "4.4.4.4".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers), "4.4.4.4");
    }

    #[test]
    fn test_resolve_client_ip_unknown_when_absent() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_client_ip(&headers), "unknown");
    }

    #[test]
    fn test_sanitize_close_code() {
        assert_eq!(sanitize_close_code(1000), 1000);
        assert_eq!(sanitize_close_code(1005), 1011);
        assert_eq!(sanitize_close_code(1006), 1011);
        assert_eq!(sanitize_close_code(999), 1011);
        assert_eq!(sanitize_close_code(5000), 1011);
    }
}
