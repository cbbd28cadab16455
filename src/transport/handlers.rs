use super::bridge::{spawn_bridge, Disconnector};
use super::{full_body, strip_selector_headers, ProxyBody, TransportKind};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_EARLY_DATA_BYTES: usize = 65_536;

pub struct HandlerOutcome {
    pub response: Option<Response<ProxyBody>>,
    /// Set when a bridge was spawned; the driver wires this into the
    /// admission-release path so counters drop exactly once on teardown.
    pub disconnector: Option<Disconnector>,
    pub failure: Option<Failure>,
}

pub struct Failure {
    pub status: Option<u16>,
    pub detail: String,
}

fn origin_host_port(origin: &str) -> Option<(String, u16, bool)> {
    let uri: Uri = origin.parse().ok()?;
    let tls = uri.scheme_str() == Some("https");
    let host = uri.host()?.to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Some((host, port, tls))
}

fn rebuild_target_uri(origin: &str, path_and_query: &str) -> Option<Uri> {
    format!("{}{}", origin.trim_end_matches('/'), path_and_query)
        .parse()
        .ok()
}

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_header = req.headers().contains_key(http::header::UPGRADE);
    let connection_says_upgrade = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_header && connection_says_upgrade
}

fn failure(status: Option<u16>, detail: impl Into<String>) -> HandlerOutcome {
    HandlerOutcome {
        response: None,
        disconnector: None,
        failure: Some(Failure { status, detail: detail.into() }),
    }
}

fn responded(response: Response<ProxyBody>) -> HandlerOutcome {
    HandlerOutcome {
        response: Some(response),
        disconnector: None,
        failure: None,
    }
}

/// Forwards a non-upgrade request to `origin` as a normal HTTP passthrough.
/// Terminal: the request body is consumed here, so this is never retried
/// against a second backend.
pub async fn handle_passthrough(req: Request<Incoming>, origin: &str) -> HandlerOutcome {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let Some(target_uri) = rebuild_target_uri(origin, &path_and_query) else {
        return failure(None, format!("invalid backend origin: {origin}"));
    };

    let client = reqwest::Client::new();
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    headers.remove(http::header::HOST);
    strip_selector_headers(&mut headers);

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return failure(None, format!("failed to read request body: {e}")),
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client
        .request(reqwest_method, target_uri.to_string())
        .timeout(PASSTHROUGH_TIMEOUT)
        .body(body_bytes.to_vec());
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }

    match timeout(PASSTHROUGH_TIMEOUT, builder.send()).await {
        Ok(Ok(resp)) => {
            let status = resp.status();
            let mut response_builder = Response::builder().status(status);
            for (name, value) in resp.headers().iter() {
                response_builder = response_builder.header(name, value);
            }
            let bytes = resp.bytes().await.unwrap_or_default();
            responded(response_builder.body(full_body(bytes)).unwrap_or_else(|_| {
                Response::builder().status(502).body(super::empty_body()).unwrap()
            }))
        }
        Ok(Err(e)) => failure(None, format!("passthrough error: {e}")),
        Err(_) => failure(None, "passthrough timed out"),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// Parses the xhttp `ed` query parameter: absent means no early-data budget
/// (the `Sec-WebSocket-Protocol` token is never consumed), present-and-valid
/// is capped at `MAX_EARLY_DATA_BYTES`, present-and-unparseable is rejected.
fn parse_ed_param(ed_param: Option<&str>) -> Result<usize, ()> {
    match ed_param {
        None => Ok(0),
        Some(v) => v.parse::<usize>().map(|n| n.min(MAX_EARLY_DATA_BYTES)).map_err(|_| ()),
    }
}

/// Extracts a decodable early-data payload from the first `Sec-WebSocket-Protocol`
/// token, per the xhttp early-data rule: single token, not a known
/// protocol-negotiation name, canonical base64url, decodes within `ed`.
fn extract_early_data<B>(req: &Request<B>, ed_limit: usize) -> Option<Bytes> {
    let raw = req
        .headers()
        .get("sec-websocket-protocol")?
        .to_str()
        .ok()?
        .trim();
    if raw.contains(',') || raw.is_empty() {
        return None;
    }
    if matches!(raw, "trojan" | "vless" | "vmess") {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(raw).ok()?;
    if URL_SAFE_NO_PAD.encode(&decoded) != raw {
        return None;
    }
    if decoded.len() > ed_limit {
        return None;
    }
    Some(Bytes::from(decoded))
}

/// Drives one upgrade attempt against `origin`. The client's upgrade
/// extension is claimed only after the upstream handshake succeeds, so a
/// caller whose attempt fails can retry this same `req` against a
/// different origin without having lost anything.
pub async fn handle_upgrade(
    req: &mut Request<Incoming>,
    origin: &str,
    kind: TransportKind,
    on_closed: impl Fn() + Send + Sync + 'static,
) -> HandlerOutcome {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let Some(target_uri) = rebuild_target_uri(origin, &path_and_query) else {
        return failure(None, format!("invalid backend origin: {origin}"));
    };

    if req.method() != http::Method::GET {
        return responded(bad_request("upgrade requires GET"));
    }
    strip_selector_headers(req.headers_mut());

    let mut early_data = None;
    if kind == TransportKind::Xhttp {
        if let Some(mode) = req
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("mode=")))
            .or_else(|| req.headers().get("x-xhttp-mode").and_then(|v| v.to_str().ok()))
        {
            if mode != "auto" && mode != "packet-up" {
                return responded(bad_request("unknown xhttp mode"));
            }
        }
        let ed_param = req
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("ed=")));
        let ed = match parse_ed_param(ed_param) {
            Ok(limit) => limit,
            Err(()) => return responded(bad_request("invalid ed parameter")),
        };
        early_data = extract_early_data(req, ed);
        if early_data.is_some() {
            req.headers_mut().remove("sec-websocket-protocol");
        }
    }

    run_handshake(req, origin, target_uri, kind, early_data, on_closed).await
}

async fn run_handshake(
    req: &mut Request<Incoming>,
    origin: &str,
    target_uri: Uri,
    kind: TransportKind,
    early_data: Option<Bytes>,
    on_closed: impl Fn() + Send + Sync + 'static,
) -> HandlerOutcome {
    let Some((host, port, _tls)) = origin_host_port(origin) else {
        return failure(None, "invalid origin for upgrade");
    };

    let mut upstream_req_builder = Request::builder().method(http::Method::GET).uri(target_uri);
    for (name, value) in req.headers().iter() {
        if name == http::header::HOST || name == http::header::SEC_WEBSOCKET_EXTENSIONS {
            continue;
        }
        upstream_req_builder = upstream_req_builder.header(name, value.clone());
    }
    upstream_req_builder = upstream_req_builder.header(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
    let upgrade_token = if kind == TransportKind::HttpUpgrade {
        req.headers()
            .get(http::header::UPGRADE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("websocket"))
    } else {
        HeaderValue::from_static("websocket")
    };
    upstream_req_builder = upstream_req_builder.header(http::header::UPGRADE, upgrade_token);

    let upstream_req = match upstream_req_builder.body(Empty::<Bytes>::new()) {
        Ok(r) => r,
        Err(e) => return failure(None, format!("bad upstream request: {e}")),
    };

    let started = std::time::Instant::now();
    let attempt_result = timeout(HANDSHAKE_TIMEOUT, async {
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.with_upgrades().await;
        });
        let resp = sender.send_request(upstream_req).await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(resp)
    })
    .await;
    crate::metrics::record_upgrade_handshake_seconds(started.elapsed().as_secs_f64());

    let resp = match attempt_result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return failure(None, format!("handshake error: {e}")),
        Err(_) => return failure(None, "handshake timed out"),
    };

    if resp.status() != http::StatusCode::SWITCHING_PROTOCOLS {
        let status = resp.status().as_u16();
        return failure(Some(status), format!("non-101 upstream status {status}"));
    }

    let upstream_upgraded = match hyper::upgrade::on(resp).await {
        Ok(u) => u,
        Err(e) => return failure(Some(101), format!("upstream upgrade negotiation failed: {e}")),
    };

    let mut response_builder = Response::builder()
        .status(http::StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::CONNECTION, "Upgrade")
        .header(http::header::UPGRADE, "websocket");
    if let Some(proto) = req.headers().get("sec-websocket-protocol") {
        response_builder = response_builder.header("sec-websocket-protocol", proto.clone());
    }
    let response = response_builder.body(super::empty_body()).unwrap();

    let client_upgraded = match hyper::upgrade::on(req).await {
        Ok(u) => u,
        Err(e) => return failure(Some(101), format!("client upgrade negotiation failed: {e}")),
    };

    if let Some(ed) = &early_data {
        use tokio::io::AsyncWriteExt;
        let mut io = TokioIo::new(client_upgraded);
        if io.write_all(ed).await.is_err() {
            tracing::debug!("failed writing early-data to client socket");
        }
        let disconnector = spawn_bridge(io.into_inner(), upstream_upgraded, on_closed);
        return HandlerOutcome {
            response: Some(response),
            disconnector: Some(disconnector),
            failure: None,
        };
    }

    let disconnector = spawn_bridge(client_upgraded, upstream_upgraded, on_closed);
    HandlerOutcome {
        response: Some(response),
        disconnector: Some(disconnector),
        failure: None,
    }
}

fn bad_request(msg: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .body(full_body(msg.to_string()))
        .unwrap()
}

/// Status-dependent retry classification used by the failover driver
/// between successive `handle_upgrade` attempts.
pub fn retryable(failure: &Failure) -> bool {
    match failure.status {
        Some(status) => is_retryable_status(status),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_rebuild_target_uri() {
        let uri = rebuild_target_uri("http://backend:80", "/foo?bar=1").unwrap();
        assert_eq!(uri.to_string(), "http://backend:80/foo?bar=1");
    }

    #[test]
    fn test_origin_host_port() {
        let (host, port, tls) = origin_host_port("https://example.com:8443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8443);
        assert!(tls);
    }

    #[test]
    fn test_retryable_unknown_status_is_retried() {
        assert!(retryable(&Failure { status: None, detail: "x".into() }));
    }

    #[test]
    fn test_retryable_terminal_status_not_retried() {
        assert!(!retryable(&Failure { status: Some(404), detail: "x".into() }));
    }

    #[test]
    fn test_parse_ed_param_absent_is_zero() {
        assert_eq!(parse_ed_param(None), Ok(0));
    }

    #[test]
    fn test_parse_ed_param_valid() {
        assert_eq!(parse_ed_param(Some("1000")), Ok(1000));
    }

    #[test]
    fn test_parse_ed_param_capped_at_max() {
        assert_eq!(parse_ed_param(Some("999999")), Ok(MAX_EARLY_DATA_BYTES));
    }

    #[test]
    fn test_parse_ed_param_non_integer_rejected() {
        assert_eq!(parse_ed_param(Some("abc")), Err(()));
    }

    #[test]
    fn test_parse_ed_param_negative_rejected() {
        assert_eq!(parse_ed_param(Some("-5")), Err(()));
    }
}
