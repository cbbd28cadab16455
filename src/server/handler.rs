use super::state::AppState;
use crate::error::GatewayError;
use crate::transport::{self, ProxyBody};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn identity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap())
}

fn extract_identity(path: &str, query: Option<&str>) -> Option<String> {
    let trimmed = path.trim_start_matches('/');
    let mut segments = trimmed.split('/');
    let first = segments.next().unwrap_or("");
    if identity_regex().is_match(first) {
        return Some(first.to_ascii_lowercase());
    }
    if first == "sub" {
        if let Some(second) = segments.next() {
            if identity_regex().is_match(second) {
                return Some(second.to_ascii_lowercase());
            }
        }
    }
    query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("id="))
            .map(|v| v.to_ascii_lowercase())
    })
}

pub async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let peer_ip = transport::resolve_client_ip(req.headers());

    if path == "/" || path == "/index.html" {
        return landing_response(&state);
    }
    if path == "/health" || path == "/healthz" {
        return health_response(&state);
    }
    if path == "/status" {
        return if state.config.debug {
            status_response(&state)
        } else {
            not_found()
        };
    }

    if let Some(sub) = &state.subscription {
        if let Some(route) = sub.parse_route(&path) {
            crate::metrics::record_subscription_request();
            if req.method() != http::Method::GET {
                return error_response(GatewayError::MethodNotAllowed);
            }
            let host = req
                .headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return match sub.fetch(&route, query.as_deref(), &host).await {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                    .body(transport::full_body(body))
                    .unwrap_or_else(|_| not_found()),
                Err(e) => error_response(e),
            };
        }
    }

    handle_proxy_request(req, state, peer_ip, &path, query.as_deref()).await
}

async fn handle_proxy_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    peer_ip: String,
    path: &str,
    query: Option<&str>,
) -> Response<ProxyBody> {
    if !state.ip_limiter.check_connection_allowed(&peer_ip) {
        crate::metrics::record_rate_limit(false);
        let retry = state.ip_limiter.get_retry_after_seconds(&peer_ip);
        warn!(ip = %peer_ip, retry_after = retry, "proxy: ip rejected before admission");
        return error_response(GatewayError::RateLimited { retry_after_secs: retry });
    }

    let identity = extract_identity(path, query);
    if let Some(id) = &identity {
        if !state.identity.check_connection_allowed(id, &peer_ip) {
            crate::metrics::record_identity(false);
            warn!(ip = %peer_ip, identity = %id, "proxy: identity connection cap exceeded");
            return error_response(GatewayError::IdentityLimited);
        }
    }

    let kind = transport::resolve_transport(
        path,
        query,
        req.headers(),
        &state.config.default_transport,
    );
    let stripped_path = transport::strip_transport_prefix(path);
    let stripped_query = query.and_then(transport::strip_selector_query);

    let mut rebuilt = req;
    let new_path_and_query = match &stripped_query {
        Some(q) => format!("{stripped_path}?{q}"),
        None => stripped_path,
    };
    if let Ok(new_uri) = new_path_and_query.parse::<http::Uri>() {
        let mut parts = rebuilt.uri().clone().into_parts();
        parts.path_and_query = new_uri.into_parts().path_and_query;
        if let Ok(uri) = http::Uri::from_parts(parts) {
            *rebuilt.uri_mut() = uri;
        }
    }

    let conn_id = state.next_id();
    let connection_id = format!("{peer_ip}:{conn_id}");
    if !state.ip_limiter.register_connection(&peer_ip, conn_id) {
        crate::metrics::record_rate_limit(false);
        let retry = state.ip_limiter.get_retry_after_seconds(&peer_ip);
        warn!(connection_id = %connection_id, ip = %peer_ip, "proxy: rate limited after transport resolution");
        return error_response(GatewayError::RateLimited { retry_after_secs: retry });
    }
    crate::metrics::record_rate_limit(true);
    debug!(connection_id = %connection_id, ip = %peer_ip, transport = kind.as_str(), identity = ?identity, "proxy: admitted");

    // Populated once the bridge exists, so a same-address session
    // replacement can actually tear down the live connection rather than
    // only releasing the IP rate-limiter slot.
    let kill_cell: Arc<std::sync::Mutex<Option<crate::identity::Disconnector>>> =
        Arc::new(std::sync::Mutex::new(None));

    if let Some(id) = &identity {
        let ip_limiter = Arc::clone(&state.ip_limiter);
        let peer_for_disconnect = peer_ip.clone();
        let cell_for_disconnect = Arc::clone(&kill_cell);
        let disconnect: crate::identity::Disconnector = Arc::new(move |code, reason| {
            let bridge_kill = cell_for_disconnect.lock().unwrap().clone();
            match bridge_kill {
                Some(kill) => kill(code, reason),
                None => ip_limiter.unregister_connection(&peer_for_disconnect, conn_id),
            }
        });
        state.identity.register_connection(id, conn_id, &peer_ip, disconnect);
        crate::metrics::record_identity(true);
    }

    let release_admission = |identity: &Option<String>| {
        state.ip_limiter.unregister_connection(&peer_ip, conn_id);
        if let Some(id) = identity {
            state.identity.unregister_connection(id, conn_id);
        }
    };

    let max_attempts = state.config.max_retries;
    state.backends.maybe_schedule_probe();

    // Plain HTTP passthrough consumes the request body on the first
    // attempt, so it is never retried against a second backend.
    if !transport::handlers::is_upgrade_request(&rebuilt) {
        let mut tried = HashSet::new();
        let origin = state.backends.select(&tried);
        tried.insert(origin.clone());
        crate::metrics::record_backend_selection(state.backends.healthy_count() == 0);
        debug!(connection_id = %connection_id, backend = %origin, "proxy: passthrough dispatched");
        let outcome = transport::handlers::handle_passthrough(rebuilt, &origin).await;
        release_admission(&identity);
        return match outcome.response {
            Some(response) => {
                state.backends.report_success(&origin);
                response
            }
            None => {
                state.backends.report_failure(&origin);
                let f = outcome.failure.unwrap();
                warn!(connection_id = %connection_id, backend = %origin, status = ?f.status, detail = %f.detail, "proxy: passthrough failed");
                error_response(GatewayError::UpstreamFailure { last_status: f.status, detail: f.detail })
            }
        };
    }

    let mut tried = HashSet::new();
    let mut last_failure = crate::transport::handlers::Failure {
        status: None,
        detail: "no backend attempted".to_string(),
    };

    for attempt in 0..max_attempts.max(1) {
        let origin = state.backends.select(&tried);
        tried.insert(origin.clone());
        crate::metrics::record_backend_selection(state.backends.healthy_count() == 0);
        debug!(connection_id = %connection_id, backend = %origin, attempt, "proxy: upgrade attempt");

        let ip_limiter_oc = Arc::clone(&state.ip_limiter);
        let identity_mgr_oc = Arc::clone(&state.identity);
        let peer_oc = peer_ip.clone();
        let identity_oc = identity.clone();
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let on_closed = move || {
            if !released.swap(true, std::sync::atomic::Ordering::AcqRel) {
                ip_limiter_oc.unregister_connection(&peer_oc, conn_id);
                if let Some(id) = &identity_oc {
                    identity_mgr_oc.unregister_connection(id, conn_id);
                }
            }
        };
        let outcome = transport::handlers::handle_upgrade(&mut rebuilt, &origin, kind, on_closed).await;
        match outcome.response {
            Some(response) => {
                state.backends.report_success(&origin);
                // Admission now releases exactly once, when `on_closed` fires
                // on bridge teardown. Stash the bridge's own kill switch so a
                // same-address identity replacement can force that teardown.
                if let Some(disconnector) = outcome.disconnector {
                    *kill_cell.lock().unwrap() = Some(disconnector);
                }
                return response;
            }
            None => {
                state.backends.report_failure(&origin);
                let f = outcome.failure.unwrap_or(crate::transport::handlers::Failure {
                    status: None,
                    detail: "unknown failure".to_string(),
                });
                let can_retry = transport::handlers::retryable(&f) && attempt + 1 < max_attempts.max(1);
                warn!(connection_id = %connection_id, backend = %origin, attempt, status = ?f.status, detail = %f.detail, retrying = can_retry, "proxy: upgrade attempt failed");
                last_failure = f;
                if !can_retry {
                    break;
                }
                crate::metrics::record_upgrade_retry();
                let delay = crate::retry::backoff_delay(attempt);
                debug!(connection_id = %connection_id, attempt, delay_ms = delay.as_millis() as u64, "proxy: retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }

    release_admission(&identity);
    warn!(connection_id = %connection_id, status = ?last_failure.status, detail = %last_failure.detail, "proxy: all backend attempts exhausted");
    error_response(GatewayError::UpstreamFailure {
        last_status: last_failure.status,
        detail: last_failure.detail,
    })
}

fn landing_response(state: &AppState) -> Response<ProxyBody> {
    if state.config.subscription_enabled && !state.config.subscription_targets.is_empty() {
        let names: Vec<_> = state
            .config
            .subscription_targets
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let body = format!(
            "tunnel gateway online\nsubscription targets: {}\n",
            names.join(", ")
        );
        return Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(http::header::CACHE_CONTROL, "public, max-age=3600")
            .body(transport::full_body(body))
            .unwrap_or_else(|_| not_found());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(http::header::CACHE_CONTROL, "public, max-age=3600")
        .body(transport::full_body(LANDING_HTML))
        .unwrap_or_else(|_| not_found())
}

const LANDING_HTML: &str = "<!doctype html><html><head><title>gateway</title></head><body><p>It works!</p></body></html>";

fn health_response(state: &AppState) -> Response<ProxyBody> {
    let total = state.backends.total_count();
    let healthy = state.backends.healthy_count();
    let status = if healthy > 0 { "ok" } else { "degraded" };

    let body = if state.config.hide_backend_urls {
        json!({
            "status": status,
            "timestamp": chrono_like_now(),
            "totalBackends": total,
            "healthyBackends": healthy,
            "unhealthyBackends": total - healthy,
        })
    } else {
        let backends: Vec<_> = state
            .backends
            .entries()
            .iter()
            .map(|e| json!({"origin": e.origin, "healthy": e.is_healthy()}))
            .collect();
        json!({
            "status": status,
            "timestamp": chrono_like_now(),
            "totalBackends": total,
            "healthyBackends": healthy,
            "unhealthyBackends": total - healthy,
            "backends": backends,
        })
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(transport::full_body(body.to_string()))
        .unwrap_or_else(|_| not_found())
}

fn status_response(state: &AppState) -> Response<ProxyBody> {
    let body = json!({
        "rateLimit": {
            "enabled": state.config.rate_limit_enabled,
            "maxConnPerIp": state.config.rate_limit_max_conn_per_ip,
            "maxConnPerMin": state.config.rate_limit_max_conn_per_min,
        },
        "identityLimit": {
            "maxConnections": state.config.uuid_max_connections,
        },
        "subscriptionTargets": state.config.subscription_targets.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
        "defaultTransport": state.config.default_transport,
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(transport::full_body(body.to_string()))
        .unwrap_or_else(|_| not_found())
}

fn chrono_like_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn not_found() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(transport::empty_body())
        .unwrap()
}

fn error_response(err: GatewayError) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let GatewayError::RateLimited { retry_after_secs } = &err {
        builder = builder.header(http::header::RETRY_AFTER, retry_after_secs.to_string());
    }
    if matches!(err, GatewayError::IdentityLimited) {
        builder = builder.header("x-websocket-close-code", "1008");
    }
    builder
        .body(transport::full_body(err.to_string()))
        .unwrap_or_else(|_| not_found())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_identity_from_first_segment() {
        let id = extract_identity("/550e8400-e29b-41d4-a716-446655440000/ws", None);
        assert_eq!(id, Some("550e8400-e29b-41d4-a716-446655440000".to_string()));
    }

    #[test]
    fn test_extract_identity_from_sub_second_segment() {
        let id = extract_identity("/sub/550e8400-e29b-41d4-a716-446655440000", None);
        assert_eq!(id, Some("550e8400-e29b-41d4-a716-446655440000".to_string()));
    }

    #[test]
    fn test_extract_identity_from_query() {
        let id = extract_identity("/ws", Some("id=ABCDEF"));
        assert_eq!(id, Some("abcdef".to_string()));
    }

    #[test]
    fn test_extract_identity_none() {
        assert_eq!(extract_identity("/foo/bar", None), None);
    }
}
