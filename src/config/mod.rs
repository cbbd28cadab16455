pub mod types;

pub use types::*;

use std::time::Duration;

impl GatewayConfig {
    /// Resolve the full configuration from environment variables.
    ///
    /// Every field has a documented default; missing or malformed values
    /// fall back to that default rather than aborting the process, matching
    /// the error-handling guarantee for configuration.
    pub fn from_env() -> Self {
        let mut cfg = GatewayConfig::default();

        if let Ok(v) = std::env::var("BACKEND_LIST") {
            match parse_backend_list(&v) {
                Ok(backends) if !backends.is_empty() => cfg.backends = backends,
                Ok(_) => tracing::warn!("config: BACKEND_LIST parsed to zero entries, ignoring"),
                Err(e) => tracing::warn!("config: BACKEND_LIST invalid, ignoring: {e}"),
            }
        } else if let Ok(v) = std::env::var("BACKEND_URL") {
            match parse_backend_entry(&v) {
                Ok(b) => cfg.backends = vec![b],
                Err(e) => tracing::warn!("config: BACKEND_URL invalid, ignoring: {e}"),
            }
        }

        if let Ok(v) = std::env::var("BACKEND_HEALTH_CHECK_INTERVAL") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.health_check_interval = Duration::from_millis(ms);
            }
        }

        if let Some(b) = env_bool("BACKEND_STICKY_SESSION") {
            cfg.sticky_session = b;
        }

        if let Ok(v) = std::env::var("MAX_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.max_retries = n.max(1);
            }
        }

        if let Some(b) = env_bool("RATE_LIMIT_ENABLED") {
            cfg.rate_limit_enabled = b;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_MAX_CONN_PER_IP") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.rate_limit_max_conn_per_ip = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_MAX_CONN_PER_MIN") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.rate_limit_max_conn_per_min = n;
            }
        }

        if let Ok(v) = std::env::var("UUID_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.uuid_max_connections = n;
            }
        }

        if let Some(b) = env_bool("SUBSCRIPTION_ENABLED") {
            cfg.subscription_enabled = b;
        }
        if let Some(b) = env_bool("SUBSCRIPTION_PRESERVE_DOMAIN") {
            cfg.subscription_preserve_domain = b;
        }
        if let Ok(v) = std::env::var("SUBSCRIPTION_TARGETS") {
            match parse_subscription_targets(&v) {
                Ok(targets) if !targets.is_empty() => cfg.subscription_targets = targets,
                Ok(_) => tracing::warn!("config: SUBSCRIPTION_TARGETS parsed to zero entries"),
                Err(e) => tracing::warn!("config: SUBSCRIPTION_TARGETS invalid, ignoring: {e}"),
            }
        }
        if let Some(b) = env_bool("SUBSCRIPTION_TRANSFORM") {
            cfg.subscription_transform = b;
        }
        if let Ok(v) = std::env::var("SUBSCRIPTION_CACHE_TTL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.subscription_cache_ttl_ms = ms;
            }
        }

        if let Ok(v) = std::env::var("TRANSPORT") {
            if matches!(v.as_str(), "ws" | "xhttp" | "httpupgrade") {
                cfg.default_transport = v;
            } else {
                tracing::warn!("config: TRANSPORT={v} unrecognized, using default");
            }
        }

        if let Some(b) = env_bool("DEBUG") {
            cfg.debug = b;
        }
        if let Some(b) = env_bool("HIDE_BACKEND_URLS") {
            cfg.hide_backend_urls = b;
        }

        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            cfg.listen_addr = v;
        }
        if let Ok(v) = std::env::var("ADMIN_LISTEN_ADDR") {
            cfg.admin_listen_addr = v;
        }

        cfg
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "true" | "1" | "yes" | "on"))
}

/// Parse `url` or `url|weight` into a `BackendConfig`. Weight defaults to 1,
/// clamped to >= 1 (the alias table's own invariant, enforced again here).
fn parse_backend_entry(entry: &str) -> Result<BackendConfig, String> {
    let entry = entry.trim();
    let (url, weight) = match entry.rsplit_once('|') {
        Some((url, w)) => (url.trim(), w.trim().parse::<u32>().unwrap_or(1).max(1)),
        None => (entry, 1),
    };
    let origin = normalize_origin(url)?;
    Ok(BackendConfig { origin, weight })
}

fn parse_backend_list(list: &str) -> Result<Vec<BackendConfig>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_backend_entry)
        .collect()
}

/// Normalize a backend URL to its canonical `scheme://host:port` origin
/// string (no path/query). Duplicate origins are left to the pool to
/// collapse and sum weights.
pub fn normalize_origin(raw: &str) -> Result<String, String> {
    let uri: http::Uri = raw.parse().map_err(|e| format!("{e}"))?;
    let scheme = uri.scheme_str().ok_or("missing scheme")?;
    if scheme != "http" && scheme != "https" {
        return Err(format!("unsupported scheme: {scheme}"));
    }
    let authority = uri.authority().ok_or("missing host")?;
    let host = authority.host();
    let port = authority
        .port_u16()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    Ok(format!("{scheme}://{host}:{port}"))
}

fn parse_subscription_targets(raw: &str) -> Result<Vec<SubscriptionTarget>, String> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| format!("{e}"))?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for v in parsed {
            let name = v
                .get("name")
                .and_then(|x| x.as_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let url = v.get("url").and_then(|x| x.as_str()).unwrap_or_default();
            let port = v.get("port").and_then(|x| x.as_u64()).unwrap_or(443) as u16;
            let path = v
                .get("path")
                .and_then(|x| x.as_str())
                .unwrap_or("/")
                .to_string();
            if name.is_empty() || url.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            out.push(SubscriptionTarget {
                name,
                origin: normalize_origin(url)?,
                port,
                base_path: normalize_base_path(&path),
            });
        }
        Ok(out)
    } else {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parts: Vec<&str> = entry.split('|').collect();
            if parts.len() < 2 {
                continue;
            }
            let name = parts[0].to_ascii_lowercase();
            if !seen.insert(name.clone()) {
                continue;
            }
            let origin = normalize_origin(parts[1])?;
            let port = parts.get(2).and_then(|p| p.parse::<u16>().ok()).unwrap_or(443);
            let path = parts.get(3).copied().unwrap_or("/");
            out.push(SubscriptionTarget {
                name,
                origin,
                port,
                base_path: normalize_base_path(path),
            });
        }
        Ok(out)
    }
}

fn normalize_base_path(path: &str) -> String {
    if path.starts_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        format!("/{}", path.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_entry_with_weight() {
        let b = parse_backend_entry("http://10.0.0.1:8080|3").unwrap();
        assert_eq!(b.origin, "http://10.0.0.1:8080");
        assert_eq!(b.weight, 3);
    }

    #[test]
    fn test_parse_backend_entry_default_weight() {
        let b = parse_backend_entry("https://example.com").unwrap();
        assert_eq!(b.origin, "https://example.com:443");
        assert_eq!(b.weight, 1);
    }

    #[test]
    fn test_parse_backend_list() {
        let backends = parse_backend_list("A://bad, http://a:80|3,http://b:80|1").unwrap_err();
        let _ = backends; // first entry is intentionally invalid
    }

    #[test]
    fn test_parse_backend_list_valid() {
        let backends = parse_backend_list("http://a:80|3,http://b:80|1").unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].weight, 3);
        assert_eq!(backends[1].weight, 1);
    }

    #[test]
    fn test_normalize_origin_rejects_bad_scheme() {
        assert!(normalize_origin("ftp://h:1").is_err());
    }

    #[test]
    fn test_subscription_targets_pipe_list() {
        let targets =
            parse_subscription_targets("alpha|https://a.example.com|443|/sub, beta|https://b.example.com|8443|sub2")
                .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "alpha");
        assert_eq!(targets[0].base_path, "/sub");
        assert_eq!(targets[1].base_path, "/sub2");
    }

    #[test]
    fn test_subscription_targets_json() {
        let json = r#"[{"name":"Alpha","url":"https://a.example.com","port":443,"path":"/sub"}]"#;
        let targets = parse_subscription_targets(json).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "alpha");
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("/sub/"), "/sub");
        assert_eq!(normalize_base_path("sub"), "/sub");
        assert_eq!(normalize_base_path("/"), "");
    }
}
