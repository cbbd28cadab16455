pub mod cache;

use crate::config::SubscriptionTarget;
use crate::error::GatewayError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use cache::SubscriptionCache;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::Mutex;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const INITIAL_BUFFER: usize = 16 * 1024;

pub struct SubscriptionProxy {
    targets: Vec<SubscriptionTarget>,
    preserve_domain: bool,
    link_transform: bool,
    cache: Mutex<SubscriptionCache>,
    client: reqwest::Client,
}

/// Parsed `/sub/<token...>` or `/<service>/sub/<token...>` route.
pub struct SubscriptionRoute {
    pub target_index: usize,
    pub token: String,
}

impl SubscriptionProxy {
    pub fn new(
        targets: Vec<SubscriptionTarget>,
        preserve_domain: bool,
        link_transform: bool,
        cache_ttl_ms: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        SubscriptionProxy {
            targets,
            preserve_domain,
            link_transform,
            cache: Mutex::new(SubscriptionCache::new(
                Duration::from_millis(cache_ttl_ms),
                256,
                20 * 1024 * 1024,
            )),
            client,
        }
    }

    /// Resolves `/sub/<token...>` (default target) or
    /// `/<service>/sub/<token...>` (named target, case-insensitive,
    /// falling back to the first target on an unknown name).
    pub fn parse_route(&self, path: &str) -> Option<SubscriptionRoute> {
        let trimmed = path.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();

        let (target_index, token_segments) = if segments.first() == Some(&"sub") {
            (0, &segments[1..])
        } else if segments.len() >= 2 && segments[1] == "sub" {
            let name = segments[0].to_ascii_lowercase();
            let idx = self
                .targets
                .iter()
                .position(|t| t.name == name)
                .unwrap_or(0);
            (idx, &segments[2..])
        } else {
            return None;
        };

        if self.targets.is_empty() || token_segments.is_empty() {
            return None;
        }

        let token = token_segments
            .iter()
            .map(|seg| percent_decode_str(seg).decode_utf8_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Some(SubscriptionRoute { target_index, token })
    }

    pub async fn fetch(
        &self,
        route: &SubscriptionRoute,
        query: Option<&str>,
        inbound_host: &str,
    ) -> Result<Bytes, GatewayError> {
        let target = &self.targets[route.target_index];
        let cache_key = format!("{}:{}:{}", target.name, route.token, query.unwrap_or(""));

        if let Some(hit) = self.cache.lock().unwrap().get(&cache_key) {
            crate::metrics::record_subscription_cache(true);
            return Ok(self.transform_for_return(hit, target, &route.token, inbound_host));
        }
        crate::metrics::record_subscription_cache(false);

        let encoded_token = percent_encoding::utf8_percent_encode(
            &route.token,
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();
        let mut url = format!(
            "{}:{}{}/{}",
            target.origin.trim_end_matches(':').trim_end_matches('/'),
            target.port,
            target.base_path,
            encoded_token
        );
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(FETCH_TIMEOUT, self.client.get(&url).send()).await;
        crate::metrics::record_subscription_fetch_seconds(started.elapsed().as_secs_f64());

        let resp = match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(target = %target.name, url = %url, error = %e, "subscription: fetch failed");
                return Err(GatewayError::UpstreamUnreachable(url));
            }
            Err(_) => {
                tracing::warn!(target = %target.name, url = %url, "subscription: fetch timed out");
                return Err(GatewayError::UpstreamTimeout);
            }
        };

        let content_length = resp.content_length().map(|n| n as usize);
        let initial_cap = content_length
            .filter(|&n| n <= MAX_BODY_BYTES)
            .unwrap_or(INITIAL_BUFFER);
        let mut buf = BytesMut::with_capacity(initial_cap.min(MAX_BODY_BYTES));

        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|_| GatewayError::UpstreamUnreachable("stream error".to_string()))?;
            if buf.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(GatewayError::SizeLimitExceeded);
            }
            buf.extend_from_slice(&chunk);
        }

        let body = buf.freeze();
        self.cache.lock().unwrap().set(cache_key, body.clone());
        Ok(self.transform_for_return(body, target, &route.token, inbound_host))
    }

    fn transform_for_return(
        &self,
        body: Bytes,
        target: &SubscriptionTarget,
        token: &str,
        inbound_host: &str,
    ) -> Bytes {
        if let Some(decoded) = decode_if_base64_blob(&body) {
            let mut inner = Bytes::from(decoded);
            if self.preserve_domain {
                inner = rewrite_domain_preservation(&inner, target, token);
            }
            if self.link_transform {
                inner = rewrite_links_to_host(&inner, inbound_host);
            }
            return Bytes::from(
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(inner),
            );
        }
        let mut out = body;
        if self.preserve_domain {
            out = rewrite_domain_preservation(&out, target, token);
        }
        if self.link_transform {
            out = rewrite_links_to_host(&out, inbound_host);
        }
        out
    }

    pub fn purge_cache(&self) {
        self.cache.lock().unwrap().purge_expired();
    }
}

/// If the whole payload is canonical base64url text of at least 16
/// characters, decode it for URL rewriting underneath.
fn decode_if_base64_blob(body: &Bytes) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if text.len() < 16 || !text.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(text).ok()?;
    if URL_SAFE_NO_PAD.encode(&decoded) != text {
        return None;
    }
    Some(decoded)
}

fn url_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?:\\?/\\?/[^\s"'<>]+"#).unwrap())
}

/// Rewrites any URL in `body` that carries `token` and lies under a
/// `/sub/` prefix so its origin matches `target`, preserving path/query/
/// fragment. Handles both plain and JSON-escaped (`\/`) URL forms.
fn rewrite_domain_preservation(body: &Bytes, target: &SubscriptionTarget, token: &str) -> Bytes {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return body.clone(),
    };

    let target_origin = target.origin.clone();
    let replaced = url_regex().replace_all(text, |caps: &regex::Captures| {
        let matched = caps.get(0).unwrap().as_str();
        let escaped = matched.contains("\\/");
        let normalized = matched.replace("\\/", "/");
        if normalized.starts_with(&target_origin) {
            return matched.to_string();
        }
        let carries_token = normalized.contains(token) || normalized.contains(&percent_encode_path(token));
        let under_sub_prefix = normalized.contains("/sub/") || normalized.contains(&target.base_path);
        if !carries_token || !under_sub_prefix {
            return matched.to_string();
        }
        let Some(rest) = strip_origin(&normalized) else {
            return matched.to_string();
        };
        let rewritten = format!("{target_origin}{rest}");
        if escaped {
            rewritten.replace('/', "\\/")
        } else {
            rewritten
        }
    });

    Bytes::from(replaced.into_owned())
}

fn percent_encode_path(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

fn strip_origin(url: &str) -> Option<String> {
    let after_scheme = url.split_once("://")?.1;
    let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
    Some(after_scheme[path_start..].to_string())
}

fn rewrite_links_to_host(body: &Bytes, inbound_host: &str) -> Bytes {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return body.clone(),
    };
    let replaced = url_regex().replace_all(text, |caps: &regex::Captures| {
        let matched = caps.get(0).unwrap().as_str();
        let escaped = matched.contains("\\/");
        let normalized = matched.replace("\\/", "/");
        let Some(rest) = strip_origin(&normalized) else {
            return matched.to_string();
        };
        let rewritten = format!("https://{inbound_host}{rest}");
        if escaped {
            rewritten.replace('/', "\\/")
        } else {
            rewritten
        }
    });
    Bytes::from(replaced.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SubscriptionTarget {
        SubscriptionTarget {
            name: "default".to_string(),
            origin: "https://origin.example.com".to_string(),
            port: 443,
            base_path: "/sub".to_string(),
        }
    }

    #[test]
    fn test_parse_default_route() {
        let proxy = SubscriptionProxy::new(vec![target()], true, false, 300_000);
        let route = proxy.parse_route("/sub/abc123").unwrap();
        assert_eq!(route.target_index, 0);
        assert_eq!(route.token, "abc123");
    }

    #[test]
    fn test_parse_named_route_unknown_falls_back() {
        let proxy = SubscriptionProxy::new(vec![target()], true, false, 300_000);
        let route = proxy.parse_route("/unknownsvc/sub/tok").unwrap();
        assert_eq!(route.target_index, 0);
        assert_eq!(route.token, "tok");
    }

    #[test]
    fn test_parse_token_with_slashes_percent_decoded() {
        let proxy = SubscriptionProxy::new(vec![target()], true, false, 300_000);
        let route = proxy.parse_route("/sub/a%2Fb/c").unwrap();
        assert_eq!(route.token, "a/b/c");
    }

    #[test]
    fn test_rewrite_domain_preservation_plain_url() {
        let t = target();
        let body = Bytes::from_static(b"https://upstream.internal:9000/sub/tok123/extra");
        let out = rewrite_domain_preservation(&body, &t, "tok123");
        let s = String::from_utf8(out.to_vec()).unwrap();
        assert!(s.starts_with("https://origin.example.com"));
        assert!(s.contains("/sub/tok123/extra"));
    }

    #[test]
    fn test_strip_origin() {
        assert_eq!(
            strip_origin("https://host:443/a/b?c=1").unwrap(),
            "/a/b?c=1".to_string()
        );
    }
}
