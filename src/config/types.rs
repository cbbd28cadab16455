use std::time::Duration;

/// A single backend entry as resolved from `BACKEND_URL`/`BACKEND_LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Canonical `scheme://host:port` origin, no path or query.
    pub origin: String,
    /// Relative selection weight, always >= 1.
    pub weight: u32,
}

/// A named subscription upstream as resolved from `SUBSCRIPTION_TARGETS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub name: String,
    pub origin: String,
    pub port: u16,
    /// Leading-slash, no trailing slash; empty string means root.
    pub base_path: String,
}

/// The fully resolved, immutable runtime configuration.
///
/// Built once at startup by [`GatewayConfig::from_env`] and handed to the
/// shared component constructors wrapped in an `Arc`; there is no live
/// reload in this deployment model, so no `ArcSwap` indirection is needed.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backends: Vec<BackendConfig>,
    pub health_check_interval: Duration,
    pub sticky_session: bool,
    pub max_retries: u32,

    pub rate_limit_enabled: bool,
    pub rate_limit_max_conn_per_ip: u64,
    pub rate_limit_max_conn_per_min: u64,

    pub uuid_max_connections: u64,

    pub subscription_enabled: bool,
    pub subscription_preserve_domain: bool,
    pub subscription_targets: Vec<SubscriptionTarget>,
    pub subscription_transform: bool,
    pub subscription_cache_ttl_ms: u64,

    pub default_transport: String,

    pub debug: bool,
    pub hide_backend_urls: bool,

    pub listen_addr: String,
    pub admin_listen_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            backends: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            sticky_session: false,
            max_retries: 3,

            rate_limit_enabled: true,
            rate_limit_max_conn_per_ip: 64,
            rate_limit_max_conn_per_min: 300,

            uuid_max_connections: 0,

            subscription_enabled: false,
            subscription_preserve_domain: true,
            subscription_targets: Vec::new(),
            subscription_transform: false,
            subscription_cache_ttl_ms: 300_000,

            default_transport: "xhttp".to_string(),

            debug: false,
            hide_backend_urls: true,

            listen_addr: "0.0.0.0:8080".to_string(),
            admin_listen_addr: "0.0.0.0:9091".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_backends() {
        let cfg = GatewayConfig::default();
        assert!(cfg.backends.is_empty());
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.hide_backend_urls);
    }
}
