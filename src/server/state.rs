use crate::backend::BackendPool;
use crate::config::GatewayConfig;
use crate::identity::IdentityManager;
use crate::metrics::Metrics;
use crate::ratelimit::IpRateLimiter;
use crate::subscription::SubscriptionProxy;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Root aggregate handed to every request handler. Built once at startup
/// from the resolved configuration.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub backends: Arc<BackendPool>,
    pub ip_limiter: Arc<IpRateLimiter>,
    pub identity: Arc<IdentityManager>,
    pub subscription: Option<Arc<SubscriptionProxy>>,
    pub metrics: Arc<Metrics>,
    pub next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Arc<Self> {
        let config = Arc::new(config);
        let backends = BackendPool::new(&config.backends, config.sticky_session, config.health_check_interval);
        let ip_limiter = Arc::new(IpRateLimiter::new(
            config.rate_limit_enabled,
            config.rate_limit_max_conn_per_ip,
            config.rate_limit_max_conn_per_min,
        ));
        let identity = Arc::new(IdentityManager::new(config.uuid_max_connections));
        let subscription = if config.subscription_enabled && !config.subscription_targets.is_empty() {
            Some(Arc::new(SubscriptionProxy::new(
                config.subscription_targets.clone(),
                config.subscription_preserve_domain,
                config.subscription_transform,
                config.subscription_cache_ttl_ms,
            )))
        } else {
            None
        };

        Arc::new(AppState {
            config,
            backends,
            ip_limiter,
            identity,
            subscription,
            metrics: Arc::new(metrics),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn next_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}
