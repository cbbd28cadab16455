use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the process-wide Prometheus recorder and describes every
/// series the gateway emits. `render()` is called once per `/metrics`
/// request (ambient addition, not gated by `DEBUG`).
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets(&[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])?
            .install_recorder()?;

        describe_counter!("gateway_connections_total", "Inbound connections accepted");
        describe_counter!(
            "gateway_backend_selections_total",
            "Backend selections made by the pool"
        );
        describe_counter!(
            "gateway_backend_pool_fallback_total",
            "Times selection fell back from the healthy subset to the full set"
        );
        describe_counter!("gateway_backend_probes_total", "Health probes dispatched");
        describe_counter!("gateway_backend_probe_failures_total", "Health probes that failed");
        describe_gauge!("gateway_backend_healthy", "Currently healthy backend count");
        describe_gauge!("gateway_backend_total", "Configured backend count");

        describe_counter!("gateway_rate_limit_admitted_total", "Connections admitted by the IP rate limiter");
        describe_counter!("gateway_rate_limit_rejected_total", "Connections rejected by the IP rate limiter");

        describe_counter!(
            "gateway_identity_admitted_total",
            "Connections admitted by the identity-session manager"
        );
        describe_counter!(
            "gateway_identity_rejected_total",
            "Connections rejected by the identity-session manager"
        );
        describe_counter!(
            "gateway_identity_replaced_total",
            "Sessions replaced by a newer session from the same address"
        );

        describe_counter!("gateway_bridge_bytes_total", "Bytes relayed across all bridged connections");
        describe_gauge!("gateway_bridge_active", "Currently active bridged connections");

        describe_counter!("gateway_subscription_requests_total", "Subscription route requests served");
        describe_counter!("gateway_subscription_cache_hits_total", "Subscription cache hits");
        describe_counter!("gateway_subscription_cache_misses_total", "Subscription cache misses");
        describe_histogram!(
            "gateway_subscription_fetch_seconds",
            "Subscription upstream fetch latency"
        );

        describe_histogram!("gateway_upgrade_handshake_seconds", "Upgrade handshake latency");
        describe_counter!("gateway_upgrade_retries_total", "Upgrade handshake retry attempts");

        Ok(Metrics { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

pub fn record_connection_accepted() {
    counter!("gateway_connections_total").increment(1);
}

pub fn record_backend_selection(fallback: bool) {
    counter!("gateway_backend_selections_total").increment(1);
    if fallback {
        counter!("gateway_backend_pool_fallback_total").increment(1);
    }
}

pub fn record_probe(failed: bool) {
    counter!("gateway_backend_probes_total").increment(1);
    if failed {
        counter!("gateway_backend_probe_failures_total").increment(1);
    }
}

pub fn set_backend_gauges(healthy: usize, total: usize) {
    gauge!("gateway_backend_healthy").set(healthy as f64);
    gauge!("gateway_backend_total").set(total as f64);
}

pub fn record_rate_limit(admitted: bool) {
    if admitted {
        counter!("gateway_rate_limit_admitted_total").increment(1);
    } else {
        counter!("gateway_rate_limit_rejected_total").increment(1);
    }
}

pub fn record_identity(admitted: bool) {
    if admitted {
        counter!("gateway_identity_admitted_total").increment(1);
    } else {
        counter!("gateway_identity_rejected_total").increment(1);
    }
}

pub fn record_identity_replaced() {
    counter!("gateway_identity_replaced_total").increment(1);
}

pub fn record_bridge_opened() {
    gauge!("gateway_bridge_active").increment(1.0);
}

pub fn record_bridge_closed() {
    gauge!("gateway_bridge_active").decrement(1.0);
}

pub fn record_bridge_bytes(client_to_upstream: u64, upstream_to_client: u64) {
    counter!("gateway_bridge_bytes_total").increment(client_to_upstream + upstream_to_client);
}

pub fn record_subscription_request() {
    counter!("gateway_subscription_requests_total").increment(1);
}

pub fn record_subscription_cache(hit: bool) {
    if hit {
        counter!("gateway_subscription_cache_hits_total").increment(1);
    } else {
        counter!("gateway_subscription_cache_misses_total").increment(1);
    }
}

pub fn record_subscription_fetch_seconds(secs: f64) {
    histogram!("gateway_subscription_fetch_seconds").record(secs);
}

pub fn record_upgrade_handshake_seconds(secs: f64) {
    histogram!("gateway_upgrade_handshake_seconds").record(secs);
}

pub fn record_upgrade_retry() {
    counter!("gateway_upgrade_retries_total").increment(1);
}
