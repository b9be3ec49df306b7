use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::telemetry::TopKCounter;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub max_label_series: usize,
    pub top_k: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_label_series: 1024,
            top_k: 20,
        }
    }
}

#[derive(Debug)]
pub struct GatewayMetrics {
    config: MetricsConfig,

    requests_total: u64,
    requests_by_auth_method: HashMap<String, u64>,
    requests_by_product: HashMap<String, u64>,

    throttle_denied_total: u64,
    throttle_denied_by_scope: HashMap<String, u64>,

    policy_denied_total: u64,
    policy_denied_by_product: HashMap<String, u64>,

    auth_cache_hits_total: u64,
    auth_cache_misses_total: u64,
    auth_invalid_total: u64,
    auth_invalid_by_method: HashMap<String, u64>,
    auth_store_unavailable_total: u64,

    store_fallback_total: u64,
    store_fallback_by_scope: HashMap<String, u64>,
    store_pool_exhausted_total: u64,
    store_pool_exhausted_by_store: HashMap<String, u64>,

    upstream_failures_total: u64,

    stream_chunks_total: u64,
    stream_bytes_total: u64,
    stream_completed_total: u64,
    stream_errors_total: u64,
    stream_aborted_total: u64,

    cost_by_tenant: TopKCounter,
    tokens_by_user: TopKCounter,
}

/// Point-in-time copy of the counters, for tests and admin endpoints.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub throttle_denied_total: u64,
    pub throttle_denied_by_scope: HashMap<String, u64>,
    pub policy_denied_total: u64,
    pub auth_cache_hits_total: u64,
    pub auth_cache_misses_total: u64,
    pub auth_invalid_total: u64,
    pub auth_store_unavailable_total: u64,
    pub store_fallback_total: u64,
    pub store_pool_exhausted_total: u64,
    pub upstream_failures_total: u64,
    pub stream_chunks_total: u64,
    pub stream_bytes_total: u64,
    pub stream_completed_total: u64,
    pub stream_errors_total: u64,
    pub stream_aborted_total: u64,
    pub top_cost_by_tenant: Vec<(String, f64)>,
    pub top_tokens_by_user: Vec<(String, f64)>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl GatewayMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        let top_k = config.top_k;
        Self {
            config,
            requests_total: 0,
            requests_by_auth_method: HashMap::new(),
            requests_by_product: HashMap::new(),
            throttle_denied_total: 0,
            throttle_denied_by_scope: HashMap::new(),
            policy_denied_total: 0,
            policy_denied_by_product: HashMap::new(),
            auth_cache_hits_total: 0,
            auth_cache_misses_total: 0,
            auth_invalid_total: 0,
            auth_invalid_by_method: HashMap::new(),
            auth_store_unavailable_total: 0,
            store_fallback_total: 0,
            store_fallback_by_scope: HashMap::new(),
            store_pool_exhausted_total: 0,
            store_pool_exhausted_by_store: HashMap::new(),
            upstream_failures_total: 0,
            stream_chunks_total: 0,
            stream_bytes_total: 0,
            stream_completed_total: 0,
            stream_errors_total: 0,
            stream_aborted_total: 0,
            cost_by_tenant: TopKCounter::new(top_k),
            tokens_by_user: TopKCounter::new(top_k),
        }
    }

    pub fn record_request(&mut self, auth_method: &str, product: &str) {
        self.requests_total = self.requests_total.saturating_add(1);
        let max = self.config.max_label_series;
        bump_limited(&mut self.requests_by_auth_method, auth_method, max);
        bump_limited(&mut self.requests_by_product, product, max);
    }

    pub fn record_throttle_denied(&mut self, scope: &str) {
        self.throttle_denied_total = self.throttle_denied_total.saturating_add(1);
        bump_limited(
            &mut self.throttle_denied_by_scope,
            scope,
            self.config.max_label_series,
        );
    }

    pub fn record_policy_denied(&mut self, product: &str) {
        self.policy_denied_total = self.policy_denied_total.saturating_add(1);
        bump_limited(
            &mut self.policy_denied_by_product,
            product,
            self.config.max_label_series,
        );
    }

    pub fn record_auth_cache_hit(&mut self) {
        self.auth_cache_hits_total = self.auth_cache_hits_total.saturating_add(1);
    }

    pub fn record_auth_cache_miss(&mut self) {
        self.auth_cache_misses_total = self.auth_cache_misses_total.saturating_add(1);
    }

    pub fn record_auth_invalid(&mut self, method: &str) {
        self.auth_invalid_total = self.auth_invalid_total.saturating_add(1);
        bump_limited(
            &mut self.auth_invalid_by_method,
            method,
            self.config.max_label_series,
        );
    }

    pub fn record_auth_store_unavailable(&mut self) {
        self.auth_store_unavailable_total = self.auth_store_unavailable_total.saturating_add(1);
    }

    pub fn record_store_fallback(&mut self, scope: &str) {
        self.store_fallback_total = self.store_fallback_total.saturating_add(1);
        bump_limited(
            &mut self.store_fallback_by_scope,
            scope,
            self.config.max_label_series,
        );
    }

    pub fn record_store_pool_exhausted(&mut self, store: &str) {
        self.store_pool_exhausted_total = self.store_pool_exhausted_total.saturating_add(1);
        bump_limited(
            &mut self.store_pool_exhausted_by_store,
            store,
            self.config.max_label_series,
        );
    }

    pub fn record_upstream_failure(&mut self) {
        self.upstream_failures_total = self.upstream_failures_total.saturating_add(1);
    }

    pub fn record_stream_chunk(&mut self, bytes: usize) {
        self.stream_chunks_total = self.stream_chunks_total.saturating_add(1);
        self.stream_bytes_total = self
            .stream_bytes_total
            .saturating_add(u64::try_from(bytes).unwrap_or(u64::MAX));
    }

    pub fn record_stream_end(&mut self, outcome: StreamOutcome) {
        let counter = match outcome {
            StreamOutcome::Completed => &mut self.stream_completed_total,
            StreamOutcome::Error => &mut self.stream_errors_total,
            StreamOutcome::Aborted => &mut self.stream_aborted_total,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_cost(&mut self, tenant: &str, usd_micros: f64) {
        if usd_micros > 0.0 {
            self.cost_by_tenant.increment(tenant, usd_micros);
        }
    }

    pub fn record_tokens(&mut self, user: &str, tokens: u64) {
        if tokens > 0 {
            self.tokens_by_user.increment(user, tokens as f64);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total,
            throttle_denied_total: self.throttle_denied_total,
            throttle_denied_by_scope: self.throttle_denied_by_scope.clone(),
            policy_denied_total: self.policy_denied_total,
            auth_cache_hits_total: self.auth_cache_hits_total,
            auth_cache_misses_total: self.auth_cache_misses_total,
            auth_invalid_total: self.auth_invalid_total,
            auth_store_unavailable_total: self.auth_store_unavailable_total,
            store_fallback_total: self.store_fallback_total,
            store_pool_exhausted_total: self.store_pool_exhausted_total,
            upstream_failures_total: self.upstream_failures_total,
            stream_chunks_total: self.stream_chunks_total,
            stream_bytes_total: self.stream_bytes_total,
            stream_completed_total: self.stream_completed_total,
            stream_errors_total: self.stream_errors_total,
            stream_aborted_total: self.stream_aborted_total,
            top_cost_by_tenant: self.cost_by_tenant.exported(),
            top_tokens_by_user: self.tokens_by_user.exported(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        write_counter(
            &mut out,
            "ditto_admission_requests_total",
            "Admitted-or-not requests that passed authentication.",
            self.requests_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_requests_by_auth_method_total",
            "Requests grouped by authentication method.",
            "auth_method",
            &self.requests_by_auth_method,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_requests_by_product_total",
            "Requests grouped by product.",
            "product",
            &self.requests_by_product,
        );

        write_counter(
            &mut out,
            "ditto_admission_throttle_denied_total",
            "Requests denied by a throttle.",
            self.throttle_denied_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_throttle_denied_by_scope_total",
            "Throttle denials grouped by the denying throttle.",
            "scope",
            &self.throttle_denied_by_scope,
        );

        write_counter(
            &mut out,
            "ditto_admission_policy_denied_total",
            "Requests denied by product access policy.",
            self.policy_denied_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_policy_denied_by_product_total",
            "Policy denials grouped by product.",
            "product",
            &self.policy_denied_by_product,
        );

        write_counter(
            &mut out,
            "ditto_admission_auth_cache_hits_total",
            "Authentication cache hits.",
            self.auth_cache_hits_total,
        );
        write_counter(
            &mut out,
            "ditto_admission_auth_cache_misses_total",
            "Authentication cache misses.",
            self.auth_cache_misses_total,
        );
        write_counter(
            &mut out,
            "ditto_admission_auth_invalid_total",
            "Rejected credentials.",
            self.auth_invalid_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_auth_invalid_by_method_total",
            "Rejected credentials grouped by authentication method.",
            "auth_method",
            &self.auth_invalid_by_method,
        );
        write_counter(
            &mut out,
            "ditto_admission_auth_store_unavailable_total",
            "Credential store lookups that failed.",
            self.auth_store_unavailable_total,
        );

        write_counter(
            &mut out,
            "ditto_admission_store_fallback_total",
            "Shared counter store failures answered from local buckets.",
            self.store_fallback_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_store_fallback_by_scope_total",
            "Shared counter store fallbacks grouped by throttle.",
            "scope",
            &self.store_fallback_by_scope,
        );
        write_counter(
            &mut out,
            "ditto_admission_store_pool_exhausted_total",
            "Store operations rejected because the connection pool was exhausted.",
            self.store_pool_exhausted_total,
        );
        write_counter_map(
            &mut out,
            "ditto_admission_store_pool_exhausted_by_store_total",
            "Store pool exhaustion grouped by store.",
            "store",
            &self.store_pool_exhausted_by_store,
        );

        write_counter(
            &mut out,
            "ditto_admission_upstream_failures_total",
            "Upstream calls that failed before producing a response.",
            self.upstream_failures_total,
        );

        write_counter(
            &mut out,
            "ditto_admission_stream_chunks_total",
            "Relayed stream chunks.",
            self.stream_chunks_total,
        );
        write_counter(
            &mut out,
            "ditto_admission_stream_bytes_total",
            "Relayed stream bytes.",
            self.stream_bytes_total,
        );
        out.push_str("# HELP ditto_admission_stream_end_total Finished streams by outcome.\n");
        out.push_str("# TYPE ditto_admission_stream_end_total counter\n");
        for (outcome, count) in [
            ("aborted", self.stream_aborted_total),
            ("completed", self.stream_completed_total),
            ("error", self.stream_errors_total),
        ] {
            out.push_str(&format!(
                "ditto_admission_stream_end_total{{outcome=\"{outcome}\"}} {count}\n"
            ));
        }

        write_gauge_entries(
            &mut out,
            "ditto_admission_cost_usd_micros_top",
            "Accumulated cost in USD micros for the top tenants.",
            "label",
            &self.cost_by_tenant.exported(),
        );
        write_gauge_entries(
            &mut out,
            "ditto_admission_tokens_top",
            "Accumulated tokens for the top users.",
            "label",
            &self.tokens_by_user.exported(),
        );

        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Error,
    Aborted,
}

/// Shared, cheaply clonable handle. The lock is only held for the duration of one counter
/// update and is never held across an `.await`.
#[derive(Clone, Debug, Default)]
pub struct MetricsHandle {
    inner: Arc<Mutex<GatewayMetrics>>,
}

impl MetricsHandle {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GatewayMetrics::new(config))),
        }
    }

    pub fn record(&self, f: impl FnOnce(&mut GatewayMetrics)) {
        let mut guard = self.lock();
        f(&mut *guard);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().snapshot()
    }

    pub fn render(&self) -> String {
        self.lock().render()
    }

    fn lock(&self) -> MutexGuard<'_, GatewayMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn bump_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize) {
    let key = if map.contains_key(key) || map.len() < max_series {
        key
    } else {
        "__overflow__"
    };
    let entry = map.entry(key.to_string()).or_default();
    *entry = entry.saturating_add(1);
}

fn write_counter(out: &mut String, metric: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    out.push_str(&format!("{metric} {value}\n"));
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));

    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn write_gauge_entries(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    entries: &[(String, f64)],
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} gauge\n"));
    for (value, amount) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {amount}\n",
            escape_label_value(value)
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_series_are_bounded() {
        let mut metrics = GatewayMetrics::new(MetricsConfig {
            max_label_series: 2,
            top_k: 2,
        });
        for scope in ["a", "b", "c", "d"] {
            metrics.record_throttle_denied(scope);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.throttle_denied_total, 4);
        assert_eq!(snapshot.throttle_denied_by_scope.len(), 3);
        assert_eq!(snapshot.throttle_denied_by_scope.get("__overflow__"), Some(&2));
    }

    #[test]
    fn renders_documented_series() {
        let handle = MetricsHandle::default();
        handle.record(|metrics| {
            metrics.record_request("api_key", "chat");
            metrics.record_throttle_denied("rate");
            metrics.record_auth_cache_hit();
            metrics.record_store_fallback("user_input_tokens");
            metrics.record_stream_chunk(12);
            metrics.record_stream_end(StreamOutcome::Aborted);
            metrics.record_cost("team \"x\"", 1500.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("ditto_admission_requests_total 1\n"));
        assert!(rendered.contains("ditto_admission_requests_by_auth_method_total{auth_method=\"api_key\"} 1\n"));
        assert!(rendered.contains("ditto_admission_throttle_denied_by_scope_total{scope=\"rate\"} 1\n"));
        assert!(rendered.contains("ditto_admission_auth_cache_hits_total 1\n"));
        assert!(rendered.contains("ditto_admission_store_fallback_total 1\n"));
        assert!(rendered.contains("ditto_admission_stream_bytes_total 12\n"));
        assert!(rendered.contains("ditto_admission_stream_end_total{outcome=\"aborted\"} 1\n"));
        assert!(rendered.contains("ditto_admission_cost_usd_micros_top{label=\"team \\\"x\\\"\"} 1500\n"));
    }

    #[test]
    fn escapes_label_values() {
        assert_eq!(escape_label_value("a"), "a");
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\\b"), "a\\\\b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }
}
