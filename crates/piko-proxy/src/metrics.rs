//! Proxy request metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `piko_proxy_requests_in_flight` | Gauge | `endpoint` |
//! | `piko_proxy_requests_total` | Counter | `endpoint`, `status`, `method` |
//! | `piko_proxy_request_latency_seconds` | Histogram | `endpoint`, `status`, `method` |
//! | `piko_proxy_request_size_bytes` | Histogram | `endpoint` |
//! | `piko_proxy_response_size_bytes` | Histogram | `endpoint` |

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::time::Duration;

/// Observes requests passing through the proxy
pub trait ProxyMetrics: Send + Sync {
    fn request_started(&self, endpoint_id: &str);

    /// Called once per started request
    fn request_finished(
        &self,
        endpoint_id: &str,
        method: &str,
        status: u16,
        latency: Duration,
        request_bytes: usize,
        response_bytes: usize,
    );
}

/// Records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProxyMetrics;

impl ProxyMetrics for NoopProxyMetrics {
    fn request_started(&self, _endpoint_id: &str) {}

    fn request_finished(
        &self,
        _endpoint_id: &str,
        _method: &str,
        _status: u16,
        _latency: Duration,
        _request_bytes: usize,
        _response_bytes: usize,
    ) {
    }
}

/// Prometheus-backed proxy metrics
#[derive(Clone)]
pub struct PrometheusProxyMetrics {
    requests_in_flight: GaugeVec,
    requests_total: CounterVec,
    request_latency: HistogramVec,
    request_size: HistogramVec,
    response_size: HistogramVec,
}

impl PrometheusProxyMetrics {
    /// Create the metrics and register them with `registry`
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g. duplicate name).
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let size_buckets = exponential_buckets(256.0, 4.0, 8)?;

        let requests_in_flight = GaugeVec::new(
            Opts::new(
                "requests_in_flight",
                "Number of requests currently handled by this server.",
            )
            .namespace("piko")
            .subsystem("proxy"),
            &["endpoint"],
        )?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "Total requests.")
                .namespace("piko")
                .subsystem("proxy"),
            &["endpoint", "status", "method"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "Request latency.")
                .namespace("piko")
                .subsystem("proxy"),
            &["endpoint", "status", "method"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        let request_size = HistogramVec::new(
            HistogramOpts::new("request_size_bytes", "Request size")
                .namespace("piko")
                .subsystem("proxy")
                .buckets(size_buckets.clone()),
            &["endpoint"],
        )?;
        registry.register(Box::new(request_size.clone()))?;

        let response_size = HistogramVec::new(
            HistogramOpts::new("response_size_bytes", "Response size")
                .namespace("piko")
                .subsystem("proxy")
                .buckets(size_buckets),
            &["endpoint"],
        )?;
        registry.register(Box::new(response_size.clone()))?;

        Ok(Self {
            requests_in_flight,
            requests_total,
            request_latency,
            request_size,
            response_size,
        })
    }
}

impl ProxyMetrics for PrometheusProxyMetrics {
    fn request_started(&self, endpoint_id: &str) {
        self.requests_in_flight
            .with_label_values(&[endpoint_id])
            .inc();
    }

    fn request_finished(
        &self,
        endpoint_id: &str,
        method: &str,
        status: u16,
        latency: Duration,
        request_bytes: usize,
        response_bytes: usize,
    ) {
        let status = status.to_string();

        self.requests_in_flight
            .with_label_values(&[endpoint_id])
            .dec();
        self.requests_total
            .with_label_values(&[endpoint_id, status.as_str(), method])
            .inc();
        self.request_latency
            .with_label_values(&[endpoint_id, status.as_str(), method])
            .observe(latency.as_secs_f64());
        self.request_size
            .with_label_values(&[endpoint_id])
            .observe(request_bytes as f64);
        self.response_size
            .with_label_values(&[endpoint_id])
            .observe(response_bytes as f64);
    }
}
