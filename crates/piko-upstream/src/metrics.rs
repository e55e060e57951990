//! Tunnel connection metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `piko_upstream_connections` | Gauge | `endpoint` |
//! | `piko_upstream_disconnects_total` | Counter | `endpoint`, `reason` |

use prometheus::{CounterVec, GaugeVec, Opts, Registry};

/// Observes upstream tunnels coming and going
pub trait UpstreamMetrics: Send + Sync {
    fn connection_opened(&self, endpoint_id: &str);

    /// `reason` is the tunnel's close reason, e.g. `peer_closed`
    fn connection_closed(&self, endpoint_id: &str, reason: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUpstreamMetrics;

impl UpstreamMetrics for NoopUpstreamMetrics {
    fn connection_opened(&self, _endpoint_id: &str) {}

    fn connection_closed(&self, _endpoint_id: &str, _reason: &str) {}
}

/// Prometheus-backed upstream metrics
#[derive(Clone)]
pub struct PrometheusUpstreamMetrics {
    connections: GaugeVec,
    disconnects_total: CounterVec,
}

impl PrometheusUpstreamMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let connections = GaugeVec::new(
            Opts::new("connections", "Number of connected upstream tunnels.")
                .namespace("piko")
                .subsystem("upstream"),
            &["endpoint"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        let disconnects_total = CounterVec::new(
            Opts::new("disconnects_total", "Upstream tunnel disconnects.")
                .namespace("piko")
                .subsystem("upstream"),
            &["endpoint", "reason"],
        )?;
        registry.register(Box::new(disconnects_total.clone()))?;

        Ok(Self {
            connections,
            disconnects_total,
        })
    }
}

impl UpstreamMetrics for PrometheusUpstreamMetrics {
    fn connection_opened(&self, endpoint_id: &str) {
        self.connections.with_label_values(&[endpoint_id]).inc();
    }

    fn connection_closed(&self, endpoint_id: &str, reason: &str) {
        self.connections.with_label_values(&[endpoint_id]).dec();
        self.disconnects_total
            .with_label_values(&[endpoint_id, reason])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_gauge_tracks_open_tunnels() {
        let registry = Registry::new();
        let metrics = PrometheusUpstreamMetrics::new(&registry).unwrap();

        metrics.connection_opened("my-endpoint");
        metrics.connection_opened("my-endpoint");
        metrics.connection_closed("my-endpoint", "peer_closed");

        assert_eq!(
            metrics
                .connections
                .with_label_values(&["my-endpoint"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics
                .disconnects_total
                .with_label_values(&["my-endpoint", "peer_closed"])
                .get(),
            1.0
        );
    }
}
