use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Counters served by a `metrics` backend.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub backend_selections_total: IntCounterVec,
    pub backend_failures_total: IntCounterVec,
    pub connections_active: IntGauge,
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("portico_requests_total", "Requests answered"),
            &["listener", "service", "code"],
        )
        .expect("metric definition");
        let backend_selections_total = IntCounterVec::new(
            Opts::new("portico_backend_selections_total", "Balancer decisions"),
            &["service", "backend"],
        )
        .expect("metric definition");
        let backend_failures_total = IntCounterVec::new(
            Opts::new("portico_backend_failures_total", "Backend connect/write failures"),
            &["backend"],
        )
        .expect("metric definition");
        let connections_active = IntGauge::new(
            "portico_connections_active",
            "Client connections currently being served",
        )
        .expect("metric definition");

        for c in [&requests_total, &backend_selections_total, &backend_failures_total] {
            if let Err(e) = registry.register(Box::new(c.clone())) {
                warn!(error = %e, "metric registration failed");
            }
        }
        if let Err(e) = registry.register(Box::new(connections_active.clone())) {
            warn!(error = %e, "metric registration failed");
        }

        Metrics {
            registry,
            requests_total,
            backend_selections_total,
            backend_failures_total,
            connections_active,
        }
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "metrics encoding failed");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let m = Metrics::new();
        m.requests_total
            .with_label_values(&["0.0.0.0:8080", "web", "200"])
            .inc();
        let text = m.render();
        assert!(text.contains("portico_requests_total"));
        assert!(text.contains("web"));
    }
}
