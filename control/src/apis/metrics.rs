//! Controller metrics
//!
//! Watch loop, store writer and table size counters on a private registry.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Watch events by kind, event type and what happened to them
    static ref WATCH_EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "edgesync_watch_events_total",
            "Total number of watch events processed",
        );
        let counter = IntCounterVec::new(opts, &["kind", "event", "outcome"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch stream disconnects by kind and reason
    static ref WATCH_RECONNECTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "edgesync_watch_reconnects_total",
            "Total number of watch stream reconnects",
        );
        let counter = IntCounterVec::new(opts, &["kind", "reason"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Store saves by outcome
    static ref STORE_SAVES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "edgesync_store_saves_total",
            "Total number of routing document saves",
        );
        let counter = IntCounterVec::new(opts, &["outcome"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Store save duration (write + stage + commit + push)
    static ref STORE_SAVE_DURATION: Histogram = {
        let opts = HistogramOpts::new(
            "edgesync_store_save_duration_seconds",
            "Routing document save duration in seconds",
        );
        let histogram = Histogram::with_opts(opts).expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// 1 while the watch stream for a kind is open
    static ref WATCH_CONNECTED: IntGaugeVec = {
        let opts = Opts::new(
            "edgesync_watch_connected",
            "Whether the watch stream for a resource kind is open",
        );
        let gauge = IntGaugeVec::new(opts, &["kind"]).expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Current number of entries per table
    static ref ROUTES: IntGaugeVec = {
        let opts = Opts::new("edgesync_routes", "Entries in the routing document");
        let gauge = IntGaugeVec::new(opts, &["table"]).expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Record one processed watch event
pub fn record_watch_event(kind: &str, event: &str, outcome: &str) {
    WATCH_EVENTS_TOTAL
        .with_label_values(&[kind, event, outcome])
        .inc();
}

/// Record a watch stream disconnect
pub fn record_watch_reconnect(kind: &str, reason: &str) {
    WATCH_RECONNECTS_TOTAL.with_label_values(&[kind, reason]).inc();
}

/// Publish whether a kind's watch stream is open
pub fn set_watch_connected(kind: &str, connected: bool) {
    WATCH_CONNECTED
        .with_label_values(&[kind])
        .set(i64::from(connected));
}

/// Record a store save attempt
pub fn record_store_save(outcome: &str, duration_secs: f64) {
    STORE_SAVE_DURATION.observe(duration_secs);
    STORE_SAVES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Publish current table sizes
pub fn set_route_counts(routes: usize, acme_routes: usize) {
    ROUTES.with_label_values(&["routes"]).set(routes as i64);
    ROUTES
        .with_label_values(&["acmeRoutes"])
        .set(acme_routes as i64);
}

/// Gather controller metrics in text exposition format
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_metrics_recorded() {
        record_watch_event("Ingress", "ADDED", "applied");
        record_watch_reconnect("Ingress", "stream_ended");
        set_watch_connected("Service", true);

        let metrics = gather_controller_metrics().expect("Should gather metrics");

        assert!(metrics.contains("edgesync_watch_events_total"));
        assert!(metrics.contains("edgesync_watch_reconnects_total"));
        assert!(metrics.contains("edgesync_watch_connected{kind=\"Service\"} 1"));
    }

    #[test]
    fn test_store_metrics_recorded() {
        record_store_save("committed", 0.12);
        set_route_counts(3, 1);

        let metrics = gather_controller_metrics().expect("Should gather metrics");

        assert!(metrics.contains("edgesync_store_saves_total"));
        assert!(metrics.contains("edgesync_store_save_duration_seconds"));
        assert!(metrics.contains("edgesync_routes"));
    }
}
