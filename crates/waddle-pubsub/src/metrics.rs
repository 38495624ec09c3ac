//! PubSub metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application (waddle-pubsub-server).

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-pubsub"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for items accepted by leaf nodes.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.published")
        .with_description("Total items published")
        .with_unit("item")
        .build()
}

/// Counter for items retracted by publishers or admins.
pub fn items_retracted() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.retracted")
        .with_description("Total items retracted")
        .with_unit("item")
        .build()
}

/// Counter for event notifications handed to the broadcaster.
pub fn notifications_sent() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifications.sent")
        .with_description("Total event notifications sent")
        .with_unit("notification")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for nodes registered in a service.
pub fn nodes_active() -> Gauge<i64> {
    meter()
        .i64_gauge("pubsub.nodes.active")
        .with_description("Current number of pubsub nodes")
        .with_unit("node")
        .build()
}

/// Gauge for item writes waiting in the write-behind queue.
pub fn queue_depth() -> Gauge<i64> {
    meter()
        .i64_gauge("pubsub.persistence.queue.depth")
        .with_description("Pending item writes awaiting flush")
        .with_unit("operation")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for write-behind flush latency.
pub fn flush_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("pubsub.persistence.flush.latency")
        .with_description("Latency of flushing pending item writes")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record items published to a node.
pub fn record_items_published(count: usize, service_id: &str) {
    items_published().add(
        count as u64,
        &[KeyValue::new("service", service_id.to_string())],
    );
}

/// Record items retracted from a node.
pub fn record_items_retracted(count: usize, service_id: &str) {
    items_retracted().add(
        count as u64,
        &[KeyValue::new("service", service_id.to_string())],
    );
}

/// Record notifications handed to the broadcaster, by event kind.
pub fn record_notifications(count: usize, kind: &'static str) {
    notifications_sent().add(count as u64, &[KeyValue::new("kind", kind)]);
}

/// Record the current node count of a service.
pub fn record_node_count(count: usize, service_id: &str) {
    nodes_active().record(
        count as i64,
        &[KeyValue::new("service", service_id.to_string())],
    );
}

/// Record the current write-behind queue depth.
pub fn record_queue_depth(adds: usize, deletes: usize) {
    queue_depth().record(adds as i64, &[KeyValue::new("queue", "add")]);
    queue_depth().record(deletes as i64, &[KeyValue::new("queue", "delete")]);
}

/// Record a flush and its outcome.
pub fn record_flush_latency(latency_ms: f64, success: bool) {
    flush_latency().record(
        latency_ms,
        &[KeyValue::new(
            "result",
            if success { "success" } else { "failure" },
        )],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_without_provider() {
        // The global no-op provider accepts recordings.
        record_items_published(2, "pubsub");
        record_items_retracted(1, "pubsub");
        record_notifications(3, "items");
        record_node_count(3, "pubsub");
        record_queue_depth(4, 1);
        record_flush_latency(1.5, true);
    }
}
