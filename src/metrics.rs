//! Prometheus Metrics
//!
//! Observability counters for the relay's message plane.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Event stream metrics
    /// Current subscribed event streams.
    pub streams_active: IntGauge,
    /// Total event stream subscriptions accepted.
    pub streams_total: IntCounter,

    // Message plane metrics
    /// Total message batches accepted.
    pub batches_received: IntCounter,
    /// Total mailbox entries persisted.
    pub messages_stored: IntCounter,
    /// Total mailbox reads served.
    pub mailbox_fetches: IntCounter,
    /// Live notifications delivered to a subscriber channel.
    pub fanout_delivered: IntCounter,
    /// Live notifications dropped (recipient offline or channel full).
    pub fanout_dropped: IntCounter,

    // One-time key metrics
    /// Total one-time keys published.
    pub otkeys_added: IntCounter,
    /// Total one-time keys served to peers.
    pub otkeys_served: IntCounter,
    /// Lookups that found an empty key pool.
    pub otkey_misses: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let streams_active = IntGauge::with_opts(Opts::new(
            "relay_streams_active",
            "Current subscribed event streams",
        ))
        .unwrap();

        let streams_total = IntCounter::with_opts(Opts::new(
            "relay_streams_total",
            "Total event stream subscriptions accepted",
        ))
        .unwrap();

        let batches_received = IntCounter::with_opts(Opts::new(
            "relay_batches_received_total",
            "Total message batches accepted",
        ))
        .unwrap();

        let messages_stored = IntCounter::with_opts(Opts::new(
            "relay_messages_stored_total",
            "Total mailbox entries persisted",
        ))
        .unwrap();

        let mailbox_fetches = IntCounter::with_opts(Opts::new(
            "relay_mailbox_fetches_total",
            "Total mailbox reads served",
        ))
        .unwrap();

        let fanout_delivered = IntCounter::with_opts(Opts::new(
            "relay_fanout_delivered_total",
            "Live notifications delivered to a subscriber channel",
        ))
        .unwrap();

        let fanout_dropped = IntCounter::with_opts(Opts::new(
            "relay_fanout_dropped_total",
            "Live notifications dropped (recipient offline or channel full)",
        ))
        .unwrap();

        let otkeys_added = IntCounter::with_opts(Opts::new(
            "relay_otkeys_added_total",
            "Total one-time keys published",
        ))
        .unwrap();

        let otkeys_served = IntCounter::with_opts(Opts::new(
            "relay_otkeys_served_total",
            "Total one-time keys served to peers",
        ))
        .unwrap();

        let otkey_misses = IntCounter::with_opts(Opts::new(
            "relay_otkey_misses_total",
            "Lookups that found an empty key pool",
        ))
        .unwrap();

        registry.register(Box::new(streams_active.clone())).unwrap();
        registry.register(Box::new(streams_total.clone())).unwrap();
        registry
            .register(Box::new(batches_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_stored.clone()))
            .unwrap();
        registry
            .register(Box::new(mailbox_fetches.clone()))
            .unwrap();
        registry
            .register(Box::new(fanout_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(fanout_dropped.clone()))
            .unwrap();
        registry.register(Box::new(otkeys_added.clone())).unwrap();
        registry.register(Box::new(otkeys_served.clone())).unwrap();
        registry.register(Box::new(otkey_misses.clone())).unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            streams_active,
            streams_total,
            batches_received,
            messages_stored,
            mailbox_fetches,
            fanout_delivered,
            fanout_dropped,
            otkeys_added,
            otkeys_served,
            otkey_misses,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
