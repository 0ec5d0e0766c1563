use anyhow::{Context, Result};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::gauge::{BucketedGauge, Thresholds};

/// Namespace of the relay series.
pub const NAMESPACE: &str = "coturn";

/// Namespace of the exporter's own health series.
pub const SELF_NAMESPACE: &str = "coturn_exporter";

/// Label every relay series is keyed by.
pub const REALM_LABEL: &str = "realm";

/// Prometheus series published by the exporter.
///
/// Relay series are only ever mutated by the dispatcher task; the HTTP
/// handler gathers them concurrently through the registry.
pub struct RelayMetrics {
    registry: Registry,

    // === Relay ===
    /// Number of live allocations per realm.
    pub allocations: IntGaugeVec,
    pub received_packets: IntCounterVec,
    pub received_bytes: IntCounterVec,
    pub sent_packets: IntCounterVec,
    pub sent_bytes: IntCounterVec,
    /// Distribution of current per-allocation received packet rates.
    pub received_packet_rate: BucketedGauge,
    /// Distribution of current per-allocation received byte rates.
    pub received_byte_rate: BucketedGauge,
    /// Distribution of current per-allocation sent packet rates.
    pub sent_packet_rate: BucketedGauge,
    /// Distribution of current per-allocation sent byte rates.
    pub sent_byte_rate: BucketedGauge,

    // === Exporter ===
    /// Decoded events by kind.
    pub events: IntCounterVec,
    /// Dropped events by decode error type.
    pub decode_errors: IntCounterVec,
    /// Traffic samples that could not produce a rate (zero elapsed time).
    pub rate_samples_skipped: IntCounter,
    /// Allocations with rate-tracking state.
    pub tracked_allocations: IntGauge,
    /// Event source reconnect attempts.
    pub source_reconnects: IntCounter,
}

impl RelayMetrics {
    /// Creates every series and registers it with a fresh registry.
    pub fn new(byte_rate_thresholds: Thresholds, packet_rate_thresholds: Thresholds) -> Result<Self> {
        let registry = Registry::new();
        let labels = &[REALM_LABEL];

        let allocations = IntGaugeVec::new(
            Opts::new("allocations", "Number of allocations").namespace(NAMESPACE),
            labels,
        )?;
        let received_packets = IntCounterVec::new(
            Opts::new("received_packets_total", "Number of packets received").namespace(NAMESPACE),
            labels,
        )?;
        let received_bytes = IntCounterVec::new(
            Opts::new("received_bytes_total", "Number of bytes received").namespace(NAMESPACE),
            labels,
        )?;
        let sent_packets = IntCounterVec::new(
            Opts::new("sent_packets_total", "Number of packets sent").namespace(NAMESPACE),
            labels,
        )?;
        let sent_bytes = IntCounterVec::new(
            Opts::new("sent_bytes_total", "Number of bytes sent").namespace(NAMESPACE),
            labels,
        )?;

        let received_packet_rate = BucketedGauge::new(
            Opts::new(
                "received_packet_rate_pps_bucket",
                "Received packet rate distribution",
            )
            .namespace(NAMESPACE),
            labels,
            packet_rate_thresholds.clone(),
        )?;
        let received_byte_rate = BucketedGauge::new(
            Opts::new(
                "received_byte_rate_bps_bucket",
                "Received byte rate distribution",
            )
            .namespace(NAMESPACE),
            labels,
            byte_rate_thresholds.clone(),
        )?;
        let sent_packet_rate = BucketedGauge::new(
            Opts::new("sent_packet_rate_pps_bucket", "Sent packet rate distribution")
                .namespace(NAMESPACE),
            labels,
            packet_rate_thresholds,
        )?;
        let sent_byte_rate = BucketedGauge::new(
            Opts::new("sent_byte_rate_bps_bucket", "Sent byte rate distribution")
                .namespace(NAMESPACE),
            labels,
            byte_rate_thresholds,
        )?;

        let events = IntCounterVec::new(
            Opts::new("events_total", "Total decoded events by kind.").namespace(SELF_NAMESPACE),
            &["kind"],
        )?;
        let decode_errors = IntCounterVec::new(
            Opts::new(
                "decode_errors_total",
                "Total events dropped by decode error type.",
            )
            .namespace(SELF_NAMESPACE),
            &["error_type"],
        )?;
        let rate_samples_skipped = IntCounter::with_opts(
            Opts::new(
                "rate_samples_skipped_total",
                "Total traffic samples without elapsed time since the previous sample.",
            )
            .namespace(SELF_NAMESPACE),
        )?;
        let tracked_allocations = IntGauge::with_opts(
            Opts::new(
                "tracked_allocations",
                "Number of allocations with rate-tracking state.",
            )
            .namespace(SELF_NAMESPACE),
        )?;
        let source_reconnects = IntCounter::with_opts(
            Opts::new(
                "source_reconnects_total",
                "Total event source reconnect attempts.",
            )
            .namespace(SELF_NAMESPACE),
        )?;

        // Relay
        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(received_packets.clone()))?;
        registry.register(Box::new(received_bytes.clone()))?;
        registry.register(Box::new(sent_packets.clone()))?;
        registry.register(Box::new(sent_bytes.clone()))?;
        registry.register(Box::new(received_packet_rate.gauge_vec().clone()))?;
        registry.register(Box::new(received_byte_rate.gauge_vec().clone()))?;
        registry.register(Box::new(sent_packet_rate.gauge_vec().clone()))?;
        registry.register(Box::new(sent_byte_rate.gauge_vec().clone()))?;

        // Exporter
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(rate_samples_skipped.clone()))?;
        registry.register(Box::new(tracked_allocations.clone()))?;
        registry.register(Box::new(source_reconnects.clone()))?;

        Ok(Self {
            registry,
            allocations,
            received_packets,
            received_bytes,
            sent_packets,
            sent_bytes,
            received_packet_rate,
            received_byte_rate,
            sent_packet_rate,
            sent_byte_rate,
            events,
            decode_errors,
            rate_samples_skipped,
            tracked_allocations,
            source_reconnects,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered series in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Renders a registry in the Prometheus text format.
pub fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}
