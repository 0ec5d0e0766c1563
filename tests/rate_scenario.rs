use std::sync::Arc;
use std::time::{Duration, Instant};

use coturn_exporter::dispatcher::Dispatcher;
use coturn_exporter::event::RawMessage;
use coturn_exporter::export::metrics::RelayMetrics;
use coturn_exporter::gauge::Thresholds;

const ALLOCATION: &str = "turn/realm/r/user/1571760000:alice/allocation/001";

fn metrics(packet_bounds: &[f64]) -> Arc<RelayMetrics> {
    Arc::new(
        RelayMetrics::new(
            Thresholds::new(vec![16384.0, 32768.0]).expect("byte thresholds"),
            Thresholds::new(packet_bounds.to_vec()).expect("packet thresholds"),
        )
        .expect("metrics"),
    )
}

fn traffic(rcvp: u64, rcvb: u64, sentp: u64, sentb: u64) -> RawMessage {
    RawMessage::new(
        format!("{ALLOCATION}/traffic"),
        format!("rcvp={rcvp}, rcvb={rcvb}, sentp={sentp}, sentb={sentb}"),
    )
}

fn status(payload: &str) -> RawMessage {
    RawMessage::new(format!("{ALLOCATION}/status"), payload)
}

fn rcvp_buckets(metrics: &RelayMetrics) -> Option<Vec<i64>> {
    metrics
        .received_packet_rate
        .snapshot(&["r"])
        .map(|s| s.counts())
}

#[test]
fn test_allocation_lifecycle_drives_rate_buckets() {
    let metrics = metrics(&[50.0, 100.0]);
    let mut dispatcher = Dispatcher::new(Arc::clone(&metrics));
    let t0 = Instant::now();

    dispatcher.handle(&status("new lifetime=600"), t0);
    assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 1);

    // First sample: counters only.
    dispatcher.handle(&traffic(10, 1_000, 10, 1_000), t0);
    assert_eq!(rcvp_buckets(&metrics), None);
    assert_eq!(metrics.received_packets.with_label_values(&["r"]).get(), 10);

    // 600 packets over 10s = 60 pps.
    dispatcher.handle(&traffic(600, 1_000, 10, 1_000), t0 + Duration::from_secs(10));
    assert_eq!(rcvp_buckets(&metrics), Some(vec![0, 1, 1]));

    // 400 packets over 10s = 40 pps.
    dispatcher.handle(&traffic(400, 1_000, 10, 1_000), t0 + Duration::from_secs(20));
    assert_eq!(rcvp_buckets(&metrics), Some(vec![1, 1, 1]));

    dispatcher.handle(&status("deleted"), t0 + Duration::from_secs(21));
    assert_eq!(rcvp_buckets(&metrics), Some(vec![0, 0, 0]));
    assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 0);
    assert_eq!(dispatcher.tracker().tracked(), 0);

    assert_eq!(metrics.received_packets.with_label_values(&["r"]).get(), 1_010);
    assert_eq!(metrics.received_bytes.with_label_values(&["r"]).get(), 3_000);
    assert_eq!(metrics.sent_packets.with_label_values(&["r"]).get(), 30);
    assert_eq!(metrics.sent_bytes.with_label_values(&["r"]).get(), 3_000);
}

#[test]
fn test_byte_rate_buckets_follow_allocation() {
    let metrics = metrics(&[50.0, 100.0]);
    let mut dispatcher = Dispatcher::new(Arc::clone(&metrics));
    let t0 = Instant::now();

    dispatcher.handle(&traffic(0, 0, 0, 0), t0);
    // 200000 bytes over 10s = 20000 B/s: above 16384, below 32768.
    dispatcher.handle(&traffic(0, 200_000, 0, 500_000), t0 + Duration::from_secs(10));

    let rcvb = metrics
        .received_byte_rate
        .snapshot(&["r"])
        .expect("present");
    assert_eq!(rcvb.count_at(16384.0), Some(0));
    assert_eq!(rcvb.count_at(32768.0), Some(1));
    assert_eq!(rcvb.overflow, 1);

    // 50000 B/s is beyond every threshold.
    let sentb = metrics.sent_byte_rate.snapshot(&["r"]).expect("present");
    assert_eq!(sentb.counts(), vec![0, 0, 1]);
}

#[test]
fn test_realms_are_accounted_separately() {
    let metrics = metrics(&[50.0, 100.0]);
    let mut dispatcher = Dispatcher::new(Arc::clone(&metrics));
    let t0 = Instant::now();
    let t1 = t0 + Duration::from_secs(10);

    let a = "turn/realm/a.example/user/u/allocation/1";
    let b = "turn/realm/b.example/user/u/allocation/2";
    for (alloc, rcvp) in [(a, 300), (b, 3_000)] {
        dispatcher.handle(&RawMessage::new(format!("{alloc}/status"), "new"), t0);
        dispatcher.handle(
            &RawMessage::new(format!("{alloc}/traffic"), "rcvp=0, rcvb=0, sentp=0, sentb=0"),
            t0,
        );
        dispatcher.handle(
            &RawMessage::new(
                format!("{alloc}/traffic"),
                format!("rcvp={rcvp}, rcvb=0, sentp=0, sentb=0"),
            ),
            t1,
        );
    }

    let snap = |realm: &str| {
        metrics
            .received_packet_rate
            .snapshot(&[realm])
            .map(|s| s.counts())
    };
    assert_eq!(snap("a.example"), Some(vec![1, 1, 1]));
    assert_eq!(snap("b.example"), Some(vec![0, 0, 1]));
    assert_eq!(metrics.allocations.with_label_values(&["a.example"]).get(), 1);
    assert_eq!(metrics.allocations.with_label_values(&["b.example"]).get(), 1);
}

#[test]
fn test_exposition_contains_bucket_series() {
    let metrics = metrics(&[50.0, 100.0]);
    let mut dispatcher = Dispatcher::new(Arc::clone(&metrics));
    let t0 = Instant::now();

    dispatcher.handle(&traffic(0, 0, 0, 0), t0);
    dispatcher.handle(&traffic(600, 0, 0, 0), t0 + Duration::from_secs(10));

    let text = metrics.encode_text().expect("encodes");
    assert!(text.contains("coturn_received_packet_rate_pps_bucket{le=\"50\",realm=\"r\"} 0"));
    assert!(text.contains("coturn_received_packet_rate_pps_bucket{le=\"100\",realm=\"r\"} 1"));
    assert!(text.contains("coturn_received_packet_rate_pps_bucket{le=\"+Inf\",realm=\"r\"} 1"));
    assert!(text.contains("coturn_exporter_events_total{kind=\"traffic\"} 2"));
}
