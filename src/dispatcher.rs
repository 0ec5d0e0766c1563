use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::decode::{DecodeError, EventDecoder};
use crate::event::{AllocationStatus, EventKind, RawMessage};
use crate::export::metrics::RelayMetrics;
use crate::tracker::RateTracker;

/// Sequential consumer that applies decoded events to the tracker.
///
/// Every event is applied completely before the next one is read, so the
/// tracker and the relay series only ever see a single writer.
pub struct Dispatcher {
    decoder: EventDecoder,
    tracker: RateTracker,
    metrics: Arc<RelayMetrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            decoder: EventDecoder::new(),
            tracker: RateTracker::new(Arc::clone(&metrics)),
            metrics,
        }
    }

    pub fn tracker(&self) -> &RateTracker {
        &self.tracker
    }

    /// Decodes and applies a single message observed at `now`.
    ///
    /// Malformed messages are logged, counted and dropped without touching
    /// any allocation state.
    pub fn handle(&mut self, message: &RawMessage, now: Instant) {
        let event = match self.decoder.decode(message) {
            Ok(event) => event,
            Err(e) => {
                self.record_decode_error(&e, message);
                return;
            }
        };

        self.metrics
            .events
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let allocation = &event.allocation;
        match event.kind {
            EventKind::Traffic(sample) => {
                let outcome =
                    self.tracker
                        .observe_traffic(&allocation.name, &allocation.realm, sample, now);
                debug!(
                    allocation = %allocation.name,
                    realm = %allocation.realm,
                    ?outcome,
                    "traffic sample",
                );
            }
            EventKind::Status(AllocationStatus::New) => {
                self.tracker.observe_created(&allocation.realm);
                debug!(allocation = %allocation.name, realm = %allocation.realm, "allocation created");
            }
            EventKind::Status(AllocationStatus::Deleted) => {
                let had_rate_state = self
                    .tracker
                    .observe_deleted(&allocation.name, &allocation.realm);
                debug!(
                    allocation = %allocation.name,
                    realm = %allocation.realm,
                    had_rate_state,
                    "allocation deleted",
                );
            }
            EventKind::Status(AllocationStatus::Refreshed) => {}
        }
    }

    /// Counts allocations that already existed before the subscription.
    ///
    /// `keys` are the allocations' `status` keys. Returns how many were
    /// counted; undecodable keys are skipped.
    pub fn reconcile(&mut self, keys: &[String]) -> usize {
        let mut counted = 0;

        for key in keys {
            match self.decoder.parse_key(key) {
                Ok((allocation, _)) => {
                    self.tracker.observe_created(&allocation.realm);
                    counted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "skipping existing allocation");
                    self.metrics
                        .decode_errors
                        .with_label_values(&[e.error_type()])
                        .inc();
                }
            }
        }

        counted
    }

    /// Consumes messages until the channel closes or `cancel` fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawMessage>, cancel: CancellationToken) {
        info!("dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle(&message, Instant::now());
                }
            }
        }

        info!(tracked = self.tracker.tracked(), "dispatcher stopped");
    }

    fn record_decode_error(&self, e: &DecodeError, message: &RawMessage) {
        self.metrics
            .decode_errors
            .with_label_values(&[e.error_type()])
            .inc();

        match e {
            DecodeError::Unsupported { .. } => {
                debug!(channel = %message.channel, error = %e, "ignoring event");
            }
            _ => {
                warn!(channel = %message.channel, error = %e, "dropping malformed event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gauge::Thresholds;

    const ALLOC: &str = "turn/realm/r/user/u/allocation/1";

    fn dispatcher() -> (Dispatcher, Arc<RelayMetrics>) {
        let metrics = Arc::new(
            RelayMetrics::new(
                Thresholds::new(vec![16384.0]).expect("thresholds"),
                Thresholds::new(vec![50.0, 100.0]).expect("thresholds"),
            )
            .expect("metrics"),
        );
        (Dispatcher::new(Arc::clone(&metrics)), metrics)
    }

    fn traffic(rcvp: u64) -> RawMessage {
        RawMessage::new(
            format!("{ALLOC}/traffic"),
            format!("rcvp={rcvp}, rcvb=0, sentp=0, sentb=0"),
        )
    }

    fn status(payload: &str) -> RawMessage {
        RawMessage::new(format!("{ALLOC}/status"), payload)
    }

    #[test]
    fn test_handle_lifecycle() {
        let (mut d, metrics) = dispatcher();
        let t0 = Instant::now();

        d.handle(&status("new lifetime=600"), t0);
        d.handle(&traffic(10), t0);
        d.handle(&traffic(600), t0 + Duration::from_secs(10));
        d.handle(&status("refreshed lifetime=600"), t0 + Duration::from_secs(11));

        assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 1);
        assert_eq!(
            metrics
                .received_packet_rate
                .snapshot(&["r"])
                .map(|s| s.counts()),
            Some(vec![0, 1, 1])
        );
        assert_eq!(metrics.events.with_label_values(&["traffic"]).get(), 2);
        assert_eq!(metrics.events.with_label_values(&["status"]).get(), 2);

        d.handle(&status("deleted"), t0 + Duration::from_secs(12));
        assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 0);
        assert_eq!(d.tracker().tracked(), 0);
        assert_eq!(
            metrics
                .received_packet_rate
                .snapshot(&["r"])
                .map(|s| s.counts()),
            Some(vec![0, 0, 0])
        );
    }

    #[test]
    fn test_handle_malformed_does_not_mutate() {
        let (mut d, metrics) = dispatcher();
        let t0 = Instant::now();

        d.handle(&RawMessage::new("not/a/turn/key", "deleted"), t0);
        d.handle(&RawMessage::new(format!("{ALLOC}/traffic"), "rcvp=1"), t0);
        d.handle(&status("bogus"), t0);
        d.handle(&RawMessage::new(format!("{ALLOC}/total_traffic"), "rcvp=1, rcvb=1, sentp=1, sentb=1"), t0);

        assert_eq!(d.tracker().tracked(), 0);
        assert_eq!(metrics.received_packets.with_label_values(&["r"]).get(), 0);
        assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 0);
        for error_type in ["unexpected_key", "unexpected_traffic", "unknown_status", "unsupported"] {
            assert_eq!(
                metrics.decode_errors.with_label_values(&[error_type]).get(),
                1,
                "{error_type}"
            );
        }
    }

    #[test]
    fn test_reconcile_counts_existing_allocations() {
        let (mut d, metrics) = dispatcher();
        let keys = vec![
            "turn/realm/a/user/u/allocation/1/status".to_string(),
            "turn/realm/a/user/v/allocation/2/status".to_string(),
            "turn/realm/b/user/u/allocation/3/status".to_string(),
            "garbage".to_string(),
        ];

        assert_eq!(d.reconcile(&keys), 3);
        assert_eq!(metrics.allocations.with_label_values(&["a"]).get(), 2);
        assert_eq!(metrics.allocations.with_label_values(&["b"]).get(), 1);
        assert_eq!(
            metrics.decode_errors.with_label_values(&["unexpected_key"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_drains_until_channel_closes() {
        let (d, metrics) = dispatcher();
        let (tx, rx) = mpsc::channel(8);

        tx.send(status("new")).await.expect("send");
        tx.send(traffic(5)).await.expect("send");
        drop(tx);

        d.run(rx, CancellationToken::new()).await;

        assert_eq!(metrics.allocations.with_label_values(&["r"]).get(), 1);
        assert_eq!(metrics.received_packets.with_label_values(&["r"]).get(), 5);
        assert_eq!(metrics.tracked_allocations.get(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (d, _metrics) = dispatcher();
        let (_tx, rx) = mpsc::channel::<RawMessage>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), d.run(rx, cancel))
            .await
            .expect("run returns after cancel");
    }
}
