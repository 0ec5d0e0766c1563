//! Per-allocation rate tracking.
//!
//! coturn reports traffic as deltas since the previous report. The tracker
//! turns consecutive reports into per-second rates and keeps the rate
//! distribution gauges in sync as allocations appear, change rate and go
//! away. The first report of an allocation only establishes a timestamp, so
//! it never contributes a rate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::event::{RateSample, TrafficSample};
use crate::export::metrics::RelayMetrics;

/// What a traffic report did to the rate gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    /// First report for the allocation; only the timestamp was recorded.
    First,
    /// First rate for the allocation was added to the gauges.
    Added,
    /// The allocation's rate was moved from its previous value.
    Replaced,
    /// No time elapsed since the previous report; the deltas are carried
    /// into the next rate.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
struct AllocationState {
    previous_rate: Option<RateSample>,
    last_observed_at: Instant,
    carried: TrafficSample,
}

impl AllocationState {
    fn new(now: Instant) -> Self {
        Self {
            previous_rate: None,
            last_observed_at: now,
            carried: TrafficSample::default(),
        }
    }
}

/// Owns the rate state of every live allocation.
///
/// Not thread-safe by design of use: a single dispatcher owns the tracker and
/// is the only writer of the relay series.
pub struct RateTracker {
    metrics: Arc<RelayMetrics>,
    allocations: HashMap<String, AllocationState>,
}

impl RateTracker {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            metrics,
            allocations: HashMap::new(),
        }
    }

    /// Number of allocations with rate state.
    pub fn tracked(&self) -> usize {
        self.allocations.len()
    }

    /// Last rate computed for `allocation`, if any.
    pub fn current_rate(&self, allocation: &str) -> Option<RateSample> {
        self.allocations
            .get(allocation)
            .and_then(|state| state.previous_rate)
    }

    /// Records a traffic report observed at `now`.
    pub fn observe_traffic(
        &mut self,
        allocation: &str,
        realm: &str,
        sample: TrafficSample,
        now: Instant,
    ) -> RateOutcome {
        let labels = [realm];

        self.metrics
            .received_packets
            .with_label_values(&labels)
            .inc_by(sample.received_packets);
        self.metrics
            .received_bytes
            .with_label_values(&labels)
            .inc_by(sample.received_bytes);
        self.metrics
            .sent_packets
            .with_label_values(&labels)
            .inc_by(sample.sent_packets);
        self.metrics
            .sent_bytes
            .with_label_values(&labels)
            .inc_by(sample.sent_bytes);

        let Some(state) = self.allocations.get_mut(allocation) else {
            self.allocations
                .insert(allocation.to_string(), AllocationState::new(now));
            self.metrics.tracked_allocations.set(self.allocations.len() as i64);
            trace!(allocation, realm, "tracking new allocation");
            return RateOutcome::First;
        };

        let pending = state.carried + sample;
        let elapsed = now.saturating_duration_since(state.last_observed_at);

        let Some(rate) = pending.rate_over(elapsed) else {
            state.carried = pending;
            self.metrics.rate_samples_skipped.inc();
            trace!(allocation, realm, "no time elapsed since previous sample");
            return RateOutcome::Skipped;
        };

        let outcome = match state.previous_rate {
            Some(previous) => {
                replace_rates(&self.metrics, &labels, &rate, &previous);
                RateOutcome::Replaced
            }
            None => {
                add_rates(&self.metrics, &labels, &rate);
                RateOutcome::Added
            }
        };

        state.previous_rate = Some(rate);
        state.last_observed_at = now;
        state.carried = TrafficSample::default();

        outcome
    }

    /// Records a newly created allocation.
    pub fn observe_created(&mut self, realm: &str) {
        self.metrics.allocations.with_label_values(&[realm]).inc();
    }

    /// Records a deleted allocation and drops its rate state.
    ///
    /// Returns whether the allocation had rate state.
    pub fn observe_deleted(&mut self, allocation: &str, realm: &str) -> bool {
        let labels = [realm];
        self.metrics.allocations.with_label_values(&labels).dec();

        let Some(state) = self.allocations.remove(allocation) else {
            return false;
        };
        self.metrics.tracked_allocations.set(self.allocations.len() as i64);

        if let Some(previous) = state.previous_rate {
            remove_rates(&self.metrics, &labels, &previous);
        }

        true
    }
}

fn add_rates(metrics: &RelayMetrics, labels: &[&str], rate: &RateSample) {
    metrics
        .received_packet_rate
        .add(labels, rate.received_packets);
    metrics.received_byte_rate.add(labels, rate.received_bytes);
    metrics.sent_packet_rate.add(labels, rate.sent_packets);
    metrics.sent_byte_rate.add(labels, rate.sent_bytes);
}

fn replace_rates(metrics: &RelayMetrics, labels: &[&str], rate: &RateSample, previous: &RateSample) {
    metrics
        .received_packet_rate
        .replace(labels, rate.received_packets, previous.received_packets);
    metrics
        .received_byte_rate
        .replace(labels, rate.received_bytes, previous.received_bytes);
    metrics
        .sent_packet_rate
        .replace(labels, rate.sent_packets, previous.sent_packets);
    metrics
        .sent_byte_rate
        .replace(labels, rate.sent_bytes, previous.sent_bytes);
}

fn remove_rates(metrics: &RelayMetrics, labels: &[&str], previous: &RateSample) {
    metrics
        .received_packet_rate
        .remove(labels, previous.received_packets);
    metrics
        .received_byte_rate
        .remove(labels, previous.received_bytes);
    metrics.sent_packet_rate.remove(labels, previous.sent_packets);
    metrics.sent_byte_rate.remove(labels, previous.sent_bytes);
}
