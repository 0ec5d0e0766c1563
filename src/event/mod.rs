pub mod decode;

use std::ops::Add;
use std::time::Duration;

/// A message as delivered by the event transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Channel (or key) the message was published on.
    pub channel: String,
    pub payload: String,
}

impl RawMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Identity of a relay allocation, derived from its channel path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationKey {
    /// `turn/realm/<realm>/user/<user>/allocation/<id>`, stable for the
    /// allocation's lifetime.
    pub name: String,
    pub realm: String,
}

/// Lifecycle transitions published on the `status` sub-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    New,
    Refreshed,
    Deleted,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Refreshed => "refreshed",
            Self::Deleted => "deleted",
        }
    }
}

/// Traffic deltas reported for one allocation since its previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
}

impl TrafficSample {
    /// Per-second rates over `elapsed`.
    ///
    /// Returns `None` when no finite rate can be derived (zero elapsed time).
    pub fn rate_over(&self, elapsed: Duration) -> Option<RateSample> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }

        let rate = RateSample {
            received_packets: self.received_packets as f64 / secs,
            received_bytes: self.received_bytes as f64 / secs,
            sent_packets: self.sent_packets as f64 / secs,
            sent_bytes: self.sent_bytes as f64 / secs,
        };

        rate.is_finite().then_some(rate)
    }
}

impl Add for TrafficSample {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            received_packets: self.received_packets.saturating_add(rhs.received_packets),
            received_bytes: self.received_bytes.saturating_add(rhs.received_bytes),
            sent_packets: self.sent_packets.saturating_add(rhs.sent_packets),
            sent_bytes: self.sent_bytes.saturating_add(rhs.sent_bytes),
        }
    }
}

/// Instantaneous per-second rates derived from a [`TrafficSample`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSample {
    pub received_packets: f64,
    pub received_bytes: f64,
    pub sent_packets: f64,
    pub sent_bytes: f64,
}

impl RateSample {
    pub fn is_finite(&self) -> bool {
        self.received_packets.is_finite()
            && self.received_bytes.is_finite()
            && self.sent_packets.is_finite()
            && self.sent_bytes.is_finite()
    }
}

/// Decoded payload of an allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Traffic(TrafficSample),
    Status(AllocationStatus),
}

impl EventKind {
    /// Label used for per-kind event counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traffic(_) => "traffic",
            Self::Status(_) => "status",
        }
    }
}

/// A fully decoded allocation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub allocation: AllocationKey,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rcvp: u64, rcvb: u64, sentp: u64, sentb: u64) -> TrafficSample {
        TrafficSample {
            received_packets: rcvp,
            received_bytes: rcvb,
            sent_packets: sentp,
            sent_bytes: sentb,
        }
    }

    #[test]
    fn test_rate_over_divides_by_seconds() {
        let rate = sample(600, 48_000, 300, 12_000)
            .rate_over(Duration::from_secs(10))
            .expect("finite rate");
        assert_eq!(rate.received_packets, 60.0);
        assert_eq!(rate.received_bytes, 4_800.0);
        assert_eq!(rate.sent_packets, 30.0);
        assert_eq!(rate.sent_bytes, 1_200.0);
    }

    #[test]
    fn test_rate_over_sub_second() {
        let rate = sample(5, 0, 0, 0)
            .rate_over(Duration::from_millis(500))
            .expect("finite rate");
        assert_eq!(rate.received_packets, 10.0);
    }

    #[test]
    fn test_rate_over_zero_elapsed() {
        assert!(sample(1, 1, 1, 1).rate_over(Duration::ZERO).is_none());
        assert!(TrafficSample::default().rate_over(Duration::ZERO).is_none());
    }

    #[test]
    fn test_traffic_sample_add_saturates() {
        let sum = sample(1, 2, 3, u64::MAX) + sample(10, 20, 30, 1);
        assert_eq!(sum, sample(11, 22, 33, u64::MAX));
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::Traffic(TrafficSample::default()).as_str(), "traffic");
        assert_eq!(EventKind::Status(AllocationStatus::New).as_str(), "status");
        assert_eq!(AllocationStatus::Deleted.as_str(), "deleted");
    }
}
