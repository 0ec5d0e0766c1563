//! Live population histogram on top of a Prometheus gauge vector.
//!
//! A [`BucketedGauge`] answers "how many tracked values are currently at or
//! below each threshold" for every label-set. Unlike a Prometheus histogram it
//! counts live entities rather than past observations, so values can be
//! removed again and replaced in place with work proportional to the number
//! of thresholds, never to the size of the population.

use prometheus::core::Collector;
use prometheus::{IntGauge, IntGaugeVec, Opts};
use thiserror::Error;

/// Label carrying the bucket boundary.
pub const BUCKET_LABEL: &str = "le";

/// Boundary label of the unbounded overflow bucket.
pub const OVERFLOW_BUCKET: &str = "+Inf";

/// Errors returned when building a [`Thresholds`] set.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("threshold set is empty")]
    Empty,

    #[error("threshold {value} is not finite")]
    NotFinite { value: f64 },

    #[error("thresholds must be strictly increasing: {previous} is followed by {value}")]
    NotIncreasing { previous: f64, value: f64 },
}

/// Strictly increasing, non-empty list of finite bucket boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds(Vec<f64>);

impl Thresholds {
    /// Validates and wraps the given boundaries.
    pub fn new(bounds: Vec<f64>) -> Result<Self, ThresholdError> {
        if bounds.is_empty() {
            return Err(ThresholdError::Empty);
        }

        for (i, &value) in bounds.iter().enumerate() {
            if !value.is_finite() {
                return Err(ThresholdError::NotFinite { value });
            }
            if let Some(&previous) = i.checked_sub(1).and_then(|p| bounds.get(p)) {
                if value <= previous {
                    return Err(ThresholdError::NotIncreasing { previous, value });
                }
            }
        }

        Ok(Self(bounds))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<f64>> for Thresholds {
    type Error = ThresholdError;

    fn try_from(bounds: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(bounds)
    }
}

/// Formats a boundary for the `le` label (shortest round-trip form).
pub fn bucket_label(bound: f64) -> String {
    format!("{bound}")
}

/// Populations of one label-set at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    /// `(boundary, population)` in ascending boundary order.
    pub buckets: Vec<(f64, i64)>,
    /// Population of the `+Inf` bucket, i.e. the number of tracked values.
    pub overflow: i64,
}

impl BucketSnapshot {
    /// Population of the bucket with the given boundary.
    pub fn count_at(&self, bound: f64) -> Option<i64> {
        self.buckets
            .iter()
            .find(|(b, _)| *b == bound)
            .map(|(_, count)| *count)
    }

    /// Populations in bucket order, overflow last.
    pub fn counts(&self) -> Vec<i64> {
        let mut counts: Vec<i64> = self.buckets.iter().map(|(_, c)| *c).collect();
        counts.push(self.overflow);
        counts
    }
}

/// Per-label-set population counts for a fixed threshold set plus overflow.
///
/// Callers own the bookkeeping of which value each entity currently
/// contributes: `remove` and `replace` must be given the value that was last
/// added (or replaced in) for the same label-set. Values must not be NaN.
///
/// The underlying series are atomics, so the vector may be gathered by other
/// threads while a single owner applies updates.
pub struct BucketedGauge {
    gauges: IntGaugeVec,
    label_names: Vec<String>,
    thresholds: Thresholds,
    bucket_labels: Vec<String>,
}

impl BucketedGauge {
    /// Creates the gauge vector with `label_names` plus the [`BUCKET_LABEL`].
    pub fn new(opts: Opts, label_names: &[&str], thresholds: Thresholds) -> prometheus::Result<Self> {
        let mut names = label_names.to_vec();
        names.push(BUCKET_LABEL);
        let gauges = IntGaugeVec::new(opts, &names)?;

        let bucket_labels = thresholds.as_slice().iter().copied().map(bucket_label).collect();

        Ok(Self {
            gauges,
            label_names: label_names.iter().map(|s| (*s).to_string()).collect(),
            thresholds,
            bucket_labels,
        })
    }

    /// The underlying vector, for registration with a registry.
    pub fn gauge_vec(&self) -> &IntGaugeVec {
        &self.gauges
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Counts a new value for `labels`.
    ///
    /// Every bucket series of the label-set is created, so buckets the value
    /// does not fall into are exported as zero instead of being absent.
    pub fn add(&self, labels: &[&str], value: f64) {
        for (bound, bucket) in self.bounds() {
            let gauge = self.series(labels, bucket);
            if value <= bound {
                gauge.inc();
            }
        }
        self.series(labels, OVERFLOW_BUCKET).inc();
    }

    /// Uncounts a value previously passed to [`add`](Self::add).
    pub fn remove(&self, labels: &[&str], value: f64) {
        for (bound, bucket) in self.bounds() {
            let gauge = self.series(labels, bucket);
            if value <= bound {
                gauge.dec();
            }
        }
        self.series(labels, OVERFLOW_BUCKET).dec();
    }

    /// Moves one tracked value from `old` to `new`.
    ///
    /// Only buckets with `min(old, new) <= bound < max(old, new)` change; the
    /// overflow bucket is left alone because the entity is still present.
    pub fn replace(&self, labels: &[&str], new: f64, old: f64) {
        if new == old {
            return;
        }

        let rising = new > old;
        let (lo, hi) = if rising { (old, new) } else { (new, old) };

        for (bound, bucket) in self.bounds() {
            if lo <= bound && bound < hi {
                let gauge = self.series(labels, bucket);
                if rising {
                    gauge.dec();
                } else {
                    gauge.inc();
                }
            }
        }
    }

    /// Reads the populations of `labels` without creating any series.
    ///
    /// Returns `None` if the label-set has never been added.
    pub fn snapshot(&self, labels: &[&str]) -> Option<BucketSnapshot> {
        if labels.len() != self.label_names.len() {
            return None;
        }

        let mut counts: Vec<Option<i64>> = vec![None; self.bucket_labels.len()];
        let mut overflow = None;

        for family in self.gauges.collect() {
            for metric in family.get_metric() {
                let pairs = metric.get_label();
                let matches = self.label_names.iter().zip(labels).all(|(name, value)| {
                    pairs
                        .iter()
                        .any(|p| p.get_name() == name && p.get_value() == *value)
                });
                if !matches {
                    continue;
                }

                let Some(le) = pairs.iter().find(|p| p.get_name() == BUCKET_LABEL) else {
                    continue;
                };
                let population = metric.get_gauge().get_value() as i64;

                if le.get_value() == OVERFLOW_BUCKET {
                    overflow = Some(population);
                } else if let Some(idx) = self.bucket_labels.iter().position(|l| l == le.get_value())
                {
                    if let Some(slot) = counts.get_mut(idx) {
                        *slot = Some(population);
                    }
                }
            }
        }

        let overflow = overflow?;
        let buckets = self
            .thresholds
            .as_slice()
            .iter()
            .zip(counts)
            .map(|(bound, count)| (*bound, count.unwrap_or(0)))
            .collect();

        Some(BucketSnapshot { buckets, overflow })
    }

    fn bounds(&self) -> impl Iterator<Item = (f64, &str)> {
        self.thresholds
            .as_slice()
            .iter()
            .copied()
            .zip(self.bucket_labels.iter().map(String::as_str))
    }

    fn series(&self, labels: &[&str], bucket: &str) -> IntGauge {
        let mut values = Vec::with_capacity(labels.len() + 1);
        values.extend_from_slice(labels);
        values.push(bucket);
        self.gauges.with_label_values(&values)
    }
}

impl std::fmt::Debug for BucketedGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketedGauge")
            .field("label_names", &self.label_names)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}
