//! Per-connection and per-path traffic metrics.
//!
//! This module provides:
//! - [`ConnMetrics`]: lock-free byte/packet counters owned by one connection
//! - [`PathMetrics`]: the bounded bandwidth history kept for one path
//! - [`MetricsRegistry`]: the explicitly owned store of all connection
//!   metrics of a session, injected into transports at construction
//!
//! Bandwidth is sampled once per metrics tick as
//! `(bytes_now - bytes_at_last_tick) * (1s / tick_interval)`. Path counters
//! grow by each tick's delta, so they keep counting across re-dials.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Bandwidth, ConnectionId};

/// Samples kept per connection for session-wide aggregation.
pub const CONN_HISTORY: usize = 600;

/// Point-in-time counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub read_bytes: u64,
    pub read_packets: u64,
    pub written_bytes: u64,
    pub written_packets: u64,
}

impl std::ops::Add for MetricsSnapshot {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            read_bytes: self.read_bytes.saturating_add(other.read_bytes),
            read_packets: self.read_packets.saturating_add(other.read_packets),
            written_bytes: self.written_bytes.saturating_add(other.written_bytes),
            written_packets: self.written_packets.saturating_add(other.written_packets),
        }
    }
}

impl MetricsSnapshot {
    /// Counter growth since `earlier`.
    #[must_use]
    pub fn since(self, earlier: Self) -> Self {
        Self {
            read_bytes: self.read_bytes.saturating_sub(earlier.read_bytes),
            read_packets: self.read_packets.saturating_sub(earlier.read_packets),
            written_bytes: self.written_bytes.saturating_sub(earlier.written_bytes),
            written_packets: self.written_packets.saturating_sub(earlier.written_packets),
        }
    }
}

/// Bandwidth observed during one metrics tick, in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub read: u64,
    pub write: u64,
}

impl BandwidthSample {
    pub fn new(read: u64, write: u64) -> Self {
        Self { read, write }
    }

    /// Larger of the two directions.
    pub fn peak(&self) -> u64 {
        self.read.max(self.write)
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            read: self.read.saturating_add(other.read),
            write: self.write.saturating_add(other.write),
        }
    }
}

/// Result of one metrics tick on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    pub sample: BandwidthSample,
    /// Counter growth since the previous tick.
    pub delta: MetricsSnapshot,
}

fn per_second(delta: u64, interval: Duration) -> u64 {
    // A zero interval is treated as one second.
    if interval.is_zero() {
        return delta;
    }
    (delta as f64 / interval.as_secs_f64()) as u64
}

fn average(values: impl Iterator<Item = u64>) -> u64 {
    let (sum, count) = values.fold((0u128, 0u128), |(s, c), v| (s + u128::from(v), c + 1));
    if count == 0 {
        0
    } else {
        (sum / count) as u64
    }
}

/// Counters of one connection plus its tick baseline.
#[derive(Debug)]
pub struct ConnMetrics {
    id: ConnectionId,
    read_bytes: AtomicU64,
    read_packets: AtomicU64,
    written_bytes: AtomicU64,
    written_packets: AtomicU64,
    /// Counters at the previous tick.
    baseline: Mutex<MetricsSnapshot>,
    history: Mutex<VecDeque<BandwidthSample>>,
}

impl ConnMetrics {
    /// Create a new zeroed metrics object.
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            read_bytes: AtomicU64::new(0),
            read_packets: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            written_packets: AtomicU64::new(0),
            baseline: Mutex::new(MetricsSnapshot::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn record_read(&self, bytes: usize) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.written_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.written_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_packets: self.read_packets.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            written_packets: self.written_packets.load(Ordering::Relaxed),
        }
    }

    /// Advance the sample window by one tick.
    pub fn tick(&self, interval: Duration) -> Tick {
        let snapshot = self.snapshot();
        let delta = {
            let mut baseline = self.baseline.lock();
            let delta = snapshot.since(*baseline);
            *baseline = snapshot;
            delta
        };
        let sample = BandwidthSample {
            read: per_second(delta.read_bytes, interval),
            write: per_second(delta.written_bytes, interval),
        };

        let mut history = self.history.lock();
        if history.len() == CONN_HISTORY {
            history.pop_front();
        }
        history.push_back(sample);
        Tick { sample, delta }
    }

    /// Samples recorded so far, oldest first.
    pub fn history(&self) -> Vec<BandwidthSample> {
        self.history.lock().iter().copied().collect()
    }
}

/// Traffic history of one path, fed by the metrics tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMetrics {
    pub read_bytes: u64,
    pub read_packets: u64,
    pub written_bytes: u64,
    pub written_packets: u64,
    samples: VecDeque<BandwidthSample>,
    max_samples: usize,
    /// Ticks recorded over the whole lifetime, including evicted samples.
    total_ticks: u64,
    max_bandwidth: u64,
}

impl PathMetrics {
    /// Create empty metrics keeping at most `max_samples` samples.
    pub fn new(max_samples: usize) -> Self {
        Self {
            read_bytes: 0,
            read_packets: 0,
            written_bytes: 0,
            written_packets: 0,
            samples: VecDeque::new(),
            max_samples: max_samples.max(1),
            total_ticks: 0,
            max_bandwidth: 0,
        }
    }

    /// Record one tick: the sample plus the counter growth since the last tick.
    pub fn record(&mut self, sample: BandwidthSample, delta: MetricsSnapshot) {
        self.read_bytes = self.read_bytes.saturating_add(delta.read_bytes);
        self.read_packets = self.read_packets.saturating_add(delta.read_packets);
        self.written_bytes = self.written_bytes.saturating_add(delta.written_bytes);
        self.written_packets = self.written_packets.saturating_add(delta.written_packets);

        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.total_ticks += 1;
        self.max_bandwidth = self.max_bandwidth.max(sample.peak());
    }

    pub fn samples(&self) -> impl Iterator<Item = &BandwidthSample> {
        self.samples.iter()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Running max over every sample ever recorded, in bytes per second.
    pub fn max_bandwidth(&self) -> u64 {
        self.max_bandwidth
    }

    // The first tick of a path covers connection setup and is not
    // representative; skip it while it is still in the window.
    fn representative(&self) -> impl Iterator<Item = &BandwidthSample> {
        let skip = usize::from(self.total_ticks == self.samples.len() as u64);
        self.samples.iter().skip(skip)
    }

    pub fn average_read_bandwidth(&self) -> u64 {
        average(self.representative().map(|s| s.read))
    }

    pub fn average_write_bandwidth(&self) -> u64 {
        average(self.representative().map(|s| s.write))
    }

    /// Average write bandwidth over the last `n` representative samples.
    pub fn last_average_write_bandwidth(&self, n: usize) -> u64 {
        let samples: Vec<u64> = self.representative().map(|s| s.write).collect();
        let start = samples.len().saturating_sub(n);
        average(samples[start..].iter().copied())
    }

    pub fn latest(&self) -> Option<BandwidthSample> {
        self.samples.back().copied()
    }
}

impl Default for PathMetrics {
    fn default() -> Self {
        Self::new(CONN_HISTORY)
    }
}

/// Per-tick bandwidth summed over all connections of a session.
#[derive(Debug, Clone, Default)]
pub struct AggregateBandwidth {
    /// Oldest first, aligned on the most recent tick.
    pub samples: Vec<BandwidthSample>,
}

impl AggregateBandwidth {
    fn add_history(&mut self, history: &[BandwidthSample]) {
        if history.len() > self.samples.len() {
            let missing = history.len() - self.samples.len();
            self.samples
                .splice(0..0, std::iter::repeat(BandwidthSample::default()).take(missing));
        }
        let offset = self.samples.len() - history.len();
        for (slot, sample) in self.samples[offset..].iter_mut().zip(history) {
            *slot = slot.saturating_add(*sample);
        }
    }

    pub fn read_mbps(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| Bandwidth::from_bps(s.read as f64).as_mbps())
            .collect()
    }

    pub fn write_mbps(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| Bandwidth::from_bps(s.write as f64).as_mbps())
            .collect()
    }

    /// Average summed write bandwidth over the last `n` ticks.
    pub fn last_average_write_bandwidth(&self, n: usize) -> u64 {
        let start = self.samples.len().saturating_sub(n);
        average(self.samples[start..].iter().map(|s| s.write))
    }
}

/// Owned registry of connection metrics for one session.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    conns: Arc<DashMap<ConnectionId, Arc<ConnMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the metrics of a connection.
    pub fn register(&self, id: ConnectionId) -> Arc<ConnMetrics> {
        self.conns
            .entry(id)
            .or_insert_with(|| Arc::new(ConnMetrics::new(id)))
            .clone()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnMetrics>> {
        self.conns.get(id).map(|m| m.clone())
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Sum of the tick history of every registered connection.
    pub fn aggregate(&self) -> AggregateBandwidth {
        let mut aggregate = AggregateBandwidth::default();
        for entry in self.conns.iter() {
            aggregate.add_history(&entry.value().history());
        }
        aggregate
    }

    /// Total counters over every registered connection.
    pub fn totals(&self) -> MetricsSnapshot {
        self.conns
            .iter()
            .fold(MetricsSnapshot::default(), |acc, entry| acc + entry.value().snapshot())
    }
}
