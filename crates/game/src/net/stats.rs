use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

pub const BANDWIDTH_HISTORY_LEN: usize = 50;

/// Discards incoming datagrams on purpose to exercise NACK recovery.
#[derive(Debug, Default)]
pub struct PacketLossSimulation {
    probability_bits: AtomicU32,
}

impl PacketLossSimulation {
    pub fn new(drop_probability: f32) -> Self {
        let simulation = Self::default();
        simulation.set_drop_probability(drop_probability);
        simulation
    }

    pub fn drop_probability(&self) -> f32 {
        f32::from_bits(self.probability_bits.load(Ordering::Relaxed))
    }

    pub fn set_drop_probability(&self, probability: f32) {
        let probability = if probability.is_finite() { probability.clamp(0.0, 1.0) } else { 0.0 };
        self.probability_bits
            .store(probability.to_bits(), Ordering::Relaxed);
    }

    pub fn should_drop(&self) -> bool {
        let probability = self.drop_probability();
        if probability <= 0.0 {
            return false;
        }
        rand::random::<f32>() < probability
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_resent: u64,
    pub packets_duplicated: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
}

/// Live counters shared by the send path and the receive thread.
#[derive(Debug, Default)]
pub struct StatCounters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_lost: AtomicU64,
    pub packets_resent: AtomicU64,
    pub packets_duplicated: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl StatCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, rtt: &RttEstimator) -> NetworkStats {
        let packets_received = self.packets_received.load(Ordering::Relaxed);
        let packets_lost = self.packets_lost.load(Ordering::Relaxed);
        let expected = packets_received + packets_lost;
        NetworkStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received,
            packets_lost,
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            packets_duplicated: self.packets_duplicated.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rtt_ms: rtt.srtt(),
            rtt_variance: rtt.rtt_var(),
            packet_loss_percent: if expected > 0 {
                packets_lost as f32 / expected as f32 * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Smoothed round-trip time, RFC 6298 style.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    sampled: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
            sampled: false,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, sample: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = sample.as_secs_f32() * 1000.0;
        if !self.sampled {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
            self.sampled = true;
            return;
        }
        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }
}

/// Traffic during one rollover period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub packets_lost: u64,
    pub packets_duplicated: u64,
}

#[derive(Debug, Default)]
pub struct BandwidthHistory {
    samples: VecDeque<BandwidthSample>,
    last: NetworkStats,
}

impl BandwidthHistory {
    /// Records the traffic since the previous rollover.
    pub fn rollover(&mut self, totals: &NetworkStats) {
        let sample = BandwidthSample {
            bytes_sent: totals.bytes_sent - self.last.bytes_sent,
            bytes_received: totals.bytes_received - self.last.bytes_received,
            packets_sent: totals.packets_sent - self.last.packets_sent,
            packets_received: totals.packets_received - self.last.packets_received,
            packets_resent: totals.packets_resent - self.last.packets_resent,
            packets_lost: totals.packets_lost - self.last.packets_lost,
            packets_duplicated: totals.packets_duplicated - self.last.packets_duplicated,
        };
        if self.samples.len() >= BANDWIDTH_HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last = totals.clone();
    }

    pub fn samples(&self) -> impl Iterator<Item = &BandwidthSample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<BandwidthSample> {
        self.samples.back().copied()
    }
}
