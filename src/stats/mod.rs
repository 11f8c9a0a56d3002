//! Connection statistics
//!
//! [`StatsSampler`] turns raw backend reports into a normalized
//! [`ConnectionStats`] snapshot; [`StatsMonitor`] drives it on a timer and
//! publishes every snapshot as a `stats-update` event.

mod monitor;

pub use monitor::StatsMonitor;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::peer::{MediaKind, RawStat};

/// Normalized statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    /// Inbound jitter (seconds), when the backend reports it
    pub jitter: Option<f64>,
    /// Round trip time (seconds) of the active candidate pair
    pub round_trip_time: Option<f64>,
    pub sampled_at: DateTime<Utc>,
    /// Average send bitrate since monitoring started
    pub avg_bitrate_bps: f64,
    /// `packets_lost / packets_sent`
    pub loss_rate: f64,
    /// `packets_lost / (packets_lost + bytes_sent)`
    ///
    /// Mixes packets with bytes and therefore reads far too low. Kept for
    /// consumers that still compare against the old number; use `loss_rate`.
    pub legacy_loss_ratio: f64,
}

/// `bytes * 8 / elapsed` in bits per second; 0 for a zero interval
pub fn average_bitrate_bps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs
}

/// Lost packets over sent packets; 0 when nothing was sent
pub fn loss_rate(packets_lost: u64, packets_sent: u64) -> f64 {
    if packets_sent == 0 {
        return 0.0;
    }
    packets_lost as f64 / packets_sent as f64
}

/// Historical loss formula, `lost / (lost + bytes_sent)`
pub fn legacy_loss_ratio(packets_lost: u64, bytes_sent: u64) -> f64 {
    let total = packets_lost.saturating_add(bytes_sent);
    if total == 0 {
        return 0.0;
    }
    packets_lost as f64 / total as f64
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    bytes_sent: u64,
    bytes_received: u64,
    packets_sent: u64,
    packets_lost: u64,
}

impl Counters {
    /// Counters never go backwards within a session
    fn clamp_to(self, previous: Counters) -> Counters {
        Counters {
            bytes_sent: self.bytes_sent.max(previous.bytes_sent),
            bytes_received: self.bytes_received.max(previous.bytes_received),
            packets_sent: self.packets_sent.max(previous.packets_sent),
            packets_lost: self.packets_lost.max(previous.packets_lost),
        }
    }
}

/// Turns successive raw reports into snapshots
#[derive(Debug)]
pub struct StatsSampler {
    started: Instant,
    previous: Counters,
}

impl StatsSampler {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            previous: Counters::default(),
        }
    }

    pub fn sample(&mut self, report: &[RawStat], now: Instant) -> ConnectionStats {
        let mut counters = Counters::default();
        let mut outbound_lost = None;
        let mut remote_lost = None;
        let mut jitter = None;
        let mut pair_rtt = None;
        let mut remote_rtt = None;

        for stat in report {
            match stat {
                RawStat::OutboundRtp {
                    kind: MediaKind::Video,
                    bytes_sent,
                    packets_sent,
                    packets_lost,
                } => {
                    counters.bytes_sent += bytes_sent;
                    counters.packets_sent += packets_sent;
                    if let Some(lost) = packets_lost {
                        outbound_lost = Some(outbound_lost.unwrap_or(0) + lost);
                    }
                }
                RawStat::RemoteInboundRtp {
                    kind: MediaKind::Video,
                    packets_lost,
                    round_trip_time,
                } => {
                    remote_lost = Some(remote_lost.unwrap_or(0) + packets_lost);
                    if remote_rtt.is_none() {
                        remote_rtt = *round_trip_time;
                    }
                }
                RawStat::InboundRtp {
                    kind: MediaKind::Video,
                    bytes_received,
                    jitter: inbound_jitter,
                    ..
                } => {
                    counters.bytes_received += bytes_received;
                    if jitter.is_none() {
                        jitter = *inbound_jitter;
                    }
                }
                RawStat::CandidatePair {
                    succeeded: true,
                    nominated,
                    current_round_trip_time,
                } => {
                    if *nominated || pair_rtt.is_none() {
                        pair_rtt = current_round_trip_time.or(pair_rtt);
                    }
                }
                _ => {}
            }
        }
        counters.packets_lost = outbound_lost.or(remote_lost).unwrap_or(0);

        let counters = counters.clamp_to(self.previous);
        self.previous = counters;

        let elapsed = now.saturating_duration_since(self.started);
        ConnectionStats {
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            packets_sent: counters.packets_sent,
            packets_lost: counters.packets_lost,
            jitter,
            round_trip_time: pair_rtt.or(remote_rtt),
            sampled_at: Utc::now(),
            avg_bitrate_bps: average_bitrate_bps(counters.bytes_sent, elapsed),
            loss_rate: loss_rate(counters.packets_lost, counters.packets_sent),
            legacy_loss_ratio: legacy_loss_ratio(counters.packets_lost, counters.bytes_sent),
        }
    }
}
