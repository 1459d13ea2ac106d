//! Link quality sampling and outgoing video bounds.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use pairline_shared::constants::{VIDEO_MAX_BITRATE_BPS, VIDEO_MIN_BITRATE_BPS};

/// Bitrate window for the outgoing video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingBounds {
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
}

impl EncodingBounds {
    /// Bounds with `min <= max` enforced.
    pub fn new(min_bitrate_bps: u32, max_bitrate_bps: u32) -> Self {
        Self {
            min_bitrate_bps: min_bitrate_bps.min(max_bitrate_bps),
            max_bitrate_bps,
        }
    }
}

impl Default for EncodingBounds {
    fn default() -> Self {
        Self::new(VIDEO_MIN_BITRATE_BPS, VIDEO_MAX_BITRATE_BPS)
    }
}

/// Raw counters as reported by the peer connection backend.
///
/// Backends fill in what they can; missing measurements stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub rtt: Option<Duration>,
    pub packets_lost: Option<u64>,
    pub packets_received: Option<u64>,
    pub jitter: Option<Duration>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkQuality {
    Good,
    Fair,
    Poor,
}

impl LinkQuality {
    /// Good: RTT < 150ms and loss < 2%. Fair: RTT < 300ms and loss < 5%.
    /// Missing measurements do not count against the link.
    pub fn classify(rtt_ms: Option<f64>, loss: Option<f64>) -> Self {
        let rtt = rtt_ms.unwrap_or(0.0);
        let loss = loss.unwrap_or(0.0);

        if rtt < 150.0 && loss < 0.02 {
            LinkQuality::Good
        } else if rtt < 300.0 && loss < 0.05 {
            LinkQuality::Fair
        } else {
            LinkQuality::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub rtt_ms: Option<f64>,
    /// Fraction of packets lost since the previous sample, 0.0..=1.0
    pub packet_loss: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub outbound_bps: u64,
    pub inbound_bps: u64,
    pub quality: LinkQuality,
}

/// Turns cumulative counters into per-interval rates.
#[derive(Debug, Default)]
pub struct StatsSampler {
    previous: Option<(Instant, RawStats)>,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, raw: RawStats, now: Instant) -> LinkStats {
        let (outbound_bps, inbound_bps, packet_loss) = match &self.previous {
            Some((at, prev)) => {
                let secs = now.saturating_duration_since(*at).as_secs_f64();
                let rate = |cur: u64, old: u64| {
                    if secs > 0.0 {
                        (cur.saturating_sub(old) as f64 * 8.0 / secs) as u64
                    } else {
                        0
                    }
                };
                (
                    rate(raw.bytes_sent, prev.bytes_sent),
                    rate(raw.bytes_received, prev.bytes_received),
                    interval_loss(prev, &raw),
                )
            }
            None => (0, 0, interval_loss(&RawStats::default(), &raw)),
        };

        let rtt_ms = raw.rtt.map(|d| d.as_secs_f64() * 1000.0);
        let jitter_ms = raw.jitter.map(|d| d.as_secs_f64() * 1000.0);
        let stats = LinkStats {
            rtt_ms,
            packet_loss,
            jitter_ms,
            outbound_bps,
            inbound_bps,
            quality: LinkQuality::classify(rtt_ms, packet_loss),
        };

        self.previous = Some((now, raw));
        stats
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn interval_loss(prev: &RawStats, cur: &RawStats) -> Option<f64> {
    let lost = cur.packets_lost?.saturating_sub(prev.packets_lost.unwrap_or(0));
    let received = cur
        .packets_received?
        .saturating_sub(prev.packets_received.unwrap_or(0));
    let total = lost + received;
    if total == 0 {
        return Some(0.0);
    }
    Some(lost as f64 / total as f64)
}
