//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Receive-side bandwidth estimation, REMB flavor: packets stamped with
//! abs-send-time are grouped, the delay trend is filtered and tested for
//! overuse, and an AIMD controller produces the bitrate the remote sender
//! is told to stay under. See
//! https://datatracker.ietf.org/doc/html/draft-alvestrand-rmcat-congestion-03.

use std::collections::HashMap;

use log::*;

use crate::{
    common::{rate_from_bytes_per_ms, DataRate, RateStatistics},
    rtp::{rtcp::ReceiverEstimatedMaximumBitrate, Ssrc},
};

pub mod aimd;
pub mod inter_arrival;
pub mod overuse_detector;
pub mod overuse_estimator;

use aimd::{AimdRateControl, RateControlInput};
use inter_arrival::InterArrival;
use overuse_detector::{Hypothesis, OveruseDetector};
use overuse_estimator::OveruseEstimator;

// abs-send-time is 6.18 fixed point; shifted up 8 bits it fills a u32 with
// 26 fractional bits, which is what the inter-arrival math runs on.
const ABS_SEND_TIME_FRACTION: u32 = 18;
const ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT: u32 = 8;
const INTER_ARRIVAL_SHIFT: u32 = ABS_SEND_TIME_FRACTION + ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT;
const TIMESTAMP_TO_MS: f64 = 1000.0 / (1u64 << INTER_ARRIVAL_SHIFT) as f64;
const TIMESTAMP_GROUP_LENGTH_TICKS: u32 =
    ((5u64 << INTER_ARRIVAL_SHIFT) / 1000) as u32;

// A stream with no packets for this long no longer counts.
const STREAM_TIMEOUT_MS: i64 = 2000;
// For this long after the first packet every large packet is probe fodder.
const INITIAL_PROBING_INTERVAL_MS: i64 = 2000;
const MIN_PROBE_PACKET_SIZE: usize = 200;
const MAX_PROBE_PACKETS: usize = 15;
const EXPECTED_NUMBER_OF_PROBES: usize = 3;
const MIN_CLUSTER_SIZE: usize = 4;
const MIN_CLUSTER_DELTA_MS: i64 = 1;
const BITRATE_WINDOW_MS: i64 = 1000;

#[derive(Clone, Copy, Debug)]
struct Probe {
    send_time_ms: i64,
    recv_time_ms: i64,
    payload_size: i64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Cluster {
    send_mean_ms: i64,
    recv_mean_ms: i64,
    mean_size: i64,
    count: usize,
    num_above_min_delta: usize,
}

impl Cluster {
    fn send_bitrate(&self) -> DataRate {
        rate_from_bytes_per_ms(self.mean_size.max(0) as u64, self.send_mean_ms)
    }

    fn recv_bitrate(&self) -> DataRate {
        rate_from_bytes_per_ms(self.mean_size.max(0) as u64, self.recv_mean_ms)
    }
}

/// The receive-side estimator. One per connection; shared by every
/// incoming stream.
pub struct RembReceiver {
    ssrcs: HashMap<Ssrc, i64>,
    remote_rate: AimdRateControl,
    estimator: OveruseEstimator,
    detector: OveruseDetector,
    inter_arrival: InterArrival,
    incoming_bitrate: RateStatistics,
    incoming_bitrate_initialized: bool,
    probes: Vec<Probe>,
    first_packet_time_ms: i64,
    last_update_ms: i64,
    min_bitrate: Option<DataRate>,
    max_bitrate: Option<DataRate>,
}

impl Default for RembReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl RembReceiver {
    pub fn new() -> Self {
        Self {
            ssrcs: HashMap::new(),
            remote_rate: AimdRateControl::new(),
            estimator: OveruseEstimator::new(),
            detector: OveruseDetector::new(),
            inter_arrival: new_inter_arrival(),
            incoming_bitrate: RateStatistics::new(BITRATE_WINDOW_MS),
            incoming_bitrate_initialized: false,
            probes: Vec::new(),
            first_packet_time_ms: -1,
            last_update_ms: 0,
            min_bitrate: None,
            max_bitrate: None,
        }
    }

    pub fn set_max_incoming_bitrate(&mut self, bitrate: Option<DataRate>) {
        self.max_bitrate = bitrate;
    }

    pub fn set_min_incoming_bitrate(&mut self, bitrate: Option<DataRate>) {
        self.min_bitrate = bitrate;
    }

    /// `(active ssrcs, estimate bps, valid)`.
    pub fn latest_estimate(&self) -> (Vec<Ssrc>, u64, bool) {
        if !self.remote_rate.valid_estimate() {
            return (Vec::new(), 0, false);
        }
        let ssrcs: Vec<Ssrc> = self.ssrcs.keys().copied().collect();
        let bitrate = if ssrcs.is_empty() {
            0
        } else {
            self.remote_rate.latest_estimate().as_bps()
        };
        (ssrcs, bitrate, true)
    }

    /// Feeds one received packet. `abs_send_time` is the raw 24-bit
    /// extension value. Returns a REMB to emit when the estimate changed
    /// (or its feedback interval expired).
    pub fn incoming_packet(
        &mut self,
        arrival_ms: i64,
        payload_size: usize,
        ssrc: Ssrc,
        abs_send_time: u32,
    ) -> Option<ReceiverEstimatedMaximumBitrate> {
        let timestamp = abs_send_time.wrapping_shl(ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT);
        let send_time_ms = (timestamp as f64 * TIMESTAMP_TO_MS) as i64;
        let now_ms = arrival_ms;

        if self.incoming_bitrate.rate(arrival_ms).is_some() {
            self.incoming_bitrate_initialized = true;
        } else if self.incoming_bitrate_initialized {
            // Too long since the last packet: the window is stale.
            self.incoming_bitrate.reset();
            self.incoming_bitrate_initialized = false;
        }
        self.incoming_bitrate.update(payload_size as i64, arrival_ms);

        if self.first_packet_time_ms == -1 {
            self.first_packet_time_ms = now_ms;
        }
        self.timeout_streams(now_ms);
        self.ssrcs.insert(ssrc, now_ms);

        let mut update_estimate = false;
        if payload_size >= MIN_PROBE_PACKET_SIZE
            && (!self.remote_rate.valid_estimate()
                || now_ms - self.first_packet_time_ms < INITIAL_PROBING_INTERVAL_MS)
        {
            self.probes.push(Probe {
                send_time_ms,
                recv_time_ms: arrival_ms,
                payload_size: payload_size as i64,
            });
            update_estimate = self.process_clusters(now_ms);
        }

        if let Some(delta) =
            self.inter_arrival
                .compute_deltas(timestamp, arrival_ms, now_ms, payload_size as i64)
        {
            let ts_delta_ms = (1000.0 * delta.ts_delta as f64
                / (1u64 << INTER_ARRIVAL_SHIFT) as f64) as i64;
            self.estimator.update(
                delta.t_delta,
                delta.ts_delta as f64,
                delta.size_delta,
                self.detector.state(),
                arrival_ms,
            );
            self.detector.detect(
                self.estimator.offset(),
                ts_delta_ms,
                self.estimator.num_of_deltas(),
                arrival_ms,
            );
        }

        if !update_estimate {
            if self.last_update_ms == 0
                || arrival_ms - self.last_update_ms > self.remote_rate.feedback_interval_ms()
            {
                update_estimate = true;
            } else if self.detector.state() == Hypothesis::Overusing {
                if let Some(rate) = self.incoming_bitrate.rate(arrival_ms) {
                    if self.remote_rate.time_to_reduce_further(arrival_ms, rate) {
                        update_estimate = true;
                    }
                }
            }
        }

        if update_estimate {
            let input = RateControlInput {
                state: self.detector.state(),
                estimated_throughput: self.incoming_bitrate.rate(arrival_ms),
            };
            let bitrate = self.remote_rate.update(input, now_ms);
            if self.remote_rate.valid_estimate() {
                return Some(self.feedback(arrival_ms, bitrate));
            }
        }
        None
    }

    fn feedback(&mut self, arrival_ms: i64, bitrate: DataRate) -> ReceiverEstimatedMaximumBitrate {
        let mut bitrate = bitrate;
        if let Some(max) = self.max_bitrate {
            bitrate = bitrate.min(max);
        }
        if let Some(min) = self.min_bitrate {
            bitrate = bitrate.max(min);
        }
        self.last_update_ms = arrival_ms;
        ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate_bps: bitrate.as_bps(),
            ssrcs: self.ssrcs.keys().copied().collect(),
        }
    }

    fn timeout_streams(&mut self, now_ms: i64) {
        self.ssrcs.retain(|_, last| now_ms - *last <= STREAM_TIMEOUT_MS);
        if self.ssrcs.is_empty() {
            // Nothing left to estimate against; restart the pipeline.
            self.inter_arrival = new_inter_arrival();
            self.estimator = OveruseEstimator::new();
        }
    }

    /// Re-clusters the probe window; adopts the best cluster's bitrate
    /// when it beats (or initializes) the current estimate.
    fn process_clusters(&mut self, now_ms: i64) -> bool {
        let clusters = self.compute_clusters();
        if clusters.is_empty() {
            // No valid cluster yet; bound the window.
            if self.probes.len() >= MAX_PROBE_PACKETS {
                self.probes.remove(0);
            }
            return false;
        }
        if let Some(best) = find_best_probe(&clusters) {
            let probe_bitrate = best.send_bitrate().min(best.recv_bitrate());
            if self.is_bitrate_improving(probe_bitrate) {
                info!(
                    "probe successful: sent at {}, received at {} ({} probes)",
                    best.send_bitrate(),
                    best.recv_bitrate(),
                    best.count,
                );
                self.remote_rate.set_estimate(probe_bitrate, now_ms);
                return true;
            }
        }
        if clusters.len() >= EXPECTED_NUMBER_OF_PROBES {
            self.probes.clear();
        }
        false
    }

    fn compute_clusters(&self) -> Vec<Cluster> {
        let mut clusters = Vec::new();
        let mut cluster = Cluster::default();
        let mut prev: Option<Probe> = None;
        for probe in &self.probes {
            if let Some(prev) = prev {
                let send_delta = probe.send_time_ms - prev.send_time_ms;
                let recv_delta = probe.recv_time_ms - prev.recv_time_ms;
                if send_delta >= MIN_CLUSTER_DELTA_MS && recv_delta >= MIN_CLUSTER_DELTA_MS {
                    cluster.num_above_min_delta += 1;
                }
                if !is_within_cluster_bounds(send_delta, &cluster) {
                    maybe_add_cluster(&cluster, &mut clusters);
                    cluster = Cluster::default();
                }
                cluster.send_mean_ms += send_delta;
                cluster.recv_mean_ms += recv_delta;
                cluster.mean_size += probe.payload_size;
                cluster.count += 1;
            }
            prev = Some(*probe);
        }
        maybe_add_cluster(&cluster, &mut clusters);
        clusters
    }

    fn is_bitrate_improving(&self, probe_bitrate: DataRate) -> bool {
        let initial_probe =
            !self.remote_rate.valid_estimate() && probe_bitrate > DataRate::ZERO;
        let above_estimate = self.remote_rate.valid_estimate()
            && probe_bitrate > self.remote_rate.latest_estimate();
        initial_probe || above_estimate
    }
}

fn new_inter_arrival() -> InterArrival {
    InterArrival::new(TIMESTAMP_GROUP_LENGTH_TICKS, TIMESTAMP_TO_MS, true)
}

fn is_within_cluster_bounds(send_delta_ms: i64, cluster: &Cluster) -> bool {
    if cluster.count == 0 {
        return true;
    }
    let cluster_mean = cluster.send_mean_ms / cluster.count as i64;
    (send_delta_ms - cluster_mean).abs() < 3
}

fn maybe_add_cluster(cluster: &Cluster, clusters: &mut Vec<Cluster>) {
    if cluster.count < MIN_CLUSTER_SIZE || cluster.send_mean_ms <= 0 || cluster.recv_mean_ms <= 0
    {
        return;
    }
    clusters.push(Cluster {
        send_mean_ms: cluster.send_mean_ms / cluster.count as i64,
        recv_mean_ms: cluster.recv_mean_ms / cluster.count as i64,
        mean_size: cluster.mean_size / cluster.count as i64,
        count: cluster.count,
        num_above_min_delta: cluster.num_above_min_delta,
    });
}

/// A cluster is a usable probe when most deltas were measurable and its
/// arrival pacing kept up with its send pacing; the best one carries the
/// highest sustainable bitrate.
fn find_best_probe(clusters: &[Cluster]) -> Option<&Cluster> {
    let mut best: Option<&Cluster> = None;
    let mut highest = DataRate::ZERO;
    for cluster in clusters {
        if cluster.send_mean_ms == 0 || cluster.recv_mean_ms == 0 {
            continue;
        }
        if cluster.num_above_min_delta > cluster.count / 2
            && cluster.recv_mean_ms - cluster.send_mean_ms <= 2
            && cluster.send_mean_ms - cluster.recv_mean_ms <= 5
        {
            let probe_bitrate = cluster.send_bitrate().min(cluster.recv_bitrate());
            if probe_bitrate > highest {
                highest = probe_bitrate;
                best = Some(cluster);
            }
        }
    }
    best
}

/// Send-side mirror of the subscriber's REMB: remembers the last reported
/// bitrate and hands it to the sender-bitrate allocation.
#[derive(Debug)]
pub struct RembSender {
    initial_bitrate: DataRate,
    last_bitrate: Option<DataRate>,
}

impl RembSender {
    pub fn new(initial_bitrate: DataRate) -> Self {
        Self {
            initial_bitrate,
            last_bitrate: None,
        }
    }

    pub fn receive_remb(&mut self, bitrate_bps: u64) {
        self.last_bitrate = Some(DataRate::from_bps(bitrate_bps));
    }

    pub fn estimate(&self) -> DataRate {
        self.last_bitrate.unwrap_or(self.initial_bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::abs_send_time_from_ms;

    #[test]
    fn test_probe_sets_initial_estimate() {
        let mut remb = RembReceiver::new();
        let mut feedback = None;
        // Five 1000-byte probes: sent 10 ms apart, arriving 5 ms apart.
        for i in 0..5i64 {
            let result = remb.incoming_packet(
                i * 5,
                1000,
                1,
                abs_send_time_from_ms(i * 10),
            );
            if result.is_some() {
                feedback = result;
            }
        }
        let feedback = feedback.expect("probe should produce feedback");
        // send bitrate 800 kbps, recv 1.6 Mbps; min wins (with a minimal
        // first AIMD increase on top).
        assert!(
            (800_000..=810_000).contains(&feedback.bitrate_bps),
            "bitrate {}",
            feedback.bitrate_bps
        );
        assert_eq!(vec![1], feedback.ssrcs);

        let (ssrcs, bitrate, valid) = remb.latest_estimate();
        assert!(valid);
        assert_eq!(vec![1], ssrcs);
        assert!(bitrate >= 800_000);
    }

    #[test]
    fn test_slow_arrival_probe_is_rejected() {
        let mut remb = RembReceiver::new();
        // Arrivals 10 ms slower than sends: recv_mean - send_mean > 2.
        for i in 0..8i64 {
            remb.incoming_packet(i * 20, 1000, 1, abs_send_time_from_ms(i * 10));
        }
        let (_, _, valid) = remb.latest_estimate();
        assert!(!valid);
    }

    #[test]
    fn test_small_packets_are_not_probes() {
        let mut remb = RembReceiver::new();
        for i in 0..10i64 {
            remb.incoming_packet(i * 5, 100, 1, abs_send_time_from_ms(i * 10));
        }
        let (_, _, valid) = remb.latest_estimate();
        assert!(!valid);
    }

    #[test]
    fn test_feedback_clamped_to_configured_range() {
        let mut remb = RembReceiver::new();
        remb.set_max_incoming_bitrate(Some(DataRate::from_kbps(500)));
        let mut feedback = None;
        for i in 0..5i64 {
            let result =
                remb.incoming_packet(i * 5, 1000, 1, abs_send_time_from_ms(i * 10));
            if result.is_some() {
                feedback = result;
            }
        }
        assert_eq!(500_000, feedback.unwrap().bitrate_bps);
    }

    #[test]
    fn test_stream_timeout_forgets_ssrcs() {
        let mut remb = RembReceiver::new();
        for i in 0..5i64 {
            remb.incoming_packet(i * 5, 1000, 1, abs_send_time_from_ms(i * 10));
        }
        // A packet from another SSRC far in the future: SSRC 1 expires.
        remb.incoming_packet(10_000, 1000, 2, abs_send_time_from_ms(10_000));
        let (ssrcs, _, _) = remb.latest_estimate();
        assert_eq!(vec![2], ssrcs);
    }

    #[test]
    fn test_remb_sender_mirror() {
        let mut sender = RembSender::new(DataRate::from_kbps(300));
        assert_eq!(DataRate::from_kbps(300), sender.estimate());
        sender.receive_remb(450_000);
        assert_eq!(DataRate::from_bps(450_000), sender.estimate());
    }
}
