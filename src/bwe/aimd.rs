//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Additive-increase / multiplicative-decrease rate control fed by the
//! overuse detector, plus the link-capacity estimate that picks between
//! the cautious additive ramp and the fast multiplicative one.

use crate::{
    bwe::overuse_detector::Hypothesis,
    common::DataRate,
};

// Time from the first throughput sample until the estimate self-starts.
const INITIALIZATION_TIME_MS: i64 = 5000;
const DEFAULT_RTT_MS: i64 = 200;
const MAX_PACKET_SIZE_BYTES: f64 = 1200.0;
const FRAMES_PER_SECOND: f64 = 30.0;
const MIN_INCREASE_RATE_BPS_PER_SECOND: f64 = 4000.0;
const DEFAULT_MAX_CONFIGURED_BITRATE: DataRate = DataRate::from_kbps(30_000);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

/// One detector observation plus the measured incoming throughput.
#[derive(Copy, Clone, Debug)]
pub struct RateControlInput {
    pub state: Hypothesis,
    pub estimated_throughput: Option<DataRate>,
}

/// Exponentially-weighted estimate of what the link carried the last few
/// times overuse was detected.
#[derive(Debug, Default)]
pub struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl LinkCapacityEstimator {
    const DEVIATION_INIT: f64 = 0.4;

    pub fn new() -> Self {
        Self {
            estimate_kbps: None,
            deviation_kbps: Self::DEVIATION_INIT,
        }
    }

    pub fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }

    pub fn estimate(&self) -> Option<DataRate> {
        self.estimate_kbps
            .map(|kbps| DataRate::from_bps((kbps * 1000.0) as u64))
    }

    pub fn reset(&mut self) {
        self.estimate_kbps = None;
        self.deviation_kbps = Self::DEVIATION_INIT;
    }

    pub fn on_overuse_detected(&mut self, acked_bitrate: DataRate) {
        self.update(acked_bitrate, 0.5)
    }

    pub fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => DataRate::from_bps(
                ((estimate + 3.0 * self.deviation_estimate_kbps(estimate)) * 1000.0) as u64,
            ),
            None => DataRate::from_bps(u64::MAX),
        }
    }

    pub fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => DataRate::from_bps(
                ((estimate - 3.0 * self.deviation_estimate_kbps(estimate)).max(0.0) * 1000.0)
                    as u64,
            ),
            None => DataRate::ZERO,
        }
    }

    fn update(&mut self, sample: DataRate, alpha: f64) {
        let sample_kbps = sample.as_bps() as f64 / 1000.0;
        let estimate_kbps = match self.estimate_kbps {
            None => sample_kbps,
            Some(estimate) => (1.0 - alpha) * estimate + alpha * sample_kbps,
        };
        let error_kbps = estimate_kbps - sample_kbps;
        self.deviation_kbps = (1.0 - alpha) * self.deviation_kbps
            + alpha * error_kbps * error_kbps / estimate_kbps.max(1.0);
        self.deviation_kbps = self.deviation_kbps.clamp(0.4, 2.5);
        self.estimate_kbps = Some(estimate_kbps);
    }

    fn deviation_estimate_kbps(&self, estimate_kbps: f64) -> f64 {
        (self.deviation_kbps * estimate_kbps).sqrt()
    }
}

#[derive(Debug)]
pub struct AimdRateControl {
    state: RateControlState,
    beta: f64,
    rtt_ms: i64,
    current_bitrate: DataRate,
    latest_estimated_throughput: DataRate,
    link_capacity: LinkCapacityEstimator,
    bitrate_is_initialized: bool,
    time_first_throughput_estimate_ms: i64,
    time_last_bitrate_change_ms: i64,
    time_last_bitrate_decrease_ms: i64,
    last_decrease: DataRate,
    min_configured_bitrate: DataRate,
    max_configured_bitrate: DataRate,
    in_experiment: bool,
}

impl Default for AimdRateControl {
    fn default() -> Self {
        Self::new()
    }
}

impl AimdRateControl {
    pub fn new() -> Self {
        Self {
            state: RateControlState::Hold,
            beta: 0.85,
            rtt_ms: DEFAULT_RTT_MS,
            current_bitrate: DEFAULT_MAX_CONFIGURED_BITRATE,
            latest_estimated_throughput: DEFAULT_MAX_CONFIGURED_BITRATE,
            link_capacity: LinkCapacityEstimator::new(),
            bitrate_is_initialized: false,
            time_first_throughput_estimate_ms: -1,
            time_last_bitrate_change_ms: -1,
            time_last_bitrate_decrease_ms: -1,
            last_decrease: DataRate::ZERO,
            min_configured_bitrate: DataRate::ZERO,
            max_configured_bitrate: DEFAULT_MAX_CONFIGURED_BITRATE,
            in_experiment: true,
        }
    }

    pub fn valid_estimate(&self) -> bool {
        self.bitrate_is_initialized
    }

    pub fn latest_estimate(&self) -> DataRate {
        self.current_bitrate
    }

    pub fn set_rtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms.max(1);
    }

    /// A probe produced a trustworthy estimate; adopt it directly.
    pub fn set_estimate(&mut self, bitrate: DataRate, now_ms: i64) {
        self.bitrate_is_initialized = true;
        let prev_bitrate = self.current_bitrate;
        self.current_bitrate = self.clamp_bitrate(bitrate);
        self.time_last_bitrate_change_ms = now_ms;
        if self.current_bitrate < prev_bitrate {
            self.time_last_bitrate_decrease_ms = now_ms;
        }
    }

    pub fn update(&mut self, input: RateControlInput, now_ms: i64) -> DataRate {
        if !self.bitrate_is_initialized {
            if self.time_first_throughput_estimate_ms == -1 {
                if input.estimated_throughput.is_some() {
                    self.time_first_throughput_estimate_ms = now_ms;
                }
            } else if now_ms - self.time_first_throughput_estimate_ms > INITIALIZATION_TIME_MS {
                if let Some(throughput) = input.estimated_throughput {
                    self.current_bitrate = throughput;
                    self.bitrate_is_initialized = true;
                }
            }
        }
        self.change_bitrate(input, now_ms);
        self.current_bitrate
    }

    /// Whether it is time to decrease again while still overusing: the
    /// last change is at least an RTT old, or throughput collapsed to
    /// under half the estimate.
    pub fn time_to_reduce_further(&self, now_ms: i64, estimated_throughput: DataRate) -> bool {
        let reduction_interval_ms = self.rtt_ms.clamp(10, 200);
        if now_ms - self.time_last_bitrate_change_ms >= reduction_interval_ms {
            return true;
        }
        if self.valid_estimate() {
            return estimated_throughput.as_bps() < self.latest_estimate().as_bps() / 2;
        }
        false
    }

    /// REMB pacing: enough feedback to cover ~5% overhead, within
    /// [200 ms, 1 s].
    pub fn feedback_interval_ms(&self) -> i64 {
        const RTCP_SIZE_BITS: f64 = 80.0 * 8.0;
        let rtcp_rate_bps = self.current_bitrate.as_bps() as f64 * 0.05;
        let interval_ms = (RTCP_SIZE_BITS / rtcp_rate_bps * 1000.0) as i64;
        interval_ms.clamp(200, 1000)
    }

    fn change_bitrate(&mut self, input: RateControlInput, now_ms: i64) {
        let estimated_throughput = input
            .estimated_throughput
            .unwrap_or(self.latest_estimated_throughput);
        if let Some(throughput) = input.estimated_throughput {
            self.latest_estimated_throughput = throughput;
        }

        // Before the first real estimate, only an overuse (which seeds the
        // estimate from measured throughput) may change the bitrate.
        if !self.bitrate_is_initialized && input.state != Hypothesis::Overusing {
            return;
        }

        self.change_state(input.state, now_ms);

        let new_bitrate = match self.state {
            RateControlState::Hold => None,
            RateControlState::Increase => self.increase(estimated_throughput, now_ms),
            RateControlState::Decrease => self.decrease(estimated_throughput, now_ms),
        };
        if let Some(new_bitrate) = new_bitrate {
            self.current_bitrate = new_bitrate;
        }
    }

    fn change_state(&mut self, hypothesis: Hypothesis, now_ms: i64) {
        match hypothesis {
            Hypothesis::Normal => {
                if self.state == RateControlState::Hold {
                    self.time_last_bitrate_change_ms = now_ms;
                    self.state = RateControlState::Increase;
                }
            }
            Hypothesis::Overusing => {
                self.state = RateControlState::Decrease;
            }
            Hypothesis::Underusing => {
                self.state = RateControlState::Hold;
            }
        }
    }

    fn increase(&mut self, estimated_throughput: DataRate, now_ms: i64) -> Option<DataRate> {
        let throughput_based_limit = DataRate::from_bps(
            (1.5 * estimated_throughput.as_bps() as f64 + 0.5 + 10_000.0) as u64,
        );
        if estimated_throughput > self.link_capacity.upper_bound() {
            self.link_capacity.reset();
        }
        let mut new_bitrate = None;
        if self.current_bitrate < throughput_based_limit {
            let increased_bitrate = if self.link_capacity.has_estimate() {
                // Near the known capacity: creep up additively.
                self.current_bitrate + self.additive_rate_increase(now_ms)
            } else {
                self.current_bitrate + self.multiplicative_rate_increase(now_ms)
            };
            new_bitrate = Some(increased_bitrate.min(throughput_based_limit));
        }
        self.time_last_bitrate_change_ms = now_ms;
        new_bitrate
    }

    fn decrease(&mut self, estimated_throughput: DataRate, now_ms: i64) -> Option<DataRate> {
        let mut decreased_bitrate = estimated_throughput * self.beta;
        if decreased_bitrate > self.current_bitrate {
            if let Some(capacity) = self.link_capacity.estimate() {
                decreased_bitrate = capacity * self.beta;
            }
        }
        let new_bitrate = if decreased_bitrate < self.current_bitrate {
            Some(decreased_bitrate)
        } else {
            None
        };

        if self.bitrate_is_initialized && estimated_throughput < self.current_bitrate {
            self.last_decrease = match new_bitrate {
                Some(new_bitrate) => self.current_bitrate.saturating_sub(new_bitrate),
                None => DataRate::ZERO,
            };
        }
        if estimated_throughput < self.link_capacity.lower_bound() {
            // The link degraded well below what we thought it carried.
            self.link_capacity.reset();
        }
        self.bitrate_is_initialized = true;
        self.link_capacity.on_overuse_detected(estimated_throughput);
        self.state = RateControlState::Hold;
        self.time_last_bitrate_change_ms = now_ms;
        self.time_last_bitrate_decrease_ms = now_ms;
        new_bitrate
    }

    fn additive_rate_increase(&self, now_ms: i64) -> DataRate {
        let period_seconds = (now_ms - self.time_last_bitrate_change_ms) as f64 / 1000.0;
        DataRate::from_bps(
            (self.near_max_increase_rate_bps_per_second() * period_seconds).max(0.0) as u64,
        )
    }

    fn multiplicative_rate_increase(&self, now_ms: i64) -> DataRate {
        let mut alpha: f64 = 1.08;
        if self.time_last_bitrate_change_ms > -1 {
            let since_last_secs =
                (now_ms - self.time_last_bitrate_change_ms) as f64 / 1000.0;
            alpha = alpha.powf(since_last_secs.min(1.0));
        }
        DataRate::from_bps(
            (self.current_bitrate.as_bps() as f64 * (alpha - 1.0)).max(1000.0) as u64,
        )
    }

    fn near_max_increase_rate_bps_per_second(&self) -> f64 {
        if self.current_bitrate == DataRate::ZERO {
            return 0.0;
        }
        // Assume 30 fps and derive the average packet size of a frame.
        let frame_size_bytes = self.current_bitrate.as_bps() as f64 / (FRAMES_PER_SECOND * 8.0);
        let packets_per_frame = (frame_size_bytes / MAX_PACKET_SIZE_BYTES).ceil();
        let avg_packet_size_bytes = frame_size_bytes / packets_per_frame;
        let mut response_time_ms = (self.rtt_ms + 100) as f64;
        if self.in_experiment {
            response_time_ms *= 2.0;
        }
        let increase_rate = avg_packet_size_bytes * 8.0 / (response_time_ms / 1000.0);
        increase_rate.max(MIN_INCREASE_RATE_BPS_PER_SECOND)
    }

    fn clamp_bitrate(&self, bitrate: DataRate) -> DataRate {
        bitrate.max(self.min_configured_bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throughput(kbps: u64) -> RateControlInput {
        RateControlInput {
            state: Hypothesis::Normal,
            estimated_throughput: Some(DataRate::from_kbps(kbps)),
        }
    }

    #[test]
    fn test_probe_estimate_is_adopted() {
        let mut aimd = AimdRateControl::new();
        assert!(!aimd.valid_estimate());
        aimd.set_estimate(DataRate::from_kbps(800), 0);
        assert!(aimd.valid_estimate());
        assert_eq!(DataRate::from_kbps(800), aimd.latest_estimate());
    }

    #[test]
    fn test_initializes_from_throughput_after_grace_period() {
        let mut aimd = AimdRateControl::new();
        aimd.update(throughput(500), 0);
        assert!(!aimd.valid_estimate());
        aimd.update(throughput(500), 2000);
        assert!(!aimd.valid_estimate());
        aimd.update(throughput(500), 5500);
        assert!(aimd.valid_estimate());
        assert!(aimd.latest_estimate() <= DataRate::from_kbps(760));
    }

    #[test]
    fn test_overuse_decreases_to_beta_of_throughput() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(1000), 0);
        let input = RateControlInput {
            state: Hypothesis::Overusing,
            estimated_throughput: Some(DataRate::from_kbps(1000)),
        };
        let rate = aimd.update(input, 100);
        assert_eq!(DataRate::from_kbps(850), rate);
        assert!(aimd.link_capacity.has_estimate());
    }

    #[test]
    fn test_increase_is_multiplicative_without_capacity_estimate() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(100), 0);
        // The first Normal only stamps the increase epoch, so it gets the
        // minimum bump; a second one a full second later grows 8%.
        let rate = aimd.update(throughput(200), 1000);
        assert_eq!(DataRate::from_bps(101_000), rate);
        let rate = aimd.update(throughput(200), 2000);
        assert_eq!(DataRate::from_bps(109_080), rate);
    }

    #[test]
    fn test_increase_is_additive_with_capacity_estimate() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(1000), 0);
        // An overuse seeds the link-capacity estimate.
        aimd.update(
            RateControlInput {
                state: Hypothesis::Overusing,
                estimated_throughput: Some(DataRate::from_kbps(1000)),
            },
            0,
        );
        // Underuse then normal: Hold, then Increase.
        aimd.update(
            RateControlInput {
                state: Hypothesis::Underusing,
                estimated_throughput: None,
            },
            100,
        );
        let before = aimd.latest_estimate();
        // First Normal switches Hold -> Increase and stamps the time.
        aimd.update(throughput(1000), 200);
        let after_one_second = aimd.update(throughput(1000), 1200);
        let growth = after_one_second.saturating_sub(before).as_bps();
        // Additive growth is a few packets per response time, far below
        // the 8%/s multiplicative ramp (which would be 68 kbps here).
        assert!(growth > 0, "no growth");
        assert!(growth < 60_000, "growth {} looks multiplicative", growth);
    }

    #[test]
    fn test_increase_skipped_above_throughput_limit() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(1000), 0);
        // Already past 1.5x throughput + 10k: no further growth; cutting
        // is the detector's job once it flags overuse.
        let rate = aimd.update(throughput(100), 1000);
        assert_eq!(DataRate::from_kbps(1000), rate);
    }

    #[test]
    fn test_underuse_holds() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(500), 0);
        let rate = aimd.update(
            RateControlInput {
                state: Hypothesis::Underusing,
                estimated_throughput: Some(DataRate::from_kbps(400)),
            },
            500,
        );
        assert_eq!(DataRate::from_kbps(500), rate);
    }

    #[test]
    fn test_feedback_interval_tracks_bitrate() {
        let mut aimd = AimdRateControl::new();
        // 30 Mbps default: minimum interval.
        assert_eq!(200, aimd.feedback_interval_ms());
        aimd.set_estimate(DataRate::from_kbps(100), 0);
        // 640 bits / (5% of 100 kbps) = 128 ms, clamped up to 200.
        assert_eq!(200, aimd.feedback_interval_ms());
        aimd.set_estimate(DataRate::from_kbps(10), 0);
        // 640 / 500 = 1.28 s, clamped down to 1 s.
        assert_eq!(1000, aimd.feedback_interval_ms());
    }

    #[test]
    fn test_time_to_reduce_further() {
        let mut aimd = AimdRateControl::new();
        aimd.set_estimate(DataRate::from_kbps(1000), 0);
        // Within the RTT of the last change, throughput healthy: no.
        assert!(!aimd.time_to_reduce_further(100, DataRate::from_kbps(900)));
        // Throughput collapsed below half the estimate: yes.
        assert!(aimd.time_to_reduce_further(100, DataRate::from_kbps(400)));
        // An RTT elapsed: yes.
        assert!(aimd.time_to_reduce_further(250, DataRate::from_kbps(900)));
    }
}
