//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Two-state Kalman filter estimating the queuing-delay trend. State is
//! (slope, offset) of observed one-way-delay variation; a growing offset
//! means packets are queuing faster than they drain.

use crate::bwe::overuse_detector::Hypothesis;

const DELTA_COUNTER_MAX: usize = 1000;
const MIN_FRAME_PERIOD_HISTORY_LENGTH: usize = 60;

#[derive(Debug)]
pub struct OveruseEstimator {
    num_of_deltas: usize,
    offset: f64,
    prev_offset: f64,
    slope: f64,
    // Error covariance and process noise of the (slope, offset) state.
    e: [[f64; 2]; 2],
    process_noise: [f64; 2],
    var_noise: f64,
    avg_noise: f64,
    ts_delta_hist: Vec<f64>,
}

impl Default for OveruseEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl OveruseEstimator {
    pub fn new() -> Self {
        Self {
            num_of_deltas: 0,
            offset: 0.0,
            prev_offset: 0.0,
            slope: 8.0 / 512.0,
            e: [[100.0, 0.0], [0.0, 1e-1]],
            process_noise: [1e-13, 1e-3],
            var_noise: 50.0,
            avg_noise: 0.0,
            ts_delta_hist: Vec::new(),
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn num_of_deltas(&self) -> usize {
        self.num_of_deltas
    }

    pub fn update(
        &mut self,
        t_delta_ms: i64,
        ts_delta: f64,
        size_delta: i64,
        current_hypothesis: Hypothesis,
        _now_ms: i64,
    ) {
        let min_frame_period = self.update_min_frame_period(ts_delta);
        let t_ts_delta = t_delta_ms as f64 - ts_delta;
        let fs_delta = size_delta as f64;
        self.num_of_deltas = (self.num_of_deltas + 1).min(DELTA_COUNTER_MAX);

        self.e[0][0] += self.process_noise[0];
        self.e[1][1] += self.process_noise[1];
        // When the hypothesis disagrees with the offset's direction, boost
        // the offset's process noise so the filter can catch up.
        if (current_hypothesis == Hypothesis::Overusing && self.offset < self.prev_offset)
            || (current_hypothesis == Hypothesis::Underusing && self.offset > self.prev_offset)
        {
            self.e[1][1] += 10.0 * self.process_noise[1];
        }

        let h = [fs_delta, 1.0];
        let eh = [
            self.e[0][0] * h[0] + self.e[0][1] * h[1],
            self.e[1][0] * h[0] + self.e[1][1] * h[1],
        ];

        let residual = t_ts_delta - self.slope * h[0] - self.offset;
        let in_stable_state = current_hypothesis == Hypothesis::Normal;
        let max_residual = 3.0 * self.var_noise.sqrt();
        if residual.abs() < max_residual {
            self.update_noise_estimate(residual, min_frame_period, in_stable_state);
        } else {
            let clipped = if residual < 0.0 { -max_residual } else { max_residual };
            self.update_noise_estimate(clipped, min_frame_period, in_stable_state);
        }

        let denom = self.var_noise + h[0] * eh[0] + h[1] * eh[1];
        let k = [eh[0] / denom, eh[1] / denom];
        let ikh = [
            [1.0 - k[0] * h[0], -k[0] * h[1]],
            [-k[1] * h[0], 1.0 - k[1] * h[1]],
        ];
        let e00 = self.e[0][0];
        let e01 = self.e[0][1];
        self.e[0][0] = e00 * ikh[0][0] + self.e[1][0] * ikh[0][1];
        self.e[0][1] = e01 * ikh[0][0] + self.e[1][1] * ikh[0][1];
        self.e[1][0] = e00 * ikh[1][0] + self.e[1][0] * ikh[1][1];
        self.e[1][1] = e01 * ikh[1][0] + self.e[1][1] * ikh[1][1];

        // A non-positive-semi-definite covariance would corrupt the state.
        let positive_semi_definite = self.e[0][0] + self.e[1][1] >= 0.0
            && self.e[0][0] * self.e[1][1] - self.e[0][1] * self.e[1][0] >= 0.0
            && self.e[0][0] >= 0.0;
        if !positive_semi_definite {
            return;
        }

        self.slope += k[0] * residual;
        self.prev_offset = self.offset;
        self.offset += k[1] * residual;
    }

    fn update_min_frame_period(&mut self, ts_delta: f64) -> f64 {
        if self.ts_delta_hist.len() >= MIN_FRAME_PERIOD_HISTORY_LENGTH {
            self.ts_delta_hist.remove(0);
        }
        let mut min_frame_period = ts_delta;
        for &delta in &self.ts_delta_hist {
            if delta < min_frame_period {
                min_frame_period = delta;
            }
        }
        self.ts_delta_hist.push(ts_delta);
        min_frame_period
    }

    fn update_noise_estimate(&mut self, residual: f64, ts_delta: f64, stable_state: bool) {
        if !stable_state {
            return;
        }
        // Slower adaptation once the filter has settled.
        let alpha: f64 = if self.num_of_deltas > 10 * 30 { 0.002 } else { 0.01 };
        let beta = (1.0 - alpha).powf(ts_delta * 30.0 / 1000.0);
        self.avg_noise = beta * self.avg_noise + (1.0 - beta) * residual;
        self.var_noise = beta * self.var_noise
            + (1.0 - beta) * (self.avg_noise - residual) * (self.avg_noise - residual);
        if self.var_noise < 1.0 {
            self.var_noise = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_deltas_keep_offset_near_zero() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..100 {
            // Arrival deltas exactly match send deltas.
            estimator.update(5, 5.0, 0, Hypothesis::Normal, i * 5);
        }
        assert!(estimator.offset().abs() < 1.0, "offset {}", estimator.offset());
        assert_eq!(100, estimator.num_of_deltas());
    }

    #[test]
    fn test_growing_queue_drives_offset_up() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..200 {
            // Every group arrives 2 ms later than it was sent.
            estimator.update(7, 5.0, 0, Hypothesis::Normal, i * 5);
        }
        assert!(estimator.offset() > 0.5, "offset {}", estimator.offset());
    }

    #[test]
    fn test_draining_queue_drives_offset_down() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..200 {
            estimator.update(3, 5.0, 0, Hypothesis::Normal, i * 5);
        }
        assert!(estimator.offset() < -0.5, "offset {}", estimator.offset());
    }

    #[test]
    fn test_delta_counter_saturates() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..2000 {
            estimator.update(5, 5.0, 0, Hypothesis::Normal, i * 5);
        }
        assert_eq!(1000, estimator.num_of_deltas());
    }
}
