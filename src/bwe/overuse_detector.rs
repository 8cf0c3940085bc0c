//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Turns the estimator's delay-trend offset into a bandwidth-usage
//! hypothesis, with a threshold that adapts toward the observed offset.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Hypothesis {
    Normal,
    Overusing,
    Underusing,
}

const MAX_NUM_DELTAS: usize = 60;
// Threshold adaptation stops for offsets far outside the threshold.
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const OVERUSING_TIME_THRESHOLD_MS: i64 = 10;
const THRESHOLD_GAIN_DOWN: f64 = 0.039;
const THRESHOLD_GAIN_UP: f64 = 0.0087;

#[derive(Debug)]
pub struct OveruseDetector {
    hypothesis: Hypothesis,
    threshold: f64,
    time_over_using_ms: i64,
    overuse_counter: usize,
    prev_offset: f64,
    last_update_ms: i64,
}

impl Default for OveruseDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl OveruseDetector {
    pub fn new() -> Self {
        Self {
            hypothesis: Hypothesis::Normal,
            threshold: 12.5,
            time_over_using_ms: -1,
            overuse_counter: 0,
            prev_offset: 0.0,
            last_update_ms: -1,
        }
    }

    pub fn state(&self) -> Hypothesis {
        self.hypothesis
    }

    pub fn detect(
        &mut self,
        offset: f64,
        ts_delta_ms: i64,
        num_of_deltas: usize,
        now_ms: i64,
    ) -> Hypothesis {
        if num_of_deltas < 2 {
            return Hypothesis::Normal;
        }
        let t = num_of_deltas.min(MAX_NUM_DELTAS) as f64 * offset;
        if t > self.threshold {
            if self.time_over_using_ms == -1 {
                // Initialize to half this group's duration.
                self.time_over_using_ms = ts_delta_ms / 2;
            } else {
                self.time_over_using_ms += ts_delta_ms;
            }
            self.overuse_counter += 1;
            if self.time_over_using_ms > OVERUSING_TIME_THRESHOLD_MS
                && self.overuse_counter > 1
                && offset >= self.prev_offset
            {
                self.time_over_using_ms = 0;
                self.overuse_counter = 0;
                self.hypothesis = Hypothesis::Overusing;
            }
        } else if t < -self.threshold {
            self.time_over_using_ms = 0;
            self.overuse_counter = 0;
            self.hypothesis = Hypothesis::Underusing;
        } else {
            self.time_over_using_ms = 0;
            self.overuse_counter = 0;
            self.hypothesis = Hypothesis::Normal;
        }
        self.prev_offset = offset;
        self.update_threshold(t, now_ms);
        self.hypothesis
    }

    fn update_threshold(&mut self, modified_offset: f64, now_ms: i64) {
        if self.last_update_ms == -1 {
            self.last_update_ms = now_ms;
        }
        if modified_offset.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            self.last_update_ms = now_ms;
            return;
        }
        let k = if modified_offset.abs() < self.threshold {
            THRESHOLD_GAIN_DOWN
        } else {
            THRESHOLD_GAIN_UP
        };
        let time_delta_ms = (now_ms - self.last_update_ms).min(100);
        self.threshold += k * (modified_offset.abs() - self.threshold) * time_delta_ms as f64;
        self.threshold = self.threshold.clamp(6.0, 600.0);
        self.last_update_ms = now_ms;
    }
}
