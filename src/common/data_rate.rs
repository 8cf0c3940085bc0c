//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    ops::{Add, AddAssign, Mul, Sub},
};

/// An amount of data, stored as bits so sizes and rates interconvert
/// without losing sub-byte precision.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct DataSize {
    bits: u64,
}

impl DataSize {
    pub const ZERO: Self = Self::from_bits(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    pub const fn as_bits(&self) -> u64 {
        self.bits
    }

    pub const fn from_bytes(bytes: u64) -> Self {
        Self::from_bits(bytes * 8)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.bits / 8
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self::from_bits(self.bits.saturating_sub(other.bits))
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, other: DataSize) -> DataSize {
        DataSize::from_bits(self.bits + other.bits)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

/// Bits per second.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct DataRate {
    bps: u64,
}

impl DataRate {
    pub const ZERO: Self = Self::from_bps(0);

    pub const fn from_bps(bps: u64) -> Self {
        Self { bps }
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self::from_bps(kbps * 1000)
    }

    pub const fn as_bps(&self) -> u64 {
        self.bps
    }

    pub const fn as_kbps(&self) -> u64 {
        self.bps / 1000
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self::from_bps(self.bps.saturating_sub(other.bps))
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self::from_bps(self.bps.clamp(min.bps, max.bps))
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.bps < 1_000 {
            write!(f, "{} bps", self.bps)
        } else if self.bps < 1_000_000 {
            write!(f, "{:.1} Kbps", (self.bps * 10 / 1_000) as f64 / 10f64)
        } else {
            write!(f, "{:.1} Mbps", (self.bps * 10 / 1_000_000) as f64 / 10f64)
        }
    }
}

impl Add<DataRate> for DataRate {
    type Output = DataRate;

    fn add(self, other: DataRate) -> DataRate {
        DataRate::from_bps(self.bps + other.bps)
    }
}

impl Sub<DataRate> for DataRate {
    type Output = DataRate;

    fn sub(self, other: DataRate) -> DataRate {
        DataRate::from_bps(self.bps - other.bps)
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, x: f64) -> DataRate {
        DataRate::from_bps((self.bps as f64 * x) as u64)
    }
}

/// `size / duration` with the +half-duration rounding the rate control
/// expects, e.g. a cluster's mean size over its mean delta.
pub fn rate_from_bytes_per_ms(bytes: u64, duration_ms: i64) -> DataRate {
    if duration_ms <= 0 {
        return DataRate::ZERO;
    }
    DataRate::from_bps((bytes as f64 * 8000.0 / duration_ms as f64) as u64)
}

const BUCKET_SCALE_BPS: f64 = 8000.0;

#[derive(Debug)]
struct Bucket {
    timestamp_ms: i64,
    sum_bytes: i64,
    num_samples: usize,
}

/// Sliding-window byte counter with per-millisecond buckets.
///
/// `rate()` withholds an answer until the window has either filled or seen
/// at least two samples, and permanently after an accumulator overflow
/// (until `reset()`).
#[derive(Debug)]
pub struct RateStatistics {
    buckets: VecDeque<Bucket>,
    accumulated_bytes: i64,
    overflow: bool,
    num_samples: usize,
    first_timestamp_ms: i64,
    window_size_ms: i64,
}

impl Default for RateStatistics {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_MS)
    }
}

impl RateStatistics {
    pub const DEFAULT_WINDOW_MS: i64 = 1000;

    pub fn new(window_size_ms: i64) -> Self {
        Self {
            buckets: VecDeque::new(),
            accumulated_bytes: 0,
            overflow: false,
            num_samples: 0,
            first_timestamp_ms: -1,
            window_size_ms,
        }
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
        self.accumulated_bytes = 0;
        self.overflow = false;
        self.num_samples = 0;
        self.first_timestamp_ms = -1;
    }

    pub fn update(&mut self, size_bytes: i64, now_ms: i64) {
        self.erase_old(now_ms);
        if self.first_timestamp_ms == -1 || self.num_samples == 0 {
            self.first_timestamp_ms = now_ms;
        }
        let mut now_ms = now_ms;
        let needs_new_bucket = match self.buckets.back() {
            None => true,
            Some(latest) => {
                if now_ms < latest.timestamp_ms {
                    // Clamp a backward clock jump onto the latest bucket.
                    now_ms = latest.timestamp_ms;
                }
                now_ms != latest.timestamp_ms
            }
        };
        if needs_new_bucket {
            self.buckets.push_back(Bucket {
                timestamp_ms: now_ms,
                sum_bytes: 0,
                num_samples: 0,
            });
        }
        let bucket = self.buckets.back_mut().unwrap();
        bucket.sum_bytes += size_bytes;
        bucket.num_samples += 1;
        if i64::MAX - self.accumulated_bytes > size_bytes {
            self.accumulated_bytes += size_bytes;
        } else {
            self.overflow = true;
        }
        self.num_samples += 1;
    }

    pub fn rate(&mut self, now_ms: i64) -> Option<DataRate> {
        self.erase_old(now_ms);
        let mut active_window_ms = 0;
        if self.first_timestamp_ms != -1 {
            active_window_ms = if self.first_timestamp_ms <= now_ms - self.window_size_ms {
                self.window_size_ms
            } else {
                now_ms - self.first_timestamp_ms + 1
            };
        }
        if self.num_samples == 0
            || active_window_ms <= 1
            || (self.num_samples <= 1 && active_window_ms < self.window_size_ms)
            || self.overflow
        {
            return None;
        }
        let bps = self.accumulated_bytes as f64 * BUCKET_SCALE_BPS / active_window_ms as f64 + 0.5;
        Some(DataRate::from_bps(bps as u64))
    }

    fn erase_old(&mut self, now_ms: i64) {
        let new_oldest_time = now_ms - self.window_size_ms + 1;
        while let Some(bucket) = self.buckets.front() {
            if bucket.timestamp_ms >= new_oldest_time {
                break;
            }
            self.accumulated_bytes -= bucket.sum_bytes;
            self.num_samples -= bucket.num_samples;
            self.buckets.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_size_and_rate_units() {
        assert_eq!(8, DataSize::from_bytes(1).as_bits());
        assert_eq!(2, DataSize::from_bits(16).as_bytes());
        assert_eq!(1_000, DataRate::from_kbps(1).as_bps());
        assert_eq!(2, DataRate::from_bps(2_999).as_kbps());
        assert_eq!(
            DataRate::from_bps(1),
            DataRate::from_bps(4).saturating_sub(DataRate::from_bps(3))
        );
        assert_eq!(
            DataRate::ZERO,
            DataRate::from_bps(4).saturating_sub(DataRate::from_bps(5))
        );
        assert_eq!(DataRate::from_bps(60), DataRate::from_bps(8) * 7.5f64);
    }

    #[test]
    fn display() {
        assert_eq!("999 bps", format!("{}", DataRate::from_bps(999)));
        assert_eq!("1.5 Kbps", format!("{}", DataRate::from_bps(1_550)));
        assert_eq!("2.3 Mbps", format!("{}", DataRate::from_bps(2_350_000)));
    }

    #[test]
    fn rate_from_cluster_deltas() {
        // 1000 bytes every 10ms is 800 kbps.
        assert_eq!(
            DataRate::from_bps(800_000),
            rate_from_bytes_per_ms(1000, 10)
        );
        assert_eq!(DataRate::ZERO, rate_from_bytes_per_ms(1000, 0));
    }

    #[test]
    fn no_rate_until_enough_samples() {
        let mut stats = RateStatistics::new(1000);
        assert_eq!(None, stats.rate(0));
        stats.update(1200, 0);
        // One sample in a partial window says nothing.
        assert_eq!(None, stats.rate(10));
        stats.update(1200, 500);
        assert!(stats.rate(500).is_some());
    }

    #[test]
    fn single_sample_counts_once_window_filled() {
        let mut stats = RateStatistics::new(1000);
        stats.update(1000, 0);
        // 1000 bytes over a full 1s window.
        assert_eq!(Some(DataRate::from_bps(8000)), stats.rate(999));
    }

    #[test]
    fn steady_stream_reports_its_bitrate() {
        let mut stats = RateStatistics::new(1000);
        // 100 packets of 125 bytes over one second = 100 kbps.
        for i in 0..100 {
            stats.update(125, i * 10);
        }
        assert_eq!(Some(DataRate::from_bps(100_000)), stats.rate(999));
    }

    #[test]
    fn old_buckets_fall_out_of_the_window() {
        let mut stats = RateStatistics::new(1000);
        stats.update(1000, 0);
        stats.update(1000, 100);
        stats.update(1000, 2000);
        stats.update(1000, 2999);
        // The first two are older than 2999 - 1000 + 1.
        assert_eq!(Some(DataRate::from_bps(16_000)), stats.rate(2999));
    }

    #[test]
    fn backward_jump_clamps_to_latest_bucket() {
        let mut stats = RateStatistics::new(1000);
        stats.update(500, 100);
        stats.update(500, 90);
        assert_eq!(Some(DataRate::from_bps(8000)), stats.rate(1099));
    }

    #[test]
    fn reset_clears_everything() {
        let mut stats = RateStatistics::new(1000);
        stats.update(1000, 0);
        stats.update(1000, 10);
        stats.reset();
        assert_eq!(None, stats.rate(10));
    }
}
