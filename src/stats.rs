//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Connection-level traffic counters. Per-stream counters live on the
//! streams themselves; this is the transport-wide view.

use parking_lot::Mutex;

use crate::common::RateStatistics;

#[derive(Debug, Default)]
struct StatsInner {
    packets_sent: u64,
    bytes_sent: u64,
    packets_received: u64,
    bytes_received: u64,
    send_bps: RateStatistics,
    receive_bps: RateStatistics,
}

#[derive(Debug, Default)]
pub struct ConnectionStats {
    inner: Mutex<StatsInner>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub send_bps: u64,
    pub receive_bps: u64,
}

impl ConnectionStats {
    pub fn record_incoming_rtp(&self, size_bytes: usize, now_ms: i64) {
        let mut inner = self.inner.lock();
        inner.packets_received += 1;
        inner.bytes_received += size_bytes as u64;
        inner.receive_bps.update(size_bytes as i64, now_ms);
    }

    pub fn record_outgoing_rtp(&self, size_bytes: usize, now_ms: i64) {
        let mut inner = self.inner.lock();
        inner.packets_sent += 1;
        inner.bytes_sent += size_bytes as u64;
        inner.send_bps.update(size_bytes as i64, now_ms);
    }

    pub fn snapshot(&self, now_ms: i64) -> StatsSnapshot {
        let mut inner = self.inner.lock();
        let send_bps = inner.send_bps.rate(now_ms).map(|r| r.as_bps()).unwrap_or(0);
        let receive_bps = inner
            .receive_bps
            .rate(now_ms)
            .map(|r| r.as_bps())
            .unwrap_or(0);
        StatsSnapshot {
            packets_sent: inner.packets_sent,
            bytes_sent: inner.bytes_sent,
            packets_received: inner.packets_received,
            bytes_received: inner.bytes_received,
            send_bps,
            receive_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnectionStats::default();
        for i in 0..10 {
            stats.record_incoming_rtp(1200, i * 10);
        }
        stats.record_outgoing_rtp(500, 50);
        let snapshot = stats.snapshot(100);
        assert_eq!(10, snapshot.packets_received);
        assert_eq!(12_000, snapshot.bytes_received);
        assert_eq!(1, snapshot.packets_sent);
        assert_eq!(500, snapshot.bytes_sent);
        assert!(snapshot.receive_bps > 0);
    }
}
