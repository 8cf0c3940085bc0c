//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Keyframe-demand deduplication, one instance per video receiver. Demand
//! for an SSRC collapses into a single outstanding request retried each
//! second until satisfied or out of retries; an optional fixed delay
//! coalesces demand from many subscribers at the cost of a slower first
//! request.
//!
//! Driven from the connection's timer via [`KeyframeManager::tick`].

use std::collections::HashMap;

use crate::rtp::Ssrc;

const RETRY_INTERVAL_MS: i64 = 1000;

#[derive(Debug)]
struct Pending {
    next_retry_ms: i64,
    retries_left: i32,
}

#[derive(Debug, Default)]
pub struct KeyframeManager {
    delay_ms: i64,
    pending: HashMap<Ssrc, Pending>,
    delayed: HashMap<Ssrc, i64>,
}

impl KeyframeManager {
    pub fn new(delay_ms: i64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    /// Registers demand for a keyframe on `ssrc`. Returns true when the
    /// caller should send a request right now; repeated demand while one
    /// is outstanding just extends the retry budget.
    pub fn needed(&mut self, ssrc: Ssrc, now_ms: i64) -> bool {
        if self.delay_ms > 0 {
            if self.pending.contains_key(&ssrc) || self.delayed.contains_key(&ssrc) {
                return false;
            }
            self.delayed.insert(ssrc, now_ms + self.delay_ms);
            return false;
        }
        self.needed_now(ssrc, now_ms)
    }

    fn needed_now(&mut self, ssrc: Ssrc, now_ms: i64) -> bool {
        self.delayed.remove(&ssrc);
        if let Some(pending) = self.pending.get_mut(&ssrc) {
            pending.retries_left += 1;
            return false;
        }
        self.pending.insert(
            ssrc,
            Pending {
                next_retry_ms: now_ms + RETRY_INTERVAL_MS,
                retries_left: 1,
            },
        );
        true
    }

    /// A keyframe arrived on `ssrc`; all demand for it is satisfied.
    pub fn received(&mut self, ssrc: Ssrc) {
        self.pending.remove(&ssrc);
        self.delayed.remove(&ssrc);
    }

    /// Promotes due delayed demand and retries overdue requests. Returns
    /// the SSRCs to request keyframes for now.
    pub fn tick(&mut self, now_ms: i64) -> Vec<Ssrc> {
        let mut fire = Vec::new();

        let due: Vec<Ssrc> = self
            .delayed
            .iter()
            .filter(|(_, &fire_at)| now_ms >= fire_at)
            .map(|(&ssrc, _)| ssrc)
            .collect();
        for ssrc in due {
            self.delayed.remove(&ssrc);
            if self.needed_now(ssrc, now_ms) {
                fire.push(ssrc);
            }
        }

        let mut timed_out = Vec::new();
        for (&ssrc, pending) in self.pending.iter_mut() {
            if now_ms < pending.next_retry_ms {
                continue;
            }
            if pending.retries_left > 0 {
                pending.retries_left -= 1;
                pending.next_retry_ms = now_ms + RETRY_INTERVAL_MS;
                fire.push(ssrc);
            } else {
                timed_out.push(ssrc);
            }
        }
        for ssrc in timed_out {
            self.pending.remove(&ssrc);
        }
        fire
    }

    #[cfg(test)]
    fn is_pending(&self, ssrc: Ssrc) -> bool {
        self.pending.contains_key(&ssrc)
    }
}
