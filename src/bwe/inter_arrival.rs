//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Groups incoming packets by abs-send-time and produces per-group
//! (send-delta, arrival-delta, size-delta) triples for the overuse
//! pipeline. Packets sent close together travel as a burst and are
//! grouped together even across the nominal 5 ms window.

const ARRIVAL_TIME_OFFSET_THRESHOLD_MS: i64 = 3000;
const REORDERED_RESET_THRESHOLD: usize = 3;
const BURST_DELTA_THRESHOLD_MS: i64 = 5;
const MAX_BURST_DURATION_MS: i64 = 100;

/// Deltas between two adjacent closed groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupDelta {
    /// Send-time delta in inter-arrival ticks.
    pub ts_delta: u32,
    /// Arrival-time delta in milliseconds.
    pub t_delta: i64,
    /// Accumulated size difference in bytes.
    pub size_delta: i64,
}

#[derive(Clone, Copy, Debug)]
struct TimeGroup {
    timestamp: u32,
    first_timestamp: u32,
    first_arrival_ms: i64,
    complete_time_ms: i64,
    last_system_time_ms: i64,
    size: i64,
}

impl TimeGroup {
    fn new() -> Self {
        Self {
            timestamp: 0,
            first_timestamp: 0,
            first_arrival_ms: -1,
            complete_time_ms: -1,
            last_system_time_ms: -1,
            size: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.complete_time_ms == -1
    }
}

#[derive(Debug)]
pub struct InterArrival {
    current_group: TimeGroup,
    prev_group: TimeGroup,
    num_consecutive_reordered: usize,
    burst_grouping: bool,
    timestamp_to_ms: f64,
    group_length_ticks: u32,
}

impl InterArrival {
    pub fn new(group_length_ticks: u32, timestamp_to_ms: f64, burst_grouping: bool) -> Self {
        Self {
            current_group: TimeGroup::new(),
            prev_group: TimeGroup::new(),
            num_consecutive_reordered: 0,
            burst_grouping,
            timestamp_to_ms,
            group_length_ticks,
        }
    }

    /// Feeds one packet; returns deltas when its arrival closed a group
    /// and both that group and its predecessor are complete.
    pub fn compute_deltas(
        &mut self,
        timestamp: u32,
        arrival_ms: i64,
        system_ms: i64,
        size: i64,
    ) -> Option<GroupDelta> {
        let mut delta = None;
        if self.current_group.is_empty() && self.current_group.first_arrival_ms == -1 {
            self.current_group.timestamp = timestamp;
            self.current_group.first_timestamp = timestamp;
            self.current_group.first_arrival_ms = arrival_ms;
        } else if !self.packet_in_order(timestamp) {
            return None;
        } else if self.new_timestamp_group(arrival_ms, timestamp) {
            if self.prev_group.complete_time_ms >= 0 {
                let ts_delta = self
                    .current_group
                    .timestamp
                    .wrapping_sub(self.prev_group.timestamp);
                let t_delta = self.current_group.complete_time_ms - self.prev_group.complete_time_ms;
                let system_delta_ms =
                    self.current_group.last_system_time_ms - self.prev_group.last_system_time_ms;
                if t_delta - system_delta_ms >= ARRIVAL_TIME_OFFSET_THRESHOLD_MS {
                    // The remote clock jumped; all history is garbage.
                    self.reset();
                    return None;
                }
                if t_delta < 0 {
                    self.num_consecutive_reordered += 1;
                    if self.num_consecutive_reordered >= REORDERED_RESET_THRESHOLD {
                        self.reset();
                    }
                    return None;
                }
                self.num_consecutive_reordered = 0;
                delta = Some(GroupDelta {
                    ts_delta,
                    t_delta,
                    size_delta: self.current_group.size - self.prev_group.size,
                });
            }
            self.prev_group = self.current_group;
            self.current_group = TimeGroup::new();
            self.current_group.timestamp = timestamp;
            self.current_group.first_timestamp = timestamp;
            self.current_group.first_arrival_ms = arrival_ms;
            self.num_consecutive_reordered = 0;
        } else {
            self.current_group.timestamp = latest_timestamp(self.current_group.timestamp, timestamp);
        }
        self.current_group.size += size;
        self.current_group.complete_time_ms = arrival_ms;
        self.current_group.last_system_time_ms = system_ms;
        delta
    }

    pub fn reset(&mut self) {
        self.num_consecutive_reordered = 0;
        self.current_group = TimeGroup::new();
        self.prev_group = TimeGroup::new();
    }

    // Modular u32 distance; anything within half the space is "forward".
    fn packet_in_order(&self, timestamp: u32) -> bool {
        if self.current_group.is_empty() && self.current_group.first_arrival_ms == -1 {
            return true;
        }
        timestamp.wrapping_sub(self.current_group.first_timestamp) < 0x8000_0000
    }

    fn new_timestamp_group(&self, arrival_ms: i64, timestamp: u32) -> bool {
        if self.current_group.first_arrival_ms == -1 {
            false
        } else if self.belongs_to_burst(arrival_ms, timestamp) {
            false
        } else {
            timestamp.wrapping_sub(self.current_group.first_timestamp) > self.group_length_ticks
        }
    }

    fn belongs_to_burst(&self, arrival_ms: i64, timestamp: u32) -> bool {
        if !self.burst_grouping || self.current_group.complete_time_ms < 0 {
            return false;
        }
        let arrival_delta_ms = arrival_ms - self.current_group.complete_time_ms;
        let ts_diff = timestamp.wrapping_sub(self.current_group.first_timestamp);
        let ts_delta_ms = (self.timestamp_to_ms * ts_diff as f64 + 0.5) as i64;
        if ts_delta_ms == 0 {
            return true;
        }
        let propagation_delta_ms = arrival_delta_ms - ts_delta_ms;
        propagation_delta_ms < 0
            && arrival_delta_ms <= BURST_DELTA_THRESHOLD_MS
            && arrival_ms - self.current_group.first_arrival_ms < MAX_BURST_DURATION_MS
    }
}

fn latest_timestamp(a: u32, b: u32) -> u32 {
    let breakpoint = 0x8000_0000u32;
    if a.wrapping_sub(b) == breakpoint {
        return a.max(b);
    }
    if a == b {
        return a;
    }
    if a.wrapping_sub(b) < breakpoint {
        a
    } else {
        b
    }
}
