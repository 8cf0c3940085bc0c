//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Receive-path NACK tracking. Gaps in the incoming sequence-number space
//! become NACK batches, retried on a timer until the packet is recovered,
//! the retry budget runs out, or the list overflows (at which point a
//! keyframe request replaces the whole backlog).

use log::*;

use crate::common::seqnum_is_before;
use crate::rtp::SequenceNumber;

// Entries older than this many seqnums behind the head are dropped.
const MAX_PACKET_AGE: u16 = 10_000;
// Cap on the number of tracked missing packets.
const MAX_NACK_PACKETS: usize = 1000;
// A packet is given up on after this many NACKs.
const MAX_NACK_RETRIES: u8 = 10;
const DEFAULT_RTT_MS: i64 = 100;

/// How often [`NackReceiver::tick`] is expected to be driven.
pub const NACK_TICK_INTERVAL_MS: i64 = 40;

#[derive(Debug, PartialEq, Eq)]
pub enum NackSignal {
    /// Sequence numbers to request, in a TransportLayerNack.
    Nacks(Vec<SequenceNumber>),
    /// The missing-packet list overflowed; loss is beyond repair and the
    /// stream needs a keyframe instead.
    KeyFrameNeeded,
}

#[derive(Debug)]
struct NackEntry {
    seq: SequenceNumber,
    sent_at_ms: i64,
    sent_at_seq: SequenceNumber,
    retries: u8,
}

#[derive(Debug, Default)]
pub struct NackReceiver {
    started: bool,
    last_seq: SequenceNumber,
    nack_list: Vec<NackEntry>,
    keyframes: Vec<SequenceNumber>,
    recover_list: Vec<SequenceNumber>,
    rtt_ms: i64,
}

impl NackReceiver {
    pub fn new() -> Self {
        Self {
            rtt_ms: DEFAULT_RTT_MS,
            ..Default::default()
        }
    }

    /// Allows the retry interval to follow the measured RTT.
    pub fn set_rtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms.max(1);
    }

    pub fn on_packet(
        &mut self,
        seq: SequenceNumber,
        is_keyframe: bool,
        is_rtx: bool,
        now_ms: i64,
    ) -> Option<NackSignal> {
        if !self.started {
            self.started = true;
            self.last_seq = seq;
            if is_keyframe {
                self.keyframes.push(seq);
            }
            return None;
        }
        if seq == self.last_seq {
            return None;
        }
        if seqnum_is_before(seq, self.last_seq) {
            // A reordered original or a repair we asked for; either way the
            // packet is no longer missing.
            self.nack_list.retain(|entry| entry.seq != seq);
            return None;
        }

        if is_keyframe {
            self.keyframes.push(seq);
        }
        drop_older_than(&mut self.keyframes, seq.wrapping_sub(MAX_PACKET_AGE));

        if is_rtx {
            // A repair arrived before its original ever did.
            self.recover_list.push(seq);
            drop_older_than(&mut self.recover_list, seq.wrapping_sub(MAX_PACKET_AGE));
            return None;
        }

        let overflowed = self.add_missing_range(self.last_seq.wrapping_add(1), seq);
        self.last_seq = seq;
        if overflowed {
            return Some(NackSignal::KeyFrameNeeded);
        }

        let batch = self.collect_batch(false, now_ms);
        if batch.is_empty() {
            None
        } else {
            Some(NackSignal::Nacks(batch))
        }
    }

    /// Periodic retry pass, expected every 40 ms. Entries whose last NACK
    /// is older than the RTT are re-requested.
    pub fn tick(&mut self, now_ms: i64) -> Option<Vec<SequenceNumber>> {
        if !self.started {
            return None;
        }
        let batch = self.collect_batch(true, now_ms);
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Returns true when the list overflowed and was cleared.
    fn add_missing_range(&mut self, first: SequenceNumber, end: SequenceNumber) -> bool {
        let cutoff = end.wrapping_sub(MAX_PACKET_AGE);
        drop_entries_older_than(&mut self.nack_list, cutoff);

        let missing = end.wrapping_sub(first) as usize;
        if self.nack_list.len() + missing > MAX_NACK_PACKETS {
            while self.nack_list.len() + missing > MAX_NACK_PACKETS {
                if !self.drop_until_next_keyframe() {
                    break;
                }
            }
            if self.nack_list.len() + missing > MAX_NACK_PACKETS {
                warn!(
                    "NACK list overflow ({} tracked + {} new); requesting keyframe",
                    self.nack_list.len(),
                    missing
                );
                self.nack_list.clear();
                return true;
            }
        }

        let mut seq = first;
        while seq != end {
            if !self.recover_list.contains(&seq) {
                self.nack_list.push(NackEntry {
                    seq,
                    sent_at_ms: 0,
                    sent_at_seq: seq,
                    retries: 0,
                });
            }
            seq = seq.wrapping_add(1);
        }
        false
    }

    fn collect_batch(&mut self, on_timer: bool, now_ms: i64) -> Vec<SequenceNumber> {
        let mut batch = Vec::new();
        let last_seq = self.last_seq;
        let rtt_ms = self.rtt_ms;
        self.nack_list.retain_mut(|entry| {
            let due = if on_timer {
                now_ms - entry.sent_at_ms >= rtt_ms
            } else {
                entry.sent_at_ms == 0
                    && (entry.sent_at_seq == last_seq
                        || seqnum_is_before(entry.sent_at_seq, last_seq))
            };
            if !due {
                return true;
            }
            batch.push(entry.seq);
            entry.retries += 1;
            entry.sent_at_ms = now_ms;
            entry.sent_at_seq = last_seq;
            entry.retries < MAX_NACK_RETRIES
        });
        batch
    }

    /// Drops tracked entries up to the oldest keyframe that would leave the
    /// list shorter. Loss before a keyframe doesn't need repair once the
    /// keyframe itself is in hand.
    fn drop_until_next_keyframe(&mut self) -> bool {
        for (kf_index, &kf_seq) in self.keyframes.iter().enumerate() {
            let drop_count = self
                .nack_list
                .iter()
                .take_while(|entry| seqnum_is_before(entry.seq, kf_seq))
                .count();
            if drop_count > 0 {
                if kf_index != 0 {
                    self.keyframes.drain(..kf_index);
                }
                self.nack_list.drain(..drop_count);
                return true;
            }
        }
        false
    }
}

fn drop_older_than(list: &mut Vec<SequenceNumber>, cutoff: SequenceNumber) {
    let keep_from = list
        .iter()
        .take_while(|&&seq| seqnum_is_before(seq, cutoff))
        .count();
    list.drain(..keep_from);
}

fn drop_entries_older_than(list: &mut Vec<NackEntry>, cutoff: SequenceNumber) {
    let keep_from = list
        .iter()
        .take_while(|entry| seqnum_is_before(entry.seq, cutoff))
        .count();
    list.drain(..keep_from);
}
