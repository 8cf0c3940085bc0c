//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-SSRC stream state shared by the receive and send paths: RFC 3550
//! sequence-number tracking, loss accounting for reception reports, and
//! the codec-feedback flags that decide which repair machinery runs.

use std::fmt;

use thiserror::Error;

use crate::{
    codec::Codec,
    common::RateStatistics,
    rtp::{rtcp::ReceptionReport, PayloadType, RtpTimestamp, SequenceNumber, Ssrc},
};

pub mod receiver;
pub mod sender;

pub(crate) const RTP_SEQ_MOD: u32 = 1 << 16;
pub(crate) const MAX_DROPOUT: u16 = 3000;
pub(crate) const MAX_MISORDER: u16 = 1500;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("bad RTP sequence number")]
    BadSeq,
    #[error("stream does not negotiate nack")]
    NackNotSupported,
    #[error("packet SSRC does not belong to this stream")]
    WrongSsrc,
    #[error("unexpected payload type for this stream")]
    WrongPayloadType,
    #[error("invalid RTX payload")]
    InvalidRtx,
}

/// One encoding of a receiver, or the outgoing stream of a sender.
/// An unset SSRC/RID means "learn it from the first matching packet".
#[derive(Clone, Debug, Default)]
pub struct StreamOption {
    pub ssrc: Option<Ssrc>,
    pub rtx_ssrc: Option<Ssrc>,
    pub rid: String,
    pub cname: String,
    pub dtx: bool,
    pub scalability_mode: String,
    pub max_bitrate_bps: Option<u64>,
}

impl StreamOption {
    pub fn with_ssrc(ssrc: Ssrc) -> Self {
        Self {
            ssrc: Some(ssrc),
            ..Default::default()
        }
    }

    pub fn with_rid(rid: &str) -> Self {
        Self {
            rid: rid.to_string(),
            ..Default::default()
        }
    }
}

/// RFC 3550 appendix A.1 sequence-number bookkeeping for one SSRC.
#[derive(Debug, Default)]
pub(crate) struct SeqTracker {
    started: bool,
    base_seq: SequenceNumber,
    max_seq: SequenceNumber,
    // Counts wraps, in steps of 2^16.
    cycles: u32,
    bad_seq: Option<u32>,
    max_timestamp: RtpTimestamp,
    max_receive_ms: i64,
    packets_received: u64,
    packets_discarded: u64,
}

impl SeqTracker {
    pub fn record(
        &mut self,
        seq: SequenceNumber,
        timestamp: RtpTimestamp,
        receive_ms: i64,
    ) -> Result<(), StreamError> {
        if !self.started {
            self.init_seq(seq);
            self.started = true;
            self.max_timestamp = timestamp;
            self.max_receive_ms = receive_ms;
        } else {
            self.update_seq(seq)?;
        }
        if timestamp > self.max_timestamp {
            self.max_timestamp = timestamp;
            self.max_receive_ms = receive_ms;
        }
        self.packets_received += 1;
        Ok(())
    }

    fn init_seq(&mut self, seq: SequenceNumber) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.bad_seq = None;
        self.cycles = 0;
        self.packets_received = 0;
    }

    fn update_seq(&mut self, seq: SequenceNumber) -> Result<(), StreamError> {
        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
            }
            self.max_seq = seq;
        } else if udelta <= (RTP_SEQ_MOD - MAX_MISORDER as u32) as u16 {
            // A very large jump: resync if it's the sequel to the last one,
            // otherwise remember where a restarted stream would continue.
            if Some(seq as u32) == self.bad_seq {
                self.init_seq(seq);
            } else {
                self.bad_seq = Some((seq.wrapping_add(1)) as u32 & (RTP_SEQ_MOD - 1));
                self.packets_discarded += 1;
                return Err(StreamError::BadSeq);
            }
        } else {
            // Duplicate or old reordered packet: accepted, max_seq stays.
        }
        Ok(())
    }

    /// Sequence-only update for repaired packets: no receive counting, no
    /// timestamp advance. Matches how the repair path is accounted.
    pub fn update_seq_only(&mut self, seq: SequenceNumber) -> Result<(), StreamError> {
        if !self.started {
            self.init_seq(seq);
            self.started = true;
            return Ok(());
        }
        self.update_seq(seq)
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// `cycles + max_seq - base_seq + 1`, the RFC 3550 expected count.
    pub fn expected_packets(&self) -> u64 {
        if !self.started {
            return 0;
        }
        self.cycles
            .wrapping_add(self.max_seq as u32)
            .wrapping_sub(self.base_seq as u32)
            .wrapping_add(1) as u64
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_discarded(&self) -> u64 {
        self.packets_discarded
    }

    /// The extended highest sequence number: cycle count in the upper half.
    pub fn extended_max_seq(&self) -> u32 {
        self.cycles | self.max_seq as u32
    }

    pub fn max_timestamp(&self) -> RtpTimestamp {
        self.max_timestamp
    }

    pub fn max_receive_ms(&self) -> i64 {
        self.max_receive_ms
    }
}

/// Interval loss state carried between successive reception reports.
#[derive(Debug, Default)]
pub(crate) struct LossTracker {
    packets_lost: i64,
    expected_prior: i64,
    received_prior: i64,
    reported_packets_lost: i64,
    fraction_lost: u8,
}

impl LossTracker {
    /// Computes fraction/total lost for this report interval. When in-band
    /// FEC is negotiated the subscriber-side worst fraction wins if larger,
    /// with the total adjusted to stay consistent.
    pub fn update(
        &mut self,
        tracker: &SeqTracker,
        worst_remote_fraction_lost: u8,
    ) -> (u8, u32) {
        let prev_packets_lost = self.packets_lost;
        let expected = tracker.expected_packets() as i64;
        let received = tracker.packets_received() as i64;
        self.packets_lost = (expected - received).max(0);

        let expected_interval = expected - self.expected_prior;
        self.expected_prior = expected;
        let received_interval = received - self.received_prior;
        self.received_prior = received;
        let lost_interval = expected_interval - received_interval;

        self.fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            (((lost_interval << 8) / expected_interval) as u64).min(u8::MAX as u64) as u8
        };

        if worst_remote_fraction_lost <= self.fraction_lost {
            self.reported_packets_lost += self.packets_lost - prev_packets_lost;
            (self.fraction_lost, self.reported_packets_lost.max(0) as u32)
        } else {
            let new_lost_interval =
                ((worst_remote_fraction_lost as i64) * expected_interval) >> 8;
            self.reported_packets_lost += new_lost_interval;
            (
                worst_remote_fraction_lost,
                self.reported_packets_lost.max(0) as u32,
            )
        }
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }
}

/// Byte/packet counters plus windowed bitrate, per stream direction.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub(crate) receive_bps: RateStatistics,
    pub(crate) send_bps: RateStatistics,
}

impl StreamCounters {
    pub fn record_received(&mut self, size_bytes: usize, now_ms: i64) {
        self.packets_received += 1;
        self.bytes_received += size_bytes as u64;
        self.receive_bps.update(size_bytes as i64, now_ms);
    }

    pub fn record_sent(&mut self, size_bytes: usize, now_ms: i64) {
        self.packets_sent += 1;
        self.bytes_sent += size_bytes as u64;
        self.send_bps.update(size_bytes as i64, now_ms);
    }

    pub fn receive_bps(&mut self, now_ms: i64) -> u64 {
        self.receive_bps.rate(now_ms).map(|r| r.as_bps()).unwrap_or(0)
    }

    pub fn send_bps(&mut self, now_ms: i64) -> u64 {
        self.send_bps.rate(now_ms).map(|r| r.as_bps()).unwrap_or(0)
    }
}

/// Configuration and feedback flags shared by receiver and sender streams.
#[derive(Debug)]
pub(crate) struct StreamConfig {
    pub media_type: MediaType,
    pub ssrc: Option<Ssrc>,
    pub rtx_ssrc: Option<Ssrc>,
    pub rid: String,
    pub cname: String,
    pub codec: Codec,
    pub payload_type: PayloadType,
    pub rtx_payload_type: Option<PayloadType>,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub use_in_band_fec: bool,
    pub use_dtx: bool,
}

impl StreamConfig {
    pub fn new(media_type: MediaType, option: &StreamOption, codec: Codec) -> Self {
        let use_in_band_fec =
            codec.parameters.get("useinbandfec").map(String::as_str) == Some("1");
        let use_dtx = option.dtx
            && codec.parameters.get("usedtx").map(String::as_str) == Some("1");
        let use_nack = codec.has_feedback("nack", "");
        let use_pli = codec.has_feedback("nack", "pli");
        let use_fir = codec.has_feedback("ccm", "fir");
        Self {
            media_type,
            ssrc: option.ssrc,
            rtx_ssrc: option.rtx_ssrc,
            rid: option.rid.clone(),
            cname: option.cname.clone(),
            payload_type: codec.payload_type,
            rtx_payload_type: codec.rtx_payload_type,
            codec,
            use_nack,
            use_pli,
            use_fir,
            use_in_band_fec,
            use_dtx,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.codec.clock_rate
    }
}

/// Minimal reception-report state for the RTX SSRC of a receiver stream,
/// reported alongside the media stream's RR.
#[derive(Debug, Default)]
pub(crate) struct RtxTracker {
    pub ssrc: Ssrc,
    seq: SeqTracker,
    loss: LossTracker,
}

impl RtxTracker {
    pub fn new(ssrc: Ssrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn record(
        &mut self,
        seq: SequenceNumber,
        timestamp: RtpTimestamp,
        receive_ms: i64,
    ) -> Result<(), StreamError> {
        self.seq.record(seq, timestamp, receive_ms)
    }

    pub fn receiver_report(&mut self) -> Option<ReceptionReport> {
        if !self.seq.started() {
            return None;
        }
        let (fraction_lost, total_lost) = self.loss.update(&self.seq, 0);
        Some(ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number: self.seq.extended_max_seq(),
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        })
    }
}
