//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One incoming encoded stream: sequence/jitter/loss tracking, RTX repair
//! intake, reception reports, keyframe demand, and NACK feedback.

use log::*;

use crate::{
    codec,
    rtp::{
        nack::{NackReceiver, NackSignal},
        ntp_middle_32, ntp_to_ms,
        packet::Packet,
        rtcp::{
            FirEntry, FullIntraRequest, PictureLossIndication, ReceptionReport, RtcpPacket,
            SenderReport, TransportLayerNack,
        },
        PayloadType, RtpTimestamp, Ssrc,
    },
    stream::{
        LossTracker, MediaType, RtxTracker, SeqTracker, StreamConfig, StreamCounters,
        StreamError, StreamOption,
    },
};

// How long with no packets before a stream is considered idle.
const INACTIVITY_INTERVAL_MS: i64 = 1500;
const INACTIVITY_INTERVAL_DTX_MS: i64 = 5000;

// Jitter deltas at least this large are clock artifacts, not jitter.
const MAX_JITTER_DELTA: i32 = 450_000;

pub struct ReceiverStream {
    config: StreamConfig,
    seq: SeqTracker,
    loss: LossTracker,
    counters: StreamCounters,
    rtx: Option<RtxTracker>,
    nack: Option<NackReceiver>,

    pli_count: u64,
    fir_count: u64,
    fir_seq: u8,
    nack_count: u64,
    nack_packet_count: u64,
    video_frame_count: u64,

    last_sr_ntp: u64,
    last_sr_ntp_ms: u64,
    last_sr_rtp_timestamp: RtpTimestamp,
    last_sr_received_ms: i64,

    jitter: i32,
    last_receive_ms: i64,
    last_receive_timestamp: RtpTimestamp,

    inactive: bool,
    last_activity_ms: i64,
}

impl ReceiverStream {
    pub(crate) fn new(
        media_type: MediaType,
        option: &StreamOption,
        codec: crate::codec::Codec,
    ) -> Self {
        let config = StreamConfig::new(media_type, option, codec);
        let nack = config.use_nack.then(NackReceiver::new);
        let rtx = config.rtx_ssrc.map(RtxTracker::new);
        Self {
            config,
            seq: SeqTracker::default(),
            loss: LossTracker::default(),
            counters: StreamCounters::default(),
            rtx,
            nack,
            pli_count: 0,
            fir_count: 0,
            fir_seq: 0,
            nack_count: 0,
            nack_packet_count: 0,
            video_frame_count: 0,
            last_sr_ntp: 0,
            last_sr_ntp_ms: 0,
            last_sr_rtp_timestamp: 0,
            last_sr_received_ms: 0,
            jitter: 0,
            last_receive_ms: 0,
            last_receive_timestamp: 0,
            inactive: false,
            last_activity_ms: 0,
        }
    }

    pub fn ssrc(&self) -> Option<Ssrc> {
        self.config.ssrc
    }

    pub fn rtx_ssrc(&self) -> Option<Ssrc> {
        self.config.rtx_ssrc
    }

    pub fn rid(&self) -> &str {
        &self.config.rid
    }

    pub fn cname(&self) -> &str {
        &self.config.cname
    }

    pub fn payload_type(&self) -> PayloadType {
        self.config.payload_type
    }

    pub fn rtx_payload_type(&self) -> Option<PayloadType> {
        self.config.rtx_payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.config.clock_rate()
    }

    pub fn use_dtx(&self) -> bool {
        self.config.use_dtx
    }

    pub(crate) fn update_ssrc(&mut self, ssrc: Ssrc) {
        self.config.ssrc = Some(ssrc);
    }

    pub(crate) fn update_rtx_ssrc(&mut self, ssrc: Ssrc) {
        self.config.rtx_ssrc = Some(ssrc);
        if self.rtx.is_none() {
            self.rtx = Some(RtxTracker::new(ssrc));
        }
    }

    pub(crate) fn set_rtx(&mut self, payload_type: PayloadType, ssrc: Option<Ssrc>) {
        self.config.rtx_payload_type = Some(payload_type);
        if let Some(ssrc) = ssrc {
            self.update_rtx_ssrc(ssrc);
        }
    }

    pub fn max_packet_timestamp(&self) -> RtpTimestamp {
        self.seq.max_timestamp()
    }

    pub fn max_packet_receive_ms(&self) -> i64 {
        self.seq.max_receive_ms()
    }

    pub fn fraction_lost(&self) -> u8 {
        self.loss.fraction_lost()
    }

    pub fn jitter(&self) -> u32 {
        self.jitter.max(0) as u32
    }

    pub fn video_frame_count(&self) -> u64 {
        self.video_frame_count
    }

    pub fn pli_count(&self) -> u64 {
        self.pli_count
    }

    pub fn fir_count(&self) -> u64 {
        self.fir_count
    }

    /// NACK packets emitted, and the total seqnums they carried.
    pub fn nack_counts(&self) -> (u64, u64) {
        (self.nack_count, self.nack_packet_count)
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive
    }

    pub(crate) fn counters_mut(&mut self) -> &mut StreamCounters {
        &mut self.counters
    }

    /// Time of the last sender report, as milliseconds since the NTP
    /// epoch; 0 until the first SR arrives.
    pub fn last_sr_ntp_ms(&self) -> u64 {
        self.last_sr_ntp_ms
    }

    pub fn last_sr_rtp_timestamp(&self) -> RtpTimestamp {
        self.last_sr_rtp_timestamp
    }

    /// Ingests a media packet. Returns any RTCP feedback (NACK batches, or
    /// a keyframe demand when the loss backlog overflowed) to emit now.
    pub(crate) fn receive(&mut self, packet: &mut Packet) -> Result<Vec<RtcpPacket>, StreamError> {
        self.seq
            .record(packet.sequence_number(), packet.timestamp(), packet.receive_ms())?;

        if packet.payload_type() == self.config.payload_type {
            packet.set_key_frame(codec::is_key_frame(
                &self.config.codec.encoder_name,
                packet.payload(),
            ));
        }
        if self.config.media_type == MediaType::Video && packet.marker() {
            self.video_frame_count += 1;
        }

        self.update_jitter(packet.timestamp(), packet.receive_ms());
        self.counters.record_received(packet.size(), packet.receive_ms());
        self.touch(packet.receive_ms());

        let mut feedback = Vec::new();
        if let Some(nack) = &mut self.nack {
            match nack.on_packet(
                packet.sequence_number(),
                packet.is_key_frame(),
                false,
                packet.receive_ms(),
            ) {
                Some(NackSignal::Nacks(seqnums)) => {
                    self.nack_count += 1;
                    self.nack_packet_count += seqnums.len() as u64;
                    feedback.push(RtcpPacket::Nack(TransportLayerNack {
                        sender_ssrc: 0,
                        media_ssrc: self.config.ssrc.unwrap_or(0),
                        seqnums,
                    }));
                }
                Some(NackSignal::KeyFrameNeeded) => {
                    feedback.extend(self.request_key_frame());
                }
                None => {}
            }
        }
        Ok(feedback)
    }

    /// Ingests an RTX repair packet: validates it against the negotiated
    /// repair stream, then decapsulates it into its media form in place.
    pub(crate) fn receive_rtx(
        &mut self,
        packet: &mut Packet,
    ) -> Result<Vec<RtcpPacket>, StreamError> {
        if !self.config.use_nack {
            return Err(StreamError::NackNotSupported);
        }
        if Some(packet.ssrc()) != self.config.rtx_ssrc {
            return Err(StreamError::WrongSsrc);
        }
        if Some(packet.payload_type()) != self.config.rtx_payload_type {
            return Err(StreamError::WrongPayloadType);
        }
        if let Some(rtx) = &mut self.rtx {
            rtx.record(packet.sequence_number(), packet.timestamp(), packet.receive_ms())?;
        }

        let media_pt = self.config.payload_type;
        let media_ssrc = self.config.ssrc.unwrap_or(0);
        packet
            .rtx_decode(media_pt, media_ssrc)
            .map_err(|_| StreamError::InvalidRtx)?;
        self.seq.update_seq_only(packet.sequence_number())?;

        if packet.payload_type() == self.config.payload_type {
            packet.set_key_frame(codec::is_key_frame(
                &self.config.codec.encoder_name,
                packet.payload(),
            ));
        }
        self.touch(packet.receive_ms());

        let mut feedback = Vec::new();
        if let Some(nack) = &mut self.nack {
            match nack.on_packet(
                packet.sequence_number(),
                packet.is_key_frame(),
                true,
                packet.receive_ms(),
            ) {
                Some(NackSignal::Nacks(seqnums)) => {
                    self.nack_count += 1;
                    self.nack_packet_count += seqnums.len() as u64;
                    feedback.push(RtcpPacket::Nack(TransportLayerNack {
                        sender_ssrc: 0,
                        media_ssrc: self.config.ssrc.unwrap_or(0),
                        seqnums,
                    }));
                }
                Some(NackSignal::KeyFrameNeeded) => {
                    feedback.extend(self.request_key_frame());
                }
                None => {}
            }
        }
        Ok(feedback)
    }

    /// Periodic NACK retry pass (40 ms cadence).
    pub(crate) fn tick_nack(&mut self, now_ms: i64) -> Option<RtcpPacket> {
        let nack = self.nack.as_mut()?;
        let seqnums = nack.tick(now_ms)?;
        self.nack_count += 1;
        self.nack_packet_count += seqnums.len() as u64;
        Some(RtcpPacket::Nack(TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: self.config.ssrc.unwrap_or(0),
            seqnums,
        }))
    }

    pub(crate) fn set_rtt(&mut self, rtt_ms: i64) {
        if let Some(nack) = &mut self.nack {
            nack.set_rtt(rtt_ms);
        }
    }

    /// Emits PLI when negotiated, else FIR, else nothing.
    pub(crate) fn request_key_frame(&mut self) -> Option<RtcpPacket> {
        let media_ssrc = self.config.ssrc.unwrap_or(0);
        if self.config.use_pli {
            self.pli_count += 1;
            Some(RtcpPacket::Pli(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            }))
        } else if self.config.use_fir {
            self.fir_seq = self.fir_seq.wrapping_add(1);
            self.fir_count += 1;
            Some(RtcpPacket::Fir(FullIntraRequest {
                sender_ssrc: 0,
                media_ssrc,
                entries: vec![FirEntry {
                    ssrc: media_ssrc,
                    sequence_number: self.fir_seq,
                }],
            }))
        } else {
            None
        }
    }

    /// Records an incoming sender report. Returns true when it's the first
    /// one for this stream (simulcast layer switching waits on that).
    pub(crate) fn process_sender_report(&mut self, sr: &SenderReport, now_ms: i64) -> bool {
        let first = self.last_sr_ntp == 0;
        self.last_sr_ntp = sr.ntp;
        self.last_sr_ntp_ms = ntp_to_ms(sr.ntp);
        self.last_sr_rtp_timestamp = sr.rtp_timestamp;
        self.last_sr_received_ms = now_ms;
        first
    }

    /// The reception report for this interval, or None before any packet.
    pub(crate) fn rtcp_receiver_report(
        &mut self,
        now_ms: i64,
        worst_remote_fraction_lost: u8,
    ) -> Option<ReceptionReport> {
        if !self.seq.started() {
            return None;
        }
        let worst = if self.config.use_in_band_fec {
            worst_remote_fraction_lost
        } else {
            0
        };
        let (fraction_lost, total_lost) = self.loss.update(&self.seq, worst);
        let mut report = ReceptionReport {
            ssrc: self.config.ssrc.unwrap_or(0),
            fraction_lost,
            total_lost,
            last_sequence_number: self.seq.extended_max_seq(),
            jitter: self.jitter(),
            last_sender_report: 0,
            delay: 0,
        };
        if self.last_sr_received_ms != 0 {
            let delay_ms = now_ms - self.last_sr_received_ms;
            report.delay = ((delay_ms * 65536) / 1000).max(0) as u32;
            report.last_sender_report = ntp_middle_32(self.last_sr_ntp);
        }
        Some(report)
    }

    /// The companion report for the RTX SSRC, when one is receiving.
    pub(crate) fn rtx_receiver_report(&mut self) -> Option<ReceptionReport> {
        self.rtx.as_mut()?.receiver_report()
    }

    /// Inactivity check on the 200 ms tick; true on the transition to idle.
    pub(crate) fn check_inactive(&mut self, now_ms: i64) -> bool {
        if !self.seq.started() || self.inactive {
            return false;
        }
        let interval = if self.config.use_dtx {
            INACTIVITY_INTERVAL_DTX_MS
        } else {
            INACTIVITY_INTERVAL_MS
        };
        if now_ms - self.last_activity_ms >= interval {
            self.inactive = true;
            debug!(
                "stream ssrc {:?} idle after {} ms",
                self.config.ssrc, interval
            );
            return true;
        }
        false
    }

    fn touch(&mut self, now_ms: i64) {
        self.inactive = false;
        self.last_activity_ms = now_ms;
    }

    fn update_jitter(&mut self, timestamp: RtpTimestamp, now_ms: i64) {
        let clock_rate = self.config.clock_rate();
        if clock_rate == 0 {
            return;
        }
        if self.last_receive_ms == 0 {
            self.last_receive_timestamp = timestamp;
            self.last_receive_ms = now_ms;
            return;
        }
        let diff_ms = now_ms - self.last_receive_ms;
        let receive_diff_rtp = (diff_ms as u32).wrapping_mul(clock_rate) / 1000;
        let sender_diff_rtp = timestamp.wrapping_sub(self.last_receive_timestamp) as i32;
        let diff_samples = (receive_diff_rtp as i32).wrapping_sub(sender_diff_rtp).abs();
        if diff_samples < MAX_JITTER_DELTA {
            self.jitter += (diff_samples - self.jitter) / 16;
        }
        self.last_receive_ms = now_ms;
        self.last_receive_timestamp = timestamp;
    }
}
