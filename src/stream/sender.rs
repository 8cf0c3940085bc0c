//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One outgoing forwarded stream: sequence/counter tracking, the replay
//! buffer that serves NACKs (raw or RTX-encapsulated), and SR/SDES
//! emission.

use std::collections::{HashMap, VecDeque};

use crate::{
    rtp::{
        ntp_from_unix_ms,
        packet::Packet,
        rtcp::{ReceptionReport, RtcpPacket, SdesChunk, SenderReport},
        PayloadType, RtpTimestamp, SequenceNumber, Ssrc,
    },
    stream::{MediaType, SeqTracker, StreamConfig, StreamCounters, StreamError, StreamOption},
};

// Most recent packets kept for retransmission.
const REPLAY_BUFFER_CAPACITY: usize = 100;

/// Fixed-capacity ring of recently sent packets, indexed by their outgoing
/// sequence number. Eviction is FIFO.
#[derive(Debug, Default)]
pub(crate) struct ReplayBuffer {
    order: VecDeque<SequenceNumber>,
    by_seq: HashMap<SequenceNumber, Packet>,
}

impl ReplayBuffer {
    fn put(&mut self, packet: Packet) {
        let seq = packet.sequence_number();
        if self.by_seq.insert(seq, packet).is_none() {
            if self.order.len() == REPLAY_BUFFER_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.by_seq.remove(&evicted);
                }
            }
            self.order.push_back(seq);
        }
    }

    fn get(&self, seq: SequenceNumber) -> Option<&Packet> {
        self.by_seq.get(&seq)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct SenderStream {
    config: StreamConfig,
    seq: SeqTracker,
    counters: StreamCounters,
    replay: ReplayBuffer,
    rtx_seq: SequenceNumber,
    fraction_lost: u8,
    packets_retransmitted: u64,
}

impl SenderStream {
    pub(crate) fn new(
        media_type: MediaType,
        option: &StreamOption,
        codec: crate::codec::Codec,
    ) -> Self {
        Self {
            config: StreamConfig::new(media_type, option, codec),
            seq: SeqTracker::default(),
            counters: StreamCounters::default(),
            replay: ReplayBuffer::default(),
            rtx_seq: 0,
            fraction_lost: 0,
            packets_retransmitted: 0,
        }
    }

    pub fn ssrc(&self) -> Option<Ssrc> {
        self.config.ssrc
    }

    pub fn rtx_ssrc(&self) -> Option<Ssrc> {
        self.config.rtx_ssrc
    }

    pub fn payload_type(&self) -> PayloadType {
        self.config.payload_type
    }

    pub fn cname(&self) -> &str {
        &self.config.cname
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    pub fn packets_retransmitted(&self) -> u64 {
        self.packets_retransmitted
    }

    /// Highest RTP timestamp sent so far; only meaningful once started.
    pub(crate) fn max_timestamp(&self) -> RtpTimestamp {
        self.seq.max_timestamp()
    }

    pub(crate) fn started(&self) -> bool {
        self.seq.started()
    }

    pub(crate) fn counters_mut(&mut self) -> &mut StreamCounters {
        &mut self.counters
    }

    /// Tracks a packet on its way out and parks a copy for NACK service.
    /// The packet must already carry its outgoing seqnum/SSRC.
    pub(crate) fn receive(&mut self, packet: &Packet) -> Result<(), StreamError> {
        self.seq
            .record(packet.sequence_number(), packet.timestamp(), packet.receive_ms())?;
        self.counters.record_sent(packet.size(), packet.receive_ms());
        if self.config.use_nack {
            self.replay.put(packet.clone());
        }
        Ok(())
    }

    /// Serves a NACK: every requested seqnum still in the replay buffer is
    /// returned ready to send, RTX-encapsulated when RTX is negotiated.
    /// Unknown seqnums are silently skipped.
    pub(crate) fn receive_nack(&mut self, seqnums: &[SequenceNumber]) -> Vec<Packet> {
        if !self.config.use_nack {
            return Vec::new();
        }
        let mut resends = Vec::new();
        for &seq in seqnums {
            let Some(packet) = self.replay.get(seq) else {
                continue;
            };
            let resend = match (self.config.rtx_payload_type, self.config.rtx_ssrc) {
                (Some(rtx_pt), Some(rtx_ssrc)) => {
                    self.rtx_seq = self.rtx_seq.wrapping_add(1);
                    packet.rtx_encode(rtx_pt, rtx_ssrc, self.rtx_seq)
                }
                _ => packet.clone(),
            };
            self.packets_retransmitted += 1;
            resends.push(resend);
        }
        resends
    }

    /// The periodic sender report; None until the first packet went out.
    pub(crate) fn sender_report(&mut self, now_ms: i64) -> Option<RtcpPacket> {
        if self.counters.packets_sent == 0 {
            return None;
        }
        let diff_ms = now_ms - self.seq.max_receive_ms();
        let diff_timestamp = diff_ms * self.config.clock_rate() as i64 / 1000;
        Some(RtcpPacket::SenderReport(SenderReport {
            ssrc: self.config.ssrc.unwrap_or(0),
            ntp: ntp_from_unix_ms(now_ms),
            rtp_timestamp: self
                .seq
                .max_timestamp()
                .wrapping_add(diff_timestamp as u32),
            packet_count: self.counters.packets_sent as u32,
            octet_count: self.counters.bytes_sent as u32,
            reports: vec![],
        }))
    }

    pub(crate) fn sdes_chunk(&self) -> SdesChunk {
        SdesChunk {
            ssrc: self.config.ssrc.unwrap_or(0),
            cname: self.config.cname.clone(),
        }
    }

    pub(crate) fn process_receiver_report(&mut self, report: &ReceptionReport) {
        self.fraction_lost = report.fraction_lost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, RtcpFeedback};

    fn sender_codec(rtx: bool) -> Codec {
        let mut codec = Codec::new("VP8", 96, 90_000);
        codec.feedback.push(RtcpFeedback::new("nack", ""));
        if rtx {
            codec.rtx_payload_type = Some(97);
        }
        codec
    }

    fn sender_stream(rtx: bool) -> SenderStream {
        let mut option = StreamOption::with_ssrc(800_000_100);
        option.cname = "forwarder".to_string();
        if rtx {
            option.rtx_ssrc = Some(800_000_101);
        }
        SenderStream::new(MediaType::Video, &option, sender_codec(rtx))
    }

    fn outgoing_packet(seq: u16, receive_ms: i64) -> Packet {
        Packet::parse(
            Packet::write(false, 96, seq, seq as u32 * 3000, 800_000_100, &[], &[1, 2, 3])
                .marshal(),
            receive_ms,
        )
        .unwrap()
    }

    #[test]
    fn test_replay_buffer_evicts_fifo() {
        let mut stream = sender_stream(false);
        for seq in 0..150u16 {
            stream.receive(&outgoing_packet(seq, seq as i64)).unwrap();
        }
        assert_eq!(REPLAY_BUFFER_CAPACITY, stream.replay.len());
        assert!(stream.replay.get(49).is_none());
        assert!(stream.replay.get(50).is_some());
        assert!(stream.replay.get(149).is_some());
    }

    #[test]
    fn test_nack_resends_raw_without_rtx() {
        let mut stream = sender_stream(false);
        for seq in 1..=5u16 {
            stream.receive(&outgoing_packet(seq, 0)).unwrap();
        }
        let resends = stream.receive_nack(&[3, 4]);
        assert_eq!(2, resends.len());
        assert_eq!(3, resends[0].sequence_number());
        assert_eq!(96, resends[0].payload_type());
        assert!(!resends[0].is_rtx());
        assert_eq!(2, stream.packets_retransmitted());
    }

    #[test]
    fn test_nack_resends_as_rtx() {
        let mut stream = sender_stream(true);
        for seq in 1..=5u16 {
            stream.receive(&outgoing_packet(seq, 0)).unwrap();
        }
        let resends = stream.receive_nack(&[2, 4]);
        assert_eq!(2, resends.len());
        // RTX header fields, monotonic RTX seqnums.
        assert_eq!(97, resends[0].payload_type());
        assert_eq!(800_000_101, resends[0].ssrc());
        assert_eq!(1, resends[0].sequence_number());
        assert_eq!(2, resends[1].sequence_number());
        assert!(resends[0].is_rtx());
        // Original seqnum leads the payload.
        assert_eq!(&[0, 2], &resends[0].payload()[..2]);
    }

    #[test]
    fn test_nack_for_unknown_seq_is_ignored() {
        let mut stream = sender_stream(true);
        stream.receive(&outgoing_packet(1, 0)).unwrap();
        assert!(stream.receive_nack(&[9999]).is_empty());
    }

    #[test]
    fn test_sender_report_projects_timestamp() {
        let mut stream = sender_stream(false);
        assert!(stream.sender_report(1000).is_none());

        // Last packet: timestamp 90_000 at t = 1000.
        let packet = Packet::parse(
            Packet::write(false, 96, 30, 90_000, 800_000_100, &[], &[1, 2, 3]).marshal(),
            1000,
        )
        .unwrap();
        stream.receive(&packet).unwrap();

        match stream.sender_report(2000) {
            Some(RtcpPacket::SenderReport(sr)) => {
                assert_eq!(800_000_100, sr.ssrc);
                // One second later at 90 kHz.
                assert_eq!(90_000 + 90_000, sr.rtp_timestamp);
                assert_eq!(1, sr.packet_count);
                assert_eq!(packet.size() as u32, sr.octet_count);
                assert_eq!(ntp_from_unix_ms(2000), sr.ntp);
            }
            other => panic!("expected sender report, got {:?}", other),
        }
    }

    #[test]
    fn test_sdes_and_rr_intake() {
        let mut stream = sender_stream(false);
        let chunk = stream.sdes_chunk();
        assert_eq!(800_000_100, chunk.ssrc);
        assert_eq!("forwarder", chunk.cname);

        stream.process_receiver_report(&ReceptionReport {
            ssrc: 800_000_100,
            fraction_lost: 77,
            ..Default::default()
        });
        assert_eq!(77, stream.fraction_lost());
    }
}
