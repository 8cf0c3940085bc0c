//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RTCP parsing and serialization: SR/RR/SDES on the regular schedule,
//! NACK/PLI/FIR/REMB as feedback. Compound framing per RFC 3550; payload
//! formats per RFC 3550/4585/5104 and the REMB draft.

use byteorder::{ReadBytesExt, BE};
use log::*;
use thiserror::Error;

use crate::{
    common::{parse_u16, parse_u24, parse_u32, parse_u64, round_up_to_multiple_of, Bits,
        CheckedSplitAt, Writer},
    rtp::{SequenceNumber, Ssrc, VERSION},
};

const RTCP_HEADER_LEN: usize = 4;
const RTCP_TYPE_SENDER_REPORT: u8 = 200;
const RTCP_TYPE_RECEIVER_REPORT: u8 = 201;
const RTCP_TYPE_SDES: u8 = 202;
const RTCP_TYPE_BYE: u8 = 203;
const RTCP_TYPE_GENERIC_FEEDBACK: u8 = 205;
const RTCP_TYPE_SPECIFIC_FEEDBACK: u8 = 206;
const RTCP_FORMAT_NACK: u8 = 1;
const RTCP_FORMAT_PLI: u8 = 1;
const RTCP_FORMAT_FIR: u8 = 4;
const RTCP_FORMAT_APPLICATION_LAYER_FEEDBACK: u8 = 15;
const SDES_ITEM_CNAME: u8 = 1;
const REMB_IDENTIFIER: &[u8; 4] = b"REMB";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtcpError {
    #[error("RTCP packet truncated")]
    Truncated,
    #[error("malformed RTCP payload")]
    Malformed,
}

/// One report block of an SR/RR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: Ssrc,
    pub fraction_lost: u8,
    pub total_lost: u32,
    pub last_sequence_number: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay: u32,
}

impl ReceptionReport {
    const LEN: usize = 24;

    fn parse(bytes: &[u8]) -> Result<Self, RtcpError> {
        if bytes.len() < Self::LEN {
            return Err(RtcpError::Truncated);
        }
        Ok(Self {
            ssrc: parse_u32(&bytes[0..4]),
            fraction_lost: bytes[4],
            total_lost: parse_u24(&bytes[5..8]),
            last_sequence_number: parse_u32(&bytes[8..12]),
            jitter: parse_u32(&bytes[12..16]),
            last_sender_report: parse_u32(&bytes[16..20]),
            delay: parse_u32(&bytes[20..24]),
        })
    }

    fn writer(&self) -> impl Writer {
        (
            self.ssrc,
            [
                self.fraction_lost,
                (self.total_lost >> 16) as u8,
                (self.total_lost >> 8) as u8,
                self.total_lost as u8,
            ],
            self.last_sequence_number,
            self.jitter,
            (self.last_sender_report, self.delay),
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: Ssrc,
    pub ntp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: Ssrc,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: Ssrc,
    pub cname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

/// Parsed NACK with the run-length FCI pairs expanded to plain seqnums.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportLayerNack {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub seqnums: Vec<SequenceNumber>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureLossIndication {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: Ssrc,
    pub sequence_number: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FullIntraRequest {
    pub sender_ssrc: Ssrc,
    pub media_ssrc: Ssrc,
    pub entries: Vec<FirEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverEstimatedMaximumBitrate {
    pub sender_ssrc: Ssrc,
    pub bitrate_bps: u64,
    pub ssrcs: Vec<Ssrc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Goodbye {
    pub ssrcs: Vec<Ssrc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Nack(TransportLayerNack),
    Pli(PictureLossIndication),
    Fir(FullIntraRequest),
    Remb(ReceiverEstimatedMaximumBitrate),
    Bye(Goodbye),
}

impl RtcpPacket {
    /// Parses a compound packet. Unknown or unparseable inner packets are
    /// skipped with a warning; only structural truncation is an error.
    pub fn parse_compound(bytes: &[u8]) -> Result<Vec<RtcpPacket>, RtcpError> {
        let mut packets = Vec::new();
        let mut rest = bytes;
        while rest.len() >= RTCP_HEADER_LEN {
            let (header, after_header) = rest.checked_split_at(RTCP_HEADER_LEN).unwrap();
            if (header[0] >> 6) != VERSION {
                return Err(RtcpError::Malformed);
            }
            let count_or_format = header[0] & 0b0001_1111;
            let pt = header[1];
            let body_len = parse_u16(&header[2..4]) as usize * 4;
            let (body, after_body) = after_header
                .checked_split_at(body_len)
                .ok_or(RtcpError::Truncated)?;
            rest = after_body;

            let parsed = match (pt, count_or_format) {
                (RTCP_TYPE_SENDER_REPORT, count) => parse_sender_report(body, count),
                (RTCP_TYPE_RECEIVER_REPORT, count) => parse_receiver_report(body, count),
                (RTCP_TYPE_SDES, count) => parse_sdes(body, count),
                (RTCP_TYPE_BYE, count) => parse_bye(body, count),
                (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_NACK) => parse_nack(body),
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_PLI) => parse_pli(body),
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_FIR) => parse_fir(body),
                (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_APPLICATION_LAYER_FEEDBACK) => {
                    parse_remb(body)
                }
                _ => {
                    debug!("ignoring RTCP packet: pt = {}, format = {}", pt, count_or_format);
                    continue;
                }
            };
            match parsed {
                Ok(packet) => packets.push(packet),
                Err(err) => warn!("failed to parse RTCP pt {}: {}", pt, err),
            }
        }
        Ok(packets)
    }

    /// Serializes packets back to back; each is individually padded to a
    /// word boundary so the result is a valid compound packet.
    pub fn write_compound(packets: &[RtcpPacket]) -> Vec<u8> {
        let mut out = Vec::new();
        for packet in packets {
            packet.write(&mut out);
        }
        out
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            RtcpPacket::SenderReport(sr) => write_rtcp(
                RTCP_TYPE_SENDER_REPORT,
                sr.reports.len() as u8,
                &(
                    sr.ssrc,
                    sr.ntp,
                    sr.rtp_timestamp,
                    (sr.packet_count, sr.octet_count),
                    sr.reports.iter().map(|r| r.writer().to_vec()).collect::<Vec<_>>(),
                ),
                out,
            ),
            RtcpPacket::ReceiverReport(rr) => write_rtcp(
                RTCP_TYPE_RECEIVER_REPORT,
                rr.reports.len() as u8,
                &(
                    rr.ssrc,
                    rr.reports.iter().map(|r| r.writer().to_vec()).collect::<Vec<_>>(),
                ),
                out,
            ),
            RtcpPacket::SourceDescription(sdes) => {
                let chunks: Vec<Vec<u8>> = sdes
                    .chunks
                    .iter()
                    .map(|chunk| {
                        let cname = chunk.cname.as_bytes();
                        let mut body = (
                            chunk.ssrc,
                            [SDES_ITEM_CNAME, cname.len() as u8],
                            cname,
                        )
                            .to_vec();
                        // Item list terminator, then pad the chunk to a word.
                        body.push(0);
                        body.resize(round_up_to_multiple_of::<4>(body.len()), 0);
                        body
                    })
                    .collect();
                write_rtcp(RTCP_TYPE_SDES, sdes.chunks.len() as u8, &chunks, out)
            }
            RtcpPacket::Nack(nack) => write_rtcp(
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_NACK,
                &(
                    nack.sender_ssrc,
                    nack.media_ssrc,
                    nack_fci(&nack.seqnums),
                ),
                out,
            ),
            RtcpPacket::Pli(pli) => write_rtcp(
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_PLI,
                &(pli.sender_ssrc, pli.media_ssrc),
                out,
            ),
            RtcpPacket::Fir(fir) => write_rtcp(
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_FIR,
                &(
                    fir.sender_ssrc,
                    fir.media_ssrc,
                    fir.entries
                        .iter()
                        .map(|entry| {
                            (entry.ssrc, [entry.sequence_number, 0, 0, 0]).to_vec()
                        })
                        .collect::<Vec<_>>(),
                ),
                out,
            ),
            RtcpPacket::Remb(remb) => {
                let (exponent, mantissa) = remb_exponent_mantissa(remb.bitrate_bps);
                write_rtcp(
                    RTCP_TYPE_SPECIFIC_FEEDBACK,
                    RTCP_FORMAT_APPLICATION_LAYER_FEEDBACK,
                    &(
                        remb.sender_ssrc,
                        0u32, // media SSRC is always zero for REMB
                        *REMB_IDENTIFIER,
                        [
                            remb.ssrcs.len() as u8,
                            (exponent << 2) | ((mantissa >> 16) as u8 & 0b11),
                            (mantissa >> 8) as u8,
                            mantissa as u8,
                        ],
                        remb.ssrcs.clone(),
                    ),
                    out,
                )
            }
            RtcpPacket::Bye(bye) => {
                write_rtcp(RTCP_TYPE_BYE, bye.ssrcs.len() as u8, &bye.ssrcs, out)
            }
        }
    }
}

fn write_rtcp(pt: u8, count_or_format: u8, body: &impl Writer, out: &mut Vec<u8>) {
    let body_len = body.written_len();
    let padded_len = round_up_to_multiple_of::<4>(body_len);
    out.reserve(RTCP_HEADER_LEN + padded_len);
    out.push((VERSION << 6) | (count_or_format & 0b0001_1111));
    out.push(pt);
    out.extend_from_slice(&((padded_len / 4) as u16).to_be_bytes());
    body.write(out);
    out.resize(out.len() + (padded_len - body_len), 0);
}

fn parse_sender_report(body: &[u8], count: u8) -> Result<RtcpPacket, RtcpError> {
    if body.len() < 24 + count as usize * ReceptionReport::LEN {
        return Err(RtcpError::Truncated);
    }
    let mut reports = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        reports.push(ReceptionReport::parse(&body[24 + i * ReceptionReport::LEN..])?);
    }
    Ok(RtcpPacket::SenderReport(SenderReport {
        ssrc: parse_u32(&body[0..4]),
        ntp: parse_u64(&body[4..12]),
        rtp_timestamp: parse_u32(&body[12..16]),
        packet_count: parse_u32(&body[16..20]),
        octet_count: parse_u32(&body[20..24]),
        reports,
    }))
}

fn parse_receiver_report(body: &[u8], count: u8) -> Result<RtcpPacket, RtcpError> {
    if body.len() < 4 + count as usize * ReceptionReport::LEN {
        return Err(RtcpError::Truncated);
    }
    let mut reports = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        reports.push(ReceptionReport::parse(&body[4 + i * ReceptionReport::LEN..])?);
    }
    Ok(RtcpPacket::ReceiverReport(ReceiverReport {
        ssrc: parse_u32(&body[0..4]),
        reports,
    }))
}

fn parse_sdes(body: &[u8], count: u8) -> Result<RtcpPacket, RtcpError> {
    let mut chunks = Vec::with_capacity(count as usize);
    let mut rest = body;
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(RtcpError::Truncated);
        }
        let ssrc = parse_u32(&rest[0..4]);
        rest = &rest[4..];
        let mut cname = String::new();
        let mut consumed = 0;
        while consumed < rest.len() {
            let item_type = rest[consumed];
            if item_type == 0 {
                consumed += 1;
                // The item list is null-terminated then padded to a word.
                consumed = round_up_to_multiple_of::<4>(consumed);
                break;
            }
            if rest.len() < consumed + 2 {
                return Err(RtcpError::Truncated);
            }
            let len = rest[consumed + 1] as usize;
            if rest.len() < consumed + 2 + len {
                return Err(RtcpError::Truncated);
            }
            if item_type == SDES_ITEM_CNAME {
                cname = String::from_utf8_lossy(&rest[consumed + 2..consumed + 2 + len])
                    .to_string();
            }
            consumed += 2 + len;
        }
        rest = &rest[consumed.min(rest.len())..];
        chunks.push(SdesChunk { ssrc, cname });
    }
    Ok(RtcpPacket::SourceDescription(SourceDescription { chunks }))
}

fn parse_bye(body: &[u8], count: u8) -> Result<RtcpPacket, RtcpError> {
    if body.len() < count as usize * 4 {
        return Err(RtcpError::Truncated);
    }
    let ssrcs = (0..count as usize)
        .map(|i| parse_u32(&body[i * 4..]))
        .collect();
    Ok(RtcpPacket::Bye(Goodbye { ssrcs }))
}

fn parse_nack(body: &[u8]) -> Result<RtcpPacket, RtcpError> {
    let mut reader = body;
    let sender_ssrc = reader.read_u32::<BE>().map_err(|_| RtcpError::Truncated)?;
    let media_ssrc = reader.read_u32::<BE>().map_err(|_| RtcpError::Truncated)?;
    let mut seqnums = Vec::new();
    while !reader.is_empty() {
        let first_seqnum = reader.read_u16::<BE>().map_err(|_| RtcpError::Truncated)?;
        let mask = reader.read_u16::<BE>().map_err(|_| RtcpError::Truncated)?;
        seqnums.push(first_seqnum);
        for index in 0..16u16 {
            if mask.ls_bit(index as u8) {
                seqnums.push(first_seqnum.wrapping_add(index + 1));
            }
        }
    }
    Ok(RtcpPacket::Nack(TransportLayerNack {
        sender_ssrc,
        media_ssrc,
        seqnums,
    }))
}

/// Packs ascending seqnums into (pid, bitmask) FCI pairs. Out-of-order
/// input still encodes correctly, just less compactly.
fn nack_fci(seqnums: &[SequenceNumber]) -> Vec<(u16, u16)> {
    let mut items: Vec<(u16, u16)> = Vec::new();
    let mut seqnums = seqnums.iter().copied();
    if let Some(mut first_seqnum) = seqnums.next() {
        let mut mask = 0u16;
        for seqnum in seqnums {
            let diff = seqnum.wrapping_sub(first_seqnum);
            if (1..=16).contains(&diff) {
                mask = mask.set_ls_bit((diff - 1) as u8);
            } else {
                items.push((first_seqnum, mask));
                first_seqnum = seqnum;
                mask = 0;
            }
        }
        items.push((first_seqnum, mask));
    }
    items
}

fn parse_pli(body: &[u8]) -> Result<RtcpPacket, RtcpError> {
    if body.len() < 8 {
        return Err(RtcpError::Truncated);
    }
    Ok(RtcpPacket::Pli(PictureLossIndication {
        sender_ssrc: parse_u32(&body[0..4]),
        media_ssrc: parse_u32(&body[4..8]),
    }))
}

fn parse_fir(body: &[u8]) -> Result<RtcpPacket, RtcpError> {
    if body.len() < 8 || (body.len() - 8) % 8 != 0 {
        return Err(RtcpError::Truncated);
    }
    let entries = body[8..]
        .chunks_exact(8)
        .map(|chunk| FirEntry {
            ssrc: parse_u32(&chunk[0..4]),
            sequence_number: chunk[4],
        })
        .collect();
    Ok(RtcpPacket::Fir(FullIntraRequest {
        sender_ssrc: parse_u32(&body[0..4]),
        media_ssrc: parse_u32(&body[4..8]),
        entries,
    }))
}

fn parse_remb(body: &[u8]) -> Result<RtcpPacket, RtcpError> {
    if body.len() < 16 || &body[8..12] != REMB_IDENTIFIER {
        return Err(RtcpError::Malformed);
    }
    let num_ssrcs = body[12] as usize;
    let exponent = body[13] >> 2;
    let mantissa =
        (((body[13] & 0b11) as u64) << 16) | ((body[14] as u64) << 8) | body[15] as u64;
    if body.len() < 16 + num_ssrcs * 4 {
        return Err(RtcpError::Truncated);
    }
    let ssrcs = (0..num_ssrcs)
        .map(|i| parse_u32(&body[16 + i * 4..]))
        .collect();
    Ok(RtcpPacket::Remb(ReceiverEstimatedMaximumBitrate {
        sender_ssrc: parse_u32(&body[0..4]),
        bitrate_bps: mantissa << exponent,
        ssrcs,
    }))
}

fn remb_exponent_mantissa(bitrate_bps: u64) -> (u8, u32) {
    let mut exponent = 0u8;
    let mut mantissa = bitrate_bps;
    while mantissa >= (1 << 18) {
        mantissa >>= 1;
        exponent += 1;
    }
    (exponent, mantissa as u32)
}
