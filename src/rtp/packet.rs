//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A parsed view over a single RTP datagram. The serialized bytes are kept
//! alongside the parsed fields and all mutators write through, so marshal
//! is free and a forwarded packet is byte-exact except for what a sender
//! deliberately rewrote.

use std::{collections::HashMap, ops::Range};

use log::*;
use thiserror::Error;

use crate::{
    common::{parse_u16, parse_u24, parse_u32, round_up_to_multiple_of, CheckedSplitAt},
    rtp::{HeaderExtensionIds, PayloadType, RtpTimestamp, SequenceNumber, Ssrc, VERSION},
};

const RTP_MIN_HEADER_LEN: usize = 12;
const RTP_PAYLOAD_TYPE_OFFSET: usize = 1;
const RTP_SEQNUM_RANGE: Range<usize> = 2..4;
const RTP_TIMESTAMP_RANGE: Range<usize> = 4..8;
const RTP_SSRC_RANGE: Range<usize> = 8..12;
const RTP_EXTENSIONS_HEADER_LEN: usize = 4;
const RTP_ONE_BYTE_EXTENSIONS_PROFILE: u16 = 0xBEDE;
// In the one-byte form, ID 15 tells the receiver to stop scanning.
const RTP_EXTENSION_ID_STOP: u8 = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("declared CSRC/extension sizes overflow the packet")]
    TruncatedHeader,
    #[error("unsupported header extension profile 0x{0:x}")]
    UnsupportedExtensionProfile(u16),
    #[error("padding length {0} exceeds the payload")]
    BadPadding(u8),
    #[error("RTX payload too short to carry the original seqnum")]
    RtxPayloadTooShort,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ExtensionEntry {
    id: u8,
    // Value bytes, relative to `serialized`.
    range: Range<usize>,
}

/// A parsed RTP datagram.
///
/// Created at the transport boundary after SRTP decrypt; mutated by the
/// receiver (extension-ID mapping install, RTX decapsulation) and by each
/// sender on a clone of its own (SSRC/PT/seqnum/timestamp rewrite).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    marker: bool,
    payload_type: PayloadType,
    seqnum: SequenceNumber,
    timestamp: RtpTimestamp,
    ssrc: Ssrc,
    receive_ms: i64,
    is_rtx: bool,
    is_key_frame: bool,
    extension_ids: HeaderExtensionIds,
    extensions: Vec<ExtensionEntry>,
    // Where the extension block starts (or would start): 12 + 4 * CSRCs.
    extensions_start: usize,
    payload_range: Range<usize>,
    serialized: Vec<u8>,
}

impl Packet {
    pub fn parse(bytes: &[u8], receive_ms: i64) -> Result<Self, PacketError> {
        if bytes.len() < RTP_MIN_HEADER_LEN {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let (main_header, after_main) = bytes
            .checked_split_at(RTP_MIN_HEADER_LEN)
            .ok_or(PacketError::TooShort(bytes.len()))?;

        let has_padding = (main_header[0] & 0b0010_0000) != 0;
        let has_extensions = (main_header[0] & 0b0001_0000) != 0;
        let csrc_count = (main_header[0] & 0b0000_1111) as usize;
        let marker = (main_header[RTP_PAYLOAD_TYPE_OFFSET] & 0b1000_0000) != 0;
        let payload_type = main_header[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111;
        let seqnum = parse_u16(&main_header[RTP_SEQNUM_RANGE]);
        let timestamp = parse_u32(&main_header[RTP_TIMESTAMP_RANGE]);
        let ssrc = parse_u32(&main_header[RTP_SSRC_RANGE]);

        let csrcs_len = 4 * csrc_count;
        let (_csrcs, after_csrcs) = after_main
            .checked_split_at(csrcs_len)
            .ok_or(PacketError::TruncatedHeader)?;

        let extensions_start = RTP_MIN_HEADER_LEN + csrcs_len;
        let mut extensions = Vec::new();
        let mut payload_start = extensions_start;
        if has_extensions {
            let (extensions_header, after_extensions_header) = after_csrcs
                .checked_split_at(RTP_EXTENSIONS_HEADER_LEN)
                .ok_or(PacketError::TruncatedHeader)?;
            let profile = parse_u16(&extensions_header[0..2]);
            let extensions_len = (parse_u16(&extensions_header[2..4]) as usize) * 4;
            if profile != RTP_ONE_BYTE_EXTENSIONS_PROFILE {
                // Two-byte headers are only needed for values of length 0
                // or > 16; no negotiated extension uses them.
                warn!("Invalid RTP: not one-byte extensions; profile = 0x{:x}", profile);
                return Err(PacketError::UnsupportedExtensionProfile(profile));
            }
            let (extension_block, _after_block) = after_extensions_header
                .checked_split_at(extensions_len)
                .ok_or(PacketError::TruncatedHeader)?;

            let block_start = extensions_start + RTP_EXTENSIONS_HEADER_LEN;
            let mut offset = 0;
            while offset < extension_block.len() {
                let header_byte = extension_block[offset];
                let id = header_byte >> 4;
                if id == 0 {
                    // Inter-extension padding byte.
                    offset += 1;
                    continue;
                }
                if id == RTP_EXTENSION_ID_STOP {
                    break;
                }
                let len = ((header_byte & 0x0F) as usize) + 1;
                if extension_block.len() < offset + 1 + len {
                    warn!("Invalid RTP: extension {} truncated", id);
                    return Err(PacketError::TruncatedHeader);
                }
                let value_start = block_start + offset + 1;
                extensions.push(ExtensionEntry {
                    id,
                    range: value_start..value_start + len,
                });
                offset += 1 + len;
            }
            payload_start = block_start + extensions_len;
        }

        let mut payload_end = bytes.len();
        if has_padding {
            let padding_len = bytes[bytes.len() - 1];
            if padding_len as usize > payload_end - payload_start || padding_len == 0 {
                return Err(PacketError::BadPadding(padding_len));
            }
            payload_end -= padding_len as usize;
        }

        Ok(Self {
            marker,
            payload_type,
            seqnum,
            timestamp,
            ssrc,
            receive_ms,
            is_rtx: false,
            is_key_frame: false,
            extension_ids: HeaderExtensionIds::default(),
            extensions,
            extensions_start,
            payload_range: payload_start..payload_end,
            serialized: bytes.to_vec(),
        })
    }

    /// Writes a fresh packet. Used by the RTX encapsulation path and tests.
    pub fn write(
        marker: bool,
        payload_type: PayloadType,
        seqnum: SequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: Ssrc,
        extensions: &[(u8, &[u8])],
        payload: &[u8],
    ) -> Self {
        let mut serialized = Vec::with_capacity(RTP_MIN_HEADER_LEN + 16 + payload.len());
        let has_extensions = !extensions.is_empty();
        serialized.push((VERSION << 6) | ((has_extensions as u8) << 4));
        serialized.push(((marker as u8) << 7) | (payload_type & 0b0111_1111));
        serialized.extend_from_slice(&seqnum.to_be_bytes());
        serialized.extend_from_slice(&timestamp.to_be_bytes());
        serialized.extend_from_slice(&ssrc.to_be_bytes());

        let mut entries = Vec::new();
        if has_extensions {
            let unpadded_len: usize = extensions.iter().map(|(_, value)| 1 + value.len()).sum();
            let padded_len = round_up_to_multiple_of::<4>(unpadded_len);
            serialized.extend_from_slice(&RTP_ONE_BYTE_EXTENSIONS_PROFILE.to_be_bytes());
            serialized.extend_from_slice(&((padded_len / 4) as u16).to_be_bytes());
            for (id, value) in extensions {
                assert!(*id >= 1 && *id < RTP_EXTENSION_ID_STOP, "id must fit in 4 bits");
                assert!(!value.is_empty() && value.len() <= 16, "bad extension length");
                serialized.push((id << 4) | (value.len() as u8 - 1));
                let value_start = serialized.len();
                serialized.extend_from_slice(value);
                entries.push(ExtensionEntry {
                    id: *id,
                    range: value_start..value_start + value.len(),
                });
            }
            serialized.resize(serialized.len() + (padded_len - unpadded_len), 0);
        }
        let payload_start = serialized.len();
        serialized.extend_from_slice(payload);

        Self {
            marker,
            payload_type,
            seqnum,
            timestamp,
            ssrc,
            receive_ms: 0,
            is_rtx: false,
            is_key_frame: false,
            extension_ids: HeaderExtensionIds::default(),
            extensions: entries,
            extensions_start: RTP_MIN_HEADER_LEN,
            payload_range: payload_start..payload_start + payload.len(),
            serialized,
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: Ssrc) {
        self.ssrc = ssrc;
        self.serialized[RTP_SSRC_RANGE].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.seqnum
    }

    pub fn set_sequence_number(&mut self, seqnum: SequenceNumber) {
        self.seqnum = seqnum;
        self.serialized[RTP_SEQNUM_RANGE].copy_from_slice(&seqnum.to_be_bytes());
    }

    pub fn timestamp(&self) -> RtpTimestamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: RtpTimestamp) {
        self.timestamp = timestamp;
        self.serialized[RTP_TIMESTAMP_RANGE].copy_from_slice(&timestamp.to_be_bytes());
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn set_payload_type(&mut self, payload_type: PayloadType) {
        self.payload_type = payload_type & 0b0111_1111;
        self.serialized[RTP_PAYLOAD_TYPE_OFFSET] =
            ((self.marker as u8) << 7) | self.payload_type;
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
        self.serialized[RTP_PAYLOAD_TYPE_OFFSET] =
            ((marker as u8) << 7) | self.payload_type;
    }

    pub fn size(&self) -> usize {
        self.serialized.len()
    }

    pub fn receive_ms(&self) -> i64 {
        self.receive_ms
    }

    pub fn is_rtx(&self) -> bool {
        self.is_rtx
    }

    /// Flags a packet that arrived on a stream's RTX SSRC before decap.
    pub fn mark_rtx(&mut self) {
        self.is_rtx = true;
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    pub fn set_key_frame(&mut self, is_key_frame: bool) {
        self.is_key_frame = is_key_frame;
    }

    pub fn payload(&self) -> &[u8] {
        &self.serialized[self.payload_range.clone()]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_range.len()
    }

    pub fn extension_ids(&self) -> &HeaderExtensionIds {
        &self.extension_ids
    }

    /// Installed by the owning receiver so MID/RID/abs-send-time lookups
    /// resolve with the connection's negotiated IDs.
    pub fn set_extension_ids(&mut self, ids: HeaderExtensionIds) {
        self.extension_ids = ids;
    }

    pub fn get_extension(&self, id: u8) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &self.serialized[entry.range.clone()])
    }

    fn extension_str(&self, id: Option<u8>) -> Option<String> {
        let value = self.get_extension(id?)?;
        std::str::from_utf8(value).ok().map(str::to_string)
    }

    pub fn mid(&self) -> Option<String> {
        self.extension_str(self.extension_ids.mid())
    }

    pub fn rid(&self) -> Option<String> {
        self.extension_str(self.extension_ids.rid())
    }

    /// The RID carried by an RTX repair packet.
    pub fn rrid(&self) -> Option<String> {
        self.extension_str(self.extension_ids.rrid())
    }

    /// Sets an extension value, in place when the length is unchanged,
    /// otherwise by rebuilding the extension block.
    pub fn set_extension(&mut self, id: u8, value: &[u8]) {
        assert!(id >= 1 && id < RTP_EXTENSION_ID_STOP, "id must fit in 4 bits");
        assert!(!value.is_empty() && value.len() <= 16, "bad extension length");
        if let Some(entry) = self.extensions.iter().find(|entry| entry.id == id) {
            if entry.range.len() == value.len() {
                self.serialized[entry.range.clone()].copy_from_slice(value);
                return;
            }
        }
        let mut values: Vec<(u8, Vec<u8>)> = self
            .extensions
            .iter()
            .filter(|entry| entry.id != id)
            .map(|entry| (entry.id, self.serialized[entry.range.clone()].to_vec()))
            .collect();
        values.push((id, value.to_vec()));
        self.rebuild_extensions(values);
    }

    /// Rewrites each extension's ID through `map`, leaving unmapped
    /// extensions untouched. One-byte writes; lengths never change.
    pub fn remap_extension_ids(&mut self, map: &HashMap<u8, u8>) {
        for index in 0..self.extensions.len() {
            let old_id = self.extensions[index].id;
            if let Some(&new_id) = map.get(&old_id) {
                if new_id == old_id || new_id == 0 || new_id >= RTP_EXTENSION_ID_STOP {
                    continue;
                }
                let header_offset = self.extensions[index].range.start - 1;
                let len_nibble = self.serialized[header_offset] & 0x0F;
                self.serialized[header_offset] = (new_id << 4) | len_nibble;
                self.extensions[index].id = new_id;
            }
        }
    }

    /// The 24-bit abs-send-time value: 6.18 fixed-point seconds.
    pub fn read_abs_send_time(&self, id: u8) -> Option<u32> {
        let value = self.get_extension(id)?;
        if value.len() != 3 {
            return None;
        }
        Some(parse_u24(value))
    }

    pub fn update_abs_send_time(&mut self, id: u8, now_ms: i64) {
        let truncated = abs_send_time_from_ms(now_ms);
        let bytes = truncated.to_be_bytes();
        self.set_extension(id, &bytes[1..4]);
    }

    pub fn read_transport_wide_cc(&self, id: u8) -> Option<u16> {
        let value = self.get_extension(id)?;
        if value.len() != 2 {
            return None;
        }
        Some(parse_u16(value))
    }

    pub fn update_transport_wide_cc(&mut self, id: u8, seqnum: u16) {
        self.set_extension(id, &seqnum.to_be_bytes());
    }

    pub fn marshal(&self) -> &[u8] {
        &self.serialized
    }

    pub fn into_serialized(self) -> Vec<u8> {
        self.serialized
    }

    /// Decapsulates an RTX repair packet in place: the first two payload
    /// bytes are the original sequence number, and PT/SSRC are rewritten
    /// back to the media stream's.
    pub fn rtx_decode(
        &mut self,
        media_pt: PayloadType,
        media_ssrc: Ssrc,
    ) -> Result<(), PacketError> {
        if self.payload_len() < 2 {
            return Err(PacketError::RtxPayloadTooShort);
        }
        let original_seqnum = parse_u16(self.payload());
        self.set_payload_type(media_pt);
        self.set_ssrc(media_ssrc);
        self.set_sequence_number(original_seqnum);
        let payload_start = self.payload_range.start;
        self.serialized.drain(payload_start..payload_start + 2);
        self.payload_range.end -= 2;
        self.is_rtx = true;
        Ok(())
    }

    /// Builds the RTX encapsulation of this packet: same extensions, the
    /// original seqnum prepended to the payload, marker cleared.
    pub fn rtx_encode(
        &self,
        rtx_pt: PayloadType,
        rtx_ssrc: Ssrc,
        rtx_seqnum: SequenceNumber,
    ) -> Packet {
        let mut rtx = self.clone();
        rtx.set_marker(false);
        rtx.set_payload_type(rtx_pt);
        rtx.set_ssrc(rtx_ssrc);
        let original_seqnum = self.seqnum.to_be_bytes();
        let payload_start = rtx.payload_range.start;
        rtx.serialized
            .splice(payload_start..payload_start, original_seqnum);
        rtx.payload_range.end += 2;
        rtx.set_sequence_number(rtx_seqnum);
        rtx.is_rtx = true;
        rtx
    }

    fn rebuild_extensions(&mut self, values: Vec<(u8, Vec<u8>)>) {
        let head_end = self.extensions_start;
        let mut rebuilt = Vec::with_capacity(self.serialized.len() + 8);
        rebuilt.extend_from_slice(&self.serialized[..head_end]);
        rebuilt[0] |= 0b0001_0000;

        let unpadded_len: usize = values.iter().map(|(_, value)| 1 + value.len()).sum();
        let padded_len = round_up_to_multiple_of::<4>(unpadded_len);
        rebuilt.extend_from_slice(&RTP_ONE_BYTE_EXTENSIONS_PROFILE.to_be_bytes());
        rebuilt.extend_from_slice(&((padded_len / 4) as u16).to_be_bytes());

        let mut entries = Vec::with_capacity(values.len());
        for (id, value) in &values {
            rebuilt.push((id << 4) | (value.len() as u8 - 1));
            let value_start = rebuilt.len();
            rebuilt.extend_from_slice(value);
            entries.push(ExtensionEntry {
                id: *id,
                range: value_start..value_start + value.len(),
            });
        }
        rebuilt.resize(rebuilt.len() + (padded_len - unpadded_len), 0);

        let payload_start = rebuilt.len();
        let payload_len = self.payload_range.len();
        rebuilt.extend_from_slice(&self.serialized[self.payload_range.start..]);

        self.serialized = rebuilt;
        self.extensions = entries;
        self.payload_range = payload_start..payload_start + payload_len;
    }
}

/// abs-send-time wire encoding: `((now_ms << 18) + 500) / 1000` masked to
/// 24 bits.
pub fn abs_send_time_from_ms(now_ms: i64) -> u32 {
    (((now_ms as u64 * (1 << 18) + 500) / 1000) & 0x00FF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{HeaderExtension, MID_URI, RID_URI};

    fn test_packet() -> Packet {
        Packet::write(
            false,
            96,
            1234,
            90_000,
            0x1122_3344,
            &[(4, b"m0"), (10, b"hi")],
            &[0xde, 0xad, 0xbe, 0xef],
        )
    }

    #[test]
    fn test_parse_rejects_short_and_truncated() {
        assert_eq!(Err(PacketError::TooShort(0)), Packet::parse(&[], 0));
        assert_eq!(Err(PacketError::TooShort(11)), Packet::parse(&[0u8; 11], 0));

        let mut evil = test_packet().into_serialized();
        // Claim 15 CSRCs that aren't there.
        evil[0] |= 0b1111;
        assert_eq!(Err(PacketError::TruncatedHeader), Packet::parse(&evil, 0));
    }

    #[test]
    fn test_parse_marshal_round_trip() {
        let bytes = test_packet().into_serialized();
        let parsed = Packet::parse(&bytes, 123).unwrap();
        assert_eq!(&bytes[..], parsed.marshal());
        assert_eq!(96, parsed.payload_type());
        assert_eq!(1234, parsed.sequence_number());
        assert_eq!(90_000, parsed.timestamp());
        assert_eq!(0x1122_3344, parsed.ssrc());
        assert_eq!(123, parsed.receive_ms());
        assert!(!parsed.marker());
        assert_eq!(&[0xde, 0xad, 0xbe, 0xef], parsed.payload());
        assert_eq!(Some(&b"m0"[..]), parsed.get_extension(4));
        assert_eq!(Some(&b"hi"[..]), parsed.get_extension(10));
        assert_eq!(None, parsed.get_extension(5));
    }

    #[test]
    fn test_parse_with_padding() {
        let mut bytes = test_packet().into_serialized();
        bytes[0] |= 0b0010_0000;
        bytes.extend_from_slice(&[0, 0, 3]);
        let parsed = Packet::parse(&bytes, 0).unwrap();
        assert_eq!(&[0xde, 0xad, 0xbe, 0xef], parsed.payload());

        // A padding count that swallows the whole payload is rejected.
        let len = bytes.len();
        bytes[len - 1] = 100;
        assert_eq!(Err(PacketError::BadPadding(100)), Packet::parse(&bytes, 0));
    }

    #[test]
    fn test_field_rewrites_write_through() {
        let mut packet = test_packet();
        packet.set_ssrc(800_000_001);
        packet.set_sequence_number(9999);
        packet.set_timestamp(180_000);
        packet.set_payload_type(100);
        packet.set_marker(true);

        let reparsed = Packet::parse(packet.marshal(), 0).unwrap();
        assert_eq!(800_000_001, reparsed.ssrc());
        assert_eq!(9999, reparsed.sequence_number());
        assert_eq!(180_000, reparsed.timestamp());
        assert_eq!(100, reparsed.payload_type());
        assert!(reparsed.marker());
        assert_eq!(&[0xde, 0xad, 0xbe, 0xef], reparsed.payload());
    }

    #[test]
    fn test_mid_rid_lookup() {
        let mut packet = test_packet();
        packet.set_extension_ids(HeaderExtensionIds::from_extensions(&[
            HeaderExtension::new(MID_URI, 4),
            HeaderExtension::new(RID_URI, 10),
        ]));
        assert_eq!(Some("m0".to_string()), packet.mid());
        assert_eq!(Some("hi".to_string()), packet.rid());
        assert_eq!(None, packet.rrid());
    }

    #[test]
    fn test_remap_extension_ids() {
        let mut packet = test_packet();
        let map = HashMap::from([(4u8, 7u8), (10u8, 2u8)]);
        packet.remap_extension_ids(&map);
        let reparsed = Packet::parse(packet.marshal(), 0).unwrap();
        assert_eq!(Some(&b"m0"[..]), reparsed.get_extension(7));
        assert_eq!(Some(&b"hi"[..]), reparsed.get_extension(2));
        assert_eq!(None, reparsed.get_extension(4));
    }

    #[test]
    fn test_set_extension_same_length_in_place() {
        let mut packet = test_packet();
        let size_before = packet.size();
        packet.set_extension(4, b"m1");
        assert_eq!(size_before, packet.size());
        assert_eq!(Some(&b"m1"[..]), packet.get_extension(4));
    }

    #[test]
    fn test_set_extension_rebuilds_on_length_change() {
        let mut packet = test_packet();
        packet.set_extension(4, b"longer");
        let reparsed = Packet::parse(packet.marshal(), 0).unwrap();
        assert_eq!(Some(&b"longer"[..]), reparsed.get_extension(4));
        assert_eq!(Some(&b"hi"[..]), reparsed.get_extension(10));
        assert_eq!(&[0xde, 0xad, 0xbe, 0xef], reparsed.payload());
    }

    #[test]
    fn test_set_extension_on_packet_without_extensions() {
        let mut packet = Packet::write(false, 96, 1, 2, 3, &[], b"payload");
        packet.set_extension(3, &[0xab, 0xcd, 0xef]);
        let reparsed = Packet::parse(packet.marshal(), 0).unwrap();
        assert_eq!(Some(&[0xab, 0xcd, 0xef][..]), reparsed.get_extension(3));
        assert_eq!(b"payload", reparsed.payload());
    }

    #[test]
    fn test_abs_send_time() {
        // 1 second is 1 << 18 in 6.18 fixed point.
        assert_eq!(1 << 18, abs_send_time_from_ms(1000));
        // The value wraps every 64 seconds.
        assert_eq!(0, abs_send_time_from_ms(64_000));

        let mut packet = Packet::write(false, 96, 1, 2, 3, &[(3, &[0, 0, 0])], b"x");
        packet.update_abs_send_time(3, 1000);
        assert_eq!(Some(1 << 18), packet.read_abs_send_time(3));
    }

    #[test]
    fn test_transport_wide_cc() {
        let mut packet = Packet::write(false, 96, 1, 2, 3, &[(5, &[0, 0])], b"x");
        packet.update_transport_wide_cc(5, 0x1234);
        assert_eq!(Some(0x1234), packet.read_transport_wide_cc(5));
    }

    #[test]
    fn test_rtx_decode() {
        // RTX packet: PT=97, SSRC=1001, payload starts with 0x04D2 = 1234.
        let mut packet = Packet::write(
            false,
            97,
            5000,
            90_000,
            1001,
            &[],
            &[0x04, 0xd2, 0x01, 0x02, 0x03],
        );
        packet.rtx_decode(96, 1000).unwrap();
        assert_eq!(96, packet.payload_type());
        assert_eq!(1000, packet.ssrc());
        assert_eq!(1234, packet.sequence_number());
        assert_eq!(&[0x01, 0x02, 0x03], packet.payload());
        assert!(packet.is_rtx());

        // The rewrites are visible on the wire too.
        let reparsed = Packet::parse(packet.marshal(), 0).unwrap();
        assert_eq!(96, reparsed.payload_type());
        assert_eq!(1000, reparsed.ssrc());
        assert_eq!(1234, reparsed.sequence_number());
        assert_eq!(&[0x01, 0x02, 0x03], reparsed.payload());
    }

    #[test]
    fn test_rtx_decode_needs_two_payload_bytes() {
        let mut packet = Packet::write(false, 97, 5000, 90_000, 1001, &[], &[0x04]);
        assert_eq!(
            Err(PacketError::RtxPayloadTooShort),
            packet.rtx_decode(96, 1000)
        );
    }

    #[test]
    fn test_rtx_encode_then_decode_round_trips() {
        let original = Packet::write(true, 96, 1234, 90_000, 1000, &[], &[9, 8, 7]);
        let mut rtx = original.rtx_encode(97, 1001, 77);
        assert_eq!(97, rtx.payload_type());
        assert_eq!(1001, rtx.ssrc());
        assert_eq!(77, rtx.sequence_number());
        assert!(!rtx.marker());
        assert_eq!(&[0x04, 0xd2, 9, 8, 7], rtx.payload());

        rtx.rtx_decode(96, 1000).unwrap();
        assert_eq!(original.payload_type(), rtx.payload_type());
        assert_eq!(original.ssrc(), rtx.ssrc());
        assert_eq!(original.sequence_number(), rtx.sequence_number());
        assert_eq!(original.payload(), rtx.payload());
    }
}
