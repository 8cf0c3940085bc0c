//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RTP/RTCP types shared across the crate. See https://tools.ietf.org/html/rfc3550.
//! Everything here operates on decrypted packets; SRTP is the transport's job.

use std::collections::HashMap;

use rand::Rng;

pub mod nack;
pub mod packet;
pub mod rtcp;

pub type PayloadType = u8;
pub type SequenceNumber = u16;
pub type RtpTimestamp = u32;
pub type Ssrc = u32;

pub(crate) const VERSION: u8 = 2;
const RTP_PAYLOAD_TYPE_OFFSET: usize = 1;
const RTCP_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 64..=95;

/// Cheap classification for the transport boundary (RFC 7983); just enough
/// to pick a parser, not validation.
pub fn looks_like_rtp(packet: &[u8]) -> bool {
    packet.len() > RTP_PAYLOAD_TYPE_OFFSET
        && (packet[0] >> 6) == VERSION
        && !RTCP_PAYLOAD_TYPES.contains(&(packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111))
}

pub fn looks_like_rtcp(packet: &[u8]) -> bool {
    packet.len() > RTP_PAYLOAD_TYPE_OFFSET
        && (packet[0] >> 6) == VERSION
        && RTCP_PAYLOAD_TYPES.contains(&(packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111))
}

const OUTGOING_SSRC_RANGE: std::ops::Range<Ssrc> = 800_000_000..900_000_000;

/// Generates an SSRC for an outgoing stream. Collision checking against the
/// connection's in-use set is the caller's job.
pub fn generate_ssrc() -> Ssrc {
    rand::thread_rng().gen_range(OUTGOING_SSRC_RANGE)
}

// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_EPOCH_OFFSET_SECS: u64 = 2_208_988_800;

/// 64-bit NTP timestamp from unix milliseconds: seconds in the upper 32
/// bits, fractional seconds in the lower 32.
pub fn ntp_from_unix_ms(unix_ms: i64) -> u64 {
    let seconds = (unix_ms / 1000) as u64 + NTP_UNIX_EPOCH_OFFSET_SECS;
    let fractional = (((unix_ms % 1000) as u64) << 32) / 1000;
    (seconds << 32) | fractional
}

/// NTP timestamp back to milliseconds since the NTP epoch, rounded to the
/// nearest millisecond. Differences of these values are real millisecond
/// deltas, which is all the simulcast timestamp reconciliation needs.
pub fn ntp_to_ms(ntp: u64) -> u64 {
    (ntp >> 32) * 1000 + (((ntp & 0xFFFF_FFFF) * 1000 + (1 << 31)) >> 32)
}

/// The middle 32 bits of an NTP timestamp, as reported in the LSR field of
/// a receiver report.
pub fn ntp_middle_32(ntp: u64) -> u32 {
    (((ntp >> 32) as u32) << 16) | ((ntp as u32) >> 16)
}

pub const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const RID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
pub const RRID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// A negotiated RTP header extension. IDs are assigned per connection in
/// [1, 20]; only IDs 1..=14 fit the one-byte header form used on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderExtension {
    pub uri: String,
    pub id: u8,
    pub encrypted: bool,
}

impl HeaderExtension {
    pub fn new(uri: &str, id: u8) -> Self {
        Self {
            uri: uri.to_string(),
            id,
            encrypted: false,
        }
    }

    /// An extension whose ID the connection will assign.
    pub fn unassigned(uri: &str) -> Self {
        Self::new(uri, 0)
    }
}

/// URI → assigned-ID mapping, installed on each receiver and sender.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderExtensionIds {
    by_uri: HashMap<String, HeaderExtension>,
}

impl HeaderExtensionIds {
    pub fn from_extensions(extensions: &[HeaderExtension]) -> Self {
        let by_uri = extensions
            .iter()
            .map(|extension| (extension.uri.clone(), extension.clone()))
            .collect();
        Self { by_uri }
    }

    pub fn extensions(&self) -> Vec<HeaderExtension> {
        self.by_uri.values().cloned().collect()
    }

    pub fn id(&self, uri: &str) -> Option<u8> {
        self.by_uri.get(uri).map(|extension| extension.id)
    }

    pub fn mid(&self) -> Option<u8> {
        self.id(MID_URI)
    }

    pub fn rid(&self) -> Option<u8> {
        self.id(RID_URI)
    }

    pub fn rrid(&self) -> Option<u8> {
        self.id(RRID_URI)
    }

    pub fn abs_send_time(&self) -> Option<u8> {
        self.id(ABS_SEND_TIME_URI)
    }

    pub fn transport_wide_cc(&self) -> Option<u8> {
        self.id(TRANSPORT_CC_URI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        // Version 2, PT 96: RTP.
        assert!(looks_like_rtp(&[0x80, 96]));
        assert!(!looks_like_rtcp(&[0x80, 96]));
        // Version 2, PT 200 (SR): 200 & 0x7f = 72, in the RTCP range.
        assert!(looks_like_rtcp(&[0x80, 200]));
        assert!(!looks_like_rtp(&[0x80, 200]));
        // Wrong version.
        assert!(!looks_like_rtp(&[0x00, 96]));
        assert!(!looks_like_rtcp(&[0x00, 200]));
        // Too short.
        assert!(!looks_like_rtp(&[0x80]));
    }

    #[test]
    fn test_generate_ssrc_in_range() {
        for _ in 0..100 {
            assert!(OUTGOING_SSRC_RANGE.contains(&generate_ssrc()));
        }
    }

    #[test]
    fn test_ntp_round_trip() {
        let ms = 1_700_000_000_123i64;
        let ntp = ntp_from_unix_ms(ms);
        assert_eq!(
            ms as u64 + NTP_UNIX_EPOCH_OFFSET_SECS * 1000,
            ntp_to_ms(ntp)
        );
    }

    #[test]
    fn test_ntp_middle_32() {
        let ntp = 0x0102_0304_0506_0708u64;
        assert_eq!(0x0304_0506, ntp_middle_32(ntp));
    }

    #[test]
    fn test_header_extension_ids() {
        let ids = HeaderExtensionIds::from_extensions(&[
            HeaderExtension::new(MID_URI, 4),
            HeaderExtension::new(RID_URI, 10),
            HeaderExtension::new(ABS_SEND_TIME_URI, 3),
        ]);
        assert_eq!(Some(4), ids.mid());
        assert_eq!(Some(10), ids.rid());
        assert_eq!(None, ids.rrid());
        assert_eq!(Some(3), ids.abs_send_time());
        assert_eq!(None, ids.transport_wide_cc());
    }
}
