//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Codec descriptions as negotiated per connection. The SFU never decodes
//! media; the only codec-specific knowledge it needs is how to spot a
//! keyframe at the start of a payload.

use std::collections::BTreeMap;

use crate::rtp::PayloadType;
use crate::{h264, vp8};

pub const VP8: &str = "VP8";
pub const H264: &str = "H264";
pub const OPUS: &str = "opus";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub kind: String,
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// A negotiated codec. The payload type is assigned per connection; two
/// codecs are the same iff encoder name and every parameter match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Codec {
    pub payload_type: PayloadType,
    pub encoder_name: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub parameters: BTreeMap<String, String>,
    pub feedback: Vec<RtcpFeedback>,
    pub rtx_payload_type: Option<PayloadType>,
}

impl Codec {
    pub fn new(encoder_name: &str, payload_type: PayloadType, clock_rate: u32) -> Self {
        Self {
            payload_type,
            encoder_name: encoder_name.to_string(),
            clock_rate,
            ..Default::default()
        }
    }

    /// Identity for the connection's payload-type table.
    pub fn matches(&self, other: &Codec) -> bool {
        self.encoder_name.eq_ignore_ascii_case(&other.encoder_name)
            && self.parameters == other.parameters
    }

    pub fn has_feedback(&self, kind: &str, parameter: &str) -> bool {
        self.feedback
            .iter()
            .any(|fb| fb.kind == kind && fb.parameter == parameter)
    }
}

/// Whether payloads of this codec can start a decodable keyframe; codecs
/// we can't inspect never gate forwarding on keyframes.
pub fn can_be_key_frame(encoder_name: &str) -> bool {
    encoder_name.eq_ignore_ascii_case(VP8) || encoder_name.eq_ignore_ascii_case(H264)
}

pub fn is_key_frame(encoder_name: &str, payload: &[u8]) -> bool {
    if encoder_name.eq_ignore_ascii_case(VP8) {
        vp8::is_key_frame(payload)
    } else if encoder_name.eq_ignore_ascii_case(H264) {
        h264::is_key_frame(payload)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_matching_ignores_payload_type() {
        let mut a = Codec::new(VP8, 96, 90_000);
        let mut b = Codec::new(VP8, 100, 90_000);
        assert!(a.matches(&b));

        a.parameters.insert("profile-id".to_string(), "0".to_string());
        assert!(!a.matches(&b));
        b.parameters.insert("profile-id".to_string(), "0".to_string());
        assert!(a.matches(&b));

        assert!(!a.matches(&Codec::new(H264, 96, 90_000)));
    }

    #[test]
    fn test_feedback_lookup() {
        let mut codec = Codec::new(VP8, 96, 90_000);
        codec.feedback.push(RtcpFeedback::new("nack", ""));
        codec.feedback.push(RtcpFeedback::new("nack", "pli"));
        assert!(codec.has_feedback("nack", ""));
        assert!(codec.has_feedback("nack", "pli"));
        assert!(!codec.has_feedback("ccm", "fir"));
    }

    #[test]
    fn test_keyframe_capability() {
        assert!(can_be_key_frame("VP8"));
        assert!(can_be_key_frame("h264"));
        assert!(!can_be_key_frame(OPUS));
        assert!(!is_key_frame(OPUS, &[0xff; 10]));
    }
}
