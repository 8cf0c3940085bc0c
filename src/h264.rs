//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! H.264 keyframe classification over the RTP payload formats of RFC 6184:
//! a payload starts a keyframe when it carries (or aggregates, or starts
//! fragmenting) an SPS NAL unit.

use crate::common::parse_u16;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

pub fn is_key_frame(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    match payload[0] & 0x1f {
        NAL_TYPE_SPS => true,
        NAL_TYPE_STAP_A => {
            // Aggregated units: [len:2][nal]...
            let mut offset = 1;
            while offset + 3 <= payload.len() {
                if payload[offset + 2] & 0x1f == NAL_TYPE_SPS {
                    return true;
                }
                offset += 2 + parse_u16(&payload[offset..]) as usize;
            }
            false
        }
        NAL_TYPE_FU_A | NAL_TYPE_FU_B => {
            // Only the first fragment of an SPS counts.
            let start_bit = payload[1] & 0x80;
            payload[1] & 0x1f == NAL_TYPE_SPS && start_bit != 0
        }
        _ => false,
    }
}
