//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Just enough VP8 payload-descriptor parsing to classify keyframes.
//! See https://tools.ietf.org/html/rfc7741#section-4.2.

/// True when this payload begins a VP8 keyframe: it must be the first
/// packet of partition 0 and the frame header's P bit must be clear.
pub fn is_key_frame(payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return false;
    }
    let mut index = 0;
    let byte = payload[index];
    let has_extension = (byte & 0x80) != 0;
    let beginning_of_partition = (byte & 0x10) != 0;
    let partition_id = byte & 0x07;
    index += 1;

    if has_extension {
        let flags = payload[index];
        let has_picture_id = (flags & 0x80) != 0;
        let has_tl0_pic_idx = (flags & 0x40) != 0;
        let has_tid = (flags & 0x20) != 0;
        let has_key_idx = (flags & 0x10) != 0;
        index += 1;

        if has_picture_id {
            if index >= payload.len() {
                return false;
            }
            // The picture ID is one or two bytes, flagged by its MSB.
            if (payload[index] & 0x80) != 0 {
                index += 1;
            }
            index += 1;
        }
        if has_tl0_pic_idx {
            index += 1;
        }
        if has_tid || has_key_idx {
            index += 1;
        }
    }

    if !beginning_of_partition || partition_id != 0 {
        return false;
    }
    match payload.get(index) {
        // P bit clear in the first payload byte means an intra frame.
        Some(first_payload_byte) => (first_payload_byte & 0x01) == 0,
        None => false,
    }
}
