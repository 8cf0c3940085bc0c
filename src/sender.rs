//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A sender forwards one receiver's media to one subscriber: SSRC/PT and
//! header-extension IDs are rewritten on an owned copy of each packet,
//! NACKs are served from the replay buffer, and for simulcast producers a
//! layer state machine switches spatial layers on keyframes while keeping
//! the outgoing timestamp and sequence spaces continuous.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::*;
use parking_lot::Mutex;

use crate::{
    codec::{self, Codec},
    connection::Connection,
    receiver::{LayerInfo, Receiver, MAX_RTCP_AUDIO_INTERVAL_MS, MAX_RTCP_VIDEO_INTERVAL_MS},
    rtp::{
        packet::Packet,
        rtcp::{ReceptionReport, RtcpPacket, SourceDescription},
        HeaderExtension, HeaderExtensionIds, PayloadType, SequenceNumber, Ssrc,
    },
    stream::{sender::SenderStream, MediaType, StreamOption},
};

// Joining mid-stream too far behind the current timestamp forces a new
// keyframe instead of an ever-growing offset.
const MAX_EXTRA_OFFSET_MS: i64 = 75;
// Nudge applied when a switch would otherwise repeat the last timestamp.
const TS_BUMP_MS: i64 = 33;

const NO_LAYER: i32 = -1;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SwitchMode {
    /// Layers change only on explicit `update_layer` calls.
    #[default]
    Manual,
    /// The connection's bitrate allocation drives the target layer.
    Auto,
}

#[derive(Clone, Debug, Default)]
pub struct SenderOptions {
    pub id: String,
    pub mid: String,
    pub receiver_id: String,
    /// Defaults to the origin receiver's codec.
    pub codec: Option<Codec>,
    /// Defaults to the origin receiver's extensions.
    pub header_extensions: Vec<HeaderExtension>,
    pub switch_mode: SwitchMode,
}

/// Rewrites producer sequence numbers into one continuous outgoing space
/// across layer switches.
#[derive(Debug, Default)]
pub(crate) struct SeqManager {
    base: SequenceNumber,
    max_input: SequenceNumber,
    max_output: SequenceNumber,
}

impl SeqManager {
    /// Aligns the mapping so the packet after `seq` continues the output
    /// space without a gap.
    pub fn sync(&mut self, seq: SequenceNumber) {
        self.base = self.max_output.wrapping_sub(seq);
        self.max_input = seq;
    }

    pub fn input(&mut self, seq: SequenceNumber) -> SequenceNumber {
        let output = seq.wrapping_add(self.base);
        if seq.wrapping_sub(self.max_input) < u16::MAX / 2 {
            self.max_input = seq;
        }
        if output.wrapping_sub(self.max_output) < u16::MAX / 2 {
            self.max_output = output;
        }
        output
    }
}

#[derive(Debug)]
struct LayerState {
    mode: SwitchMode,
    preferred: i32,
    current: i32,
    target: i32,
    ts_reference: i32,
    ts_offset: u32,
    keyframe_requested_for_ts_offset: bool,
    seq: SeqManager,
    last_downgrade_ms: i64,
}

struct SenderState {
    codec: Codec,
    header_ids: HeaderExtensionIds,
    // Incoming extension ID -> outgoing extension ID.
    header_map: HashMap<u8, u8>,
    stream: SenderStream,
    transport_connected: bool,
    receiver_closed: bool,
    sync_required: bool,
    last_rtcp_sent_ms: i64,
    max_rtcp_interval_ms: i64,
    layers: Option<LayerState>,
}

impl SenderState {
    fn active(&self) -> bool {
        self.transport_connected && !self.receiver_closed
    }
}

pub struct Sender {
    id: String,
    mid: String,
    receiver_id: String,
    media_type: MediaType,
    connection: Weak<Connection>,
    receiver: Weak<Receiver>,
    state: Mutex<SenderState>,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: &SenderOptions,
        codec: Codec,
        header_ids: HeaderExtensionIds,
        header_map: HashMap<u8, u8>,
        stream_option: StreamOption,
        simulcast_layers: usize,
        connection: Weak<Connection>,
        receiver: &Arc<Receiver>,
    ) -> Arc<Self> {
        let media_type = receiver.media_type();
        let max_rtcp_interval_ms = match media_type {
            MediaType::Audio => MAX_RTCP_AUDIO_INTERVAL_MS,
            MediaType::Video => MAX_RTCP_VIDEO_INTERVAL_MS,
        };
        let layers = (simulcast_layers > 1).then(|| LayerState {
            mode: options.switch_mode,
            // Highest available until told otherwise.
            preferred: simulcast_layers as i32 - 1,
            current: NO_LAYER,
            target: NO_LAYER,
            ts_reference: NO_LAYER,
            ts_offset: 0,
            keyframe_requested_for_ts_offset: false,
            seq: SeqManager::default(),
            last_downgrade_ms: 0,
        });
        let stream = SenderStream::new(media_type, &stream_option, codec.clone());
        Arc::new(Self {
            id: options.id.clone(),
            mid: options.mid.clone(),
            receiver_id: options.receiver_id.clone(),
            media_type,
            connection,
            receiver: Arc::downgrade(receiver),
            state: Mutex::new(SenderState {
                codec,
                header_ids,
                header_map,
                stream,
                transport_connected: false,
                receiver_closed: false,
                sync_required: true,
                last_rtcp_sent_ms: 0,
                max_rtcp_interval_ms,
                layers,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn is_simulcast(&self) -> bool {
        self.state.lock().layers.is_some()
    }

    pub fn ssrc(&self) -> Option<Ssrc> {
        self.state.lock().stream.ssrc()
    }

    pub fn rtx_ssrc(&self) -> Option<Ssrc> {
        self.state.lock().stream.rtx_ssrc()
    }

    pub fn codec(&self) -> Codec {
        self.state.lock().codec.clone()
    }

    pub fn header_extensions(&self) -> Vec<HeaderExtension> {
        self.state.lock().header_ids.extensions()
    }

    pub fn fraction_lost(&self) -> u8 {
        let state = self.state.lock();
        if !state.active() {
            return 0;
        }
        state.stream.fraction_lost()
    }

    pub fn current_layer(&self) -> i32 {
        self.state
            .lock()
            .layers
            .as_ref()
            .map(|layers| layers.current)
            .unwrap_or(0)
    }

    pub fn target_layer(&self) -> i32 {
        self.state
            .lock()
            .layers
            .as_ref()
            .map(|layers| layers.target)
            .unwrap_or(0)
    }

    /// When the bitrate allocation last forced this sender down a layer;
    /// 0 until that happens.
    pub fn last_downgrade_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .layers
            .as_ref()
            .map(|layers| layers.last_downgrade_ms)
    }

    /// Forward-path entry, called by the origin receiver for every
    /// accepted packet.
    pub fn send_rtp(&self, packet: &Packet, now_ms: i64) {
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let snapshot = if self.is_simulcast() {
            receiver.layer_snapshot(now_ms)
        } else {
            Vec::new()
        };

        let (outgoing, request_keyframe_ssrc) = {
            let mut state = self.state.lock();
            if !state.active() {
                return;
            }
            self.forward(&mut state, packet, &snapshot)
        };

        if let Some(ssrc) = request_keyframe_ssrc {
            receiver.request_key_frame(ssrc, now_ms);
        }
        if let Some(outgoing) = outgoing {
            if let Some(connection) = self.connection.upgrade() {
                connection.send_rtp_packet(&outgoing, now_ms);
            }
        }
    }

    /// The per-packet pipeline under the sender lock: layer filtering,
    /// keyframe-gated sync, then the rewrite.
    fn forward(
        &self,
        state: &mut SenderState,
        packet: &Packet,
        snapshot: &[LayerInfo],
    ) -> (Option<Packet>, Option<Ssrc>) {
        let mut should_switch = false;
        let mut layer = 0i32;
        if let Some(layers) = state.layers.as_mut() {
            if layers.target == NO_LAYER {
                return (None, None);
            }
            let Some(packet_layer) = layer_of(snapshot, packet.ssrc()) else {
                return (None, None);
            };
            layer = packet_layer;
            if layers.current != layers.target && layer == layers.target {
                should_switch = true;
                state.sync_required = true;
            } else if layer != layers.current {
                return (None, None);
            }
        }

        if state.sync_required
            && codec::can_be_key_frame(&state.codec.encoder_name)
            && !packet.is_key_frame()
        {
            trace!("dropping packet while waiting for a keyframe");
            return (None, None);
        }

        if state.sync_required {
            if state.layers.is_some() {
                let clock_rate = state.codec.clock_rate;
                let max_sent_timestamp = state.stream.max_timestamp();
                let started = state.stream.started();
                let layers = state.layers.as_mut().unwrap();
                match compute_ts_offset(
                    layers,
                    snapshot,
                    layer,
                    should_switch,
                    packet,
                    started.then_some(max_sent_timestamp),
                    clock_rate,
                ) {
                    TsOffset::Ready(offset) => layers.ts_offset = offset,
                    TsOffset::NeedKeyFrame => {
                        layers.keyframe_requested_for_ts_offset = true;
                        let ssrc = layer_ssrc(snapshot, layers.current);
                        return (None, ssrc);
                    }
                    TsOffset::Wait => return (None, None),
                }
                layers.seq.sync(packet.sequence_number().wrapping_sub(1));
                layers.keyframe_requested_for_ts_offset = false;
            }
            state.sync_required = false;
        }

        if should_switch {
            let layers = state.layers.as_mut().unwrap();
            info!(
                "sender {} switching layer {} -> {}",
                self.id, layers.current, layers.target
            );
            layers.current = layers.target;
        }

        let mut outgoing = packet.clone();
        if let Some(layers) = state.layers.as_mut() {
            outgoing.set_timestamp(packet.timestamp().wrapping_sub(layers.ts_offset));
            outgoing.set_sequence_number(layers.seq.input(packet.sequence_number()));
        }
        outgoing.remap_extension_ids(&state.header_map);
        if let Some(ssrc) = state.stream.ssrc() {
            outgoing.set_ssrc(ssrc);
        }
        outgoing.set_payload_type(state.codec.payload_type);

        if state.stream.receive(&outgoing).is_err() {
            return (None, None);
        }
        (Some(outgoing), None)
    }

    /// Serves a subscriber NACK from the replay buffer.
    pub fn receive_nack(&self, seqnums: &[SequenceNumber], now_ms: i64) {
        let resends = {
            let mut state = self.state.lock();
            if !state.active() {
                return;
            }
            state.stream.receive_nack(seqnums)
        };
        if let Some(connection) = self.connection.upgrade() {
            for packet in &resends {
                connection.send_rtp_packet(packet, now_ms);
            }
        }
    }

    pub fn process_receiver_report(&self, report: &ReceptionReport) {
        self.state.lock().stream.process_receiver_report(report);
    }

    /// The periodic SR + SDES compound, rate-limited per media type.
    pub(crate) fn get_rtcp(&self, now_ms: i64) -> Option<Vec<RtcpPacket>> {
        let mut state = self.state.lock();
        if ((now_ms - state.last_rtcp_sent_ms) as f64) * 1.15
            < state.max_rtcp_interval_ms as f64
        {
            return None;
        }
        let sr = state.stream.sender_report(now_ms)?;
        let sdes = RtcpPacket::SourceDescription(SourceDescription {
            chunks: vec![state.stream.sdes_chunk()],
        });
        state.last_rtcp_sent_ms = now_ms;
        Some(vec![sr, sdes])
    }

    /// A subscriber asked for a keyframe (PLI/FIR); relay the demand to
    /// the producer's current layer.
    pub fn request_keyframe(&self, now_ms: i64) {
        if self.media_type != MediaType::Video {
            return;
        }
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let snapshot = receiver.layer_snapshot(now_ms);
        let ssrc = {
            let state = self.state.lock();
            if !state.active() {
                return;
            }
            match state.layers.as_ref() {
                Some(layers) => layer_ssrc(&snapshot, layers.current),
                None => snapshot.first().and_then(|layer| layer.ssrc),
            }
        };
        if let Some(ssrc) = ssrc {
            receiver.request_key_frame(ssrc, now_ms);
        }
    }

    /// Picks a new preferred layer (subscriber- or operator-driven).
    pub fn update_layer(&self, layer: i32, now_ms: i64) {
        {
            let mut state = self.state.lock();
            if let Some(layers) = state.layers.as_mut() {
                layers.preferred = layer;
            } else {
                return;
            }
        }
        self.may_change_layers(true, now_ms);
    }

    /// Connection-driven target change from the bitrate allocation.
    /// `force` marks BWE-driven downgrades.
    pub(crate) fn update_target_layer(&self, layer: i32, force: bool, now_ms: i64) {
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let snapshot = receiver.layer_snapshot(now_ms);
        let request = {
            let mut state = self.state.lock();
            match state.layers.as_mut() {
                Some(layers) => update_target(layers, layer, force, &snapshot, now_ms),
                None => None,
            }
        };
        if let Some(ssrc) = request {
            receiver.request_key_frame(ssrc, now_ms);
        }
    }

    /// The producer sent its first SR on some layer; switching may have
    /// been blocked on exactly that.
    pub(crate) fn on_producer_sender_report(&self, first: bool, now_ms: i64) {
        if !first {
            return;
        }
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let snapshot = receiver.layer_snapshot(now_ms);
        {
            let state = self.state.lock();
            if !state.active() {
                return;
            }
            let Some(layers) = state.layers.as_ref() else {
                return;
            };
            let current_has_sr = layers.current != NO_LAYER
                && snapshot
                    .get(layers.current as usize)
                    .map(|layer| layer.last_sr_ntp_ms > 0)
                    .unwrap_or(false);
            if !current_has_sr {
                return;
            }
        }
        self.may_change_layers(false, now_ms);
    }

    pub(crate) fn transport_connected(&self, now_ms: i64) {
        let is_simulcast = {
            let mut state = self.state.lock();
            state.transport_connected = true;
            state.sync_required = true;
            if let Some(layers) = state.layers.as_mut() {
                layers.keyframe_requested_for_ts_offset = false;
            }
            state.layers.is_some()
        };
        if is_simulcast {
            self.may_change_layers(false, now_ms);
        } else {
            self.request_keyframe(now_ms);
        }
    }

    pub(crate) fn transport_disconnected(&self) {
        self.state.lock().transport_connected = false;
    }

    /// The bitrate this sender consumes when capped at `layer`: the
    /// incremental cost of a layer is its bps minus the layer below.
    pub(crate) fn get_bitrate(&self, layer: i32, now_ms: i64) -> u64 {
        let Some(receiver) = self.receiver.upgrade() else {
            return 0;
        };
        let snapshot = receiver.layer_snapshot(now_ms);
        let state = self.state.lock();
        match state.layers.as_ref() {
            None => snapshot.first().map(|l| l.receive_bps).unwrap_or(0),
            Some(layers) => {
                if layer > layers.preferred {
                    return 0;
                }
                let layer = layer.max(0) as usize;
                if layer == 0 {
                    snapshot.first().map(|l| l.receive_bps).unwrap_or(0)
                } else {
                    let high = snapshot.get(layer).map(|l| l.receive_bps).unwrap_or(0);
                    let low = snapshot.get(layer - 1).map(|l| l.receive_bps).unwrap_or(0);
                    high.saturating_sub(low)
                }
            }
        }
    }

    fn may_change_layers(&self, force: bool, now_ms: i64) {
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        let snapshot = receiver.layer_snapshot(now_ms);
        let mut request = None;
        let mut need_bitrate_change = false;
        {
            let mut state = self.state.lock();
            if let Some(layers) = state.layers.as_mut() {
                if let Some(new_target) = recalculate_target(layers, &snapshot) {
                    match layers.mode {
                        SwitchMode::Auto => {
                            if force {
                                request = update_target(layers, new_target, true, &snapshot, now_ms);
                            }
                            if new_target != layers.target {
                                need_bitrate_change = true;
                            }
                        }
                        SwitchMode::Manual => {
                            request = update_target(layers, new_target, false, &snapshot, now_ms);
                        }
                    }
                }
            }
        }
        if let Some(ssrc) = request {
            receiver.request_key_frame(ssrc, now_ms);
        }
        if need_bitrate_change {
            if let Some(connection) = self.connection.upgrade() {
                connection.need_bitrate_change(now_ms);
            }
        }
    }

    /// Close is idempotent; detaches from both the receiver and the
    /// connection.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.receiver_closed {
                return;
            }
            state.receiver_closed = true;
        }
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.detach_sender(&self.id);
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_sender(&self.id);
        }
    }
}

fn layer_of(snapshot: &[LayerInfo], ssrc: Ssrc) -> Option<i32> {
    snapshot
        .iter()
        .position(|layer| layer.ssrc == Some(ssrc))
        .map(|index| index as i32)
}

fn layer_ssrc(snapshot: &[LayerInfo], layer: i32) -> Option<Ssrc> {
    if layer < 0 {
        return None;
    }
    snapshot.get(layer as usize).and_then(|info| info.ssrc)
}

/// The highest switchable layer not above the preferred one. A layer is
/// switchable before a reference exists, when it *is* the reference, or
/// once both it and the reference have sender reports to reconcile
/// timestamps with.
fn recalculate_target(layers: &LayerState, snapshot: &[LayerInfo]) -> Option<i32> {
    let mut new_target = NO_LAYER;
    for index in 0..snapshot.len() as i32 {
        if !can_switch_to(layers, snapshot, index) {
            continue;
        }
        new_target = index;
        if index >= layers.preferred {
            break;
        }
    }
    (new_target != layers.target).then_some(new_target)
}

fn can_switch_to(layers: &LayerState, snapshot: &[LayerInfo], index: i32) -> bool {
    if layers.ts_reference == NO_LAYER || index == layers.ts_reference {
        return true;
    }
    let reference_sr = snapshot
        .get(layers.ts_reference as usize)
        .map(|layer| layer.last_sr_ntp_ms)
        .unwrap_or(0);
    let candidate_sr = snapshot
        .get(index as usize)
        .map(|layer| layer.last_sr_ntp_ms)
        .unwrap_or(0);
    reference_sr > 0 && candidate_sr > 0
}

/// Installs a new target layer. Returns the SSRC to demand a keyframe on
/// when the switch needs one.
fn update_target(
    layers: &mut LayerState,
    spatial_layer: i32,
    force: bool,
    snapshot: &[LayerInfo],
    now_ms: i64,
) -> Option<Ssrc> {
    // The first layer ever targeted anchors the timestamp space.
    if spatial_layer != NO_LAYER && layers.ts_reference == NO_LAYER {
        layers.ts_reference = spatial_layer;
    }
    if spatial_layer == NO_LAYER {
        layers.target = NO_LAYER;
        layers.current = NO_LAYER;
        return None;
    }
    layers.target = spatial_layer;
    if force && layers.target < layers.current {
        info!(
            "downgrading layer {} -> {} for bandwidth",
            layers.current, layers.target
        );
        layers.last_downgrade_ms = now_ms;
    }
    if layers.target != layers.current {
        return layer_ssrc(snapshot, layers.target);
    }
    None
}

enum TsOffset {
    Ready(u32),
    /// Too far behind the already-sent timestamps; drop and ask for a
    /// fresh keyframe on the current layer.
    NeedKeyFrame,
    /// Missing sender reports; drop the packet and wait.
    Wait,
}

/// Reconciles the target layer's RTP timestamp space with the reference
/// layer's, using their sender reports, so the outgoing timestamps stay
/// monotonic across a switch.
fn compute_ts_offset(
    layers: &LayerState,
    snapshot: &[LayerInfo],
    layer: i32,
    should_switch: bool,
    packet: &Packet,
    max_sent_timestamp: Option<u32>,
    clock_rate: u32,
) -> TsOffset {
    let mut ts_offset = 0u32;
    if layer != layers.ts_reference {
        let (Some(reference), Some(target)) = (
            snapshot.get(layers.ts_reference.max(0) as usize),
            snapshot.get(layers.target.max(0) as usize),
        ) else {
            return TsOffset::Wait;
        };
        if reference.last_sr_ntp_ms == 0 || target.last_sr_ntp_ms == 0 {
            warn!("cannot switch to a layer without a sender report");
            return TsOffset::Wait;
        }
        let diff_ms = target.last_sr_ntp_ms as i64 - reference.last_sr_ntp_ms as i64;
        let diff_ts = diff_ms * clock_rate as i64 / 1000;
        let new_ts2 = target.last_sr_rtp_timestamp as i64 - diff_ts;
        ts_offset = (new_ts2 - reference.last_sr_rtp_timestamp as i64) as u32;
    }

    if should_switch {
        if let Some(max_sent) = max_sent_timestamp {
            let rewritten = packet.timestamp().wrapping_sub(ts_offset);
            if rewritten <= max_sent {
                let max_extra_offset = MAX_EXTRA_OFFSET_MS * clock_rate as i64 / 1000;
                let mut extra = max_sent
                    .wrapping_sub(packet.timestamp())
                    .wrapping_add(ts_offset) as i64;
                if layers.keyframe_requested_for_ts_offset {
                    if extra > max_extra_offset {
                        extra = 1;
                    }
                } else if extra > max_extra_offset {
                    warn!("layer timestamp offset too large; requesting keyframe");
                    return TsOffset::NeedKeyFrame;
                } else if extra == 0 {
                    extra = TS_BUMP_MS * clock_rate as i64 / 1000;
                }
                if extra > 0 {
                    ts_offset = ts_offset.wrapping_sub(extra as u32);
                }
            }
        }
    }
    TsOffset::Ready(ts_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_manager_continuous_after_sync() {
        let mut seq = SeqManager::default();
        // Sync to 99: the next input (100) continues from max_output + 1.
        seq.sync(99);
        assert_eq!(1, seq.input(100));
        assert_eq!(2, seq.input(101));
        assert_eq!(3, seq.input(102));

        // Switch to a layer far away in seq space: output continues +1.
        seq.sync(4999);
        assert_eq!(4, seq.input(5000));
        assert_eq!(5, seq.input(5001));
    }

    #[test]
    fn test_seq_manager_wraparound() {
        let mut seq = SeqManager::default();
        seq.sync(65533);
        assert_eq!(1, seq.input(65534));
        assert_eq!(2, seq.input(65535));
        // Input wraps; output keeps incrementing.
        assert_eq!(3, seq.input(0));
    }

    fn snapshot_3_layers() -> Vec<LayerInfo> {
        vec![
            LayerInfo {
                ssrc: Some(1000),
                last_sr_ntp_ms: 0,
                last_sr_rtp_timestamp: 0,
                receive_bps: 100_000,
            },
            LayerInfo {
                ssrc: Some(1001),
                last_sr_ntp_ms: 0,
                last_sr_rtp_timestamp: 0,
                receive_bps: 250_000,
            },
            LayerInfo {
                ssrc: Some(1002),
                last_sr_ntp_ms: 0,
                last_sr_rtp_timestamp: 0,
                receive_bps: 800_000,
            },
        ]
    }

    fn layer_state() -> LayerState {
        LayerState {
            mode: SwitchMode::Manual,
            preferred: 2,
            current: NO_LAYER,
            target: NO_LAYER,
            ts_reference: NO_LAYER,
            ts_offset: 0,
            keyframe_requested_for_ts_offset: false,
            seq: SeqManager::default(),
            last_downgrade_ms: 0,
        }
    }

    #[test]
    fn test_recalculate_without_reference_takes_preferred() {
        let layers = layer_state();
        let snapshot = snapshot_3_layers();
        // No reference layer yet: everything is switchable, so the scan
        // runs up to the preferred layer.
        assert_eq!(Some(2), recalculate_target(&layers, &snapshot));
    }

    #[test]
    fn test_recalculate_requires_sender_reports() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.target = 0;
        layers.current = 0;
        let mut snapshot = snapshot_3_layers();
        // No SRs anywhere: only the reference layer itself qualifies, and
        // it's already the target.
        assert_eq!(None, recalculate_target(&layers, &snapshot));

        // SRs on the reference and the top layer unlock the top layer.
        snapshot[0].last_sr_ntp_ms = 1000;
        snapshot[2].last_sr_ntp_ms = 1100;
        assert_eq!(Some(2), recalculate_target(&layers, &snapshot));
    }

    #[test]
    fn test_update_target_requests_keyframe_on_switch() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.current = 0;
        layers.target = 0;
        let snapshot = snapshot_3_layers();
        let request = update_target(&mut layers, 2, false, &snapshot, 0);
        assert_eq!(Some(1002), request);
        assert_eq!(2, layers.target);
        assert_eq!(0, layers.current);
    }

    #[test]
    fn test_update_target_forced_downgrade_records_time() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.current = 2;
        layers.target = 2;
        let snapshot = snapshot_3_layers();
        let request = update_target(&mut layers, 0, true, &snapshot, 12_345);
        assert_eq!(Some(1000), request);
        assert_eq!(12_345, layers.last_downgrade_ms);
    }

    #[test]
    fn test_ts_offset_reference_layer_is_zero() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.target = 0;
        let snapshot = snapshot_3_layers();
        let packet = Packet::write(false, 96, 1, 1000, 1000, &[], &[0]);
        match compute_ts_offset(&layers, &snapshot, 0, false, &packet, None, 90_000) {
            TsOffset::Ready(offset) => assert_eq!(0, offset),
            _ => panic!("expected an offset"),
        }
    }

    #[test]
    fn test_ts_offset_from_sender_reports() {
        // Spec scenario: ref layer SR (ntp=X, ts=90000), target layer SR
        // (ntp=X+100ms, ts=99000) at 90 kHz: offset comes out zero, so an
        // incoming ts of 99010 forwards unchanged.
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.current = 0;
        layers.target = 2;
        let mut snapshot = snapshot_3_layers();
        snapshot[0].last_sr_ntp_ms = 1_000_000;
        snapshot[0].last_sr_rtp_timestamp = 90_000;
        snapshot[2].last_sr_ntp_ms = 1_000_100;
        snapshot[2].last_sr_rtp_timestamp = 99_000;

        let packet = Packet::write(false, 96, 40, 99_010, 1002, &[], &[0]);
        // Prior output stopped at ts 95_000: the rewritten ts stays ahead.
        match compute_ts_offset(&layers, &snapshot, 2, true, &packet, Some(95_000), 90_000) {
            TsOffset::Ready(offset) => {
                assert_eq!(0, offset);
                assert_eq!(99_010, packet.timestamp().wrapping_sub(offset));
            }
            _ => panic!("expected an offset"),
        }
    }

    #[test]
    fn test_ts_offset_missing_sr_waits() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.target = 2;
        let snapshot = snapshot_3_layers(); // no SRs
        let packet = Packet::write(false, 96, 40, 99_010, 1002, &[], &[0]);
        assert!(matches!(
            compute_ts_offset(&layers, &snapshot, 2, true, &packet, Some(95_000), 90_000),
            TsOffset::Wait
        ));
    }

    #[test]
    fn test_ts_offset_far_behind_demands_keyframe() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.current = 0;
        layers.target = 2;
        let mut snapshot = snapshot_3_layers();
        snapshot[0].last_sr_ntp_ms = 1_000_000;
        snapshot[0].last_sr_rtp_timestamp = 90_000;
        snapshot[2].last_sr_ntp_ms = 1_000_000;
        snapshot[2].last_sr_rtp_timestamp = 90_000;

        // Rewritten ts would be 90_000 while we already sent 100_000:
        // 10_000 ticks (111 ms at 90 kHz) > the 75 ms limit.
        let packet = Packet::write(false, 96, 40, 90_000, 1002, &[], &[0]);
        assert!(matches!(
            compute_ts_offset(&layers, &snapshot, 2, true, &packet, Some(100_000), 90_000),
            TsOffset::NeedKeyFrame
        ));
    }

    #[test]
    fn test_ts_offset_equal_timestamp_bumps() {
        let mut layers = layer_state();
        layers.ts_reference = 0;
        layers.current = 0;
        layers.target = 2;
        let mut snapshot = snapshot_3_layers();
        snapshot[0].last_sr_ntp_ms = 1_000_000;
        snapshot[0].last_sr_rtp_timestamp = 90_000;
        snapshot[2].last_sr_ntp_ms = 1_000_000;
        snapshot[2].last_sr_rtp_timestamp = 90_000;

        // Rewritten ts equals the last sent timestamp exactly.
        let packet = Packet::write(false, 96, 40, 100_000, 1002, &[], &[0]);
        match compute_ts_offset(&layers, &snapshot, 2, true, &packet, Some(100_000), 90_000) {
            TsOffset::Ready(offset) => {
                let bumped = packet.timestamp().wrapping_sub(offset);
                // 33 ms at 90 kHz ahead of the duplicate.
                assert_eq!(100_000 + 33 * 90, bumped);
            }
            _ => panic!("expected an offset"),
        }
    }
}
