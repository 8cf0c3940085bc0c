//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A receiver aggregates the streams one publisher track arrives on (one
//! per simulcast encoding), routes packets to them by SSRC/RID, owns the
//! keyframe-demand state, and fans accepted packets out to the attached
//! senders.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::*;
use parking_lot::Mutex;

use crate::{
    codec::Codec,
    connection::Connection,
    keyframe::KeyframeManager,
    rtp::{
        packet::Packet,
        rtcp::{ReceiverReport, RtcpPacket, SenderReport},
        HeaderExtension, HeaderExtensionIds, RtpTimestamp, Ssrc,
    },
    sender::Sender,
    stream::{receiver::ReceiverStream, MediaType, StreamOption},
};

// How often a receiver emits its compound RR at most; audio tolerates a
// much longer cadence than video.
pub(crate) const MAX_RTCP_AUDIO_INTERVAL_MS: i64 = 5000;
pub(crate) const MAX_RTCP_VIDEO_INTERVAL_MS: i64 = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceiverKind {
    Simple,
    Simulcast,
    Svc,
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReceptionOutcome {
    Media,
    Retransmission,
    Discarded,
}

#[derive(Clone, Debug)]
pub struct ReceiverOptions {
    pub id: String,
    pub mid: String,
    pub media_type: MediaType,
    pub codec: Codec,
    pub header_extensions: Vec<HeaderExtension>,
    pub streams: Vec<StreamOption>,
    /// Nonzero arms the delayed keyframe-demand path.
    pub key_frame_request_delay_ms: i64,
}

impl ReceiverOptions {
    pub fn new(id: &str, mid: &str, media_type: MediaType, codec: Codec) -> Self {
        Self {
            id: id.to_string(),
            mid: mid.to_string(),
            media_type,
            codec,
            header_extensions: Vec::new(),
            streams: Vec::new(),
            key_frame_request_delay_ms: 0,
        }
    }
}

/// Per-layer data a simulcast sender needs to pick and reconcile layers.
#[derive(Clone, Debug, Default)]
pub struct LayerInfo {
    pub ssrc: Option<Ssrc>,
    pub last_sr_ntp_ms: u64,
    pub last_sr_rtp_timestamp: RtpTimestamp,
    pub receive_bps: u64,
}

pub struct Receiver {
    id: String,
    mid: String,
    media_type: MediaType,
    kind: ReceiverKind,
    connection: Weak<Connection>,
    state: Mutex<ReceiverState>,
}

struct ReceiverState {
    codec: Codec,
    header_ids: HeaderExtensionIds,
    streams: Vec<ReceiverStream>,
    ssrc_to_index: HashMap<Ssrc, usize>,
    rtx_ssrc_to_index: HashMap<Ssrc, usize>,
    keyframe: Option<KeyframeManager>,
    senders: Vec<Arc<Sender>>,
    closed: bool,
    last_rtcp_sent_ms: i64,
    max_rtcp_interval_ms: i64,
}

impl Receiver {
    pub(crate) fn new(
        options: &ReceiverOptions,
        media_type: MediaType,
        codec: Codec,
        header_ids: HeaderExtensionIds,
        connection: Weak<Connection>,
    ) -> Arc<Self> {
        let kind = match options.streams.len() {
            0 => ReceiverKind::None,
            1 if !options.streams[0].scalability_mode.is_empty() => ReceiverKind::Svc,
            1 => ReceiverKind::Simple,
            _ => ReceiverKind::Simulcast,
        };

        let mut streams = Vec::with_capacity(options.streams.len());
        let mut ssrc_to_index = HashMap::new();
        let mut rtx_ssrc_to_index = HashMap::new();
        for (index, stream_option) in options.streams.iter().enumerate() {
            let stream = ReceiverStream::new(media_type, stream_option, codec.clone());
            if let Some(ssrc) = stream.ssrc() {
                ssrc_to_index.insert(ssrc, index);
            }
            if let Some(rtx_ssrc) = stream.rtx_ssrc() {
                rtx_ssrc_to_index.insert(rtx_ssrc, index);
            }
            streams.push(stream);
        }

        let keyframe = (media_type == MediaType::Video)
            .then(|| KeyframeManager::new(options.key_frame_request_delay_ms));
        let max_rtcp_interval_ms = match media_type {
            MediaType::Audio => MAX_RTCP_AUDIO_INTERVAL_MS,
            MediaType::Video => MAX_RTCP_VIDEO_INTERVAL_MS,
        };

        Arc::new(Self {
            id: options.id.clone(),
            mid: options.mid.clone(),
            media_type,
            kind,
            connection,
            state: Mutex::new(ReceiverState {
                codec,
                header_ids,
                streams,
                ssrc_to_index,
                rtx_ssrc_to_index,
                keyframe,
                senders: Vec::new(),
                closed: false,
                last_rtcp_sent_ms: 0,
                max_rtcp_interval_ms,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn kind(&self) -> ReceiverKind {
        self.kind
    }

    pub fn codec(&self) -> Codec {
        self.state.lock().codec.clone()
    }

    pub fn header_extensions(&self) -> Vec<HeaderExtension> {
        self.state.lock().header_ids.extensions()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// SSRCs and RIDs this receiver's streams are configured with, for the
    /// connection's routing table.
    pub(crate) fn route_keys(&self) -> (Vec<Ssrc>, Vec<String>) {
        let state = self.state.lock();
        let mut ssrcs = Vec::new();
        let mut rids = Vec::new();
        for stream in &state.streams {
            if let Some(ssrc) = stream.ssrc() {
                ssrcs.push(ssrc);
            }
            if let Some(rtx_ssrc) = stream.rtx_ssrc() {
                ssrcs.push(rtx_ssrc);
            }
            if !stream.rid().is_empty() {
                rids.push(stream.rid().to_string());
            }
        }
        (ssrcs, rids)
    }

    /// Whether any producer stream repairs through RTX; a forwarding
    /// sender then gets an RTX SSRC of its own.
    pub(crate) fn has_rtx(&self) -> bool {
        let state = self.state.lock();
        state
            .streams
            .iter()
            .any(|stream| stream.rtx_ssrc().is_some() || stream.rtx_payload_type().is_some())
    }

    pub(crate) fn cname(&self) -> String {
        let state = self.state.lock();
        state
            .streams
            .first()
            .map(|stream| stream.cname().to_string())
            .unwrap_or_default()
    }

    /// Layer data ordered by encoding index (low to high).
    pub(crate) fn layer_snapshot(&self, now_ms: i64) -> Vec<LayerInfo> {
        let mut state = self.state.lock();
        state
            .streams
            .iter_mut()
            .map(|stream| LayerInfo {
                ssrc: stream.ssrc(),
                last_sr_ntp_ms: stream.last_sr_ntp_ms(),
                last_sr_rtp_timestamp: stream.last_sr_rtp_timestamp(),
                receive_bps: stream.counters_mut().receive_bps(now_ms),
            })
            .collect()
    }

    pub(crate) fn attach_sender(&self, sender: Arc<Sender>) {
        self.state.lock().senders.push(sender);
    }

    pub(crate) fn detach_sender(&self, id: &str) {
        self.state.lock().senders.retain(|sender| sender.id() != id);
    }

    /// Ingest path: route to a stream, run its state machine, notify the
    /// keyframe manager, and fan the packet out to every attached sender.
    pub fn receive_rtp(&self, packet: &mut Packet) -> ReceptionOutcome {
        let now_ms = packet.receive_ms();
        let (outcome, feedback, senders) = {
            let mut state = self.state.lock();
            if state.closed {
                return ReceptionOutcome::Discarded;
            }
            // RTX probing padding can arrive with no payload, before any
            // media on the stream.
            if packet.payload_len() == 0 {
                return ReceptionOutcome::Discarded;
            }
            let streams_before = state.ssrc_to_index.len();
            let Some((index, is_rtx)) = state.find_stream(packet) else {
                warn!("no stream for packet ssrc {}", packet.ssrc());
                return ReceptionOutcome::Discarded;
            };
            packet.set_extension_ids(state.header_ids.clone());

            let mut feedback;
            let outcome;
            if is_rtx {
                packet.mark_rtx();
                match state.streams[index].receive_rtx(packet) {
                    Ok(rtcp) => {
                        feedback = rtcp;
                        outcome = ReceptionOutcome::Retransmission;
                    }
                    Err(err) => {
                        debug!("dropping rtx packet: {}", err);
                        return ReceptionOutcome::Retransmission;
                    }
                }
            } else {
                match state.streams[index].receive(packet) {
                    Ok(rtcp) => {
                        feedback = rtcp;
                        outcome = ReceptionOutcome::Media;
                    }
                    Err(err) => {
                        debug!("dropping media packet: {}", err);
                        return ReceptionOutcome::Discarded;
                    }
                }
            }

            let grew = state.ssrc_to_index.len() > streams_before;
            let state = &mut *state;
            if let Some(keyframe) = state.keyframe.as_mut() {
                if packet.is_key_frame() {
                    keyframe.received(packet.ssrc());
                } else if grew && keyframe.needed(packet.ssrc(), now_ms) {
                    // A brand-new stream is useless to subscribers until
                    // it starts on a keyframe.
                    feedback.extend(state.streams[index].request_key_frame());
                }
            }
            (outcome, feedback, state.senders.clone())
        };

        if !feedback.is_empty() {
            if let Some(connection) = self.connection.upgrade() {
                connection.send_rtcp_packets(&feedback);
            }
        }
        for sender in &senders {
            sender.send_rtp(packet, now_ms);
        }
        outcome
    }

    /// Requests a keyframe on a producer SSRC, deduplicated through the
    /// keyframe manager.
    pub fn request_key_frame(&self, ssrc: Ssrc, now_ms: i64) {
        let feedback = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let fire = match &mut state.keyframe {
                Some(keyframe) => keyframe.needed(ssrc, now_ms),
                None => return,
            };
            if !fire {
                return;
            }
            let Some(&index) = state.ssrc_to_index.get(&ssrc) else {
                return;
            };
            state.streams[index].request_key_frame()
        };
        if let (Some(packet), Some(connection)) = (feedback, self.connection.upgrade()) {
            connection.send_rtcp_packets(&[packet]);
        }
    }

    /// An SR from the publisher: feeds the matching stream and tells the
    /// attached senders (the first SR unblocks simulcast layer switching).
    pub(crate) fn process_sender_report(&self, sr: &SenderReport, now_ms: i64) {
        let (first, senders) = {
            let mut state = self.state.lock();
            let Some(&index) = state.ssrc_to_index.get(&sr.ssrc) else {
                return;
            };
            let first = state.streams[index].process_sender_report(sr, now_ms);
            (first, state.senders.clone())
        };
        for sender in &senders {
            sender.on_producer_sender_report(first, now_ms);
        }
    }

    /// Feeds measured RTT into each stream's NACK pacing.
    pub fn set_rtt(&self, rtt_ms: i64) {
        let mut state = self.state.lock();
        for stream in &mut state.streams {
            stream.set_rtt(rtt_ms);
        }
    }

    /// The periodic compound RR, rate-limited per media type.
    pub(crate) fn get_rtcp(&self, now_ms: i64) -> Option<Vec<RtcpPacket>> {
        let mut state = self.state.lock();
        if ((now_ms - state.last_rtcp_sent_ms) as f64) * 1.15
            < state.max_rtcp_interval_ms as f64
        {
            return None;
        }
        let worst = state.worst_remote_fraction_lost();
        let mut reports = Vec::new();
        for stream in &mut state.streams {
            reports.extend(stream.rtcp_receiver_report(now_ms, worst));
            reports.extend(stream.rtx_receiver_report());
        }
        if reports.is_empty() {
            return None;
        }
        state.last_rtcp_sent_ms = now_ms;
        Some(vec![RtcpPacket::ReceiverReport(ReceiverReport {
            ssrc: 0,
            reports,
        })])
    }

    /// 40 ms cadence: NACK retry batches from every stream.
    pub(crate) fn tick_nack(&self, now_ms: i64) -> Vec<RtcpPacket> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let mut out = Vec::new();
        for stream in &mut state.streams {
            out.extend(stream.tick_nack(now_ms));
        }
        out
    }

    /// 200 ms cadence: keyframe retries and inactivity checks.
    pub(crate) fn tick(&self, now_ms: i64) -> Vec<RtcpPacket> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let mut out = Vec::new();
        let fire = match &mut state.keyframe {
            Some(keyframe) => keyframe.tick(now_ms),
            None => Vec::new(),
        };
        for ssrc in fire {
            let index = state.ssrc_to_index.get(&ssrc).copied();
            if let Some(index) = index {
                out.extend(state.streams[index].request_key_frame());
            }
        }
        for stream in &mut state.streams {
            if stream.check_inactive(now_ms) {
                info!("receiver {} stream {:?} went idle", self.id, stream.ssrc());
            }
        }
        out
    }

    /// Close is idempotent: detaches from the connection's routing table
    /// and closes every attached sender.
    pub fn close(&self) {
        let senders = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.senders)
        };
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_receiver(&self.id);
        }
        for sender in senders {
            sender.close();
        }
    }
}

impl ReceiverState {
    /// Stream routing: memoized SSRC first, then a scan by configured
    /// SSRC/RID/RRID, then the single-stream MID-only fallback. A hit
    /// memoizes the packet's SSRC as media or RTX.
    fn find_stream(&mut self, packet: &Packet) -> Option<(usize, bool)> {
        if let Some(&index) = self.ssrc_to_index.get(&packet.ssrc()) {
            return Some((index, false));
        }
        if let Some(&index) = self.rtx_ssrc_to_index.get(&packet.ssrc()) {
            return Some((index, true));
        }

        // The receiver's extension IDs aren't installed on the packet yet
        // at routing time, so read RID/RRID through our own table.
        let rid = self.extension_str(packet, self.header_ids.rid());
        let rrid = self.extension_str(packet, self.header_ids.rrid());

        let mut found = None;
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.ssrc() == Some(packet.ssrc())
                || stream.rtx_ssrc() == Some(packet.ssrc())
                || (!rid.is_empty() && stream.rid() == rid)
                || (!rrid.is_empty() && stream.rid() == rrid)
            {
                found = Some(index);
                break;
            }
        }
        if found.is_none() && self.streams.len() == 1 {
            let only = &self.streams[0];
            if only.ssrc().is_none()
                && only.rid().is_empty()
                && (only.payload_type() == packet.payload_type()
                    || only.rtx_payload_type() == Some(packet.payload_type()))
            {
                found = Some(0);
            }
        }

        let index = found?;
        let stream = &mut self.streams[index];
        let is_rtx = stream.rtx_ssrc() == Some(packet.ssrc())
            || stream.rtx_payload_type() == Some(packet.payload_type())
            || !rrid.is_empty();
        if is_rtx {
            stream.update_rtx_ssrc(packet.ssrc());
            self.rtx_ssrc_to_index.insert(packet.ssrc(), index);
        } else {
            stream.update_ssrc(packet.ssrc());
            self.ssrc_to_index.insert(packet.ssrc(), index);
        }
        Some((index, is_rtx))
    }

    fn extension_str(&self, packet: &Packet, id: Option<u8>) -> String {
        id.and_then(|id| packet.get_extension(id))
            .and_then(|value| std::str::from_utf8(value).ok())
            .unwrap_or("")
            .to_string()
    }

    fn worst_remote_fraction_lost(&self) -> u8 {
        self.senders
            .iter()
            .map(|sender| sender.fraction_lost())
            .max()
            .unwrap_or(0)
    }
}
