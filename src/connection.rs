//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One peer connection: the shared payload-type and header-extension
//! tables, the RTP routing table, RTCP dispatch, the periodic RTCP/NACK
//! timer, and the bitrate allocation across its senders.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use log::*;
use parking_lot::Mutex;
use rand::Rng;

use crate::{
    bwe::{RembReceiver, RembSender},
    codec::Codec,
    common::{unix_ms, DataRate},
    error::Error,
    receiver::{Receiver, ReceiverKind, ReceiverOptions},
    rtp::{
        packet::Packet,
        rtcp::RtcpPacket,
        generate_ssrc, HeaderExtension, HeaderExtensionIds, PayloadType, Ssrc,
        ABS_SEND_TIME_URI, TRANSPORT_CC_URI,
    },
    sender::{Sender, SenderOptions},
    stats::ConnectionStats,
    stream::StreamOption,
    transport::Transport,
};

// Dynamic payload types handed out by the connection.
const PAYLOAD_TYPE_RANGE: std::ops::RangeInclusive<PayloadType> = 100..=150;
const HEADER_ID_RANGE: std::ops::RangeInclusive<u8> = 1..=20;

// Timer cadence: NACKs every tick, everything else every fifth.
const TICK_INTERVAL_MS: u64 = 40;
const RTCP_TICKS_PER_NACK_TICKS: u64 = 5;
// A compound report goes out at least this often, and with 10% chance on
// any 200 ms tick, spreading emission over [200, 2000] ms.
const RTCP_FORCE_INTERVAL_MS: i64 = 2000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BweKind {
    #[default]
    None,
    /// Receive-side estimation over abs-send-time, fed back as REMB.
    Remb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Disconnected,
}

pub type StateChangeCallback = Box<dyn Fn(TransportState) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub bwe: BweKind,
    pub initial_available_outgoing_bitrate: DataRate,
    pub max_incoming_bitrate: Option<DataRate>,
    pub min_incoming_bitrate: Option<DataRate>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            bwe: BweKind::None,
            initial_available_outgoing_bitrate: DataRate::from_kbps(600),
            max_incoming_bitrate: None,
            min_incoming_bitrate: None,
        }
    }
}

#[derive(Default)]
struct RtpTable {
    by_ssrc: HashMap<Ssrc, Arc<Receiver>>,
    by_mid: HashMap<String, Arc<Receiver>>,
    by_rid: HashMap<String, Arc<Receiver>>,
}

impl RtpTable {
    fn add_receiver(&mut self, receiver: &Arc<Receiver>) -> Result<(), Error> {
        let (ssrcs, rids) = receiver.route_keys();
        for ssrc in &ssrcs {
            if self.by_ssrc.contains_key(ssrc) {
                self.remove_receiver(receiver.id());
                return Err(Error::SsrcExists);
            }
            self.by_ssrc.insert(*ssrc, receiver.clone());
        }
        for rid in &rids {
            if self.by_rid.contains_key(rid) && receiver.mid().is_empty() {
                self.remove_receiver(receiver.id());
                return Err(Error::RidExists);
            }
            self.by_rid.insert(rid.clone(), receiver.clone());
        }
        if !receiver.mid().is_empty() {
            if self.by_mid.contains_key(receiver.mid()) {
                self.remove_receiver(receiver.id());
                return Err(Error::MidExists);
            }
            self.by_mid
                .insert(receiver.mid().to_string(), receiver.clone());
        }
        Ok(())
    }

    fn remove_receiver(&mut self, id: &str) {
        self.by_ssrc.retain(|_, receiver| receiver.id() != id);
        self.by_mid.retain(|_, receiver| receiver.id() != id);
        self.by_rid.retain(|_, receiver| receiver.id() != id);
    }

    /// Route resolution order: SSRC, then MID, then RID. MID/RID hits
    /// memoize the packet's SSRC for next time.
    fn get(
        &mut self,
        packet: &Packet,
        header_ids: &HashMap<String, u8>,
    ) -> Option<Arc<Receiver>> {
        if let Some(receiver) = self.by_ssrc.get(&packet.ssrc()) {
            return Some(receiver.clone());
        }
        if let Some(mid) = extension_str(packet, header_ids.get(MID_URI_KEY).copied()) {
            if let Some(receiver) = self.by_mid.get(&mid) {
                let receiver = receiver.clone();
                self.by_ssrc.insert(packet.ssrc(), receiver.clone());
                return Some(receiver);
            }
        }
        if let Some(rid) = extension_str(packet, header_ids.get(RID_URI_KEY).copied()) {
            if let Some(receiver) = self.by_rid.get(&rid) {
                let receiver = receiver.clone();
                self.by_ssrc.insert(packet.ssrc(), receiver.clone());
                return Some(receiver);
            }
        }
        None
    }

    fn get_by_ssrc(&self, ssrc: Ssrc) -> Option<Arc<Receiver>> {
        self.by_ssrc.get(&ssrc).cloned()
    }
}

const MID_URI_KEY: &str = crate::rtp::MID_URI;
const RID_URI_KEY: &str = crate::rtp::RID_URI;

fn extension_str(packet: &Packet, id: Option<u8>) -> Option<String> {
    let value = packet.get_extension(id?)?;
    std::str::from_utf8(value).ok().map(str::to_string)
}

struct ConnectionState {
    codecs: HashMap<PayloadType, Codec>,
    header_ids: HashMap<String, u8>,
    receivers: Vec<Arc<Receiver>>,
    senders: Vec<Arc<Sender>>,
    senders_by_ssrc: HashMap<Ssrc, Arc<Sender>>,
    senders_by_rtx_ssrc: HashMap<Ssrc, Arc<Sender>>,
    rtp_table: RtpTable,
    bwe_receiver: Option<RembReceiver>,
    bwe_sender: Option<RembSender>,
    used_ssrcs: HashSet<Ssrc>,
    connected: bool,
    closed: bool,
}

pub struct Connection {
    id: String,
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    stats: ConnectionStats,
    state: Mutex<ConnectionState>,
    on_state_change: Mutex<Option<StateChangeCallback>>,
    last_compound_rtcp_ms: AtomicI64,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    pub fn new(id: &str, transport: Arc<dyn Transport>, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            transport,
            options,
            stats: ConnectionStats::default(),
            state: Mutex::new(ConnectionState {
                codecs: HashMap::new(),
                header_ids: HashMap::new(),
                receivers: Vec::new(),
                senders: Vec::new(),
                senders_by_ssrc: HashMap::new(),
                senders_by_rtx_ssrc: HashMap::new(),
                rtp_table: RtpTable::default(),
                bwe_receiver: None,
                bwe_sender: None,
                used_ssrcs: HashSet::new(),
                connected: false,
                closed: false,
            }),
            on_state_change: Mutex::new(None),
            last_compound_rtcp_ms: AtomicI64::new(0),
            tick_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn on_state_change(&self, callback: impl Fn(TransportState) + Send + Sync + 'static) {
        *self.on_state_change.lock() = Some(Box::new(callback));
    }

    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.state.lock().receivers.clone()
    }

    pub fn senders(&self) -> Vec<Arc<Sender>> {
        self.state.lock().senders.clone()
    }

    pub fn receiver(&self, id: &str) -> Option<Arc<Receiver>> {
        self.state
            .lock()
            .receivers
            .iter()
            .find(|receiver| receiver.id() == id)
            .cloned()
    }

    /// Registers a publisher track. Codec and header-extension tables are
    /// validated before anything is inserted, so a failed creation leaves
    /// the connection untouched.
    pub fn new_receiver(
        self: &Arc<Self>,
        options: ReceiverOptions,
    ) -> Result<Arc<Receiver>, Error> {
        if options.streams.is_empty() {
            return Err(Error::StreamsEmpty);
        }
        let mut options = options;
        let bwe = self.options.bwe;
        options.header_extensions.retain(|extension| {
            keep_extension_for_bwe(&extension.uri, bwe)
        });

        let receiver = {
            let mut state = self.state.lock();
            register_codec(&mut state.codecs, &options.codec)?;
            let assigned = assign_header_ids(&mut state.header_ids, &options.header_extensions)?;
            let header_ids = HeaderExtensionIds::from_extensions(&assigned);
            let receiver = Receiver::new(
                &options,
                options.media_type,
                options.codec.clone(),
                header_ids,
                Arc::downgrade(self),
            );
            state.rtp_table.add_receiver(&receiver)?;
            state.receivers.push(receiver.clone());

            if bwe == BweKind::Remb
                && state.bwe_receiver.is_none()
                && state.header_ids.contains_key(ABS_SEND_TIME_URI)
            {
                let mut estimator = RembReceiver::new();
                estimator.set_max_incoming_bitrate(self.options.max_incoming_bitrate);
                estimator.set_min_incoming_bitrate(self.options.min_incoming_bitrate);
                state.bwe_receiver = Some(estimator);
            }
            receiver
        };
        Ok(receiver)
    }

    /// Creates a sender forwarding `receiver` (which may belong to another
    /// connection) to this connection's peer.
    pub fn new_sender(
        self: &Arc<Self>,
        options: SenderOptions,
        receiver: &Arc<Receiver>,
    ) -> Result<Arc<Sender>, Error> {
        if receiver.is_closed() {
            return Err(Error::ReceiverNotExist);
        }
        let mut options = options;
        if options.id.is_empty() {
            options.id = random_id();
        }
        if options.receiver_id.is_empty() {
            options.receiver_id = receiver.id().to_string();
        }

        let sender = {
            let mut state = self.state.lock();
            let requested_codec = match options.codec.take() {
                Some(codec) => {
                    register_codec(&mut state.codecs, &codec)?;
                    codec
                }
                None => receiver.codec(),
            };
            let codec = reuse_or_assign_codec(&mut state.codecs, requested_codec)?;

            let mut headers = if options.header_extensions.is_empty() {
                receiver.header_extensions()
            } else {
                std::mem::take(&mut options.header_extensions)
            };
            headers.retain(|extension| keep_extension_for_bwe(&extension.uri, self.options.bwe));
            if self.options.bwe == BweKind::Remb
                && !headers.iter().any(|h| h.uri == ABS_SEND_TIME_URI)
            {
                headers.push(HeaderExtension::unassigned(ABS_SEND_TIME_URI));
            }
            // The sender assigns fresh IDs in this connection's space and
            // remaps each packet's extensions from the receiver's IDs.
            let unassigned: Vec<HeaderExtension> = headers
                .iter()
                .map(|h| HeaderExtension::unassigned(&h.uri))
                .collect();
            let assigned = assign_header_ids(&mut state.header_ids, &unassigned)?;
            let mut header_map = HashMap::new();
            for receiver_extension in receiver.header_extensions() {
                if let Some(out) = assigned
                    .iter()
                    .find(|extension| extension.uri == receiver_extension.uri)
                {
                    header_map.insert(receiver_extension.id, out.id);
                }
            }

            let out_ssrc = generate_unused_ssrc(&mut state.used_ssrcs);
            let rtx_ssrc = (receiver.has_rtx() && codec.rtx_payload_type.is_some())
                .then(|| generate_unused_ssrc(&mut state.used_ssrcs));
            let stream_option = StreamOption {
                ssrc: Some(out_ssrc),
                rtx_ssrc,
                cname: receiver.cname(),
                ..Default::default()
            };

            let simulcast_layers = if receiver.kind() == ReceiverKind::Simulcast {
                receiver.layer_snapshot(0).len()
            } else {
                1
            };
            let sender = Sender::new(
                &options,
                codec,
                HeaderExtensionIds::from_extensions(&assigned),
                header_map,
                stream_option,
                simulcast_layers,
                Arc::downgrade(self),
                receiver,
            );
            state.senders.push(sender.clone());
            state.senders_by_ssrc.insert(out_ssrc, sender.clone());
            if let Some(rtx_ssrc) = rtx_ssrc {
                state.senders_by_rtx_ssrc.insert(rtx_ssrc, sender.clone());
            }
            if self.options.bwe == BweKind::Remb && state.bwe_sender.is_none() {
                state.bwe_sender = Some(RembSender::new(
                    self.options.initial_available_outgoing_bitrate,
                ));
            }
            sender
        };

        receiver.attach_sender(sender.clone());
        if self.transport.is_connected() {
            sender.transport_connected(unix_ms());
        }
        Ok(sender)
    }

    /// Transport ingest: a decrypted RTP datagram.
    pub fn receive_rtp(&self, data: &[u8], now_ms: i64) {
        let mut packet = match Packet::parse(data, now_ms) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("invalid RTP: {}", err);
                debug!("{}", hex::encode(&data[..data.len().min(100)]));
                return;
            }
        };
        self.receive_rtp_packet(&mut packet);
    }

    /// Same as [`Connection::receive_rtp`] for an already-parsed packet.
    pub fn receive_rtp_packet(&self, packet: &mut Packet) {
        let now_ms = packet.receive_ms();
        self.stats.record_incoming_rtp(packet.size(), now_ms);

        let (bwe_feedback, receiver) = {
            let mut state = self.state.lock();
            let abs_send_time = state
                .header_ids
                .get(ABS_SEND_TIME_URI)
                .copied()
                .and_then(|id| packet.read_abs_send_time(id));
            let bwe_feedback = match (state.bwe_receiver.as_mut(), abs_send_time) {
                (Some(bwe), Some(abs)) => {
                    bwe.incoming_packet(now_ms, packet.size(), packet.ssrc(), abs)
                }
                _ => None,
            };
            let state = &mut *state;
            let receiver = state.rtp_table.get(packet, &state.header_ids);
            (bwe_feedback, receiver)
        };

        if let Some(remb) = bwe_feedback {
            self.send_rtcp_packets(&[RtcpPacket::Remb(remb)]);
        }
        match receiver {
            Some(receiver) => {
                receiver.receive_rtp(packet);
            }
            None => {
                warn!("no receiver for packet ssrc {}", packet.ssrc());
            }
        }
    }

    /// Transport ingest: a decrypted RTCP compound packet.
    pub fn receive_rtcp(&self, data: &[u8], now_ms: i64) {
        let packets = match RtcpPacket::parse_compound(data) {
            Ok(packets) => packets,
            Err(err) => {
                warn!("invalid RTCP: {}", err);
                return;
            }
        };
        for packet in packets {
            self.handle_rtcp(packet, now_ms);
        }
    }

    fn handle_rtcp(&self, packet: RtcpPacket, now_ms: i64) {
        match packet {
            RtcpPacket::ReceiverReport(rr) => {
                for report in rr.reports {
                    let sender = self.sender_by_ssrc(report.ssrc);
                    if let Some(sender) = sender {
                        sender.process_receiver_report(&report);
                    }
                    // Unknown SSRCs are routinely the RTX stream's RR.
                }
            }
            RtcpPacket::Pli(pli) => {
                match self.sender_by_ssrc(pli.media_ssrc) {
                    Some(sender) => sender.request_keyframe(now_ms),
                    None => warn!("keyframe request for unknown ssrc {}", pli.media_ssrc),
                }
            }
            RtcpPacket::Fir(fir) => {
                for entry in &fir.entries {
                    match self.sender_by_ssrc(entry.ssrc) {
                        Some(sender) => sender.request_keyframe(now_ms),
                        None => warn!("FIR for unknown ssrc {}", entry.ssrc),
                    }
                }
            }
            RtcpPacket::Nack(nack) => {
                if let Some(sender) = self.sender_by_ssrc(nack.media_ssrc) {
                    sender.receive_nack(&nack.seqnums, now_ms);
                }
            }
            RtcpPacket::Remb(remb) => {
                let mut state = self.state.lock();
                if let Some(bwe_sender) = state.bwe_sender.as_mut() {
                    bwe_sender.receive_remb(remb.bitrate_bps);
                }
            }
            RtcpPacket::SenderReport(sr) => {
                let receiver = self.state.lock().rtp_table.get_by_ssrc(sr.ssrc);
                if let Some(receiver) = receiver {
                    receiver.process_sender_report(&sr, now_ms);
                }
            }
            RtcpPacket::SourceDescription(_) | RtcpPacket::Bye(_) => {}
        }
    }

    fn sender_by_ssrc(&self, ssrc: Ssrc) -> Option<Arc<Sender>> {
        let state = self.state.lock();
        state
            .senders_by_ssrc
            .get(&ssrc)
            .or_else(|| state.senders_by_rtx_ssrc.get(&ssrc))
            .cloned()
    }

    /// Egress: stamps abs-send-time (when REMB is on) and hands the packet
    /// to the transport.
    pub(crate) fn send_rtp_packet(&self, packet: &Packet, now_ms: i64) {
        if !self.transport.is_connected() {
            return;
        }
        let abs_id = if self.options.bwe == BweKind::Remb {
            self.state.lock().header_ids.get(ABS_SEND_TIME_URI).copied()
        } else {
            None
        };
        if let Some(id) = abs_id {
            let mut stamped = packet.clone();
            stamped.update_abs_send_time(id, now_ms);
            self.stats.record_outgoing_rtp(stamped.size(), now_ms);
            self.transport.send_rtp(&stamped);
            return;
        }
        self.stats.record_outgoing_rtp(packet.size(), now_ms);
        self.transport.send_rtp(packet);
    }

    pub(crate) fn send_rtcp_packets(&self, packets: &[RtcpPacket]) {
        if packets.is_empty() {
            return;
        }
        self.transport.send_rtcp(packets);
    }

    /// Splits the estimated outgoing bitrate over the senders: simple
    /// senders take their stream's rate off the top, simulcast senders
    /// round-robin up through layer costs until the budget runs out.
    pub(crate) fn need_bitrate_change(&self, now_ms: i64) {
        let (estimate, senders) = {
            let state = self.state.lock();
            let Some(bwe_sender) = state.bwe_sender.as_ref() else {
                return;
            };
            (bwe_sender.estimate(), state.senders.clone())
        };

        let mut bitrate = estimate.as_bps() as i64;
        let mut simulcast: Vec<(Arc<Sender>, i32)> = Vec::new();
        for sender in senders {
            if sender.is_simulcast() {
                simulcast.push((sender, -1));
            } else {
                bitrate -= sender.get_bitrate(0, now_ms) as i64;
            }
        }
        if simulcast.is_empty() {
            return;
        }
        debug!("bitrate left for simulcast: {}", bitrate);

        while bitrate > 0 {
            let before = bitrate;
            for (sender, layer) in simulcast.iter_mut() {
                let next = *layer + 1;
                let expected = sender.get_bitrate(next, now_ms) as i64;
                if expected >= bitrate {
                    *layer = next;
                    bitrate = 0;
                    break;
                }
                bitrate -= expected;
                *layer = next;
            }
            if before == bitrate {
                // Nobody wants more bitrate.
                break;
            }
        }

        for (sender, layer) in simulcast {
            sender.update_target_layer(layer.max(0), true, now_ms);
        }
    }

    /// The transport finished ICE/DTLS: activate senders and start the
    /// timer task.
    pub fn transport_connected(self: &Arc<Self>) {
        let senders = {
            let mut state = self.state.lock();
            if state.connected || state.closed {
                return;
            }
            state.connected = true;
            state.senders.clone()
        };
        let now_ms = unix_ms();
        for sender in senders {
            sender.transport_connected(now_ms);
        }
        self.spawn_tick_loop();
        self.notify_state(TransportState::Connected);
    }

    /// The transport dropped; everything cascades closed.
    pub fn transport_disconnected(&self) {
        self.notify_state(TransportState::Disconnected);
        let (receivers, senders) = {
            let mut state = self.state.lock();
            state.connected = false;
            (state.receivers.clone(), state.senders.clone())
        };
        for receiver in receivers {
            receiver.close();
        }
        for sender in senders {
            sender.transport_disconnected();
        }
    }

    /// Close is idempotent: closes receivers and senders, then the
    /// transport, then stops the timer.
    pub fn close(&self) {
        let (receivers, senders) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.receivers.clone(), state.senders.clone())
        };
        for receiver in receivers {
            receiver.close();
        }
        for sender in senders {
            sender.close();
        }
        self.transport.close();
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn remove_receiver(&self, id: &str) {
        let mut state = self.state.lock();
        state.rtp_table.remove_receiver(id);
        state.receivers.retain(|receiver| receiver.id() != id);
    }

    pub(crate) fn remove_sender(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(sender) = state
            .senders
            .iter()
            .find(|sender| sender.id() == id)
            .cloned()
        {
            if let Some(ssrc) = sender.ssrc() {
                state.senders_by_ssrc.remove(&ssrc);
            }
            if let Some(rtx_ssrc) = sender.rtx_ssrc() {
                state.senders_by_rtx_ssrc.remove(&rtx_ssrc);
            }
        }
        state.senders.retain(|sender| sender.id() != id);
    }

    fn spawn_tick_loop(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; drive Connection ticks manually");
            return;
        };
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(TICK_INTERVAL_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                if connection.is_closed() {
                    return;
                }
                let now_ms = unix_ms();
                connection.tick_nack(now_ms);
                ticks += 1;
                if ticks % RTCP_TICKS_PER_NACK_TICKS == 0 {
                    connection.tick_rtcp(now_ms);
                }
            }
        });
        *self.tick_task.lock() = Some(task);
    }

    /// 40 ms cadence: NACK retry batches.
    pub fn tick_nack(&self, now_ms: i64) {
        let receivers = self.state.lock().receivers.clone();
        for receiver in receivers {
            let feedback = receiver.tick_nack(now_ms);
            self.send_rtcp_packets(&feedback);
        }
    }

    /// 200 ms cadence: keyframe retries, inactivity, and the jittered
    /// compound SR/RR emission.
    pub fn tick_rtcp(&self, now_ms: i64) {
        let (receivers, senders) = {
            let state = self.state.lock();
            (state.receivers.clone(), state.senders.clone())
        };
        for receiver in &receivers {
            let feedback = receiver.tick(now_ms);
            self.send_rtcp_packets(&feedback);
        }

        let last = self.last_compound_rtcp_ms.load(Ordering::Relaxed);
        let due = now_ms - last > RTCP_FORCE_INTERVAL_MS
            || rand::thread_rng().gen_range(0..10) == 0;
        if !due {
            return;
        }
        self.last_compound_rtcp_ms.store(now_ms, Ordering::Relaxed);
        // Sent separately rather than as one compound to stay under MTU.
        for sender in &senders {
            if let Some(packets) = sender.get_rtcp(now_ms) {
                self.send_rtcp_packets(&packets);
            }
        }
        for receiver in &receivers {
            if let Some(packets) = receiver.get_rtcp(now_ms) {
                self.send_rtcp_packets(&packets);
            }
        }
    }

    fn notify_state(&self, state: TransportState) {
        if let Some(callback) = self.on_state_change.lock().as_ref() {
            callback(state);
        }
    }
}

fn keep_extension_for_bwe(uri: &str, bwe: BweKind) -> bool {
    if uri == ABS_SEND_TIME_URI {
        return bwe == BweKind::Remb;
    }
    // The transport-CC variant of congestion control is not implemented.
    uri != TRANSPORT_CC_URI
}

/// Validates a caller-specified codec against the table. Same payload
/// type requires the same codec; the RTX payload type must be free.
fn register_codec(
    codecs: &mut HashMap<PayloadType, Codec>,
    codec: &Codec,
) -> Result<(), Error> {
    if let Some(existing) = codecs.get(&codec.payload_type) {
        if !existing.matches(codec) {
            return Err(Error::PayloadMismatch);
        }
    }
    if let Some(rtx_payload_type) = codec.rtx_payload_type {
        if codecs.contains_key(&rtx_payload_type) {
            return Err(Error::RtxPayloadMismatch);
        }
    }
    codecs.insert(codec.payload_type, codec.clone());
    Ok(())
}

/// Reuses an equal codec's assignment or allocates a fresh payload type.
fn reuse_or_assign_codec(
    codecs: &mut HashMap<PayloadType, Codec>,
    codec: Codec,
) -> Result<Codec, Error> {
    if let Some(existing) = codecs.values().find(|existing| existing.matches(&codec)) {
        return Ok(existing.clone());
    }
    let mut codec = codec;
    let payload_type = PAYLOAD_TYPE_RANGE
        .clone()
        .find(|pt| !codecs.contains_key(pt))
        .ok_or(Error::PayloadTypesExhausted)?;
    codec.payload_type = payload_type;
    codecs.insert(payload_type, codec.clone());
    Ok(codec)
}

/// Enforces existing URI→ID assignments and allocates IDs for new URIs;
/// the request is validated in full before the table is touched.
fn assign_header_ids(
    table: &mut HashMap<String, u8>,
    requested: &[HeaderExtension],
) -> Result<Vec<HeaderExtension>, Error> {
    let mut claimed: HashSet<u8> = table.values().copied().collect();
    for extension in requested {
        match table.get(&extension.uri) {
            Some(&id) => {
                if extension.id != 0 && extension.id != id {
                    return Err(Error::HeaderIdMismatch);
                }
            }
            None => {
                if extension.id != 0 {
                    if claimed.contains(&extension.id) {
                        return Err(Error::HeaderIdMismatch);
                    }
                    claimed.insert(extension.id);
                }
            }
        }
    }

    let mut assigned = Vec::with_capacity(requested.len());
    for extension in requested {
        let id = match table.get(&extension.uri) {
            Some(&id) => id,
            None => {
                let id = if extension.id != 0 {
                    extension.id
                } else {
                    let free = HEADER_ID_RANGE
                        .clone()
                        .find(|id| !table.values().any(|used| used == id))
                        .ok_or(Error::HeaderIdsExhausted)?;
                    free
                };
                table.insert(extension.uri.clone(), id);
                id
            }
        };
        assigned.push(HeaderExtension {
            uri: extension.uri.clone(),
            id,
            encrypted: extension.encrypted,
        });
    }
    Ok(assigned)
}

fn generate_unused_ssrc(used: &mut HashSet<Ssrc>) -> Ssrc {
    loop {
        let ssrc = generate_ssrc();
        if used.insert(ssrc) {
            return ssrc;
        }
    }
}

fn random_id() -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::{
        codec::RtcpFeedback,
        rtp::{ntp_from_unix_ms, packet::abs_send_time_from_ms},
        stream::MediaType,
        transport::TransportInfo,
    };

    struct MockTransport {
        connected: AtomicBool,
        rtp: Mutex<Vec<Packet>>,
        rtcp: Mutex<Vec<RtcpPacket>>,
    }

    impl MockTransport {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                rtp: Mutex::new(Vec::new()),
                rtcp: Mutex::new(Vec::new()),
            })
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn sent_rtp(&self) -> Vec<Packet> {
            self.rtp.lock().clone()
        }

        fn sent_rtcp(&self) -> Vec<RtcpPacket> {
            self.rtcp.lock().clone()
        }

        fn clear(&self) {
            self.rtp.lock().clear();
            self.rtcp.lock().clear();
        }
    }

    impl Transport for MockTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_rtp(&self, packet: &Packet) {
            self.rtp.lock().push(packet.clone());
        }

        fn send_rtcp(&self, packets: &[RtcpPacket]) {
            self.rtcp.lock().extend_from_slice(packets);
        }

        fn info(&self) -> TransportInfo {
            TransportInfo::default()
        }

        fn close(&self) {
            self.set_connected(false);
        }
    }

    fn video_codec(encoder: &str, payload_type: PayloadType) -> Codec {
        let mut codec = Codec::new(encoder, payload_type, 90_000);
        codec.feedback.push(RtcpFeedback::new("nack", ""));
        codec.feedback.push(RtcpFeedback::new("nack", "pli"));
        codec
    }

    // An H264 payload padded so the whole packet serializes to `total`.
    fn h264_payload(keyframe: bool, total_size: usize) -> Vec<u8> {
        let mut payload = vec![if keyframe { 0x67 } else { 0x61 }, 0x42];
        payload.resize(total_size - 12, 0);
        payload
    }

    fn rtp_bytes(
        payload_type: PayloadType,
        seq: u16,
        timestamp: u32,
        ssrc: Ssrc,
        marker: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        Packet::write(marker, payload_type, seq, timestamp, ssrc, &[], payload)
            .into_serialized()
    }

    fn nacks(packets: &[RtcpPacket]) -> Vec<&crate::rtp::rtcp::TransportLayerNack> {
        packets
            .iter()
            .filter_map(|packet| match packet {
                RtcpPacket::Nack(nack) => Some(nack),
                _ => None,
            })
            .collect()
    }

    fn plis(packets: &[RtcpPacket]) -> Vec<Ssrc> {
        packets
            .iter()
            .filter_map(|packet| match packet {
                RtcpPacket::Pli(pli) => Some(pli.media_ssrc),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_simple_forwarding_rewrites_and_counts() {
        let publisher_transport = MockTransport::new(true);
        let publisher = Connection::new(
            "pub",
            publisher_transport.clone(),
            ConnectionOptions::default(),
        );
        let mut options =
            ReceiverOptions::new("r1", "0", MediaType::Video, video_codec("H264", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        let receiver = publisher.new_receiver(options).unwrap();

        let subscriber_transport = MockTransport::new(true);
        let subscriber = Connection::new(
            "sub",
            subscriber_transport.clone(),
            ConnectionOptions::default(),
        );
        let sender = subscriber
            .new_sender(SenderOptions::default(), &receiver)
            .unwrap();

        for seq in 1..=10u16 {
            let payload = h264_payload(seq == 1, 1200);
            let bytes = rtp_bytes(96, seq, seq as u32 * 3000, 1000, seq == 10, &payload);
            assert_eq!(1200, bytes.len());
            publisher.receive_rtp(&bytes, seq as i64 * 10);
        }

        let forwarded = subscriber_transport.sent_rtp();
        assert_eq!(10, forwarded.len());
        let out_ssrc = sender.ssrc().unwrap();
        assert!((800_000_000..900_000_000).contains(&out_ssrc));
        let out_pt = sender.codec().payload_type;
        for packet in &forwarded {
            assert_eq!(out_ssrc, packet.ssrc());
            assert_eq!(out_pt, packet.payload_type());
        }
        assert!(forwarded[9].marker());
        assert!(!forwarded[8].marker());

        let stats = publisher.stats().snapshot(1000);
        assert_eq!(10, stats.packets_received);
        assert_eq!(12_000, stats.bytes_received);
        let sub_stats = subscriber.stats().snapshot(1000);
        assert_eq!(10, sub_stats.packets_sent);
    }

    #[test]
    fn test_nack_recovery_cycle() {
        let publisher_transport = MockTransport::new(true);
        let publisher = Connection::new(
            "pub",
            publisher_transport.clone(),
            ConnectionOptions::default(),
        );
        let mut options =
            ReceiverOptions::new("r1", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        publisher.new_receiver(options).unwrap();

        let vp8_key = [0x10u8, 0x00, 0x9d];
        let vp8_delta = [0x10u8, 0x01, 0x9d];
        for (seq, payload) in [
            (1u16, &vp8_key),
            (2, &vp8_delta),
            (3, &vp8_delta),
            (5, &vp8_delta),
            (6, &vp8_delta),
        ] {
            let bytes = rtp_bytes(96, seq, 3000, 1000, false, payload);
            publisher.receive_rtp(&bytes, seq as i64 * 10);
        }
        let sent = publisher_transport.sent_rtcp();
        let nack_packets = nacks(&sent);
        assert_eq!(1, nack_packets.len());
        assert_eq!(1000, nack_packets[0].media_ssrc);
        assert_eq!(vec![4u16], nack_packets[0].seqnums);

        // The publisher retransmits seq 4 (as plain media here).
        publisher_transport.clear();
        let bytes = rtp_bytes(96, 4, 3000, 1000, false, &vp8_delta);
        publisher.receive_rtp(&bytes, 100);
        // No more NACKs for it, even after retry ticks.
        publisher.tick_nack(500);
        publisher.tick_nack(1000);
        assert!(nacks(&publisher_transport.sent_rtcp()).is_empty());
    }

    #[test]
    fn test_simulcast_switch_keeps_timestamps_and_seqnums_continuous() {
        let publisher_transport = MockTransport::new(true);
        let publisher = Connection::new(
            "pub",
            publisher_transport.clone(),
            ConnectionOptions::default(),
        );
        let mut options =
            ReceiverOptions::new("r1", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        options.streams.push(StreamOption::with_ssrc(1001));
        options.streams.push(StreamOption::with_ssrc(1002));
        let receiver = publisher.new_receiver(options).unwrap();

        // Subscriber whose transport is still handshaking, so the initial
        // layer choice is ours to make.
        let subscriber_transport = MockTransport::new(false);
        let subscriber = Connection::new(
            "sub",
            subscriber_transport.clone(),
            ConnectionOptions::default(),
        );
        let sender = subscriber
            .new_sender(SenderOptions::default(), &receiver)
            .unwrap();
        assert!(sender.is_simulcast());
        sender.update_layer(0, 0);
        subscriber_transport.set_connected(true);
        subscriber.transport_connected();

        // A keyframe on layer 0 starts the forwarding.
        let vp8_key = [0x10u8, 0x00, 0x9d];
        publisher.receive_rtp(&rtp_bytes(96, 20, 95_000, 1000, false, &vp8_key), 10);
        let forwarded = subscriber_transport.sent_rtp();
        assert_eq!(1, forwarded.len());
        assert_eq!(95_000, forwarded[0].timestamp());
        let first_out_seq = forwarded[0].sequence_number();
        assert_eq!(0, sender.current_layer());

        // Sender reports on layers 0 and 2, 100 ms apart in NTP time.
        let sr0 = RtcpPacket::SenderReport(crate::rtp::rtcp::SenderReport {
            ssrc: 1000,
            ntp: ntp_from_unix_ms(1_000_000),
            rtp_timestamp: 90_000,
            packet_count: 1,
            octet_count: 100,
            reports: vec![],
        });
        let sr2 = RtcpPacket::SenderReport(crate::rtp::rtcp::SenderReport {
            ssrc: 1002,
            ntp: ntp_from_unix_ms(1_000_100),
            rtp_timestamp: 99_000,
            packet_count: 1,
            octet_count: 100,
            reports: vec![],
        });
        publisher.receive_rtcp(&RtcpPacket::write_compound(&[sr0, sr2]), 20);

        // Ask for the top layer: a keyframe demand lands on its SSRC.
        publisher_transport.clear();
        sender.update_layer(2, 30);
        assert_eq!(2, sender.target_layer());
        assert_eq!(0, sender.current_layer());
        assert!(plis(&publisher_transport.sent_rtcp()).contains(&1002));

        // Delta frames on the old layer keep flowing; frames on the new
        // layer wait for a keyframe.
        let vp8_delta = [0x10u8, 0x01, 0x9d];
        publisher.receive_rtp(&rtp_bytes(96, 21, 95_100, 1000, false, &vp8_delta), 40);
        publisher.receive_rtp(&rtp_bytes(96, 39, 99_000, 1002, false, &vp8_delta), 45);
        assert_eq!(2, subscriber_transport.sent_rtp().len());

        // The keyframe arrives on layer 2: the switch happens with the
        // timestamp offset reconciled to zero and the seq space continuous.
        publisher.receive_rtp(&rtp_bytes(96, 40, 99_010, 1002, false, &vp8_key), 50);
        let forwarded = subscriber_transport.sent_rtp();
        assert_eq!(3, forwarded.len());
        let switched = &forwarded[2];
        assert_eq!(99_010, switched.timestamp());
        assert_eq!(first_out_seq.wrapping_add(2), switched.sequence_number());
        assert_eq!(2, sender.current_layer());
    }

    #[test]
    fn test_remb_probe_produces_feedback() {
        let transport = MockTransport::new(true);
        let options = ConnectionOptions {
            bwe: BweKind::Remb,
            ..Default::default()
        };
        let connection = Connection::new("pub", transport.clone(), options);
        let mut receiver_options =
            ReceiverOptions::new("r1", "0", MediaType::Video, video_codec("VP8", 96));
        receiver_options.streams.push(StreamOption::with_ssrc(1));
        receiver_options
            .header_extensions
            .push(HeaderExtension::new(ABS_SEND_TIME_URI, 3));
        connection.new_receiver(receiver_options).unwrap();

        // Five 1000-byte packets sent 10 ms apart arriving 5 ms apart: a
        // probe cluster showing the path drains faster than the send rate.
        let vp8_key = [0x10u8, 0x00];
        for i in 0..5i64 {
            let abs = abs_send_time_from_ms(i * 10).to_be_bytes();
            let mut payload = vp8_key.to_vec();
            payload.resize(980, 0);
            let bytes = Packet::write(
                false,
                96,
                i as u16 + 1,
                90_000 + i as u32 * 900,
                1,
                &[(3, &abs[1..4])],
                &payload,
            )
            .into_serialized();
            assert_eq!(1000, bytes.len());
            connection.receive_rtp(&bytes, i * 5);
        }

        let rembs: Vec<_> = transport
            .sent_rtcp()
            .into_iter()
            .filter_map(|packet| match packet {
                RtcpPacket::Remb(remb) => Some(remb),
                _ => None,
            })
            .collect();
        assert_eq!(1, rembs.len());
        assert!(
            (800_000..=810_000).contains(&rembs[0].bitrate_bps),
            "bitrate {}",
            rembs[0].bitrate_bps
        );
        assert_eq!(vec![1u32], rembs[0].ssrcs);
    }

    #[test]
    fn test_codec_collision_rejected() {
        let transport = MockTransport::new(true);
        let connection = Connection::new("pub", transport, ConnectionOptions::default());

        let mut options =
            ReceiverOptions::new("a", "0", MediaType::Video, video_codec("H264", 100));
        options.streams.push(StreamOption::with_ssrc(1000));
        connection.new_receiver(options).unwrap();

        let mut colliding =
            ReceiverOptions::new("b", "1", MediaType::Video, video_codec("VP9", 100));
        colliding.streams.push(StreamOption::with_ssrc(2000));
        assert_eq!(
            Err(Error::PayloadMismatch),
            connection.new_receiver(colliding).map(|_| ())
        );

        // The table still holds H264: an equal codec re-registers fine.
        let mut same = ReceiverOptions::new("c", "2", MediaType::Video, video_codec("H264", 100));
        same.streams.push(StreamOption::with_ssrc(3000));
        connection.new_receiver(same).unwrap();
    }

    #[test]
    fn test_duplicate_mid_and_ssrc_rejected() {
        let transport = MockTransport::new(true);
        let connection = Connection::new("pub", transport, ConnectionOptions::default());

        let mut options =
            ReceiverOptions::new("a", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        connection.new_receiver(options).unwrap();

        let mut dup_mid = ReceiverOptions::new("b", "0", MediaType::Video, video_codec("VP8", 96));
        dup_mid.streams.push(StreamOption::with_ssrc(2000));
        assert_eq!(
            Err(Error::MidExists),
            connection.new_receiver(dup_mid).map(|_| ())
        );

        let mut dup_ssrc = ReceiverOptions::new("c", "1", MediaType::Video, video_codec("VP8", 96));
        dup_ssrc.streams.push(StreamOption::with_ssrc(1000));
        assert_eq!(
            Err(Error::SsrcExists),
            connection.new_receiver(dup_ssrc).map(|_| ())
        );
    }

    #[test]
    fn test_header_id_conflict_rejected() {
        let transport = MockTransport::new(true);
        let connection = Connection::new("pub", transport, ConnectionOptions::default());

        let mut options =
            ReceiverOptions::new("a", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        options
            .header_extensions
            .push(HeaderExtension::new(crate::rtp::MID_URI, 4));
        connection.new_receiver(options).unwrap();

        // The same URI must keep its ID connection-wide.
        let mut conflicting =
            ReceiverOptions::new("b", "1", MediaType::Video, video_codec("VP8", 96));
        conflicting.streams.push(StreamOption::with_ssrc(2000));
        conflicting
            .header_extensions
            .push(HeaderExtension::new(crate::rtp::MID_URI, 5));
        assert_eq!(
            Err(Error::HeaderIdMismatch),
            connection.new_receiver(conflicting).map(|_| ())
        );
    }

    #[test]
    fn test_sender_creation_requires_open_receiver() {
        let transport = MockTransport::new(true);
        let publisher = Connection::new("pub", transport, ConnectionOptions::default());
        let mut options =
            ReceiverOptions::new("a", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        let receiver = publisher.new_receiver(options).unwrap();
        receiver.close();

        let subscriber_transport = MockTransport::new(true);
        let subscriber =
            Connection::new("sub", subscriber_transport, ConnectionOptions::default());
        assert_eq!(
            Err(Error::ReceiverNotExist),
            subscriber
                .new_sender(SenderOptions::default(), &receiver)
                .map(|_| ())
        );
    }

    #[test]
    fn test_subscriber_nack_is_served_from_replay() {
        let publisher_transport = MockTransport::new(true);
        let publisher = Connection::new(
            "pub",
            publisher_transport,
            ConnectionOptions::default(),
        );
        let mut options =
            ReceiverOptions::new("r1", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        let receiver = publisher.new_receiver(options).unwrap();

        let subscriber_transport = MockTransport::new(true);
        let subscriber = Connection::new(
            "sub",
            subscriber_transport.clone(),
            ConnectionOptions::default(),
        );
        let sender = subscriber
            .new_sender(SenderOptions::default(), &receiver)
            .unwrap();

        let vp8_key = [0x10u8, 0x00, 0x9d];
        let vp8_delta = [0x10u8, 0x01, 0x9d];
        publisher.receive_rtp(&rtp_bytes(96, 1, 3000, 1000, false, &vp8_key), 10);
        publisher.receive_rtp(&rtp_bytes(96, 2, 6000, 1000, false, &vp8_delta), 20);
        let forwarded = subscriber_transport.sent_rtp();
        assert_eq!(2, forwarded.len());
        let lost = &forwarded[1];

        // The subscriber NACKs the second forwarded packet.
        subscriber_transport.clear();
        let nack = RtcpPacket::Nack(crate::rtp::rtcp::TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: sender.ssrc().unwrap(),
            seqnums: vec![lost.sequence_number()],
        });
        subscriber.receive_rtcp(&RtcpPacket::write_compound(&[nack]), 100);

        let resent = subscriber_transport.sent_rtp();
        assert_eq!(1, resent.len());
        assert_eq!(lost.sequence_number(), resent[0].sequence_number());
        assert_eq!(lost.payload(), resent[0].payload());
    }

    #[test]
    fn test_close_is_idempotent_and_cascades() {
        let transport = MockTransport::new(true);
        let connection = Connection::new("pub", transport.clone(), ConnectionOptions::default());
        let mut options =
            ReceiverOptions::new("a", "0", MediaType::Video, video_codec("VP8", 96));
        options.streams.push(StreamOption::with_ssrc(1000));
        let receiver = connection.new_receiver(options).unwrap();

        connection.close();
        assert!(connection.is_closed());
        assert!(receiver.is_closed());
        assert!(!transport.is_connected());
        assert!(connection.receivers().is_empty());
        // A second close is a no-op.
        connection.close();
    }
}
