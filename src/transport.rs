//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The transport a connection forwards through. ICE, DTLS, and SRTP live
//! behind this trait; the connection hands it plaintext RTP/RTCP and gets
//! decrypted packets back through [`crate::connection::Connection`]'s
//! receive entry points.

use crate::rtp::{packet::Packet, rtcp::RtcpPacket};

/// Implementations are expected to push writes through a bounded queue
/// (~100 slots) to a single writer that encrypts and hits the socket, so
/// `send_rtp` must not block; dropping on overload is the right behavior
/// for real-time media.
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send_rtp(&self, packet: &Packet);
    fn send_rtcp(&self, packets: &[RtcpPacket]);
    fn info(&self) -> TransportInfo;
    fn close(&self);
}

#[derive(Clone, Debug, Default)]
pub struct TransportInfo {
    pub ice: IceInfo,
    pub dtls: DtlsInfo,
}

#[derive(Clone, Debug, Default)]
pub struct IceInfo {
    pub role: String,
    pub candidates: Vec<String>,
    pub ufrag: String,
    pub pwd: String,
    pub lite: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DtlsInfo {
    pub fingerprints: Vec<Fingerprint>,
    pub role: String,
}

#[derive(Clone, Debug, Default)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}
