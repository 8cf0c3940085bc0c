//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The media plane of a selective forwarding unit: per-connection RTP/RTCP
//! state machines for receiving and forwarding encoded streams, NACK/RTX
//! repair, simulcast layer selection, and REMB receive-side bandwidth
//! estimation. ICE, DTLS, SRTP, and signaling live behind the
//! [`transport::Transport`] trait and the caller's SDP layer.

pub mod bwe;
pub mod codec;
pub mod common;
pub mod connection;
pub mod error;
pub mod h264;
pub mod keyframe;
pub mod receiver;
pub mod rtp;
pub mod sender;
pub mod stats;
pub mod stream;
pub mod transport;
pub mod vp8;

pub use connection::{BweKind, Connection, ConnectionOptions, TransportState};
pub use error::Error;
pub use receiver::{ReceiverOptions, ReceptionOutcome};
pub use sender::{SenderOptions, SwitchMode};
pub use stream::{MediaType, StreamOption};
