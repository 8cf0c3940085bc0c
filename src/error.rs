//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration errors surfaced from receiver/sender creation. Per-packet
//! failures never reach here; they are dropped and counted where they
//! happen.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("codec conflicts with one already registered for that payload type")]
    PayloadMismatch,
    #[error("RTX payload type already registered on this connection")]
    RtxPayloadMismatch,
    #[error("header extension ID conflicts with one already assigned")]
    HeaderIdMismatch,
    #[error("no free payload type left on this connection")]
    PayloadTypesExhausted,
    #[error("no free header extension ID left on this connection")]
    HeaderIdsExhausted,
    #[error("MID already in use")]
    MidExists,
    #[error("RID already in use")]
    RidExists,
    #[error("SSRC already in use")]
    SsrcExists,
    #[error("origin receiver does not exist or is closed")]
    ReceiverNotExist,
    #[error("a receiver needs at least one stream")]
    StreamsEmpty,
}
