// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport seam.
//!
//! The dispatch core never talks to a concrete wire. It drives three socket
//! shapes: a multi-peer request socket per handle, an ephemeral request/reply
//! socket per discovery probe and a bound reply socket for the statistics
//! endpoint. The [`channel`] module provides the in-process implementation;
//! real network bindings implement the same traits downstream.

pub mod channel;

use std::time::Duration;

use async_trait::async_trait;
use couriercommon::{envelope::Frame, identifiers::Peer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reachable peer")]
    NoPeers,
    #[error("address {0} is already bound")]
    AddressInUse(Peer),
    #[error("socket is closed")]
    Closed,
    #[error("operation timed out")]
    Timeout,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Factory for the socket shapes the dispatch core consumes. Created once
/// and shared by every task that opens a socket.
pub trait Transport: Send + Sync {
    fn request_socket(&self) -> TransportResult<Box<dyn RequestSocket>>;
    fn probe_socket(&self, peer: Peer) -> TransportResult<Box<dyn ProbeSocket>>;
    fn reply_socket(&self, port: u16) -> TransportResult<Box<dyn ReplySocket>>;
}

/// A handle's outbound socket. Messages handed to [`RequestSocket::send`]
/// spread across the connected peers; responses from any of them arrive
/// through the same socket.
#[async_trait]
pub trait RequestSocket: Send {
    /// Connects to an additional peer. Connecting is lazy, an unreachable
    /// peer surfaces as a send failure, not a connect failure.
    fn connect(&mut self, peer: Peer) -> TransportResult<()>;

    /// Atomically hands one frame sequence to the transport.
    async fn send(&mut self, frames: Vec<Frame>) -> TransportResult<()>;

    /// Non-blocking fetch of the next inbound frame sequence.
    fn try_recv(&mut self) -> TransportResult<Option<Vec<Frame>>>;

    /// Waits until inbound frames may be available, up to `timeout`. Returns
    /// whether the socket became readable.
    async fn wait_readable(&mut self, timeout: Duration) -> TransportResult<bool>;
}

/// An ephemeral request/reply socket used for a single discovery probe.
#[async_trait]
pub trait ProbeSocket: Send {
    async fn send(&mut self, request: Vec<u8>) -> TransportResult<()>;
    async fn recv(&mut self, timeout: Duration) -> TransportResult<Vec<u8>>;
}

/// A bound reply socket serving one request at a time.
#[async_trait]
pub trait ReplySocket: Send {
    async fn recv(&mut self) -> TransportResult<Vec<u8>>;
    async fn send(&mut self, reply: Vec<u8>) -> TransportResult<()>;
}
