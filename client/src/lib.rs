// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side message dispatch.
//!
//! Applications submit opaque payloads addressed by `(service, handle)` and
//! receive responses through a callback. The library discovers worker hosts,
//! spreads load across them, applies per-message deadlines and retry
//! timeouts, and buffers messages locally under a global capacity bound.

mod cache;
mod client;
mod discovery;
mod handle;
mod logging;
mod response;
mod service;
mod statistics;
pub mod transport;

#[cfg(test)]
mod tests;

pub use client::{BuildError, Client, ConnectError, ResponseCallback};
pub use discovery::DiscoveryError;
pub use logging::init_logging;
pub use response::{Response, ResponseKind};

// the shared data model, re-exported for convenience
pub use couriercommon::{
    config::{ClientConfig, ConfigError},
    error::ClientError,
    identifiers::{HandleName, MessageId, MessagePath, Peer, ServiceName},
    payload::{DataContainer, MAX_PAYLOAD_SIZE},
    policy::MessagePolicy,
};
