// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use couriercommon::{
    identifiers::{MessageId, MessagePath},
    payload::DataContainer,
    time::TimeStamp,
};

/// A response delivered to the application callback. Every submitted message
/// sees exactly one terminal response: `Choke`, `PeerError` or
/// `DeadlineExpired`. Any number of `Chunk` responses may precede it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub uuid: MessageId,
    pub path: MessagePath,
    pub kind: ResponseKind,
    pub received_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// A data chunk; the request is still in progress.
    Chunk(DataContainer),
    /// The terminal frame of a completed request.
    Choke,
    /// The peer reported an error for this message.
    PeerError { code: i32, message: String },
    /// The message's deadline passed before the peer answered.
    DeadlineExpired,
}

impl Response {
    pub(crate) fn new(uuid: MessageId, path: MessagePath, kind: ResponseKind) -> Self {
        Self {
            uuid,
            path,
            kind,
            received_at: TimeStamp::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ResponseKind::Chunk(_))
    }
}
