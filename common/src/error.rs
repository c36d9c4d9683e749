// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

use crate::identifiers::ServiceName;

/// Externally visible submission failures. The numeric codes are wire stable
/// and reported by the statistics endpoint.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unclassified failure: {0}")]
    Unknown(String),
    #[error("message data exceeds the 2 GiB limit")]
    MessageDataTooBig,
    #[error("message cache over capacity")]
    MessageCacheOverCapacity,
    #[error("persistent message cache out of room")]
    OverHddCapacity,
    #[error("unknown service {0}, check the configuration")]
    UnknownService(ServiceName),
}

impl ClientError {
    pub fn code(&self) -> u8 {
        match self {
            ClientError::Unknown(_) => 1,
            ClientError::MessageDataTooBig => 2,
            ClientError::MessageCacheOverCapacity => 3,
            ClientError::OverHddCapacity => 4,
            ClientError::UnknownService(_) => 5,
        }
    }
}
