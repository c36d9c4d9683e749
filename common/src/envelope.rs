// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire envelopes and frame sequences.
//!
//! A message travels as three frames: an empty delimiter, a JSON envelope and
//! the payload bytes (possibly empty). A response arrives as an empty
//! delimiter, a JSON envelope and an optional payload chunk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{identifiers::MessageId, payload::DataContainer, policy::MessagePolicy};

/// One transport frame.
pub type Frame = Vec<u8>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("expected {expected} frames, got {got}")]
    FrameCount { expected: &'static str, got: usize },
    #[error("first frame must be an empty delimiter")]
    MissingDelimiter,
    #[error("could not parse envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response envelope carries no uuid")]
    MissingUuid,
}

/// Header framing an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub urgent: bool,
    pub mailboxed: bool,
    pub timeout: f64,
    pub deadline: f64,
    pub uuid: String,
}

impl MessageEnvelope {
    pub fn new(uuid: MessageId, policy: &MessagePolicy) -> Self {
        Self {
            urgent: policy.urgent,
            mailboxed: policy.mailboxed,
            timeout: policy.timeout,
            deadline: policy.deadline,
            uuid: uuid.to_string(),
        }
    }
}

/// Header framing an inbound response. Missing `completed` and `code` fields
/// decode to their idle values; a missing uuid is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub uuid: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl ResponseEnvelope {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

/// Encodes a message into its three-frame wire form.
pub fn encode_message(
    envelope: &MessageEnvelope,
    payload: &DataContainer,
) -> Result<Vec<Frame>, EnvelopeError> {
    let header = serde_json::to_vec(envelope)?;
    Ok(vec![Vec::new(), header, payload.as_slice().to_vec()])
}

/// Decodes the three-frame form back into envelope and payload frame.
pub fn decode_message(frames: &[Frame]) -> Result<(MessageEnvelope, &[u8]), EnvelopeError> {
    let [delimiter, header, payload] = frames else {
        return Err(EnvelopeError::FrameCount {
            expected: "3",
            got: frames.len(),
        });
    };
    if !delimiter.is_empty() {
        return Err(EnvelopeError::MissingDelimiter);
    }
    let envelope = serde_json::from_slice(header)?;
    Ok((envelope, payload))
}

/// Encodes a response into its wire form. The payload frame is present only
/// for data chunks.
pub fn encode_response(
    envelope: &ResponseEnvelope,
    payload: Option<&[u8]>,
) -> Result<Vec<Frame>, EnvelopeError> {
    let header = serde_json::to_vec(envelope)?;
    let mut frames = vec![Vec::new(), header];
    if let Some(payload) = payload {
        frames.push(payload.to_vec());
    }
    Ok(frames)
}

/// Decodes a two- or three-frame response.
pub fn decode_response(
    frames: &[Frame],
) -> Result<(ResponseEnvelope, Option<&[u8]>), EnvelopeError> {
    let (delimiter, header, payload) = match frames {
        [delimiter, header] => (delimiter, header, None),
        [delimiter, header, payload] => (delimiter, header, Some(payload.as_slice())),
        _ => {
            return Err(EnvelopeError::FrameCount {
                expected: "2 or 3",
                got: frames.len(),
            });
        }
    };
    if !delimiter.is_empty() {
        return Err(EnvelopeError::MissingDelimiter);
    }
    let envelope: ResponseEnvelope = serde_json::from_slice(header)?;
    if envelope.uuid.is_empty() {
        return Err(EnvelopeError::MissingUuid);
    }
    Ok((envelope, payload))
}
