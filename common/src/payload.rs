// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, sync::Arc};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Upper bound on a single message payload.
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Payloads at least this large carry a digest so equality checks do not walk
/// the full buffer.
const FINGERPRINT_THRESHOLD: usize = 512 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    TooBig(usize),
}

/// Immutable shareable byte buffer. Clones share the underlying allocation;
/// large payloads compare by SHA-256 fingerprint.
#[derive(Clone)]
pub struct DataContainer {
    bytes: Arc<[u8]>,
    fingerprint: Option<[u8; 32]>,
}

impl DataContainer {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Result<Self, PayloadError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(PayloadError::TooBig(bytes.len()));
        }
        let fingerprint = (bytes.len() >= FINGERPRINT_THRESHOLD)
            .then(|| Sha256::digest(&bytes).into());
        Ok(Self { bytes, fingerprint })
    }

    pub fn empty() -> Self {
        Self {
            bytes: Arc::from([]),
            fingerprint: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for DataContainer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for DataContainer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.bytes == other.bytes,
            _ => false,
        }
    }
}

impl Eq for DataContainer {}

impl fmt::Debug for DataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("DataContainer");
        s.field("len", &self.bytes.len());
        if let Some(fingerprint) = &self.fingerprint {
            s.field("fingerprint", &hex::encode(&fingerprint[..8]));
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_compare_by_bytes() {
        let a = DataContainer::new(b"hello".to_vec()).unwrap();
        let b = DataContainer::new(b"hello".to_vec()).unwrap();
        let c = DataContainer::new(b"world".to_vec()).unwrap();
        assert!(a.fingerprint.is_none());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn large_payloads_carry_a_fingerprint() {
        let blob = vec![0x5au8; FINGERPRINT_THRESHOLD];
        let a = DataContainer::new(blob.clone()).unwrap();
        let b = DataContainer::new(blob).unwrap();
        assert!(a.fingerprint.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn clones_share_the_allocation() {
        let a = DataContainer::new(vec![1u8, 2, 3]).unwrap();
        let b = a.clone();
        assert!(std::ptr::eq(a.as_slice(), b.as_slice()));
    }

    #[test]
    fn empty_container() {
        let empty = DataContainer::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
    }
}
