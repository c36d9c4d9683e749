// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::TimeStamp;

/// Per-message delivery options. Only `deadline` and `timeout` influence the
/// dispatch algorithm; the remaining options travel to the peer verbatim in
/// the message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagePolicy {
    pub urgent: bool,
    pub mailboxed: bool,
    pub send_to_all_hosts: bool,
    /// Per-send retry budget in seconds. An in-flight message older than this
    /// is requeued for another send. Zero disables requeueing.
    pub timeout: f64,
    /// Absolute expiry as seconds since the Unix epoch. Zero disables expiry.
    pub deadline: f64,
    pub max_timeout_retries: u32,
}

impl MessagePolicy {
    pub fn deadline(&self) -> Option<TimeStamp> {
        TimeStamp::from_epoch_secs(self.deadline)
    }

    pub fn per_send_timeout(&self) -> Option<Duration> {
        if self.timeout > 0.0 {
            Some(Duration::from_secs_f64(self.timeout))
        } else {
            None
        }
    }
}
