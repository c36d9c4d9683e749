// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeStamp {
    time: DateTime<Utc>,
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl TimeStamp {
    pub fn now() -> Self {
        let time = Utc::now();
        Self { time }
    }

    /// Interprets fractional seconds since the Unix epoch. Returns `None` for
    /// the zero value, which policies use to disable a deadline.
    pub fn from_epoch_secs(secs: f64) -> Option<Self> {
        if secs <= 0.0 {
            return None;
        }
        let millis = (secs * 1000.0) as i64;
        let time = Utc.timestamp_millis_opt(millis).single()?;
        Some(Self { time })
    }

    pub fn epoch_secs(&self) -> f64 {
        self.time.timestamp_millis() as f64 / 1000.0
    }

    pub fn is_past(&self) -> bool {
        self.time < Utc::now()
    }

    /// Time elapsed since this timestamp, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}
