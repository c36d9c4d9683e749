// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data model shared by the courier dispatch client and its tooling:
//! identifiers, message policies, wire envelopes, payload containers,
//! timestamps, externally visible errors and the configuration document.

pub mod config;
pub mod envelope;
pub mod error;
pub mod identifiers;
pub mod payload;
pub mod policy;
pub mod time;
