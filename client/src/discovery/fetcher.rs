// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic fetch of a service's candidate host list.
//!
//! The list is plain text, one IPv4 literal per line, optionally followed by
//! a hostname. Parsing is lenient: malformed lines are skipped, a malformed
//! body is just an empty list.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use couriercommon::identifiers::ServiceName;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) const FETCH_INTERVAL: Duration = Duration::from_secs(1);

/// The fetcher's cached host list, shared with the prober and replaced
/// atomically after every successful fetch.
pub(crate) type SharedHosts = Arc<Mutex<Vec<(Ipv4Addr, String)>>>;

pub(crate) fn parse_host_lines(body: &str) -> Vec<(Ipv4Addr, String)> {
    body.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let ip: Ipv4Addr = tokens.next()?.parse().ok()?;
            let hostname = tokens.next().unwrap_or_default().to_string();
            Some((ip, hostname))
        })
        .collect()
}

pub(crate) struct HostFetcher {
    service_name: ServiceName,
    hosts_url: String,
    http: reqwest::Client,
    hosts: SharedHosts,
}

impl HostFetcher {
    pub(crate) fn new(service_name: ServiceName, hosts_url: String, hosts: SharedHosts) -> Self {
        Self {
            service_name,
            hosts_url,
            http: reqwest::Client::new(),
            hosts,
        }
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        loop {
            self.fetch_once().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(FETCH_INTERVAL) => {}
            }
        }
    }

    async fn fetch_once(&self) {
        let response = match self.http.get(&self.hosts_url).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(service = %self.service_name, %error, "host fetch failed");
                return;
            }
        };
        if !response.status().is_success() {
            warn!(
                service = %self.service_name,
                status = %response.status(),
                "host fetch failed"
            );
            return;
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                warn!(service = %self.service_name, %error, "host fetch body unreadable");
                return;
            }
        };
        let hosts = parse_host_lines(&body);
        debug!(
            service = %self.service_name,
            count = hosts.len(),
            "fetched candidate hosts"
        );
        *self.hosts.lock() = hosts;
    }
}
