// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Discovery and health: per-service host fetchers feed a single prober,
//! which emits membership refreshes the client routes to its services.

mod fetcher;
mod probe;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use couriercommon::{
    config::{AutodiscoveryType, ClientConfig, ServiceConfig},
    identifiers::{HandleInfo, ServiceName},
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::transport::Transport;

use self::fetcher::{HostFetcher, SharedHosts};

/// Cadence of the prober.
const HOSTS_PING_INTERVAL: Duration = Duration::from_secs(1);

/// One atomic membership delivery: every host in `hosts` answered its most
/// recent probe, `handles` is the union of what they advertised.
#[derive(Debug)]
pub(crate) struct Refresh {
    pub service_name: ServiceName,
    pub hosts: Vec<(Ipv4Addr, String)>,
    pub handles: Vec<HandleInfo>,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("multicast autodiscovery is not available in this build")]
    MulticastUnavailable,
}

/// The discovery pipeline. The HTTP variant is the only prober in-tree; a
/// multicast collector would slot in behind the same refresh channel.
pub(crate) struct HeartbeatsCollector {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HeartbeatsCollector {
    pub(crate) fn from_config(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        refresh_tx: mpsc::UnboundedSender<Refresh>,
    ) -> Result<Self, DiscoveryError> {
        match config.autodiscovery.discovery_type {
            AutodiscoveryType::Http => Ok(Self::start_http(
                config.services.values().cloned().collect(),
                transport,
                refresh_tx,
            )),
            AutodiscoveryType::Multicast => Err(DiscoveryError::MulticastUnavailable),
        }
    }

    fn start_http(
        services: Vec<ServiceConfig>,
        transport: Arc<dyn Transport>,
        refresh_tx: mpsc::UnboundedSender<Refresh>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut probed: Vec<(ServiceConfig, SharedHosts)> = Vec::new();

        for service in services {
            let hosts: SharedHosts = Arc::new(Mutex::new(Vec::new()));
            let fetcher = HostFetcher::new(
                service.name.clone(),
                service.hosts_url.clone(),
                hosts.clone(),
            );
            tasks.push(tokio::spawn(fetcher.run(cancel.clone())));
            probed.push((service, hosts));
        }

        let prober = Prober {
            transport,
            probed,
            refresh_tx,
        };
        tasks.push(tokio::spawn(prober.run(cancel.clone())));

        Self { cancel, tasks }
    }

    /// Stops fetchers and prober and joins them.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(error) = task.await {
                error!(%error, "discovery task panicked");
            }
        }
    }
}

struct Prober {
    transport: Arc<dyn Transport>,
    probed: Vec<(ServiceConfig, SharedHosts)>,
    refresh_tx: mpsc::UnboundedSender<Refresh>,
}

impl Prober {
    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(HOSTS_PING_INTERVAL) => {}
            }
            for (service, hosts) in &self.probed {
                let candidates = hosts.lock().clone();
                // nothing fetched yet, nothing to report
                if candidates.is_empty() {
                    continue;
                }
                let refresh = self.probe_service(service, candidates).await;
                if self.refresh_tx.send(refresh).is_err() {
                    return;
                }
            }
        }
    }

    async fn probe_service(
        &self,
        service: &ServiceConfig,
        candidates: Vec<(Ipv4Addr, String)>,
    ) -> Refresh {
        let mut live_hosts = Vec::new();
        let mut per_host: Vec<(Ipv4Addr, Vec<HandleInfo>)> = Vec::new();

        for (ip, hostname) in candidates {
            let Some(handles) = probe::probe_host(&self.transport, ip, service).await else {
                continue;
            };
            live_hosts.push((ip, hostname));
            per_host.push((ip, handles));
        }

        let handles = consistent_union(service, &per_host);
        Refresh {
            service_name: service.name.clone(),
            hosts: live_hosts,
            handles,
        }
    }
}

/// Collapses per-host advertisements into one handle set, keyed by handle
/// name. Every live host is expected to advertise every handle at the same
/// port; discrepancies are logged and the union is emitted so dispatch can
/// proceed. When hosts disagree on a handle's port, the first advertised
/// port wins and the disagreement is reported as a conflict.
fn consistent_union(
    service: &ServiceConfig,
    per_host: &[(Ipv4Addr, Vec<HandleInfo>)],
) -> Vec<HandleInfo> {
    let mut union: Vec<HandleInfo> = Vec::new();
    for (ip, handles) in per_host {
        for handle in handles {
            match union.iter().find(|known| known.name == handle.name) {
                None => union.push(handle.clone()),
                Some(known) if known.port != handle.port => {
                    warn!(
                        service = %service.name,
                        host = %ip,
                        handle = %handle.name,
                        advertised_port = handle.port,
                        accepted_port = known.port,
                        "host advertises a conflicting port for a handle"
                    );
                }
                Some(_) => {}
            }
        }
    }

    for (ip, handles) in per_host {
        for handle in &union {
            if !handles.iter().any(|advertised| advertised.name == handle.name) {
                warn!(
                    service = %service.name,
                    host = %ip,
                    handle = %handle.name,
                    "host does not advertise a handle its peers advertise"
                );
            }
        }
    }

    union
}
