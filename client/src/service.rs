// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One service: the set of live handles, the parking lot for messages whose
//! handle does not exist yet, and the fan-in queues for responses on their
//! way to the application callback.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use couriercommon::{
    config::ServiceConfig,
    identifiers::{HandleInfo, HandleName, MessagePath},
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheGauge, CachedMessage},
    handle::Handle,
    response::Response,
    transport::Transport,
};

#[derive(Default)]
struct ServiceState {
    hosts: HashMap<Ipv4Addr, String>,
    handles: HashMap<HandleName, Handle>,
    unhandled: HashMap<HandleName, VecDeque<CachedMessage>>,
    received: HashMap<HandleName, VecDeque<Response>>,
}

/// A service owns its handles exclusively; handles never point back. The
/// state lock is held only for map surgery, never across socket work or task
/// joins.
pub(crate) struct Service {
    info: ServiceConfig,
    transport: Arc<dyn Transport>,
    poll_timeout: Duration,
    gauge: Arc<CacheGauge>,
    /// Wakes the client's response consumer after a deposit.
    ready_tx: mpsc::UnboundedSender<MessagePath>,
    state: Mutex<ServiceState>,
}

impl Service {
    pub(crate) fn new(
        info: ServiceConfig,
        transport: Arc<dyn Transport>,
        poll_timeout: Duration,
        gauge: Arc<CacheGauge>,
        ready_tx: mpsc::UnboundedSender<MessagePath>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            transport,
            poll_timeout,
            gauge,
            ready_tx,
            state: Mutex::new(ServiceState::default()),
        })
    }

    /// Routes a submission to its handle, or parks it until the handle
    /// appears. Capacity was reserved by the caller.
    pub(crate) fn submit(&self, message: CachedMessage) {
        let mut state = self.state.lock();
        let handle_name = message.path().handle_name.clone();
        match state.handles.get(&handle_name) {
            Some(handle) => handle.enqueue(message),
            None => {
                state
                    .unhandled
                    .entry(handle_name)
                    .or_default()
                    .push_back(message);
            }
        }
    }

    /// Applies one membership refresh from the heartbeats collector.
    pub(crate) async fn refresh(
        self: &Arc<Self>,
        hosts_now: Vec<(Ipv4Addr, String)>,
        handles_now: Vec<HandleInfo>,
    ) {
        let advertised: HashMap<&HandleName, &HandleInfo> =
            handles_now.iter().map(|info| (&info.name, info)).collect();

        // diff and detach under the lock
        let (removed_handles, hosts_removed, hosts_added, peers) = {
            let mut state = self.state.lock();

            let ips_now: HashSet<Ipv4Addr> = hosts_now.iter().map(|(ip, _)| *ip).collect();
            let hosts_removed: Vec<Ipv4Addr> = state
                .hosts
                .keys()
                .filter(|ip| !ips_now.contains(ip))
                .copied()
                .collect();
            let hosts_added: Vec<Ipv4Addr> = hosts_now
                .iter()
                .map(|(ip, _)| *ip)
                .filter(|ip| !state.hosts.contains_key(ip))
                .collect();
            state.hosts = hosts_now.into_iter().collect();

            let retired: Vec<HandleName> = state
                .handles
                .keys()
                .filter(|name| !advertised.contains_key(name))
                .cloned()
                .collect();
            let removed_handles: Vec<Handle> = retired
                .into_iter()
                .filter_map(|name| state.handles.remove(&name))
                .collect();

            let peers: Vec<Ipv4Addr> = state.hosts.keys().copied().collect();
            (removed_handles, hosts_removed, hosts_added, peers)
        };

        // retire handles outside the lock; their cached messages are re-parked,
        // never discarded
        for handle in removed_handles {
            let name = handle.info().name.clone();
            info!(service = %self.info.name, handle = %name, "retiring handle");
            handle.disconnect();
            let parked = handle.shutdown().await;
            if !parked.is_empty() {
                debug!(
                    service = %self.info.name,
                    handle = %name,
                    count = parked.len(),
                    "re-parking messages of a retired handle"
                );
                self.state
                    .lock()
                    .unhandled
                    .entry(name)
                    .or_default()
                    .extend(parked);
            }
        }

        // steer the survivors
        {
            let state = self.state.lock();
            if !hosts_removed.is_empty() {
                for handle in state.handles.values() {
                    handle.reconnect(peers.clone());
                }
            } else if !hosts_added.is_empty() {
                for handle in state.handles.values() {
                    handle.connect_new_hosts(hosts_added.clone());
                }
            }
        }

        // create the newcomers, seeded with anything parked for their name
        for info in handles_now {
            if self.state.lock().handles.contains_key(&info.name) {
                continue;
            }
            info!(service = %self.info.name, handle = %info.name, "creating handle");
            let sink = self.response_sink(info.name.clone());
            let handle = Handle::spawn(
                info.clone(),
                peers.clone(),
                self.transport.clone(),
                self.poll_timeout,
                self.gauge.clone(),
                sink,
            );
            let mut state = self.state.lock();
            if let Some(parked) = state.unhandled.remove(&info.name) {
                handle.cache().append_queue(parked);
            }
            handle.connect();
            state.handles.insert(info.name.clone(), handle);
        }
    }

    fn response_sink(self: &Arc<Self>, handle_name: HandleName) -> crate::handle::ResponseSink {
        let service = Arc::downgrade(self);
        Arc::new(move |response: Response| {
            let Some(service) = service.upgrade() else {
                return;
            };
            service.deposit_response(&handle_name, response);
        })
    }

    /// Handle-level callbacks land here; the client-owned consumer drains the
    /// queue and invokes the application callback.
    fn deposit_response(&self, handle_name: &HandleName, response: Response) {
        let path = response.path.clone();
        self.state
            .lock()
            .received
            .entry(handle_name.clone())
            .or_default()
            .push_back(response);
        if self.ready_tx.send(path).is_err() {
            warn!(service = %self.info.name, "response consumer is gone");
        }
    }

    /// Takes everything queued for one handle, oldest first.
    pub(crate) fn take_responses(&self, handle_name: &HandleName) -> VecDeque<Response> {
        self.state
            .lock()
            .received
            .remove(handle_name)
            .unwrap_or_default()
    }

    /// Tears down every handle and drops every cached message, releasing the
    /// capacity they held. Part of client disconnect only.
    pub(crate) async fn shutdown(&self) {
        let (handles, parked) = {
            let mut state = self.state.lock();
            let handles: Vec<Handle> = state.handles.drain().map(|(_, handle)| handle).collect();
            let parked: Vec<VecDeque<CachedMessage>> =
                state.unhandled.drain().map(|(_, queue)| queue).collect();
            state.received.clear();
            (handles, parked)
        };
        for handle in handles {
            let dropped = handle.shutdown().await;
            for message in dropped {
                self.gauge.release(message.container_size());
            }
        }
        for queue in parked {
            for message in queue {
                self.gauge.release(message.container_size());
            }
        }
    }

    /// Queue statistics for this service, keyed by handle name.
    pub(crate) fn stats(&self) -> serde_json::Value {
        let state = self.state.lock();
        let handles: serde_json::Map<String, serde_json::Value> = state
            .handles
            .iter()
            .map(|(name, handle)| {
                (
                    name.to_string(),
                    json!({
                        "pending": handle.cache().new_len(),
                        "in_flight": handle.cache().in_flight_len(),
                        "bytes": handle.cache().bytes(),
                    }),
                )
            })
            .collect();
        let unhandled: serde_json::Map<String, serde_json::Value> = state
            .unhandled
            .iter()
            .map(|(name, queue)| (name.to_string(), json!(queue.len())))
            .collect();
        json!({
            "description": self.info.description,
            "app_name": self.info.app_name,
            "instance": self.info.instance,
            "hosts": state.hosts.len(),
            "handles": handles,
            "unhandled": unhandled,
        })
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self, handle_name: &HandleName) -> usize {
        self.state
            .lock()
            .unhandled
            .get(handle_name)
            .map_or(0, |queue| queue.len())
    }
}
