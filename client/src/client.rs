// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The client façade: global capacity accounting, submission routing and
//! callback delivery. Submission is synchronous and never touches the
//! network; everything asynchronous happens on background tasks between
//! `connect` and `disconnect`.

use std::{collections::HashMap, sync::Arc};

use couriercommon::{
    config::{CacheType, ClientConfig},
    error::ClientError,
    identifiers::{MessageId, MessagePath, ServiceName},
    payload::DataContainer,
    policy::MessagePolicy,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cache::{CacheGauge, CachedMessage},
    discovery::{DiscoveryError, HeartbeatsCollector, Refresh},
    response::Response,
    service::Service,
    statistics::StatisticsCollector,
    transport::Transport,
};

/// Invoked for every response on a registered path, including the synthetic
/// terminal kinds. Responses on paths without a callback are dropped.
pub type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("persistent message cache is not available in this build")]
    PersistentCacheUnavailable,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

struct RunningTasks {
    collector: HeartbeatsCollector,
    router: JoinHandle<()>,
    consumer: JoinHandle<()>,
    statistics: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    gauge: Arc<CacheGauge>,
    services: HashMap<ServiceName, Arc<Service>>,
    callbacks: RwLock<HashMap<MessagePath, ResponseCallback>>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<MessagePath>>>,
    running: Mutex<Option<RunningTasks>>,
}

impl Client {
    /// Builds a client from a validated configuration. Must be called within
    /// a tokio runtime; the services' dispatch tasks are spawned lazily once
    /// discovery reports their handles.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, BuildError> {
        if config.message_cache.cache_type == CacheType::Persistent {
            return Err(BuildError::PersistentCacheUnavailable);
        }
        let gauge = Arc::new(CacheGauge::new(config.message_cache.max_ram_limit_bytes));
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let services: HashMap<ServiceName, Arc<Service>> = config
            .services
            .values()
            .map(|service_config| {
                let service = Service::new(
                    service_config.clone(),
                    transport.clone(),
                    config.socket_poll_timeout,
                    gauge.clone(),
                    ready_tx.clone(),
                );
                (service_config.name.clone(), service)
            })
            .collect();

        info!(services = services.len(), "client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                gauge,
                services,
                callbacks: RwLock::new(HashMap::new()),
                ready_rx: Mutex::new(Some(ready_rx)),
                running: Mutex::new(None),
            }),
        })
    }

    /// Starts discovery, the response consumer and, when configured, the
    /// statistics endpoint.
    pub fn connect(&self) -> Result<(), ConnectError> {
        let mut running = self.inner.running.lock();
        if running.is_some() || self.inner.ready_rx.lock().is_none() {
            return Err(ConnectError::AlreadyConnected);
        }

        let cancel = CancellationToken::new();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let collector = HeartbeatsCollector::from_config(
            &self.inner.config,
            self.inner.transport.clone(),
            refresh_tx,
        )?;
        let Some(ready_rx) = self.inner.ready_rx.lock().take() else {
            return Err(ConnectError::AlreadyConnected);
        };

        let router = tokio::spawn(Self::route_refreshes(
            self.inner.clone(),
            refresh_rx,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(Self::consume_responses(
            self.inner.clone(),
            ready_rx,
            cancel.clone(),
        ));

        let statistics_config = &self.inner.config.statistics;
        let statistics = (statistics_config.enabled && statistics_config.remote_access).then(|| {
            let collector = Arc::new(StatisticsCollector::new(
                &self.inner.config,
                self.inner.gauge.clone(),
                self.inner.services.clone(),
            ));
            collector.serve_remote(
                self.inner.transport.clone(),
                statistics_config.remote_port,
                cancel.clone(),
            )
        });

        *running = Some(RunningTasks {
            collector,
            router,
            consumer,
            statistics,
            cancel,
        });
        info!("client connected");
        Ok(())
    }

    /// Submits one message. Fails fast on unknown services, oversized
    /// payloads and a full cache; never blocks on the network.
    pub fn send_message(
        &self,
        payload: impl Into<Vec<u8>>,
        path: MessagePath,
        policy: MessagePolicy,
    ) -> Result<MessageId, ClientError> {
        let Some(service) = self.inner.services.get(&path.service_name) else {
            return Err(ClientError::UnknownService(path.service_name));
        };
        let payload = DataContainer::new(payload.into())
            .map_err(|_| ClientError::MessageDataTooBig)?;
        let message = CachedMessage::new(path, policy, payload);
        let uuid = message.uuid();

        if !self.inner.gauge.try_reserve(message.container_size()) {
            return Err(ClientError::MessageCacheOverCapacity);
        }
        service.submit(message);
        Ok(uuid)
    }

    pub fn set_response_callback(
        &self,
        path: MessagePath,
        callback: impl Fn(Response) + Send + Sync + 'static,
    ) {
        self.inner
            .callbacks
            .write()
            .insert(path, Arc::new(callback));
    }

    pub fn clear_response_callback(&self, path: &MessagePath) {
        self.inner.callbacks.write().remove(path);
    }

    /// Bytes currently held across all services, the value the capacity gate
    /// compares against the configured limit.
    pub fn cache_bytes(&self) -> u64 {
        self.inner.gauge.used()
    }

    /// Stops discovery, then tears down every service. All background tasks
    /// are joined before this returns; unresolved messages are dropped and
    /// their capacity released.
    pub async fn disconnect(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        running.collector.stop().await;
        running.cancel.cancel();
        if let Err(error) = running.router.await {
            error!(%error, "refresh router panicked");
        }
        if let Err(error) = running.consumer.await {
            error!(%error, "response consumer panicked");
        }
        if let Some(statistics) = running.statistics {
            if let Err(error) = statistics.await {
                error!(%error, "statistics endpoint panicked");
            }
        }
        for service in self.inner.services.values() {
            service.shutdown().await;
        }
        info!("client disconnected");
    }

    async fn route_refreshes(
        inner: Arc<ClientInner>,
        mut refresh_rx: mpsc::UnboundedReceiver<Refresh>,
        cancel: CancellationToken,
    ) {
        loop {
            let refresh = tokio::select! {
                _ = cancel.cancelled() => return,
                refresh = refresh_rx.recv() => refresh,
            };
            let Some(refresh) = refresh else { return };
            let Some(service) = inner.services.get(&refresh.service_name) else {
                debug!(service = %refresh.service_name, "refresh for unknown service");
                continue;
            };
            service.refresh(refresh.hosts, refresh.handles).await;
        }
    }

    async fn consume_responses(
        inner: Arc<ClientInner>,
        mut ready_rx: mpsc::UnboundedReceiver<MessagePath>,
        cancel: CancellationToken,
    ) {
        loop {
            let path = tokio::select! {
                _ = cancel.cancelled() => return,
                path = ready_rx.recv() => path,
            };
            let Some(path) = path else { return };
            let Some(service) = inner.services.get(&path.service_name) else {
                continue;
            };
            let responses = service.take_responses(&path.handle_name);
            for response in responses {
                let callback = inner.callbacks.read().get(&response.path).cloned();
                match callback {
                    Some(callback) => callback(response),
                    None => {
                        debug!(path = %response.path, "dropping response without a callback");
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn service(&self, name: &ServiceName) -> Option<Arc<Service>> {
        self.inner.services.get(name).cloned()
    }
}
