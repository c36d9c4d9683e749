// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Statistics: cache usage, configuration and per-service queue depths over
//! a versioned request/reply JSON protocol, optionally served on a bound
//! reply socket for remote inspection.

use std::{collections::HashMap, sync::Arc};

use couriercommon::{config::ClientConfig, identifiers::ServiceName};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    cache::CacheGauge,
    service::Service,
    transport::{ReplySocket as _, Transport},
};

const STATISTICS_PROTOCOL_VERSION: u64 = 1;

/// Wire-stable error codes of the statistics protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestError {
    BadJson = 1,
    NoVersion = 2,
    UnsupportedVersion = 3,
    NoAction = 4,
    UnsupportedAction = 5,
}

impl RequestError {
    fn message(self) -> &'static str {
        match self {
            RequestError::BadJson => "statistics request json could not be parsed",
            RequestError::NoVersion => "no protocol version in statistics request json",
            RequestError::UnsupportedVersion => {
                "unsupported protocol version in statistics request json"
            }
            RequestError::NoAction => "no action in statistics request json",
            RequestError::UnsupportedAction => "unsupported action in statistics request json",
        }
    }

    fn to_json(self) -> Value {
        json!({ "error": self as u8, "message": self.message() })
    }
}

pub(crate) struct StatisticsCollector {
    gauge: Arc<CacheGauge>,
    config_summary: Value,
    services: HashMap<ServiceName, Arc<Service>>,
}

impl StatisticsCollector {
    pub(crate) fn new(
        config: &ClientConfig,
        gauge: Arc<CacheGauge>,
        services: HashMap<ServiceName, Arc<Service>>,
    ) -> Self {
        Self {
            gauge,
            config_summary: config_summary(config),
            services,
        }
    }

    /// Serves the protocol until cancellation.
    pub(crate) fn serve_remote(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        port: u16,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut socket = match transport.reply_socket(port) {
                Ok(socket) => socket,
                Err(error) => {
                    error!(port, %error, "could not bind statistics endpoint");
                    return;
                }
            };
            debug!(port, "statistics endpoint up");
            loop {
                let request = tokio::select! {
                    _ = cancel.cancelled() => return,
                    request = socket.recv() => request,
                };
                let request = match request {
                    Ok(request) => request,
                    Err(error) => {
                        debug!(%error, "statistics endpoint closed");
                        return;
                    }
                };
                let reply = self.process_request(&request).to_string().into_bytes();
                if let Err(error) = socket.send(reply).await {
                    debug!(%error, "could not answer statistics request");
                    return;
                }
            }
        })
    }

    pub(crate) fn process_request(&self, request: &[u8]) -> Value {
        let Ok(request) = serde_json::from_slice::<Value>(request) else {
            return RequestError::BadJson.to_json();
        };
        let Some(version) = request.get("version").and_then(Value::as_u64) else {
            return RequestError::NoVersion.to_json();
        };
        if version != STATISTICS_PROTOCOL_VERSION {
            return RequestError::UnsupportedVersion.to_json();
        }
        let Some(action) = request.get("action").and_then(Value::as_str) else {
            return RequestError::NoAction.to_json();
        };

        match action {
            "cache_stats" => self.cache_stats(),
            "config" => self.config_summary.clone(),
            "all_services" => self.all_services(),
            "service" => {
                let name = request.get("name").and_then(Value::as_str).unwrap_or("");
                self.single_service(name)
            }
            _ => RequestError::UnsupportedAction.to_json(),
        }
    }

    fn cache_stats(&self) -> Value {
        json!({
            "used_cache_size": self.gauge.used(),
            "max_cache_size": self.gauge.limit(),
        })
    }

    fn all_services(&self) -> Value {
        let services: serde_json::Map<String, Value> = self
            .services
            .iter()
            .map(|(name, service)| (name.to_string(), service.stats()))
            .collect();
        json!({ "services": services })
    }

    fn single_service(&self, name: &str) -> Value {
        let found = ServiceName::new(name)
            .ok()
            .and_then(|name| self.services.get(&name));
        match found {
            Some(service) => service.stats(),
            None => RequestError::UnsupportedAction.to_json(),
        }
    }
}

fn config_summary(config: &ClientConfig) -> Value {
    let services: serde_json::Map<String, Value> = config
        .services
        .values()
        .map(|service| {
            (
                service.name.to_string(),
                json!({
                    "app_name": service.app_name,
                    "instance": service.instance,
                    "hosts_url": service.hosts_url,
                    "control_port": service.control_port,
                }),
            )
        })
        .collect();
    json!({
        "config_version": config.config_version,
        "message_timeout": config.message_timeout.as_secs(),
        "socket_poll_timeout": config.socket_poll_timeout.as_millis() as u64,
        "max_cache_size": config.message_cache.max_ram_limit_bytes,
        "services": services,
    })
}
