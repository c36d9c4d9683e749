// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-host metadata probe.
//!
//! An ephemeral request/reply socket asks the host's control port for its
//! metadata and extracts the dispatch endpoints this service may use. A host
//! that fails any step is simply absent from the current tick; the next tick
//! probes it again from scratch.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use couriercommon::{
    config::ServiceConfig,
    identifiers::{HandleInfo, HandleName, Peer},
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{ProbeSocket as _, Transport};

/// How long a probed host gets to answer.
pub(crate) const SOCKET_PING_TIMEOUT: Duration = Duration::from_secs(1);

const INFO_PROTOCOL_VERSION: u32 = 2;

/// Task entries must carry this type to count as dispatch endpoints.
const DISPATCH_TASK_TYPE: &str = "server+lsd";

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum MetadataError {
    #[error("metadata is not valid json")]
    BadJson,
    #[error("metadata carries no apps object")]
    NoApps,
    #[error("app is not known to the host")]
    AppMissing,
    #[error("app is not running")]
    NotRunning,
}

pub(crate) fn info_request() -> Vec<u8> {
    json!({ "version": INFO_PROTOCOL_VERSION, "action": "info" })
        .to_string()
        .into_bytes()
}

/// Probes one host. `None` means the host does not participate in this tick,
/// whatever the reason.
pub(crate) async fn probe_host(
    transport: &Arc<dyn Transport>,
    ip: Ipv4Addr,
    service: &ServiceConfig,
) -> Option<Vec<HandleInfo>> {
    let peer = Peer::new(ip, service.control_port);
    let mut socket = match transport.probe_socket(peer) {
        Ok(socket) => socket,
        Err(error) => {
            warn!(service = %service.name, %peer, %error, "could not open probe socket");
            return None;
        }
    };
    if let Err(error) = socket.send(info_request()).await {
        warn!(service = %service.name, %peer, %error, "could not send metadata request");
        return None;
    }
    let reply = match socket.recv(SOCKET_PING_TIMEOUT).await {
        Ok(reply) => reply,
        Err(error) => {
            debug!(service = %service.name, %peer, %error, "host did not answer the probe");
            return None;
        }
    };
    match parse_metadata(&reply, service) {
        Ok(handles) => Some(handles),
        Err(error) => {
            debug!(service = %service.name, %peer, %error, "host skipped");
            None
        }
    }
}

/// Extracts this service's dispatch endpoints from a metadata reply. The
/// host counts as live iff its app reports `running == true`; handles are
/// accepted only with the dispatch task type, a route within the configured
/// instance and a non-zero port.
pub(crate) fn parse_metadata(
    reply: &[u8],
    service: &ServiceConfig,
) -> Result<Vec<HandleInfo>, MetadataError> {
    let root: Value = serde_json::from_slice(reply).map_err(|_| MetadataError::BadJson)?;
    let apps = root.get("apps").ok_or(MetadataError::NoApps)?;
    let app = apps
        .get(&service.app_name)
        .ok_or(MetadataError::AppMissing)?;
    if app.get("running").and_then(Value::as_bool) != Some(true) {
        return Err(MetadataError::NotRunning);
    }

    let mut handles = Vec::new();
    let Some(tasks) = app.get("tasks").and_then(Value::as_object) else {
        return Ok(handles);
    };
    for (task_name, task) in tasks {
        if task.get("type").and_then(Value::as_str) != Some(DISPATCH_TASK_TYPE) {
            continue;
        }
        let route = task.get("route").and_then(Value::as_str).unwrap_or_default();
        let instance = route.split('/').next().unwrap_or_default();
        if instance != service.instance {
            continue;
        }
        let endpoint = task
            .get("endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let port: u16 = endpoint
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .unwrap_or(0);
        if port == 0 {
            warn!(
                service = %service.name,
                task = %task_name,
                endpoint,
                "rejecting handle without a usable port"
            );
            continue;
        }
        let Ok(name) = HandleName::new(task_name.clone()) else {
            continue;
        };
        handles.push(HandleInfo {
            name,
            service_name: service.name.clone(),
            port,
        });
    }
    Ok(handles)
}
