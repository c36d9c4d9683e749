// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-handle dispatch.
//!
//! Each handle runs exactly one dispatch task that owns the transport socket
//! and the message cache. Outside callers steer the task through a FIFO
//! control mailbox and never touch its mutable state directly. One loop pass
//! drains the mailbox, sends at most one pending message, runs the
//! once-per-second maintenance sweep and drains inbound responses; when none
//! of that produced work the task parks on the mailbox and the socket with a
//! bounded timeout, so it neither busy-spins nor sleeps through work.

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use couriercommon::{
    envelope::{self, MessageEnvelope, ResponseEnvelope},
    identifiers::{HandleInfo, MessageId, Peer},
    payload::DataContainer,
};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    cache::{CacheGauge, CachedMessage, MessageCache},
    response::{Response, ResponseKind},
    transport::{RequestSocket, Transport},
};

/// Cadence of the timeout-requeue and deadline-expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The full control vocabulary of a dispatch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    /// Open the transport socket and connect to the current hosts.
    Connect,
    /// Tear the socket down, open a new one, connect to the current hosts.
    Reconnect,
    /// Close the socket, stay alive.
    Disconnect,
    /// Connect the existing socket to the staged new hosts.
    AddHosts,
    /// Exit the dispatch loop.
    Kill,
}

/// Where a dispatch task deposits responses, both real and synthetic.
pub(crate) type ResponseSink = Arc<dyn Fn(Response) + Send + Sync>;

struct HandleShared {
    hosts: Mutex<Vec<Ipv4Addr>>,
    new_hosts: Mutex<Vec<Ipv4Addr>>,
}

/// The outside view of a dispatch task: the control mailbox, the shared host
/// lists and the message cache submissions flow into.
pub(crate) struct Handle {
    info: HandleInfo,
    cache: Arc<MessageCache>,
    shared: Arc<HandleShared>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    task: JoinHandle<()>,
}

impl Handle {
    pub(crate) fn spawn(
        info: HandleInfo,
        hosts: Vec<Ipv4Addr>,
        transport: Arc<dyn Transport>,
        poll_timeout: Duration,
        gauge: Arc<CacheGauge>,
        sink: ResponseSink,
    ) -> Self {
        let cache = Arc::new(MessageCache::new());
        let shared = Arc::new(HandleShared {
            hosts: Mutex::new(hosts),
            new_hosts: Mutex::new(Vec::new()),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task = DispatchTask {
            info: info.clone(),
            cache: cache.clone(),
            shared: shared.clone(),
            control_rx,
            pending_control: None,
            transport,
            poll_timeout,
            gauge,
            sink,
            socket: None,
            last_sweep: Instant::now(),
        };
        debug!(service = %info.service_name, handle = %info.name, "spawning dispatch task");
        let task = tokio::spawn(task.run());

        Self {
            info,
            cache,
            shared,
            control_tx,
            task,
        }
    }

    pub(crate) fn info(&self) -> &HandleInfo {
        &self.info
    }

    pub(crate) fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub(crate) fn enqueue(&self, message: CachedMessage) {
        self.cache.enqueue(message);
    }

    /// Connect to the hosts the handle was created with.
    pub(crate) fn connect(&self) {
        self.post(ControlCommand::Connect);
    }

    /// Replaces the host set and rebuilds the socket. In-flight messages are
    /// not requeued here; the sweep catches them if the peer stays silent.
    pub(crate) fn reconnect(&self, hosts: Vec<Ipv4Addr>) {
        *self.shared.hosts.lock() = hosts;
        self.post(ControlCommand::Reconnect);
    }

    /// Stages additional hosts and connects the existing socket to them.
    pub(crate) fn connect_new_hosts(&self, hosts: Vec<Ipv4Addr>) {
        {
            let mut staged = self.shared.new_hosts.lock();
            staged.extend(hosts.iter().copied());
            self.shared.hosts.lock().extend(hosts);
        }
        self.post(ControlCommand::AddHosts);
    }

    pub(crate) fn disconnect(&self) {
        self.post(ControlCommand::Disconnect);
    }

    /// Posts `Kill`, joins the dispatch task and drains every message still
    /// cached, cleared back to the unsent state, for the service to re-park
    /// or release.
    pub(crate) async fn shutdown(self) -> VecDeque<CachedMessage> {
        let _ = self.control_tx.send(ControlCommand::Kill);
        if let Err(error) = self.task.await {
            error!(
                service = %self.info.service_name,
                handle = %self.info.name,
                %error,
                "dispatch task panicked"
            );
        }
        self.cache.make_all_new();
        self.cache.drain_new()
    }

    fn post(&self, command: ControlCommand) {
        if self.control_tx.send(command).is_err() {
            warn!(
                service = %self.info.service_name,
                handle = %self.info.name,
                ?command,
                "control mailbox is closed"
            );
        }
    }
}

struct DispatchTask {
    info: HandleInfo,
    cache: Arc<MessageCache>,
    shared: Arc<HandleShared>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    /// A command picked up during the idle wait, handled on the next pass so
    /// the mailbox keeps its FIFO order.
    pending_control: Option<ControlCommand>,
    transport: Arc<dyn Transport>,
    poll_timeout: Duration,
    gauge: Arc<CacheGauge>,
    sink: ResponseSink,
    socket: Option<Box<dyn RequestSocket>>,
    last_sweep: Instant,
}

impl DispatchTask {
    async fn run(mut self) {
        debug!(
            service = %self.info.service_name,
            handle = %self.info.name,
            "dispatch task started"
        );
        loop {
            let mut progressed = false;

            loop {
                let command = match self.pending_control.take() {
                    Some(command) => command,
                    None => match self.control_rx.try_recv() {
                        Ok(command) => command,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => ControlCommand::Kill,
                    },
                };
                if command == ControlCommand::Kill {
                    debug!(
                        service = %self.info.service_name,
                        handle = %self.info.name,
                        "dispatch task stopped"
                    );
                    return;
                }
                self.apply_control(command);
                progressed = true;
            }

            progressed |= self.send_next().await;

            if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.last_sweep = Instant::now();
                self.sweep();
            }

            progressed |= self.drain_responses();

            if !progressed {
                self.idle_wait().await;
            }
        }
    }

    fn apply_control(&mut self, command: ControlCommand) {
        debug!(
            service = %self.info.service_name,
            handle = %self.info.name,
            ?command,
            "control message"
        );
        match command {
            ControlCommand::Connect => {
                if self.socket.is_none() {
                    self.open_socket();
                }
            }
            ControlCommand::Reconnect => {
                self.socket = None;
                self.open_socket();
            }
            ControlCommand::Disconnect => {
                self.socket = None;
            }
            ControlCommand::AddHosts => {
                let staged: Vec<Ipv4Addr> = self.shared.new_hosts.lock().drain(..).collect();
                if let Some(socket) = self.socket.as_mut() {
                    for ip in staged {
                        let peer = Peer::new(ip, self.info.port);
                        if let Err(error) = socket.connect(peer) {
                            warn!(%peer, %error, "could not connect to new host");
                        }
                    }
                }
            }
            // filtered out by the dispatch loop
            ControlCommand::Kill => {}
        }
    }

    fn open_socket(&mut self) {
        let mut socket = match self.transport.request_socket() {
            Ok(socket) => socket,
            Err(error) => {
                error!(
                    service = %self.info.service_name,
                    handle = %self.info.name,
                    %error,
                    "could not open request socket"
                );
                return;
            }
        };
        for ip in self.shared.hosts.lock().iter() {
            let peer = Peer::new(*ip, self.info.port);
            if let Err(error) = socket.connect(peer) {
                warn!(%peer, %error, "could not connect");
            }
        }
        self.socket = Some(socket);
    }

    /// Sends the head of the `new` queue, if any. On successful handoff the
    /// message moves to the in-flight index; on failure it stays at the head
    /// for the next pass.
    async fn send_next(&mut self) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        let Some(head) = self.cache.head() else {
            return false;
        };
        let envelope = MessageEnvelope::new(head.uuid(), head.policy());
        let frames = match envelope::encode_message(&envelope, head.payload()) {
            Ok(frames) => frames,
            Err(error) => {
                error!(uuid = %head.uuid(), %error, "could not encode message");
                return false;
            }
        };
        match socket.send(frames).await {
            Ok(()) => {
                self.cache.promote_to_in_flight(head.uuid());
                true
            }
            Err(error) => {
                debug!(
                    service = %self.info.service_name,
                    handle = %self.info.name,
                    uuid = %head.uuid(),
                    %error,
                    "send failed, message stays queued"
                );
                false
            }
        }
    }

    /// Requeues in-flight messages past their per-send timeout, then expires
    /// everything past its deadline. Expired messages leave the cache for
    /// good and surface as synthetic deadline-expired responses.
    fn sweep(&mut self) {
        let requeued = self.cache.requeue_timed_out();
        if !requeued.is_empty() {
            debug!(
                service = %self.info.service_name,
                handle = %self.info.name,
                count = requeued.len(),
                "requeued timed-out messages"
            );
        }
        for message in self.cache.sweep_expired() {
            debug!(uuid = %message.uuid(), "message expired");
            self.gauge.release(message.container_size());
            (self.sink)(Response::new(
                message.uuid(),
                message.path().clone(),
                ResponseKind::DeadlineExpired,
            ));
        }
    }

    fn drain_responses(&mut self) -> bool {
        if self.socket.is_none() {
            return false;
        }
        let mut received = false;
        loop {
            let outcome = self.socket.as_mut().unwrap().try_recv();
            match outcome {
                Ok(Some(frames)) => {
                    received = true;
                    self.process_response(&frames);
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(
                        service = %self.info.service_name,
                        handle = %self.info.name,
                        %error,
                        "receive failed"
                    );
                    break;
                }
            }
        }
        received
    }

    /// Inbound frames never disturb in-flight state unless they carry a
    /// parseable envelope with a known uuid.
    fn process_response(&mut self, frames: &[Vec<u8>]) {
        let (envelope, chunk) = match envelope::decode_response(frames) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(
                    service = %self.info.service_name,
                    handle = %self.info.name,
                    %error,
                    "discarding unparseable response"
                );
                return;
            }
        };
        let Ok(uuid) = envelope.uuid.parse::<MessageId>() else {
            debug!(uuid = %envelope.uuid, "discarding response with malformed uuid");
            return;
        };

        if envelope.is_error() {
            self.resolve_terminal(uuid, &envelope, ResponseKind::PeerError {
                code: envelope.code,
                message: envelope.message.clone(),
            });
        } else if envelope.completed {
            self.resolve_terminal(uuid, &envelope, ResponseKind::Choke);
        } else {
            self.deliver_chunk(uuid, chunk);
        }
    }

    fn resolve_terminal(&mut self, uuid: MessageId, envelope: &ResponseEnvelope, kind: ResponseKind) {
        let Some(message) = self.cache.erase_in_flight(uuid) else {
            // an ack for a message the cache has no record of means the peer
            // and the cache have desynced, or the peer acked twice
            error!(
                service = %self.info.service_name,
                handle = %self.info.name,
                %uuid,
                code = envelope.code,
                "terminal response for a message that is not in flight"
            );
            return;
        };
        self.gauge.release(message.container_size());
        (self.sink)(Response::new(uuid, message.path().clone(), kind));
    }

    fn deliver_chunk(&mut self, uuid: MessageId, chunk: Option<&[u8]>) {
        let Some(path) = self.cache.in_flight_path(uuid) else {
            debug!(%uuid, "chunk for unknown uuid");
            return;
        };
        let payload = match DataContainer::new(chunk.unwrap_or_default().to_vec()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%uuid, %error, "dropping oversized chunk");
                return;
            }
        };
        (self.sink)(Response::new(uuid, path, ResponseKind::Chunk(payload)));
    }

    /// Parks until the mailbox or the socket has work, bounded by the poll
    /// timeout so the sweep keeps its cadence.
    async fn idle_wait(&mut self) {
        let command = match self.socket.as_mut() {
            Some(socket) => {
                tokio::select! {
                    command = self.control_rx.recv() => {
                        Some(command.unwrap_or(ControlCommand::Kill))
                    }
                    _ = socket.wait_readable(self.poll_timeout) => None,
                }
            }
            None => {
                tokio::select! {
                    command = self.control_rx.recv() => {
                        Some(command.unwrap_or(ControlCommand::Kill))
                    }
                    _ = tokio::time::sleep(self.poll_timeout) => None,
                }
            }
        };
        if command.is_some() {
            self.pending_control = command;
        }
    }
}
