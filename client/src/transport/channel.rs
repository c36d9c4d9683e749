// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process transport over tokio channels.
//!
//! Peers bind an address on a shared registry; request sockets spread sends
//! across their connected peers round-robin, the way a multi-peer dealer
//! socket would. Doubles as the test double: scripted peers acknowledge,
//! error, chunk or stay silent.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use couriercommon::{envelope::Frame, identifiers::Peer};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ProbeSocket, ReplySocket, RequestSocket, Transport, TransportError, TransportResult};

/// One request arriving at a bound peer. Replies sent through `reply` are
/// routed back to the originating socket; the channel stays usable for as
/// long as that socket lives, so a peer may answer with several frame
/// sequences (chunks, then a choke) at any later point.
pub struct Incoming {
    pub frames: Vec<Frame>,
    pub reply: mpsc::UnboundedSender<Vec<Frame>>,
}

type PeerSender = mpsc::UnboundedSender<Incoming>;

#[derive(Default)]
struct Registry {
    bound: Mutex<HashMap<Peer, PeerSender>>,
}

impl Registry {
    fn live_sender(&self, peer: &Peer) -> Option<PeerSender> {
        let mut bound = self.bound.lock();
        match bound.get(peer) {
            Some(sender) if !sender.is_closed() => Some(sender.clone()),
            Some(_) => {
                bound.remove(peer);
                None
            }
            None => None,
        }
    }
}

/// The in-process transport. Clones share the registry.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    registry: Arc<Registry>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `peer` and returns the receiving end. Dropping the listener
    /// unbinds the address.
    pub fn bind(&self, peer: Peer) -> TransportResult<ChannelListener> {
        let mut bound = self.registry.bound.lock();
        if bound.get(&peer).is_some_and(|sender| !sender.is_closed()) {
            return Err(TransportError::AddressInUse(peer));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        bound.insert(peer, tx);
        Ok(ChannelListener { rx })
    }
}

/// The peer-side endpoint of a bound address.
pub struct ChannelListener {
    rx: mpsc::UnboundedReceiver<Incoming>,
}

impl ChannelListener {
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }
}

impl Transport for ChannelTransport {
    fn request_socket(&self) -> TransportResult<Box<dyn RequestSocket>> {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Ok(Box::new(ChannelRequestSocket {
            registry: self.registry.clone(),
            peers: Vec::new(),
            next_peer: 0,
            responses_tx,
            responses_rx,
            buffered: None,
        }))
    }

    fn probe_socket(&self, peer: Peer) -> TransportResult<Box<dyn ProbeSocket>> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Ok(Box::new(ChannelProbeSocket {
            registry: self.registry.clone(),
            peer,
            reply_tx,
            reply_rx,
        }))
    }

    fn reply_socket(&self, port: u16) -> TransportResult<Box<dyn ReplySocket>> {
        let peer = Peer::new(std::net::Ipv4Addr::LOCALHOST, port);
        let listener = self.bind(peer)?;
        Ok(Box::new(ChannelReplySocket {
            listener,
            pending_reply: None,
        }))
    }
}

struct ChannelRequestSocket {
    registry: Arc<Registry>,
    peers: Vec<Peer>,
    next_peer: usize,
    responses_tx: mpsc::UnboundedSender<Vec<Frame>>,
    responses_rx: mpsc::UnboundedReceiver<Vec<Frame>>,
    // sequence consumed by wait_readable, served by the next try_recv
    buffered: Option<Vec<Frame>>,
}

#[async_trait]
impl RequestSocket for ChannelRequestSocket {
    fn connect(&mut self, peer: Peer) -> TransportResult<()> {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
        Ok(())
    }

    async fn send(&mut self, frames: Vec<Frame>) -> TransportResult<()> {
        if self.peers.is_empty() {
            return Err(TransportError::NoPeers);
        }
        // round-robin over currently reachable peers
        for offset in 0..self.peers.len() {
            let index = (self.next_peer + offset) % self.peers.len();
            let Some(sender) = self.registry.live_sender(&self.peers[index]) else {
                continue;
            };
            let incoming = Incoming {
                frames,
                reply: self.responses_tx.clone(),
            };
            if sender.send(incoming).is_ok() {
                self.next_peer = (index + 1) % self.peers.len();
                return Ok(());
            }
            return Err(TransportError::Closed);
        }
        Err(TransportError::NoPeers)
    }

    fn try_recv(&mut self) -> TransportResult<Option<Vec<Frame>>> {
        if let Some(frames) = self.buffered.take() {
            return Ok(Some(frames));
        }
        match self.responses_rx.try_recv() {
            Ok(frames) => Ok(Some(frames)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            // the socket holds a sender itself, so this arm is unreachable
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    async fn wait_readable(&mut self, timeout: Duration) -> TransportResult<bool> {
        if self.buffered.is_some() || !self.responses_rx.is_empty() {
            return Ok(true);
        }
        match tokio::time::timeout(timeout, self.responses_rx.recv()).await {
            Ok(Some(frames)) => {
                self.buffered = Some(frames);
                Ok(true)
            }
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(false),
        }
    }
}

struct ChannelProbeSocket {
    registry: Arc<Registry>,
    peer: Peer,
    reply_tx: mpsc::UnboundedSender<Vec<Frame>>,
    reply_rx: mpsc::UnboundedReceiver<Vec<Frame>>,
}

#[async_trait]
impl ProbeSocket for ChannelProbeSocket {
    async fn send(&mut self, request: Vec<u8>) -> TransportResult<()> {
        // an unreachable peer swallows the request and the probe times out,
        // the same shape a lazy network connect gives
        if let Some(sender) = self.registry.live_sender(&self.peer) {
            let _ = sender.send(Incoming {
                frames: vec![request],
                reply: self.reply_tx.clone(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> TransportResult<Vec<u8>> {
        match tokio::time::timeout(timeout, self.reply_rx.recv()).await {
            Ok(Some(mut frames)) if !frames.is_empty() => Ok(frames.remove(0)),
            Ok(_) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

struct ChannelReplySocket {
    listener: ChannelListener,
    pending_reply: Option<mpsc::UnboundedSender<Vec<Frame>>>,
}

#[async_trait]
impl ReplySocket for ChannelReplySocket {
    async fn recv(&mut self) -> TransportResult<Vec<u8>> {
        let incoming = self.listener.recv().await.ok_or(TransportError::Closed)?;
        self.pending_reply = Some(incoming.reply);
        incoming
            .frames
            .into_iter()
            .next()
            .ok_or(TransportError::Closed)
    }

    async fn send(&mut self, reply: Vec<u8>) -> TransportResult<()> {
        let sender = self.pending_reply.take().ok_or(TransportError::Closed)?;
        sender
            .send(vec![reply])
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> Peer {
        Peer::new(std::net::Ipv4Addr::new(10, 0, 0, 1), port)
    }

    #[tokio::test]
    async fn request_sockets_round_robin_across_peers() {
        let transport = ChannelTransport::new();
        let mut first = transport.bind(peer(5001)).unwrap();
        let mut second = transport.bind(peer(5002)).unwrap();

        let mut socket = transport.request_socket().unwrap();
        socket.connect(peer(5001)).unwrap();
        socket.connect(peer(5002)).unwrap();

        for _ in 0..2 {
            socket.send(vec![b"m".to_vec()]).await.unwrap();
        }

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_skips_dead_peers() {
        let transport = ChannelTransport::new();
        let dead = transport.bind(peer(5001)).unwrap();
        drop(dead);
        let mut alive = transport.bind(peer(5002)).unwrap();

        let mut socket = transport.request_socket().unwrap();
        socket.connect(peer(5001)).unwrap();
        socket.connect(peer(5002)).unwrap();

        for _ in 0..3 {
            socket.send(vec![b"m".to_vec()]).await.unwrap();
        }
        for _ in 0..3 {
            assert!(alive.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn send_without_reachable_peers_fails() {
        let transport = ChannelTransport::new();
        let mut socket = transport.request_socket().unwrap();
        assert!(matches!(
            socket.send(vec![b"m".to_vec()]).await,
            Err(TransportError::NoPeers)
        ));

        socket.connect(peer(5001)).unwrap();
        assert!(matches!(
            socket.send(vec![b"m".to_vec()]).await,
            Err(TransportError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn replies_reach_the_originating_socket() {
        let transport = ChannelTransport::new();
        let mut listener = transport.bind(peer(5001)).unwrap();
        let mut socket = transport.request_socket().unwrap();
        socket.connect(peer(5001)).unwrap();
        socket.send(vec![b"ping".to_vec()]).await.unwrap();

        let incoming = listener.recv().await.unwrap();
        incoming.reply.send(vec![b"pong".to_vec()]).unwrap();

        assert!(socket.wait_readable(Duration::from_secs(1)).await.unwrap());
        let frames = socket.try_recv().unwrap().unwrap();
        assert_eq!(frames, vec![b"pong".to_vec()]);
        assert!(socket.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn probe_round_trip_and_timeout() {
        let transport = ChannelTransport::new();
        let mut listener = transport.bind(peer(5555)).unwrap();

        let mut probe = transport.probe_socket(peer(5555)).unwrap();
        probe.send(b"info".to_vec()).await.unwrap();
        let incoming = listener.recv().await.unwrap();
        assert_eq!(incoming.frames, vec![b"info".to_vec()]);
        incoming.reply.send(vec![b"meta".to_vec()]).unwrap();
        let reply = probe.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"meta");

        // nobody bound on this port, the probe must time out
        let mut silent = transport.probe_socket(peer(5556)).unwrap();
        silent.send(b"info".to_vec()).await.unwrap();
        assert!(matches!(
            silent.recv(Duration::from_millis(10)).await,
            Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn reply_socket_serves_requests() {
        let transport = ChannelTransport::new();
        let mut reply_socket = transport.reply_socket(3333).unwrap();
        let mut probe = transport
            .probe_socket(Peer::new(std::net::Ipv4Addr::LOCALHOST, 3333))
            .unwrap();

        probe.send(b"stats?".to_vec()).await.unwrap();
        let request = reply_socket.recv().await.unwrap();
        assert_eq!(request, b"stats?");
        reply_socket.send(b"stats!".to_vec()).await.unwrap();
        let reply = probe.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"stats!");
    }

    #[tokio::test]
    async fn double_bind_is_rejected_until_the_listener_drops() {
        let transport = ChannelTransport::new();
        let listener = transport.bind(peer(5001)).unwrap();
        assert!(matches!(
            transport.bind(peer(5001)),
            Err(TransportError::AddressInUse(_))
        ));
        drop(listener);
        assert!(transport.bind(peer(5001)).is_ok());
    }
}
