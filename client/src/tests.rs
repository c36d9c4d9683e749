// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scenario tests against the channel transport with scripted peers.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use couriercommon::{
    envelope::{self, ResponseEnvelope},
    identifiers::{HandleInfo, HandleName, MessageId, MessagePath, Peer, ServiceName},
    policy::MessagePolicy,
    time::TimeStamp,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::{
    BuildError, Client, ClientError, ConnectError, DiscoveryError, Response, ResponseKind,
    cache::{CacheGauge, CachedMessage, MessageCache},
    handle::Handle,
    transport::{
        ProbeSocket as _, Transport,
        channel::{ChannelListener, ChannelTransport},
    },
};

const HOST_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const HOST_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const HANDLE_PORT: u16 = 5001;
const CONTROL_PORT: u16 = 5555;

#[derive(Clone, Copy)]
enum PeerBehavior {
    /// Answer every message with a terminal choke.
    Ack,
    /// Swallow messages without answering.
    Silent,
    /// Answer with a peer error.
    Error { code: i32, message: &'static str },
    /// Answer with one data chunk, then a choke.
    ChunkThenChoke(&'static [u8]),
}

/// The previous owner of an address may still be winding down after an
/// abort, so binding retries briefly.
fn bind_with_retry(transport: &ChannelTransport, peer: Peer) -> ChannelListener {
    for _ in 0..200 {
        match transport.bind(peer) {
            Ok(listener) => return listener,
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    panic!("could not bind {peer}");
}

/// A scripted worker process bound to `(ip, port)`. Aborting the task drops
/// the listener, which unbinds the address.
fn spawn_worker(
    transport: &ChannelTransport,
    ip: Ipv4Addr,
    port: u16,
    behavior: PeerBehavior,
    seen: Arc<Mutex<Vec<MessageId>>>,
) -> JoinHandle<()> {
    let mut listener = bind_with_retry(transport, Peer::new(ip, port));
    tokio::spawn(async move {
        while let Some(incoming) = listener.recv().await {
            let Ok((message, _payload)) = envelope::decode_message(&incoming.frames) else {
                continue;
            };
            let uuid = message.uuid.clone();
            if let Ok(parsed) = uuid.parse::<MessageId>() {
                seen.lock().push(parsed);
            }
            let respond = |completed, code, message: &str, payload: Option<&[u8]>| {
                let envelope = ResponseEnvelope {
                    uuid: uuid.clone(),
                    completed,
                    code,
                    message: message.to_string(),
                };
                envelope::encode_response(&envelope, payload).unwrap()
            };
            match behavior {
                PeerBehavior::Ack => {
                    let _ = incoming.reply.send(respond(true, 0, "", None));
                }
                PeerBehavior::Silent => {}
                PeerBehavior::Error { code, message } => {
                    let _ = incoming.reply.send(respond(false, code, message, None));
                }
                PeerBehavior::ChunkThenChoke(chunk) => {
                    let _ = incoming.reply.send(respond(false, 0, "", Some(chunk)));
                    let _ = incoming.reply.send(respond(true, 0, "", None));
                }
            }
        }
    })
}

/// A scripted control-port metadata endpoint advertising `handles`.
fn spawn_metadata_server(
    transport: &ChannelTransport,
    ip: Ipv4Addr,
    handles: Vec<(&'static str, u16)>,
) -> JoinHandle<()> {
    let mut listener = bind_with_retry(transport, Peer::new(ip, CONTROL_PORT));
    tokio::spawn(async move {
        while let Some(incoming) = listener.recv().await {
            let tasks: serde_json::Map<String, serde_json::Value> = handles
                .iter()
                .map(|(name, port)| {
                    (
                        name.to_string(),
                        json!({
                            "type": "server+lsd",
                            "endpoint": format!("{ip}:{port}"),
                            "route": format!("production/{name}"),
                        }),
                    )
                })
                .collect();
            let metadata = json!({
                "apps": { "billing_app": { "running": true, "tasks": tasks } }
            });
            let _ = incoming
                .reply
                .send(vec![metadata.to_string().into_bytes()]);
        }
    })
}

fn config_json(max_ram_limit_mib: u64, hosts_url: &str) -> String {
    format!(
        r#"{{
            "lsd_config": {{
                "socket_poll_timeout": 10,
                "message_cache": {{ "max_ram_limit": {max_ram_limit_mib} }},
                "services": [{{
                    "name": "billing",
                    "app_name": "billing_app",
                    "instance": "production",
                    "hosts_url": "{hosts_url}",
                    "control_port": {CONTROL_PORT}
                }}]
            }}
        }}"#
    )
}

struct TestBed {
    transport: ChannelTransport,
    client: Client,
    responses: Arc<Mutex<Vec<Response>>>,
}

impl TestBed {
    /// A connected client whose host fetcher points at a dead URL, so
    /// membership is driven by the tests calling `refresh` directly.
    fn new(max_ram_limit_mib: u64) -> Self {
        let config =
            crate::ClientConfig::from_json_str(&config_json(max_ram_limit_mib, "http://127.0.0.1:9/hosts"))
                .unwrap();
        let transport = ChannelTransport::new();
        let client = Client::new(config, Arc::new(transport.clone())).unwrap();
        client.connect().unwrap();

        let responses: Arc<Mutex<Vec<Response>>> = Arc::default();
        let sink = responses.clone();
        client.set_response_callback(path(), move |response| {
            sink.lock().push(response);
        });

        Self {
            transport,
            client,
            responses,
        }
    }

    async fn refresh(&self, hosts: &[Ipv4Addr], handles: &[(&str, u16)]) {
        let service = self.client.service(&service_name()).unwrap();
        let hosts = hosts.iter().map(|ip| (*ip, String::new())).collect();
        let handles = handles
            .iter()
            .map(|(name, port)| HandleInfo {
                name: HandleName::new(*name).unwrap(),
                service_name: service_name(),
                port: *port,
            })
            .collect();
        service.refresh(hosts, handles).await;
    }

    fn submit(&self, payload: &[u8], policy: MessagePolicy) -> MessageId {
        self.client
            .send_message(payload.to_vec(), path(), policy)
            .unwrap()
    }

    fn terminal_count(&self) -> usize {
        self.responses
            .lock()
            .iter()
            .filter(|response| response.is_terminal())
            .count()
    }
}

fn service_name() -> ServiceName {
    ServiceName::new("billing").unwrap()
}

fn path() -> MessagePath {
    MessagePath::new(service_name(), HandleName::new("invoice").unwrap())
}

async fn wait_until(what: &str, deadline: Duration, condition: impl Fn() -> bool) {
    let started = tokio::time::Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_delivers_every_message() {
    let bed = TestBed::new(512);
    let seen = Arc::default();
    spawn_worker(&bed.transport, HOST_A, HANDLE_PORT, PeerBehavior::Ack, Arc::clone(&seen));
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    let mut submitted = Vec::new();
    for i in 0..100u32 {
        submitted.push(bed.submit(format!("message {i}").as_bytes(), MessagePolicy::default()));
    }
    let mut distinct = submitted.clone();
    distinct.sort_by_key(|uuid| uuid.to_string());
    distinct.dedup();
    assert_eq!(distinct.len(), 100);

    wait_until("100 chokes", Duration::from_secs(10), || {
        bed.terminal_count() == 100
    })
    .await;

    let responses = bed.responses.lock();
    assert!(
        responses
            .iter()
            .all(|response| response.kind == ResponseKind::Choke)
    );
    drop(responses);
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_park_until_their_handle_appears() {
    let bed = TestBed::new(512);
    let seen: Arc<Mutex<Vec<MessageId>>> = Arc::default();
    spawn_worker(&bed.transport, HOST_A, HANDLE_PORT, PeerBehavior::Ack, Arc::clone(&seen));

    let submitted: Vec<MessageId> = (0..10)
        .map(|i| bed.submit(format!("parked {i}").as_bytes(), MessagePolicy::default()))
        .collect();

    let service = bed.client.service(&service_name()).unwrap();
    assert_eq!(service.parked_count(&HandleName::new("invoice").unwrap()), 10);
    assert!(bed.client.cache_bytes() > 0);

    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    wait_until("10 chokes", Duration::from_secs(10), || {
        bed.terminal_count() == 10
    })
    .await;

    // parked messages reach the peer in submission order
    assert_eq!(*seen.lock(), submitted);
    assert_eq!(service.parked_count(&HandleName::new("invoice").unwrap()), 0);
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_expiry_surfaces_once_per_message() {
    let bed = TestBed::new(512);
    spawn_worker(
        &bed.transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::Silent,
        Arc::default(),
    );
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    let policy = MessagePolicy {
        deadline: TimeStamp::now().epoch_secs() + 0.1,
        ..Default::default()
    };
    let uuid = bed.submit(b"doomed", policy);

    wait_until("deadline expiry", Duration::from_secs(4), || {
        bed.terminal_count() == 1
    })
    .await;

    {
        let responses = bed.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].uuid, uuid);
        assert_eq!(responses[0].kind, ResponseKind::DeadlineExpired);
    }
    assert_eq!(bed.client.cache_bytes(), 0);

    // the expiry is reported exactly once
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(bed.terminal_count(), 1);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn host_removal_loses_no_messages() {
    let bed = TestBed::new(512);
    spawn_worker(&bed.transport, HOST_A, HANDLE_PORT, PeerBehavior::Ack, Arc::default());
    let stuck = spawn_worker(
        &bed.transport,
        HOST_B,
        HANDLE_PORT,
        PeerBehavior::Silent,
        Arc::default(),
    );
    bed.refresh(&[HOST_A, HOST_B], &[("invoice", HANDLE_PORT)]).await;

    // a short per-send budget so messages stuck at the silent host requeue
    let policy = MessagePolicy {
        timeout: 0.5,
        ..Default::default()
    };
    for i in 0..50u32 {
        bed.submit(format!("spread {i}").as_bytes(), policy);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    stuck.abort();
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    wait_until("50 chokes", Duration::from_secs(15), || {
        bed.terminal_count() == 50
    })
    .await;
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_handle_re_parks_and_a_new_one_inherits() {
    let bed = TestBed::new(512);
    let silent = spawn_worker(
        &bed.transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::Silent,
        Arc::default(),
    );
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    for i in 0..20u32 {
        bed.submit(format!("limbo {i}").as_bytes(), MessagePolicy::default());
    }
    let service = bed.client.service(&service_name()).unwrap();
    wait_until("messages handed to the silent peer", Duration::from_secs(5), || {
        bed.client.cache_bytes() > 0 && service.handle_count() == 1
    })
    .await;

    // the handle disappears; everything it held is re-parked, nothing is lost
    bed.refresh(&[HOST_A], &[]).await;
    assert_eq!(service.handle_count(), 0);
    assert_eq!(service.parked_count(&HandleName::new("invoice").unwrap()), 20);
    assert_eq!(bed.terminal_count(), 0);

    // it comes back behind an answering peer and inherits the parked queue
    silent.abort();
    spawn_worker(&bed.transport, HOST_A, HANDLE_PORT, PeerBehavior::Ack, Arc::default());
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    wait_until("20 chokes", Duration::from_secs(10), || {
        bed.terminal_count() == 20
    })
    .await;
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_gate_rejects_the_overflowing_submit() {
    let bed = TestBed::new(1);
    let payload = vec![0u8; 300 * 1024];

    let _first = bed.submit(&payload, MessagePolicy::default());
    let per_message = bed.client.cache_bytes();
    bed.submit(&payload, MessagePolicy::default());
    bed.submit(&payload, MessagePolicy::default());
    assert_eq!(bed.client.cache_bytes(), 3 * per_message);

    let rejected = bed
        .client
        .send_message(payload.clone(), path(), MessagePolicy::default());
    assert!(matches!(
        rejected,
        Err(ClientError::MessageCacheOverCapacity)
    ));
    assert_eq!(bed.client.cache_bytes(), 3 * per_message);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_refresh_is_a_no_op() {
    let bed = TestBed::new(512);
    spawn_worker(
        &bed.transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::Silent,
        Arc::default(),
    );
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    bed.submit(b"steady", MessagePolicy::default());
    let service = bed.client.service(&service_name()).unwrap();
    wait_until("message in flight", Duration::from_secs(5), || {
        bed.client.cache_bytes() > 0
    })
    .await;

    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;

    // nothing was destroyed or re-parked
    assert_eq!(service.handle_count(), 1);
    assert_eq!(service.parked_count(&HandleName::new("invoice").unwrap()), 0);
    assert_eq!(bed.terminal_count(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_errors_and_chunks_reach_the_callback() {
    let bed = TestBed::new(512);
    spawn_worker(
        &bed.transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::Error {
            code: 42,
            message: "worker said no",
        },
        Arc::default(),
    );
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;
    let uuid = bed.submit(b"rejected", MessagePolicy::default());

    wait_until("peer error", Duration::from_secs(5), || {
        bed.terminal_count() == 1
    })
    .await;
    {
        let responses = bed.responses.lock();
        assert_eq!(responses[0].uuid, uuid);
        assert_eq!(
            responses[0].kind,
            ResponseKind::PeerError {
                code: 42,
                message: "worker said no".into()
            }
        );
    }
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;

    // chunked responses: one chunk, then the terminal choke
    let bed = TestBed::new(512);
    spawn_worker(
        &bed.transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::ChunkThenChoke(b"partial result"),
        Arc::default(),
    );
    bed.refresh(&[HOST_A], &[("invoice", HANDLE_PORT)]).await;
    bed.submit(b"chunky", MessagePolicy::default());

    wait_until("chunk and choke", Duration::from_secs(5), || {
        bed.responses.lock().len() == 2
    })
    .await;
    {
        let responses = bed.responses.lock();
        assert!(
            matches!(&responses[0].kind, ResponseKind::Chunk(chunk) if chunk.as_slice() == b"partial result")
        );
        assert_eq!(responses[1].kind, ResponseKind::Choke);
    }
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

/// A bare handle wired straight to the channel transport, for driving the
/// control vocabulary without a service around it.
fn bare_handle(
    transport: &ChannelTransport,
    hosts: Vec<Ipv4Addr>,
) -> (Handle, Arc<Mutex<Vec<Response>>>) {
    let info = HandleInfo {
        name: HandleName::new("invoice").unwrap(),
        service_name: service_name(),
        port: HANDLE_PORT,
    };
    let responses: Arc<Mutex<Vec<Response>>> = Arc::default();
    let sink = responses.clone();
    // enqueueing directly skips the façade's reservation, so pre-reserve a
    // block for the releases on terminal acknowledgment to draw from
    let gauge = Arc::new(CacheGauge::new(u64::MAX));
    assert!(gauge.try_reserve(1 << 30));
    let handle = Handle::spawn(
        info,
        hosts,
        Arc::new(transport.clone()),
        Duration::from_millis(10),
        gauge,
        Arc::new(move |response| sink.lock().push(response)),
    );
    (handle, responses)
}

fn cached(payload: &[u8]) -> CachedMessage {
    CachedMessage::new(
        path(),
        MessagePolicy::default(),
        crate::DataContainer::new(payload.to_vec()).unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_handle_holds_messages_until_reconnect() {
    let transport = ChannelTransport::new();
    let seen: Arc<Mutex<Vec<MessageId>>> = Arc::default();
    spawn_worker(&transport, HOST_A, HANDLE_PORT, PeerBehavior::Ack, Arc::clone(&seen));

    let (handle, responses) = bare_handle(&transport, vec![HOST_A]);
    handle.connect();
    handle.enqueue(cached(b"first"));
    wait_until("first choke", Duration::from_secs(5), || {
        responses.lock().len() == 1
    })
    .await;

    handle.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.enqueue(cached(b"second"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(handle.cache().new_len(), 1);

    handle.reconnect(vec![HOST_A]);
    wait_until("second choke", Duration::from_secs(5), || {
        responses.lock().len() == 2
    })
    .await;

    let leftover = handle.shutdown().await;
    assert!(leftover.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn staged_hosts_attach_to_a_live_socket() {
    let transport = ChannelTransport::new();
    let seen: Arc<Mutex<Vec<MessageId>>> = Arc::default();
    spawn_worker(&transport, HOST_B, HANDLE_PORT, PeerBehavior::Ack, Arc::clone(&seen));

    // connected, but with no peers yet: sends fail and the message stays
    let (handle, responses) = bare_handle(&transport, Vec::new());
    handle.connect();
    handle.enqueue(cached(b"waiting"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(responses.lock().is_empty());
    assert_eq!(handle.cache().new_len(), 1);

    handle.connect_new_hosts(vec![HOST_B]);
    wait_until("choke after new host", Duration::from_secs(5), || {
        responses.lock().len() == 1
    })
    .await;

    let leftover = handle.shutdown().await;
    assert!(leftover.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_returns_unresolved_messages_as_unsent() {
    let transport = ChannelTransport::new();
    spawn_worker(
        &transport,
        HOST_A,
        HANDLE_PORT,
        PeerBehavior::Silent,
        Arc::default(),
    );
    let (handle, _responses) = bare_handle(&transport, vec![HOST_A]);
    handle.connect();
    for i in 0..5u32 {
        handle.enqueue(cached(format!("stranded {i}").as_bytes()));
    }
    let cache: &MessageCache = handle.cache();
    wait_until("messages in flight", Duration::from_secs(5), || {
        cache.in_flight_len() == 5
    })
    .await;

    let leftover = handle.shutdown().await;
    assert_eq!(leftover.len(), 5);
    assert!(leftover.iter().all(|message| !message.is_sent()));
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_to_an_unknown_service_fails_fast() {
    let bed = TestBed::new(512);
    let foreign = MessagePath::new(
        ServiceName::new("video").unwrap(),
        HandleName::new("transcode").unwrap(),
    );
    let result = bed
        .client
        .send_message(b"lost".to_vec(), foreign, MessagePolicy::default());
    assert!(matches!(result, Err(ClientError::UnknownService(_))));
    assert_eq!(bed.client.cache_bytes(), 0);
    bed.client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn statistics_endpoint_answers_over_the_transport() {
    let data = r#"{
        "lsd_config": {
            "socket_poll_timeout": 10,
            "statistics": { "enabled": true, "remote_access": true, "remote_port": 3400 },
            "services": [{
                "name": "billing",
                "app_name": "billing_app",
                "instance": "production",
                "hosts_url": "http://127.0.0.1:9/hosts"
            }]
        }
    }"#;
    let config = crate::ClientConfig::from_json_str(data).unwrap();
    let transport = ChannelTransport::new();
    let client = Client::new(config, Arc::new(transport.clone())).unwrap();
    client.connect().unwrap();

    // the endpoint binds asynchronously, keep probing until it answers
    let stats_peer = Peer::new(Ipv4Addr::LOCALHOST, 3400);
    let started = tokio::time::Instant::now();
    let reply = loop {
        let mut probe = transport.probe_socket(stats_peer).unwrap();
        probe
            .send(br#"{"version": 1, "action": "cache_stats"}"#.to_vec())
            .await
            .unwrap();
        match probe.recv(Duration::from_millis(200)).await {
            Ok(reply) => break reply,
            Err(_) if started.elapsed() < Duration::from_secs(5) => continue,
            Err(error) => panic!("statistics endpoint never answered: {error}"),
        }
    };
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["used_cache_size"], 0);

    // a parked submission shows up in the per-service queue depths
    client
        .send_message(b"parked".to_vec(), path(), MessagePolicy::default())
        .unwrap();
    let mut probe = transport.probe_socket(stats_peer).unwrap();
    probe
        .send(br#"{"version": 1, "action": "all_services"}"#.to_vec())
        .await
        .unwrap();
    let reply = probe.recv(Duration::from_secs(2)).await.unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["services"]["billing"]["unhandled"]["invoice"], 1);

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_variants_are_rejected() {
    let data = r#"{"lsd_config": {"message_cache": {"type": "PERSISTENT"}}}"#;
    let config = crate::ClientConfig::from_json_str(data).unwrap();
    assert!(matches!(
        Client::new(config, Arc::new(ChannelTransport::new())),
        Err(BuildError::PersistentCacheUnavailable)
    ));

    let data = r#"{"lsd_config": {"autodiscovery": {"type": "MULTICAST"}}}"#;
    let config = crate::ClientConfig::from_json_str(data).unwrap();
    let client = Client::new(config, Arc::new(ChannelTransport::new())).unwrap();
    assert!(matches!(
        client.connect(),
        Err(ConnectError::Discovery(DiscoveryError::MulticastUnavailable))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_discovery_pipeline_end_to_end() {
    let mock_hosts = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/hosts"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("127.0.0.1\n"))
        .mount(&mock_hosts)
        .await;

    let config = crate::ClientConfig::from_json_str(&config_json(
        512,
        &format!("{}/hosts", mock_hosts.uri()),
    ))
    .unwrap();
    let transport = ChannelTransport::new();
    let client = Client::new(config, Arc::new(transport.clone())).unwrap();

    spawn_metadata_server(&transport, Ipv4Addr::LOCALHOST, vec![("invoice", HANDLE_PORT)]);
    spawn_worker(
        &transport,
        Ipv4Addr::LOCALHOST,
        HANDLE_PORT,
        PeerBehavior::Ack,
        Arc::default(),
    );

    let responses: Arc<Mutex<Vec<Response>>> = Arc::default();
    let sink = responses.clone();
    client.set_response_callback(path(), move |response| {
        sink.lock().push(response);
    });
    client.connect().unwrap();

    let uuid = client
        .send_message(b"discovered".to_vec(), path(), MessagePolicy::default())
        .unwrap();

    wait_until("discovery driven choke", Duration::from_secs(15), || {
        responses
            .lock()
            .iter()
            .any(|response| response.uuid == uuid && response.kind == ResponseKind::Choke)
    })
    .await;
    assert_eq!(client.cache_bytes(), 0);
    client.disconnect().await;
}
