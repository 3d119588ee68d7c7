//! End-to-end tests with two messaging systems on loopback.

use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use msgprims_frame::{
    encode_header, FieldMap, FieldValue, FrameConfig, FrameReader, FrameWriter, Header,
};
use msgprims_peer::handshake::{
    handshake_client_primary, negotiate_version, read_connect_request, send_connect_response,
};
use msgprims_peer::{
    with_response_timeout, AccessControl, BoxError, ConnectResponse, Destination, DispatchRequest,
    HandshakeConfig, JsonBody, Message, MessageContext, MessagingConfig, MessagingError,
    MessagingManager, MetadataListener, Target,
};
use msgprims_transport::{address_id, TcpTransport};
use serde::{Deserialize, Serialize};

fn config() -> MessagingConfig {
    MessagingConfig::default()
        .with_connections_per_destination(1)
        .with_response_timeout(Duration::from_secs(5))
        .with_check_interval(Duration::from_millis(500))
        .with_excess_endpoint_grace(Duration::from_millis(100))
        .with_connect_timeout(Duration::from_secs(1))
        .with_worker_pool(4, 64)
}

fn loopback() -> Option<SocketAddr> {
    Some("127.0.0.1:0".parse().unwrap())
}

fn start_server(config: MessagingConfig) -> MessagingManager {
    MessagingManager::start(config, loopback()).unwrap()
}

/// A client with one destination, returned once the primary link is up.
fn start_client(config: MessagingConfig, server: &MessagingManager) -> (MessagingManager, Arc<Destination>) {
    let client = MessagingManager::start(config, None).unwrap();
    let destination = client.add_destination(server.local_addr().unwrap());
    assert!(
        wait_until(Duration::from_secs(5), || destination.is_linked()),
        "client never linked to server"
    );
    (client, destination)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

fn echo(_: &MessageContext, mut msg: Message) -> Result<(), BoxError> {
    let body = msg.body_bytes()?;
    msg.reply(Header::new(), Some(&body))?;
    Ok(())
}

fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn sync_send_round_trip_leaves_no_pending_replies() {
    let server = start_server(config());
    server.set_default_consumer(echo);
    let (client, _) = start_client(config(), &server);

    for i in 0..20 {
        let body = format!("ping {i}");
        let mut reply = client.send(Header::new(), Some(&body)).unwrap();
        assert_eq!(&reply.body_bytes().unwrap()[..], body.as_bytes());
        assert!(reply.header().is_reply());
    }
    assert_eq!(client.pending_replies(), 0);
}

#[test]
fn every_sync_outcome_clears_the_pending_table() {
    let server = start_server(config());
    server.register_consumer("silent", |_: &MessageContext, msg: Message| -> Result<(), BoxError> {
        msg.signal_read_completion();
        Ok(())
    });
    server.register_consumer("failing", |_: &MessageContext, _: Message| -> Result<(), BoxError> {
        Err("order rejected".into())
    });
    let (client, destination) = start_client(config(), &server);
    assert!(wait_until(Duration::from_secs(5), || destination.has_named_receiver("failing")));

    let err = with_response_timeout(Duration::from_millis(200), || {
        client.send_to_named("silent", Header::new(), None)
    })
    .unwrap_err();
    assert!(matches!(err, MessagingError::ResponseTimeout(_)), "{err}");
    assert_eq!(client.pending_replies(), 0);

    let err = client.send_to_named("failing", Header::new(), None).unwrap_err();
    assert!(err.is_dispatch_failed());
    assert!(err.to_string().contains("order rejected"), "{err}");
    assert_eq!(client.pending_replies(), 0);

    let err = with_response_timeout(Duration::from_millis(200), || {
        client.send_to_named("nobody", Header::new(), Some(&"x"))
    })
    .unwrap_err();
    assert!(matches!(err, MessagingError::NoEndpointAvailable(_)), "{err}");
    assert!(err.is_dispatch_failed());
    assert_eq!(client.pending_replies(), 0);
}

#[test]
fn concurrent_replies_reach_their_own_callers() {
    let server = start_server(config().with_worker_pool(8, 256));
    server.set_default_consumer(|_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let body = msg.body_bytes()?;
        let jitter = body.iter().map(|b| *b as u64).sum::<u64>() % 7;
        thread::sleep(Duration::from_millis(jitter));
        msg.reply(Header::new(), Some(&body))?;
        Ok(())
    });
    let (client, _) = start_client(config().with_connections_per_destination(3), &server);

    let callers: Vec<_> = (0..8)
        .map(|caller| {
            let handle = client.handle();
            thread::spawn(move || {
                for i in 0..25 {
                    let body = format!("caller {caller} request {i}");
                    let mut reply = handle.send(Header::new(), Some(&body)).unwrap();
                    assert_eq!(&reply.body_bytes().unwrap()[..], body.as_bytes());
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(client.pending_replies(), 0);
}

#[test]
fn late_reply_never_reaches_a_consumer() {
    let server = start_server(config());
    server.set_default_consumer(|_: &MessageContext, msg: Message| -> Result<(), BoxError> {
        thread::sleep(Duration::from_millis(400));
        msg.reply(Header::new(), Some(&"too late"))?;
        Ok(())
    });

    let (client, _) = start_client(config(), &server);
    let delivered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&delivered);
    client.set_default_consumer(move |_: &MessageContext, _: Message| -> Result<(), BoxError> {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let err = client
        .dispatch(DispatchRequest::new().with_timeout(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, MessagingError::ResponseTimeout(_)), "{err}");

    thread::sleep(Duration::from_millis(800));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(client.pending_replies(), 0);
}

#[test]
fn endpoint_count_converges_on_the_target() {
    let server = start_server(config());
    server.set_default_consumer(echo);
    let (client, destination) = start_client(config().with_connections_per_destination(3), &server);

    assert!(
        wait_until(Duration::from_secs(5), || destination.live_endpoint_count() == 3),
        "expected 3 endpoints, have {}",
        destination.live_endpoint_count()
    );

    client.set_connections_per_destination(1);
    assert!(
        wait_until(Duration::from_secs(10), || destination.live_endpoint_count() == 1),
        "expected 1 endpoint, have {}",
        destination.live_endpoint_count()
    );
    assert!(wait_until(Duration::from_secs(5), || {
        server
            .destinations()
            .iter()
            .map(|d| d.live_endpoint_count())
            .sum::<usize>()
            == 1
    }));

    let mut reply = client.send(Header::new(), Some(&"still linked")).unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"still linked");
}

#[test]
fn unreachable_destination_fails_within_the_timeout() {
    let client = MessagingManager::start(config(), None).unwrap();
    client.add_destination(unused_addr());

    let started = Instant::now();
    let err = client
        .dispatch(
            DispatchRequest::new()
                .with_body(&"hello")
                .with_timeout(Duration::from_millis(500)),
        )
        .unwrap_err();
    assert!(err.is_dispatch_failed(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.pending_replies(), 0);
}

struct ReadOnly;

impl AccessControl for ReadOnly {
    fn identify(&self, message: &Message) -> Option<String> {
        match message.header().message_type {
            2 => Some("write".to_string()),
            _ => Some("read".to_string()),
        }
    }

    fn check_access(&self, _receiver: &str, operation: &str) -> bool {
        operation == "read"
    }
}

#[test]
fn access_denied_reply_fails_the_dispatch() {
    let server = start_server(config());
    server.set_default_consumer(echo);
    server.set_access_control(ReadOnly);
    let (client, _) = start_client(config(), &server);

    let mut reply = client
        .send(Header::new().with_message_type(1), Some(&"read me"))
        .unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"read me");

    let err = client
        .send(Header::new().with_message_type(2), Some(&"write me"))
        .unwrap_err();
    assert!(err.is_dispatch_failed());
    assert!(err.to_string().to_lowercase().contains("no access"), "{err}");
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Order {
    id: u32,
    item: String,
}

#[test]
fn cached_body_is_readable_as_bytes_then_object() {
    let server = start_server(config());
    server.set_default_consumer(|_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        msg.set_caching(true);
        let raw = msg.body_bytes()?;
        let order: Order = msg.body_object()?;
        let text = String::from_utf8(raw.to_vec())?;
        let reply = JsonBody::new(&(order.id, text))?;
        msg.reply(Header::new(), Some(&reply))?;
        Ok(())
    });
    let (client, _) = start_client(config(), &server);

    let order = Order {
        id: 42,
        item: "widget".to_string(),
    };
    let body = JsonBody::new(&order).unwrap();
    let mut reply = client.send(Header::new(), Some(&body)).unwrap();

    let raw = reply.body_bytes().unwrap();
    assert!(matches!(
        reply.body_object::<(u32, String)>(),
        Err(MessagingError::BodyConsumed)
    ));
    let (id, text): (u32, String) = serde_json::from_slice(&raw).unwrap();
    assert_eq!(id, 42);
    assert_eq!(serde_json::from_str::<Order>(&text).unwrap(), order);
}

#[test]
fn large_bodies_are_streamed_to_the_consumer() {
    let server = start_server(config().with_prebuffer_limit(16));
    server.set_default_consumer(|_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let mut stream = msg.body_stream()?;
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut content)?;
        let sum: u64 = content.iter().map(|b| *b as u64).sum();
        msg.reply(Header::new(), Some(&format!("{} {sum}", content.len())))?;
        Ok(())
    });
    let (client, _) = start_client(config(), &server);

    let body: Vec<u8> = (0..65_536u32).map(|i| (i % 251) as u8).collect();
    let expected: u64 = body.iter().map(|b| *b as u64).sum();
    for _ in 0..3 {
        let mut reply = client.send(Header::new(), Some(&body)).unwrap();
        assert_eq!(
            String::from_utf8(reply.body_bytes().unwrap().to_vec()).unwrap(),
            format!("65536 {expected}")
        );
    }
}

#[test]
fn unread_large_body_does_not_break_the_connection() {
    let server = start_server(config().with_prebuffer_limit(16));
    server.register_consumer("ignore", |_: &MessageContext, msg: Message| -> Result<(), BoxError> {
        msg.reply(Header::new(), Some(&"ignored"))?;
        Ok(())
    });
    server.set_default_consumer(echo);
    let (client, destination) = start_client(config(), &server);
    assert!(wait_until(Duration::from_secs(5), || destination.has_named_receiver("ignore")));

    let big = vec![7u8; 32 * 1024];
    let mut reply = client.send_to_named("ignore", Header::new(), Some(&big)).unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"ignored");

    let mut reply = client.send(Header::new(), Some(&"after")).unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"after");
}

struct CountingListener(Arc<AtomicUsize>);

impl MetadataListener for CountingListener {
    fn metadata_changed(&self, _destination: &Arc<Destination>, _previous: Option<&FieldMap>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn metadata_updates_reach_linked_peers() {
    let server = start_server(config().with_report_load(false));
    server.set_default_consumer(echo);
    let client = MessagingManager::start(config(), None).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    client.set_metadata_listener(CountingListener(Arc::clone(&changes)));
    let destination = client.add_destination(server.local_addr().unwrap());
    assert!(wait_until(Duration::from_secs(5), || destination.is_linked()));

    server.set_metadata("zone", "eu-west");
    server.perform_periodic_check();
    assert!(wait_until(Duration::from_secs(5), || {
        destination.metadata_value("zone") == Some(FieldValue::from("eu-west"))
    }));
    assert!(changes.load(Ordering::SeqCst) >= 2);

    let filter = FieldMap::from([("zone".to_string(), FieldValue::from("eu-west"))]);
    let mut reply = client
        .send_matching(filter.clone(), Header::new(), Some(&"zoned"))
        .unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"zoned");

    server.remove_metadata("zone");
    server.perform_periodic_check();
    assert!(wait_until(Duration::from_secs(5), || destination.metadata_value("zone").is_none()));

    let err = client
        .dispatch(
            DispatchRequest::new()
                .with_target(Target::MetaData(filter))
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap_err();
    assert!(matches!(err, MessagingError::NoEndpointAvailable(_)), "{err}");
}

#[test]
fn server_shutdown_disconnects_the_client() {
    let server = start_server(config());
    server.set_default_consumer(echo);
    let (client, destination) = start_client(config(), &server);

    server.shutdown();
    assert!(wait_until(Duration::from_secs(5), || destination.live_endpoint_count() == 0));

    let err = client
        .dispatch(
            DispatchRequest::new()
                .with_body(&"anyone?")
                .with_timeout(Duration::from_millis(300)),
        )
        .unwrap_err();
    assert!(err.is_dispatch_failed(), "{err}");
}

#[test]
fn replies_use_the_sending_connection_destination() {
    let server = start_server(config());
    let (client, destination) = start_client(config(), &server);
    client.set_default_consumer(echo);

    assert!(wait_until(Duration::from_secs(5), || server.destinations().len() == 1));
    let inbound = server.destinations().remove(0);
    assert!(!inbound.is_client_side());
    assert_eq!(inbound.client_id(), destination.destination_id());
    assert_eq!(destination.client_id(), inbound.destination_id());

    let mut reply = server
        .send_to(inbound.destination_id(), Header::new(), Some(&"reverse"))
        .unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"reverse");
}

#[test]
fn malformed_frame_is_skipped_without_dropping_the_connection() {
    let server = start_server(config());
    let (tx, rx) = crossbeam_channel::unbounded();
    server.set_default_consumer(move |_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        tx.send(msg.body_bytes()?.to_vec())?;
        Ok(())
    });
    let server_addr = server.local_addr().unwrap();

    let frame = FrameConfig {
        read_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        ..FrameConfig::default()
    };
    let stream = TcpTransport::connect(server_addr).unwrap();
    let mut reader = FrameReader::with_config_net(stream.try_clone().unwrap(), frame.clone()).unwrap();
    let mut writer = FrameWriter::with_config_net(stream, frame).unwrap();
    let outcome = handshake_client_primary(
        &mut reader,
        &mut writer,
        address_id(server_addr),
        None,
        &HandshakeConfig::default(),
    )
    .unwrap();
    let version = outcome.negotiated_version;

    let header = |message_id: i64| Header {
        sender_id: outcome.client_id,
        message_id,
        message_type: 1,
        body_length: 5,
        asynch: true,
        ..Header::default()
    };

    let mut wire = BytesMut::new();
    encode_header(&header(1), &mut wire).unwrap();
    wire[4] = 0x33;
    wire.extend_from_slice(b"hello");
    writer.get_mut().write_all(&wire).unwrap();
    writer.send(&header(2), b"after", version).unwrap();

    let body = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"after");
    assert!(rx.try_recv().is_err());

    let inbound = server.destinations();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].endpoint_count(), 1);
}

#[test]
fn legacy_protocol_peer_exchanges_messages() {
    let server = start_server(config());
    server.set_default_consumer(echo);
    server.register_consumer("echo", echo);

    let legacy = HandshakeConfig {
        protocol_version: 3,
        ..HandshakeConfig::default()
    };
    let (client, destination) = start_client(
        config()
            .with_connections_per_destination(2)
            .with_handshake_config(legacy),
        &server,
    );
    assert_eq!(destination.protocol_version(), 3);
    assert!(wait_until(Duration::from_secs(5), || destination.endpoint_count() == 2));
    assert!(wait_until(Duration::from_secs(5), || destination.has_named_receiver("echo")));

    let order = Order {
        id: 11,
        item: "legacy".into(),
    };
    for _ in 0..4 {
        let mut reply = client
            .send(Header::new().with_description("v3"), Some(&JsonBody::new(&order).unwrap()))
            .unwrap();
        assert_eq!(reply.header().protocol_version, 3);
        assert_eq!(reply.body_object::<Order>().unwrap(), order);
    }

    let mut reply = client.send_to_named("echo", Header::new(), Some(&"named")).unwrap();
    assert_eq!(&reply.body_bytes().unwrap()[..], b"named");

    let inbound = server.destinations();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].protocol_version(), 3);
}

#[test]
fn peer_that_stops_reading_fails_the_dispatch_in_time() {
    let listener = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr();
    let (release, hold) = mpsc::channel::<()>();
    let peer = thread::spawn(move || {
        let handshake = HandshakeConfig::default();
        let (stream, _) = listener.accept().unwrap();
        let frame = FrameConfig {
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_net(stream.try_clone().unwrap(), frame.clone()).unwrap();
        let mut writer = FrameWriter::with_config_net(stream, frame).unwrap();
        let request = read_connect_request(&mut reader, &handshake).unwrap();
        let version = negotiate_version(request.protocol_version, &handshake);
        let response = ConnectResponse::primary(request.client_id, None, version);
        send_connect_response(&mut reader, &mut writer, &response, &handshake).unwrap();
        // Hold the connection open without ever reading from it.
        let _ = hold.recv_timeout(Duration::from_secs(30));
    });

    let stalled = config()
        .with_frame_config(FrameConfig {
            write_timeout: Some(Duration::from_millis(100)),
            ..FrameConfig::default()
        })
        .with_handshake_config(HandshakeConfig {
            timeout: Duration::from_secs(1),
            ..HandshakeConfig::default()
        });
    let client = MessagingManager::start(stalled, None).unwrap();
    let destination = client.add_destination(addr);
    assert!(wait_until(Duration::from_secs(5), || destination.is_linked()));

    let body = vec![0x5au8; 32 * 1024 * 1024];
    let started = Instant::now();
    let err = client
        .dispatch(
            DispatchRequest::new()
                .with_body(&body)
                .with_timeout(Duration::from_secs(2))
                .asynchronous(),
        )
        .unwrap_err();
    assert!(err.is_dispatch_failed(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(8), "{:?}", started.elapsed());

    client.shutdown();
    let _ = release.send(());
    peer.join().unwrap();
}
