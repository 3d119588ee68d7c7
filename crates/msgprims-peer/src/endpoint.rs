//! One TCP connection to a destination.
//!
//! An endpoint is created once its handshake has completed and it has been
//! registered with its destination. Each endpoint owns a receive thread
//! (see [`crate::receive`]) and a writer shared by every dispatch that the
//! selection strategy hands it.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use msgprims_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, Header, HeaderType};
use msgprims_transport::{NetStream, TcpTransport};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::body::{BodyWriter, CountingWriter};
use crate::config::MessagingConfig;
use crate::destination::Destination;
use crate::error::{MessagingError, Result};
use crate::handshake::{
    handshake_client_primary, handshake_client_secondary, negotiate_version, read_connect_request,
    send_connect_response, ConnectResponse,
};
use crate::manager::Shared;
use crate::receive;

/// Consecutive failures after which connect failures are no longer logged
/// at warn level on every attempt.
const QUIET_ERROR_COUNT: u32 = 10;

/// Lifecycle of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    AwaitingPeerHandshake,
    Handshaking,
    LinkEstablished,
    Ready,
    Busy,
    Disconnected,
    Destroyed,
    Failed,
}

/// Read side of an endpoint, shared by the receive loop and body streams.
///
/// `seq` numbers the frames read so far. A body stream remembers the
/// sequence number of its frame and stops reading once the receive loop has
/// moved past it.
pub(crate) struct Inbound {
    reader: FrameReader<NetStream>,
    seq: u64,
    body_remaining: u64,
}

impl Inbound {
    fn new(reader: FrameReader<NetStream>) -> Self {
        Self {
            reader,
            seq: 0,
            body_remaining: 0,
        }
    }

    pub(crate) fn next_header(&mut self, protocol_version: u8) -> msgprims_frame::Result<Header> {
        let header = self.reader.read_header(protocol_version)?;
        self.seq += 1;
        self.body_remaining = header.body_length.max(0) as u64;
        Ok(header)
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn body_remaining(&self) -> u64 {
        self.body_remaining
    }

    /// Read up to `buf.len()` body bytes of frame `seq`.
    pub(crate) fn read_body(&mut self, seq: u64, buf: &mut [u8]) -> io::Result<usize> {
        if seq != self.seq {
            return Err(io::Error::other("message body is no longer available"));
        }
        if self.body_remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = self.body_remaining.min(buf.len() as u64) as usize;
        let n = self.reader.read_body(&mut buf[..want]).map_err(frame_to_io)?;
        self.body_remaining -= n as u64;
        Ok(n)
    }

    /// Read the whole remaining body of the current frame.
    pub(crate) fn read_remaining(&mut self) -> msgprims_frame::Result<Bytes> {
        let len = self.body_remaining as usize;
        let bytes = self.reader.read_body_exact(len)?;
        self.body_remaining = 0;
        Ok(bytes)
    }

    /// Discard what is left of frame `seq`'s body.
    pub(crate) fn skip_body(&mut self, seq: u64) -> io::Result<()> {
        if seq != self.seq {
            return Ok(());
        }
        self.skip_remaining().map_err(frame_to_io)
    }

    pub(crate) fn skip_remaining(&mut self) -> msgprims_frame::Result<()> {
        if self.body_remaining > 0 {
            self.reader.skip(self.body_remaining)?;
            self.body_remaining = 0;
        }
        Ok(())
    }
}

fn frame_to_io(err: FrameError) -> io::Error {
    match err {
        FrameError::Io(err) => err,
        FrameError::ConnectionClosed => io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed while reading message body",
        ),
        other => io::Error::new(ErrorKind::InvalidData, other),
    }
}

/// A connected socket with its framed reader and writer.
struct Link {
    reader: FrameReader<NetStream>,
    writer: FrameWriter<NetStream>,
    control: NetStream,
    peer_addr: SocketAddr,
}

impl Link {
    /// Wrap a fresh socket, configured for the handshake exchange.
    fn open(stream: NetStream, peer_addr: SocketAddr, config: &MessagingConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let handshake_frame = FrameConfig {
            max_object_size: config.handshake.max_handshake_payload,
            read_timeout: Some(config.handshake.timeout),
            write_timeout: Some(config.handshake.timeout),
            ..config.frame.clone()
        };
        let reader = FrameReader::with_config_net(stream.try_clone()?, handshake_frame.clone())?;
        let control = stream.try_clone()?;
        let writer = FrameWriter::with_config_net(stream, handshake_frame)?;
        Ok(Self {
            reader,
            writer,
            control,
            peer_addr,
        })
    }
}

/// Put the runtime limits and timeouts back after the handshake.
fn restore_runtime_io(
    reader: &mut FrameReader<NetStream>,
    writer: &mut FrameWriter<NetStream>,
    config: &MessagingConfig,
) -> Result<()> {
    reader.set_max_object_size(config.frame.max_object_size);
    reader.set_read_timeout(config.frame.read_timeout)?;
    writer.get_ref().set_write_timeout(config.frame.write_timeout)?;
    Ok(())
}

/// One connection to a destination.
pub struct Endpoint {
    id: u64,
    destination: Weak<Destination>,
    shared: Weak<Shared>,
    first_in_group: bool,
    client_side: bool,
    peer_addr: SocketAddr,
    protocol_version: u8,
    state: Mutex<EndpointState>,
    writer: Mutex<FrameWriter<NetStream>>,
    inbound: Arc<Mutex<Inbound>>,
    control: NetStream,
    last_ready: Mutex<Instant>,
    disconnect_received: AtomicBool,
    closed: AtomicBool,
}

impl Endpoint {
    fn new(
        shared: Weak<Shared>,
        id: u64,
        destination: &Arc<Destination>,
        link: Link,
        first_in_group: bool,
        protocol_version: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            destination: Arc::downgrade(destination),
            shared,
            first_in_group,
            client_side: destination.is_client_side(),
            peer_addr: link.peer_addr,
            protocol_version,
            state: Mutex::new(EndpointState::LinkEstablished),
            writer: Mutex::new(link.writer),
            inbound: Arc::new(Mutex::new(Inbound::new(link.reader))),
            control: link.control,
            last_ready: Mutex::new(Instant::now()),
            disconnect_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to a client-side destination and run its handshake.
    ///
    /// The first endpoint of a destination runs the primary handshake and
    /// fixes ids, version and metadata; later ones run a secondary handshake
    /// with the values it established.
    pub(crate) fn connect_client(
        shared: &Arc<Shared>,
        destination: &Arc<Destination>,
        first: bool,
    ) -> Result<Arc<Endpoint>> {
        let config = &shared.config;
        let address = destination.address().ok_or_else(|| {
            MessagingError::HandshakeFailed("destination has no address".to_string())
        })?;

        debug!(%address, first, state = ?EndpointState::Connecting, "connecting endpoint");
        let stream = TcpTransport::connect_timeout(address, config.connect_timeout)?;
        let mut link = Link::open(stream, address, config)?;

        debug!(%address, first, state = ?EndpointState::Handshaking, "handshaking");
        if first {
            let outcome = handshake_client_primary(
                &mut link.reader,
                &mut link.writer,
                destination.destination_id(),
                shared.handshake_metadata(),
                &config.handshake,
            )?;
            restore_runtime_io(&mut link.reader, &mut link.writer, config)?;

            let (endpoint, previous) = {
                let set = shared.registry.lock();
                if !set.contains(destination) {
                    return Err(MessagingError::Disconnected(format!(
                        "{address} was removed during the handshake"
                    )));
                }
                destination.set_protocol_version(outcome.negotiated_version);
                destination.set_client_id(outcome.client_id);
                let previous = destination.set_metadata(outcome.remote_metadata);
                let endpoint = Endpoint::new(
                    Arc::downgrade(shared),
                    shared.next_endpoint_id(),
                    destination,
                    link,
                    true,
                    outcome.negotiated_version,
                );
                destination.add_endpoint(Arc::clone(&endpoint));
                (endpoint, previous)
            };
            shared.notify_metadata_changed(destination, previous.as_ref());
            Ok(endpoint)
        } else {
            let version = destination.protocol_version();
            let accepted = handshake_client_secondary(
                &mut link.reader,
                &mut link.writer,
                destination.client_id(),
                version,
                &config.handshake,
            )?;
            if !accepted {
                return Err(MessagingError::HandshakeFailed(format!(
                    "{address} rejected the secondary connection"
                )));
            }
            restore_runtime_io(&mut link.reader, &mut link.writer, config)?;

            let set = shared.registry.lock();
            if !set.contains(destination) {
                return Err(MessagingError::Disconnected(format!(
                    "{address} was removed during the handshake"
                )));
            }
            let endpoint = Endpoint::new(
                Arc::downgrade(shared),
                shared.next_endpoint_id(),
                destination,
                link,
                false,
                version,
            );
            destination.add_endpoint(Arc::clone(&endpoint));
            Ok(endpoint)
        }
    }

    /// Run the accepting side of the handshake on an inbound connection.
    ///
    /// The endpoint is registered with its destination before the response
    /// is sent, so a peer that starts dispatching as soon as it reads the
    /// response always finds its destination here.
    pub(crate) fn accept_server(
        shared: &Arc<Shared>,
        stream: NetStream,
        remote: SocketAddr,
    ) -> Result<Arc<Endpoint>> {
        let config = &shared.config;
        debug!(%remote, state = ?EndpointState::AwaitingPeerHandshake, "inbound connection");
        let mut link = Link::open(stream, remote, config)?;
        let request = read_connect_request(&mut link.reader, &config.handshake)?;

        if request.first_connect_request {
            let version = negotiate_version(request.protocol_version, &config.handshake);
            let (destination, endpoint, previous) = {
                let mut set = shared.registry.lock();
                let (destination, _) = set.get_or_create(remote, false);
                destination.set_client_id(request.client_id);
                destination.set_protocol_version(version);
                let previous = destination.set_metadata(request.metadata);
                let endpoint = Endpoint::new(
                    Arc::downgrade(shared),
                    shared.next_endpoint_id(),
                    &destination,
                    link,
                    true,
                    version,
                );
                destination.add_endpoint(Arc::clone(&endpoint));
                (destination, endpoint, previous)
            };

            let response = ConnectResponse::primary(
                destination.destination_id(),
                shared.handshake_metadata(),
                version,
            );
            if let Err(err) = endpoint.respond(&response, config) {
                endpoint_disconnected(shared, &endpoint);
                return Err(err);
            }
            shared.notify_metadata_changed(&destination, previous.as_ref());
            info!(
                %remote,
                destination_id = destination.destination_id(),
                version,
                "accepted primary connection"
            );
            return Ok(endpoint);
        }

        let set = shared.registry.lock();
        let destination = set
            .iter()
            .find(|d| !d.is_client_side() && d.destination_id() == request.client_id)
            .cloned();
        let Some(destination) = destination else {
            drop(set);
            let response = ConnectResponse::secondary(false, request.protocol_version);
            if let Err(err) =
                send_connect_response(&mut link.reader, &mut link.writer, &response, &config.handshake)
            {
                debug!(%remote, %err, "rejection not delivered");
            }
            return Err(MessagingError::HandshakeFailed(format!(
                "no primary connection with id {} for secondary connection from {remote}",
                request.client_id
            )));
        };
        let endpoint = Endpoint::new(
            Arc::downgrade(shared),
            shared.next_endpoint_id(),
            &destination,
            link,
            false,
            destination.protocol_version(),
        );
        destination.add_endpoint(Arc::clone(&endpoint));
        drop(set);

        let response = ConnectResponse::secondary(true, endpoint.protocol_version);
        if let Err(err) = endpoint.respond(&response, config) {
            endpoint_disconnected(shared, &endpoint);
            return Err(err);
        }
        debug!(%remote, client_id = request.client_id, "accepted secondary connection");
        Ok(endpoint)
    }

    /// Send the connect response and switch the socket to runtime settings.
    fn respond(&self, response: &ConnectResponse, config: &MessagingConfig) -> Result<()> {
        let mut writer = self.writer.lock();
        let mut inbound = self.inbound.lock();
        send_connect_response(&mut inbound.reader, &mut writer, response, &config.handshake)?;
        restore_runtime_io(&mut inbound.reader, &mut writer, config)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning destination, while it still exists.
    pub fn destination(&self) -> Option<Arc<Destination>> {
        self.destination.upgrade()
    }

    pub(crate) fn shared(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    /// True for the endpoint that ran the primary handshake.
    pub fn is_first_in_group(&self) -> bool {
        self.first_in_group
    }

    pub fn is_client_side(&self) -> bool {
        self.client_side
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: EndpointState) {
        let mut current = self.state.lock();
        if *current != EndpointState::Destroyed {
            *current = state;
        }
    }

    /// When the endpoint last became ready for a dispatch.
    pub fn last_ready_time(&self) -> Instant {
        *self.last_ready.lock()
    }

    pub(crate) fn set_last_ready_time(&self, at: Instant) {
        *self.last_ready.lock() = at;
    }

    /// True once the peer announced that it is closing this connection.
    pub fn disconnect_received(&self) -> bool {
        self.disconnect_received.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnect_received(&self) {
        self.disconnect_received.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn inbound(&self) -> &Arc<Mutex<Inbound>> {
        &self.inbound
    }

    /// Write one frame.
    ///
    /// The header is sent as a copy carrying the destination's client id,
    /// this endpoint's protocol version and the body length. A write
    /// failure closes the endpoint and may be retried on another one.
    pub fn send(&self, header: &Header, body: Option<&dyn BodyWriter>) -> Result<()> {
        if self.is_closed() {
            return Err(MessagingError::dispatch_failed(
                format!("endpoint {} is closed", self.id),
                true,
            ));
        }
        let destination = self.destination().ok_or_else(|| {
            MessagingError::dispatch_failed("destination no longer exists", true)
        })?;

        let mut header = header.clone();
        header.sender_id = destination.client_id();
        header.protocol_version = self.protocol_version;
        let declared = body.map_or(0, |b| b.body_length());
        header.body_length = declared as i64;

        let written = {
            let mut writer = self.writer.lock();
            write_frame(&mut writer, &header, body, self.protocol_version)
        };

        match written {
            Ok(written) if written == declared => Ok(()),
            Ok(written) => {
                error!(
                    endpoint = self.id,
                    declared, written, "body length does not match declared length"
                );
                self.close();
                Err(MessagingError::dispatch_failed(
                    format!("body writer produced {written} bytes, declared {declared}"),
                    false,
                ))
            }
            Err(err @ FrameError::HeaderTooLarge { .. }) => {
                Err(MessagingError::dispatch_failed(err.to_string(), false))
            }
            Err(err) => {
                if !self.is_closed() {
                    warn!(endpoint = self.id, peer = %self.peer_addr, %err, "send failed, closing endpoint");
                }
                self.close();
                Err(MessagingError::dispatch_failed(
                    format!("error sending to {}: {err}", self.peer_addr),
                    true,
                ))
            }
        }
    }

    /// Send a liveness check.
    pub fn check(&self) -> Result<()> {
        self.send(&Header::of_type(HeaderType::EndpointCheck), None)
    }

    /// Announce the disconnect to the peer, then close.
    pub fn disconnect(&self) {
        if !self.is_closed() && !self.disconnect_received() {
            if let Err(err) = self.send(&Header::of_type(HeaderType::Disconnect), None) {
                debug!(endpoint = self.id, %err, "disconnect notice not sent");
            }
        }
        self.close();
    }

    /// Shut the socket down. Unblocks the receive loop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(EndpointState::Disconnected);
        if let Err(err) = self.control.shutdown() {
            debug!(endpoint = self.id, %err, "socket shutdown failed");
        }
    }

    /// A consumer failed to read a body from this endpoint.
    ///
    /// Socket-level failures leave the stream at an unknown position, so the
    /// endpoint is closed. Decode failures and late reads are only logged.
    pub(crate) fn body_read_error_occurred(&self, err: &io::Error) {
        match err.kind() {
            ErrorKind::InvalidData | ErrorKind::Other => {
                debug!(endpoint = self.id, %err, "message body read failed");
            }
            _ => {
                warn!(endpoint = self.id, %err, "error reading message body, closing endpoint");
                self.close();
            }
        }
    }

    /// Hand the freshly linked endpoint to the selection strategy.
    fn link_established(self: &Arc<Self>, shared: &Shared) {
        info!(
            endpoint = self.id,
            peer = %self.peer_addr,
            first = self.first_in_group,
            version = self.protocol_version,
            "link established"
        );
        shared.strategy().endpoint_ready(self);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .field("first_in_group", &self.first_in_group)
            .field("client_side", &self.client_side)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

/// Write header and body, returning the number of body bytes written.
fn write_frame(
    writer: &mut FrameWriter<NetStream>,
    header: &Header,
    body: Option<&dyn BodyWriter>,
    protocol_version: u8,
) -> msgprims_frame::Result<u64> {
    writer.write_header(header, protocol_version)?;
    let mut written = 0;
    if let Some(body) = body {
        let mut counting = CountingWriter::new(writer.get_mut());
        body.write_body(&mut counting)?;
        written = counting.written();
    }
    writer.flush()?;
    Ok(written)
}

/// Start connecting an endpoint of a client-side destination.
///
/// A primary connect is skipped when one is already in progress or the
/// destination already has endpoints.
pub(crate) fn spawn_client(shared: &Arc<Shared>, destination: Arc<Destination>, first: bool) {
    if shared.is_shut_down() {
        return;
    }
    if first {
        if !destination.try_begin_first_connect() {
            return;
        }
    } else {
        destination.begin_connect();
    }

    let name = format!(
        "msgprims-ep-{}",
        destination
            .address()
            .map_or_else(|| "unknown".to_string(), |a| a.to_string())
    );
    let thread_shared = Arc::clone(shared);
    let thread_destination = Arc::clone(&destination);
    let spawned = thread::Builder::new()
        .name(name)
        .spawn(move || run_client(thread_shared, thread_destination, first));

    if let Err(err) = spawned {
        error!(%err, "unable to start endpoint thread");
        destination.finish_connect();
        if first {
            destination.set_connecting_first_endpoint(false);
        }
    }
}

fn run_client(shared: Arc<Shared>, destination: Arc<Destination>, first: bool) {
    let result = Endpoint::connect_client(&shared, &destination, first);
    destination.finish_connect();
    if first {
        first_endpoint_link_established(&shared, &destination, &result);
    }

    match result {
        Ok(endpoint) => {
            endpoint.link_established(&shared);
            receive::run_receive_loop(&shared, &endpoint);
        }
        Err(err) if !first => {
            debug!(destination = %destination.description(), %err, "secondary connect failed");
        }
        Err(_) => {}
    }
}

/// Start the handshake and receive loop of an accepted connection.
pub(crate) fn spawn_server(shared: &Arc<Shared>, stream: NetStream, remote: SocketAddr) -> Result<()> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("msgprims-ep-{remote}"))
        .spawn(move || match Endpoint::accept_server(&shared, stream, remote) {
            Ok(endpoint) => {
                endpoint.link_established(&shared);
                receive::run_receive_loop(&shared, &endpoint);
            }
            Err(err) => {
                warn!(%remote, %err, state = ?EndpointState::Failed, "inbound handshake failed");
            }
        })
        .map(|_| ())
        .map_err(|err| MessagingError::Transport(err.into()))
}

/// Bookkeeping after a primary connect attempt.
///
/// Success clears the error state and starts the secondaries. Failure puts
/// the destination into the error state; warnings stop once the failure
/// count reaches [`QUIET_ERROR_COUNT`].
pub(crate) fn first_endpoint_link_established(
    shared: &Arc<Shared>,
    destination: &Arc<Destination>,
    result: &Result<Arc<Endpoint>>,
) {
    destination.set_connecting_first_endpoint(false);
    match result {
        Ok(_) => {
            let recovered = destination.is_error();
            destination.set_error(false);
            if recovered {
                info!(destination = %destination.description(), "destination reconnected");
            }
            if !shared.registry.contains(destination) {
                return;
            }
            let missing = shared
                .target_endpoints()
                .saturating_sub(destination.endpoint_count());
            for _ in 0..missing {
                spawn_client(shared, Arc::clone(destination), false);
            }
        }
        Err(err) => {
            if destination.error_count() == 0 {
                destination.set_error(true);
            }
            if destination.error_count() < QUIET_ERROR_COUNT {
                warn!(
                    destination = %destination.description(),
                    errors = destination.error_count(),
                    %err,
                    "unable to connect"
                );
            }
        }
    }
}

/// Bookkeeping once an endpoint's receive loop has ended.
pub(crate) fn endpoint_disconnected(shared: &Shared, endpoint: &Arc<Endpoint>) {
    endpoint.close();
    shared.strategy().endpoint_destroyed(endpoint);

    if let Some(destination) = endpoint.destination() {
        let empty = {
            let mut set = shared.registry.lock();
            let empty = destination.remove_endpoint(endpoint.id());
            if empty && !destination.is_client_side() {
                set.remove(&destination);
            }
            empty
        };
        if empty {
            info!(destination = %destination.description(), "all endpoints disconnected");
        } else {
            debug!(endpoint = endpoint.id(), destination_id = destination.destination_id(), "endpoint disconnected");
        }
    }
    endpoint.set_state(EndpointState::Destroyed);
}

#[cfg(test)]
pub(crate) fn test_endpoint_pair(destination: &Arc<Destination>) -> (Arc<Endpoint>, NetStream) {
    use std::net::TcpListener;
    use std::sync::atomic::AtomicU64;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1_000_000);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let stream = TcpTransport::connect(addr).unwrap();
    let (peer, _) = listener.accept().unwrap();

    let link = Link {
        reader: FrameReader::new(stream.try_clone().unwrap()),
        writer: FrameWriter::new(stream.try_clone().unwrap()),
        control: stream,
        peer_addr: addr,
    };
    let endpoint = Endpoint::new(
        Weak::new(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed),
        destination,
        link,
        true,
        msgprims_frame::MESSAGING_PROTOCOL_VERSION,
    );
    (endpoint, NetStream::from_tcp(peer))
}

#[cfg(test)]
pub(crate) fn test_endpoint(destination: &Arc<Destination>) -> Arc<Endpoint> {
    test_endpoint_pair(destination).0
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use msgprims_frame::MESSAGING_PROTOCOL_VERSION;

    use super::*;
    use crate::destination::DestinationRegistry;

    struct LyingBody;

    impl BodyWriter for LyingBody {
        fn body_length(&self) -> u64 {
            10
        }

        fn write_body(&self, out: &mut dyn io::Write) -> io::Result<()> {
            out.write_all(b"short")
        }
    }

    fn destination(port: u16) -> (DestinationRegistry, Arc<Destination>) {
        let registry = DestinationRegistry::new();
        let (dest, _) = registry.get_or_create(SocketAddr::from(([127, 0, 0, 1], port)), true);
        dest.set_client_id(42);
        (registry, dest)
    }

    #[test]
    fn send_stamps_sender_and_length() {
        let (_registry, dest) = destination(7200);
        let (endpoint, peer) = test_endpoint_pair(&dest);

        let header = Header::new().with_message_type(3);
        endpoint.send(&header, Some(b"hello")).unwrap();
        assert_eq!(header.sender_id, msgprims_frame::UNDEFINED, "caller's header untouched");

        let mut reader = FrameReader::new(peer);
        let received = reader.read_header(MESSAGING_PROTOCOL_VERSION).unwrap();
        assert_eq!(received.sender_id, 42);
        assert_eq!(received.message_type, 3);
        assert_eq!(received.body_length, 5);
        assert_eq!(&reader.read_body_exact(5).unwrap()[..], b"hello");
    }

    #[test]
    fn length_mismatch_closes_endpoint() {
        let (_registry, dest) = destination(7201);
        let (endpoint, _peer) = test_endpoint_pair(&dest);

        let err = endpoint.send(&Header::new(), Some(&LyingBody)).unwrap_err();
        assert!(err.is_dispatch_failed());
        assert!(!err.is_redispatch_possible());
        assert!(endpoint.is_closed());
    }

    #[test]
    fn send_on_closed_endpoint_can_be_redispatched() {
        let (_registry, dest) = destination(7202);
        let (endpoint, _peer) = test_endpoint_pair(&dest);
        endpoint.close();
        assert_eq!(endpoint.state(), EndpointState::Disconnected);

        let err = endpoint.check().unwrap_err();
        assert!(err.is_redispatch_possible());
    }

    #[test]
    fn disconnect_announces_then_closes() {
        let (_registry, dest) = destination(7203);
        let (endpoint, peer) = test_endpoint_pair(&dest);
        endpoint.disconnect();
        assert!(endpoint.is_closed());

        let mut reader = FrameReader::new(peer);
        let received = reader.read_header(MESSAGING_PROTOCOL_VERSION).unwrap();
        assert_eq!(received.header_type, HeaderType::Disconnect);
        assert!(matches!(
            reader.read_header(MESSAGING_PROTOCOL_VERSION),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn stale_body_reads_are_refused() {
        let (_registry, dest) = destination(7204);
        let (endpoint, peer) = test_endpoint_pair(&dest);

        let mut writer = FrameWriter::new(peer);
        let mut first = Header::new();
        first.body_length = 3;
        writer.send(&first, b"abc", MESSAGING_PROTOCOL_VERSION).unwrap();
        writer.send(&Header::new(), b"", MESSAGING_PROTOCOL_VERSION).unwrap();

        let mut inbound = endpoint.inbound().lock();
        inbound.next_header(MESSAGING_PROTOCOL_VERSION).unwrap();
        let seq = inbound.seq();
        assert_eq!(inbound.body_remaining(), 3);
        inbound.skip_remaining().unwrap();
        inbound.next_header(MESSAGING_PROTOCOL_VERSION).unwrap();

        let mut buf = [0u8; 3];
        let err = inbound.read_body(seq, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn read_error_on_socket_closes_endpoint() {
        let (_registry, dest) = destination(7205);
        let (endpoint, _peer) = test_endpoint_pair(&dest);

        endpoint.body_read_error_occurred(&io::Error::new(ErrorKind::InvalidData, "bad"));
        assert!(!endpoint.is_closed());
        endpoint.body_read_error_occurred(&io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert!(endpoint.is_closed());
    }
}
