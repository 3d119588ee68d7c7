//! Connection handshake.
//!
//! The connecting side sends a [`ConnectRequest`] and the accepting side
//! answers with a [`ConnectResponse`]. Both travel as self-delimited objects
//! regardless of the protocol version. The first ("primary") connection to
//! a destination exchanges ids and metadata and fixes the protocol version
//! for every later ("secondary") connection of the same destination.
//!
//! On protocol v4 and later each side writes one reset marker after the
//! handshake and consumes the peer's before the first steady-state frame.

use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use msgprims_frame::{
    is_length_prefixed, FieldMap, FrameError, FrameReader, FrameWriter,
    MESSAGING_PROTOCOL_VERSION, UNDEFINED,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MessagingError, Result};

/// First protocol version whose connect response reports secondary success.
pub const SECONDARY_SUCCESS_VERSION: u8 = 6;

const MAX_METADATA_ENTRIES: usize = 1024;

/// Sent by the connecting side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectRequest {
    pub protocol_version: u8,
    /// Primary: the id the connecting side uses for the accepting side.
    /// Secondary: the id the accepting side assigned to the connecting side.
    pub client_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FieldMap>,
    pub first_connect_request: bool,
}

/// Sent by the accepting side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectResponse {
    /// Id under which the connecting side is known to the accepting side.
    pub client_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FieldMap>,
    pub protocol_version: u8,
    #[serde(default = "default_secondary_success")]
    pub secondary_response_success: bool,
}

fn default_secondary_success() -> bool {
    true
}

impl ConnectResponse {
    /// Response to a primary request.
    pub fn primary(client_id: i64, metadata: Option<FieldMap>, protocol_version: u8) -> Self {
        Self {
            client_id,
            metadata,
            protocol_version,
            secondary_response_success: true,
        }
    }

    /// Response to a secondary request.
    pub fn secondary(success: bool, protocol_version: u8) -> Self {
        Self {
            client_id: UNDEFINED,
            metadata: None,
            protocol_version,
            secondary_response_success: success,
        }
    }
}

/// Result of a successful primary handshake on the connecting side.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryOutcome {
    pub negotiated_version: u8,
    /// Id under which the local system is known to the peer.
    pub client_id: i64,
    pub remote_metadata: Option<FieldMap>,
}

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Socket timeout used for the handshake exchange.
    pub timeout: Duration,
    /// Highest protocol version offered or accepted.
    pub protocol_version: u8,
    /// Maximum size of one handshake object in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            protocol_version: MESSAGING_PROTOCOL_VERSION,
            max_handshake_payload: 64 * 1024,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_version", &self.protocol_version)
            .field("max_handshake_payload", &self.max_handshake_payload)
            .finish()
    }
}

/// Run the primary handshake on the connecting side.
///
/// `destination_id` is the id the local system uses for the peer; the peer
/// uses it as this system's client id when sending replies back.
pub fn handshake_client_primary<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    destination_id: i64,
    local_metadata: Option<FieldMap>,
    config: &HandshakeConfig,
) -> Result<PrimaryOutcome> {
    validate_protocol_version(config.protocol_version)?;

    let request = ConnectRequest {
        protocol_version: config.protocol_version,
        client_id: destination_id,
        metadata: local_metadata,
        first_connect_request: true,
    };
    debug!(destination_id, "sending primary connect request");
    writer.write_object(&request)?;

    let deadline = Instant::now() + config.timeout;
    let response: ConnectResponse = recv_object(reader, deadline, config.timeout)?;

    validate_protocol_version(response.protocol_version)?;
    if response.protocol_version > config.protocol_version {
        return Err(MessagingError::HandshakeFailed(format!(
            "peer selected protocol v{} above offered v{}",
            response.protocol_version, config.protocol_version
        )));
    }
    if response.client_id == UNDEFINED {
        return Err(MessagingError::HandshakeFailed(
            "peer did not assign a client id".to_string(),
        ));
    }
    validate_metadata(response.metadata.as_ref())?;

    if is_length_prefixed(response.protocol_version) {
        recv_reset_marker(reader, deadline, config.timeout)?;
        writer.write_reset_marker()?;
    }

    debug!(
        version = response.protocol_version,
        client_id = response.client_id,
        "primary handshake complete"
    );

    Ok(PrimaryOutcome {
        negotiated_version: response.protocol_version,
        client_id: response.client_id,
        remote_metadata: response.metadata,
    })
}

/// Run a secondary handshake on the connecting side.
///
/// Returns whether the peer accepted the connection. Peers below
/// [`SECONDARY_SUCCESS_VERSION`] do not report this, so success is assumed.
pub fn handshake_client_secondary<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    client_id: i64,
    protocol_version: u8,
    config: &HandshakeConfig,
) -> Result<bool> {
    let request = ConnectRequest {
        protocol_version,
        client_id,
        metadata: None,
        first_connect_request: false,
    };
    debug!(client_id, "sending secondary connect request");
    writer.write_object(&request)?;

    let deadline = Instant::now() + config.timeout;
    let response: ConnectResponse = recv_object(reader, deadline, config.timeout)?;

    let success = protocol_version < SECONDARY_SUCCESS_VERSION || response.secondary_response_success;
    if success && is_length_prefixed(protocol_version) {
        recv_reset_marker(reader, deadline, config.timeout)?;
        writer.write_reset_marker()?;
    }
    Ok(success)
}

/// Read the connect request on the accepting side.
pub fn read_connect_request<R: Read>(
    reader: &mut FrameReader<R>,
    config: &HandshakeConfig,
) -> Result<ConnectRequest> {
    let deadline = Instant::now() + config.timeout;
    let request: ConnectRequest = recv_object(reader, deadline, config.timeout)?;
    validate_protocol_version(request.protocol_version)?;
    validate_metadata(request.metadata.as_ref())?;
    Ok(request)
}

/// Protocol version the accepting side settles on.
pub fn negotiate_version(requested: u8, config: &HandshakeConfig) -> u8 {
    requested.min(config.protocol_version)
}

/// Send the connect response on the accepting side.
///
/// On v4 and later a successful handshake is followed by the reset marker
/// exchange: this side writes its marker, then consumes the peer's.
pub fn send_connect_response<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    response: &ConnectResponse,
    config: &HandshakeConfig,
) -> Result<()> {
    writer.write_object(response)?;

    if response.secondary_response_success && is_length_prefixed(response.protocol_version) {
        writer.write_reset_marker()?;
        let deadline = Instant::now() + config.timeout;
        recv_reset_marker(reader, deadline, config.timeout)?;
    }
    Ok(())
}

fn recv_object<T: DeserializeOwned, R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
) -> Result<T> {
    loop {
        if Instant::now() >= deadline {
            return Err(MessagingError::HandshakeFailed(format!(
                "timed out after {timeout:?}"
            )));
        }

        match reader.read_object() {
            Ok(object) => return Ok(object),
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(MessagingError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(FrameError::ObjectTooLarge { size, max }) => {
                return Err(MessagingError::HandshakeFailed(format!(
                    "handshake payload too large: {size} (max {max})"
                )));
            }
            Err(err) => return Err(MessagingError::Frame(err)),
        }
    }
}

fn recv_reset_marker<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    loop {
        if Instant::now() >= deadline {
            return Err(MessagingError::HandshakeFailed(format!(
                "timed out after {timeout:?} waiting for reset marker"
            )));
        }

        match reader.read_reset_marker() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                return Err(MessagingError::Disconnected(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(err) => return Err(MessagingError::Frame(err)),
        }
    }
}

fn validate_protocol_version(version: u8) -> Result<()> {
    if version == 0 {
        return Err(MessagingError::HandshakeFailed(
            "invalid protocol version 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_metadata(metadata: Option<&FieldMap>) -> Result<()> {
    if let Some(meta) = metadata {
        if meta.len() > MAX_METADATA_ENTRIES {
            return Err(MessagingError::HandshakeFailed(format!(
                "too many metadata entries: {} (max {})",
                meta.len(),
                MAX_METADATA_ENTRIES
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, ErrorKind, Read};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use msgprims_frame::{FieldValue, Header, RESET_MARKER};

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn framed(stream: TcpStream) -> (FrameReader<TcpStream>, FrameWriter<TcpStream>) {
        (
            FrameReader::new(stream.try_clone().unwrap()),
            FrameWriter::new(stream),
        )
    }

    fn meta(key: &str, value: &str) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(key.to_string(), FieldValue::from(value));
        map
    }

    fn serve_primary(stream: TcpStream, config: HandshakeConfig) -> ConnectRequest {
        let (mut reader, mut writer) = framed(stream);
        let request = read_connect_request(&mut reader, &config).unwrap();
        let version = negotiate_version(request.protocol_version, &config);
        let response = ConnectResponse::primary(99, Some(meta("name", "server")), version);
        send_connect_response(&mut reader, &mut writer, &response, &config).unwrap();

        if is_length_prefixed(version) {
            let header = reader.read_header(version).unwrap();
            assert_eq!(header.message_type, 1, "steady state after markers");
        }
        request
    }

    #[test]
    fn primary_handshake_exchanges_ids_and_metadata() {
        let (server, client) = pair();
        let server = thread::spawn(move || serve_primary(server, HandshakeConfig::default()));

        let (mut reader, mut writer) = framed(client);
        let outcome = handshake_client_primary(
            &mut reader,
            &mut writer,
            1234,
            Some(meta("name", "client")),
            &HandshakeConfig::default(),
        )
        .unwrap();
        writer
            .send(&Header::new().with_message_type(1), b"", outcome.negotiated_version)
            .unwrap();

        let request = server.join().unwrap();
        assert!(request.first_connect_request);
        assert_eq!(request.client_id, 1234);
        assert_eq!(request.metadata, Some(meta("name", "client")));

        assert_eq!(outcome.negotiated_version, MESSAGING_PROTOCOL_VERSION);
        assert_eq!(outcome.client_id, 99);
        assert_eq!(outcome.remote_metadata, Some(meta("name", "server")));
    }

    #[test]
    fn server_picks_minimum_version() {
        let (server, client) = pair();
        let server_config = HandshakeConfig {
            protocol_version: 4,
            ..HandshakeConfig::default()
        };
        let server = thread::spawn(move || serve_primary(server, server_config));

        let (mut reader, mut writer) = framed(client);
        let outcome =
            handshake_client_primary(&mut reader, &mut writer, 1, None, &HandshakeConfig::default())
                .unwrap();
        writer
            .send(&Header::new().with_message_type(1), b"", outcome.negotiated_version)
            .unwrap();

        server.join().unwrap();
        assert_eq!(outcome.negotiated_version, 4);
    }

    #[test]
    fn legacy_version_skips_reset_marker() {
        let (server, client) = pair();
        let server_config = HandshakeConfig {
            protocol_version: 3,
            ..HandshakeConfig::default()
        };
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = framed(server);
            let request = read_connect_request(&mut reader, &server_config).unwrap();
            let version = negotiate_version(request.protocol_version, &server_config);
            let response = ConnectResponse::primary(7, None, version);
            send_connect_response(&mut reader, &mut writer, &response, &server_config).unwrap();
            reader.read_header(version).unwrap()
        });

        let (mut reader, mut writer) = framed(client);
        let outcome =
            handshake_client_primary(&mut reader, &mut writer, 1, None, &HandshakeConfig::default())
                .unwrap();
        assert_eq!(outcome.negotiated_version, 3);
        writer
            .send(&Header::new().with_message_type(5), b"", 3)
            .unwrap();

        assert_eq!(server.join().unwrap().message_type, 5);
    }

    #[test]
    fn secondary_failure_is_reported_on_v6() {
        let (server, client) = pair();
        let server = thread::spawn(move || {
            let config = HandshakeConfig::default();
            let (mut reader, mut writer) = framed(server);
            let request = read_connect_request(&mut reader, &config).unwrap();
            assert!(!request.first_connect_request);
            let response = ConnectResponse::secondary(false, request.protocol_version);
            send_connect_response(&mut reader, &mut writer, &response, &config).unwrap();
        });

        let (mut reader, mut writer) = framed(client);
        let ok = handshake_client_secondary(&mut reader, &mut writer, 99, 6, &HandshakeConfig::default())
            .unwrap();
        server.join().unwrap();
        assert!(!ok);
    }

    #[test]
    fn secondary_success_assumed_below_v6() {
        let (server, client) = pair();
        let server = thread::spawn(move || {
            let config = HandshakeConfig::default();
            let (mut reader, mut writer) = framed(server);
            let request = read_connect_request(&mut reader, &config).unwrap();
            // An old peer never sets the success flag.
            let response = ConnectResponse::secondary(false, request.protocol_version);
            writer.write_object(&response).unwrap();
            writer.write_reset_marker().unwrap();
            reader.read_reset_marker().unwrap();
        });

        let (mut reader, mut writer) = framed(client);
        let ok = handshake_client_secondary(&mut reader, &mut writer, 99, 5, &HandshakeConfig::default())
            .unwrap();
        server.join().unwrap();
        assert!(ok);
    }

    #[test]
    fn missing_client_id_rejected() {
        let mut wire = bytes::BytesMut::new();
        msgprims_frame::encode_object(&ConnectResponse::primary(UNDEFINED, None, 6), &mut wire)
            .unwrap();
        wire.extend_from_slice(&[RESET_MARKER]);

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let result =
            handshake_client_primary(&mut reader, &mut writer, 1, None, &HandshakeConfig::default());
        assert!(matches!(result, Err(MessagingError::HandshakeFailed(_))));
    }

    #[test]
    fn invalid_request_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"{\"not\":\"a request\"}".to_vec()));
        let result = read_connect_request(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(MessagingError::Frame(FrameError::Object(_)))));
    }

    #[test]
    fn closed_connection_is_disconnect() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let result = read_connect_request(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(MessagingError::Disconnected(_))));
    }

    #[test]
    fn handshake_timeout() {
        let mut reader = FrameReader::new(AlwaysTimedOutReader);
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let result = handshake_client_primary(&mut reader, &mut writer, 1, None, &cfg);
        assert!(matches!(result, Err(MessagingError::HandshakeFailed(_))));
    }

    #[test]
    fn oversized_request_rejected() {
        let mut map = FieldMap::new();
        map.insert("blob".to_string(), FieldValue::from("x".repeat(512)));
        let request = ConnectRequest {
            protocol_version: 6,
            client_id: 1,
            metadata: Some(map),
            first_connect_request: true,
        };
        let mut wire = bytes::BytesMut::new();
        msgprims_frame::encode_object(&request, &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        reader.set_max_object_size(64);
        let result = read_connect_request(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(MessagingError::HandshakeFailed(_))));
    }

    struct AlwaysTimedOutReader;

    impl Read for AlwaysTimedOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
