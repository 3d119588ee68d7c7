use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, Bytes, BytesMut};
use msgprims_transport::NetStream;
use serde::de::DeserializeOwned;

use crate::codec::{decode_header, is_length_prefixed, FrameConfig, RESET_MARKER};
use crate::error::{FrameError, Result};
use crate::header::Header;
use crate::legacy::{decode_legacy_header, decode_object};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads headers, bodies and handshake objects from any `Read` stream.
///
/// Handles partial reads internally, so callers always get complete headers.
/// Bytes read ahead of a header are kept and served first to body reads.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next header (blocking), using the encoding for `protocol_version`.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached. A
    /// [`FrameError::MalformedFrame`] is returned only after the rejected
    /// frame's body has been discarded, so the next call starts on a frame
    /// boundary.
    pub fn read_header(&mut self, protocol_version: u8) -> Result<Header> {
        loop {
            let result = if is_length_prefixed(protocol_version) {
                decode_header(&mut self.buf, self.config.max_header_size)
            } else {
                decode_legacy_header(&mut self.buf, self.config.max_object_size, protocol_version)
            };
            let decoded = match result {
                Err(FrameError::MalformedFrame { reason, body_length }) => {
                    self.discard_body(body_length)?;
                    return Err(FrameError::MalformedFrame { reason, body_length });
                }
                other => other?,
            };

            if let Some(mut header) = decoded {
                header.protocol_version = protocol_version;
                return Ok(header);
            }

            self.fill()?;
        }
    }

    /// Read one self-delimited object (blocking).
    pub fn read_object<O: DeserializeOwned>(&mut self) -> Result<O> {
        loop {
            if let Some(object) = decode_object(&mut self.buf, self.config.max_object_size)? {
                return Ok(object);
            }
            self.fill()?;
        }
    }

    /// Consume the reset marker that follows a length-prefixed handshake.
    pub fn read_reset_marker(&mut self) -> Result<()> {
        while self.buf.is_empty() {
            self.fill()?;
        }
        let marker = self.buf.get_u8();
        if marker != RESET_MARKER {
            return Err(FrameError::StreamCorrupted(format!(
                "expected reset marker 0x{RESET_MARKER:02x}, got 0x{marker:02x}"
            )));
        }
        Ok(())
    }

    /// Read body bytes into `out`, returning how many were read.
    ///
    /// Buffered bytes are served first; afterwards reads go straight to the
    /// stream. Returns `Err(FrameError::ConnectionClosed)` on EOF.
    pub fn read_body(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }

        loop {
            match self.inner.read(out) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Read exactly `len` body bytes into memory.
    pub fn read_body_exact(&mut self, len: usize) -> Result<Bytes> {
        while self.buf.len() < len {
            self.fill()?;
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Copy exactly `len` body bytes into `sink`.
    pub fn read_body_into<W: Write>(&mut self, sink: &mut W, len: u64) -> Result<u64> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK_SIZE as u64) as usize;
            let n = self.read_body(&mut chunk[..want])?;
            sink.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        Ok(len)
    }

    /// Discard `len` body bytes.
    pub fn skip(&mut self, len: u64) -> Result<()> {
        self.read_body_into(&mut std::io::sink(), len).map(|_| ())
    }

    /// Skip the body of a rejected frame. Read timeouts do not abandon the
    /// skip, since a partial skip would leave the stream misaligned.
    fn discard_body(&mut self, len: u64) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK_SIZE as u64) as usize;
            match self.read_body(&mut chunk[..want]) {
                Ok(n) => remaining -= n as u64,
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Number of bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum object size for subsequent object decoding.
    pub fn set_max_object_size(&mut self, max_object_size: usize) {
        self.config.max_object_size = max_object_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<NetStream> {
    /// Create a frame reader for `NetStream` and apply read timeout from config.
    pub fn with_config_net(inner: NetStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying socket.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.config.read_timeout = timeout;
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)
    }
}

pub(crate) fn transport_to_frame_error(err: msgprims_transport::TransportError) -> FrameError {
    match err {
        msgprims_transport::TransportError::Io(io)
        | msgprims_transport::TransportError::Accept(io) => FrameError::Io(io),
        msgprims_transport::TransportError::Bind { source, .. }
        | msgprims_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};

    use bytes::{BufMut, BytesMut};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codec::encode_header;
    use crate::header::HeaderType;
    use crate::legacy::{encode_legacy_header, encode_object, LegacyHeader};

    fn wire_with_body(header: &Header, body: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        encode_header(header, &mut wire).unwrap();
        wire.put_slice(body);
        wire.to_vec()
    }

    #[test]
    fn read_single_header() {
        let header = Header::new().with_message_type(5);
        let mut reader = FrameReader::new(Cursor::new(wire_with_body(&header, b"")));

        let decoded = reader.read_header(6).unwrap();
        assert_eq!(decoded.message_type, 5);
        assert_eq!(decoded.protocol_version, 6);
    }

    #[test]
    fn header_then_body_then_header() {
        let mut first = Header::new().with_message_type(1);
        first.body_length = 5;
        let mut wire = wire_with_body(&first, b"hello");
        wire.extend(wire_with_body(&Header::of_type(HeaderType::EndpointCheck), b""));

        let mut reader = FrameReader::new(Cursor::new(wire));
        let h1 = reader.read_header(4).unwrap();
        let body = reader.read_body_exact(h1.body_length as usize).unwrap();
        let h2 = reader.read_header(4).unwrap();

        assert_eq!(body.as_ref(), b"hello");
        assert_eq!(h2.header_type, HeaderType::EndpointCheck);
    }

    #[test]
    fn body_read_serves_buffer_first() {
        let mut header = Header::new();
        header.body_length = 3;
        let mut reader = FrameReader::new(Cursor::new(wire_with_body(&header, b"abc")));
        reader.read_header(4).unwrap();
        assert_eq!(reader.buffered(), 3);

        let mut out = [0u8; 8];
        let n = reader.read_body(&mut out).unwrap();
        assert_eq!(&out[..n], b"abc");
    }

    #[test]
    fn skip_discards_body() {
        let mut header = Header::new();
        header.body_length = 20_000;
        let mut wire = wire_with_body(&header, &vec![7u8; 20_000]);
        wire.extend(wire_with_body(&Header::new().with_message_type(2), b""));

        let mut reader = FrameReader::new(Cursor::new(wire));
        let h1 = reader.read_header(6).unwrap();
        reader.skip(h1.body_length as u64).unwrap();
        assert_eq!(reader.read_header(6).unwrap().message_type, 2);
    }

    #[test]
    fn read_body_into_sink() {
        let mut header = Header::new();
        header.body_length = 4;
        let mut reader = FrameReader::new(Cursor::new(wire_with_body(&header, b"data")));
        reader.read_header(6).unwrap();

        let mut sink = Vec::new();
        reader.read_body_into(&mut sink, 4).unwrap();
        assert_eq!(sink, b"data");
    }

    #[test]
    fn partial_read_handling() {
        let header = Header::new().with_description("slow");
        let byte_reader = ByteByByteReader {
            bytes: wire_with_body(&header, b""),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let decoded = reader.read_header(6).unwrap();
        assert_eq!(decoded.description, "slow");
    }

    #[test]
    fn legacy_header_followed_by_body() {
        let mut header = Header::new().with_message_type(8);
        header.body_length = 2;
        let mut wire = BytesMut::new();
        encode_legacy_header(&header, 2, &mut wire).unwrap();
        wire.put_slice(b"ok");

        let byte_reader = ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);
        let decoded = reader.read_header(2).unwrap();
        assert_eq!(decoded.message_type, 8);
        assert_eq!(reader.read_body_exact(2).unwrap().as_ref(), b"ok");
    }

    #[test]
    fn reads_objects_and_reset_marker() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Hello {
            name: String,
        }

        let mut wire = BytesMut::new();
        encode_object(
            &Hello {
                name: "peer".to_string(),
            },
            &mut wire,
        )
        .unwrap();
        wire.put_u8(RESET_MARKER);

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let hello: Hello = reader.read_object().unwrap();
        assert_eq!(hello.name, "peer");
        reader.read_reset_marker().unwrap();
    }

    #[test]
    fn wrong_reset_marker_is_fatal() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x00]));
        let err = reader.read_reset_marker().unwrap_err();
        assert!(matches!(err, FrameError::StreamCorrupted(_)));
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_header(6).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_body() {
        let mut header = Header::new();
        header.body_length = 10;
        let mut reader = FrameReader::new(Cursor::new(wire_with_body(&header, b"short")));
        reader.read_header(6).unwrap();
        let err = reader.read_body_exact(10).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_header_in_stream() {
        let mut wire = BytesMut::new();
        wire.put_i32(1024);

        let cfg = FrameConfig {
            max_header_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        let err = reader.read_header(6).unwrap_err();
        assert!(matches!(err, FrameError::HeaderTooLarge { .. }));
    }

    #[test]
    fn malformed_header_keeps_stream_aligned() {
        let mut wire = BytesMut::new();
        encode_header(&Header::new(), &mut wire).unwrap();
        wire[4] = 0x44;
        encode_header(&Header::new().with_message_type(3), &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let err = reader.read_header(6).unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(reader.read_header(6).unwrap().message_type, 3);
    }

    #[test]
    fn unknown_type_frame_is_skipped_with_its_body() {
        let mut rejected = Header::new();
        rejected.body_length = 5;
        let mut wire = BytesMut::new();
        encode_header(&rejected, &mut wire).unwrap();
        wire[4] = 0x33;
        wire.put_slice(b"hello");
        let mut next = Header::new().with_message_type(9);
        next.body_length = 2;
        encode_header(&next, &mut wire).unwrap();
        wire.put_slice(b"ok");

        let mut reader = FrameReader::new(ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        });
        let err = reader.read_header(6).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { body_length: 5, .. }));

        let header = reader.read_header(6).unwrap();
        assert_eq!(header.message_type, 9);
        assert_eq!(&reader.read_body_exact(2).unwrap()[..], b"ok");
    }

    #[test]
    fn legacy_frame_with_unknown_type_is_skipped_with_its_body() {
        let mut rejected = LegacyHeader::from_header(&Header::new(), 3);
        rejected.header_type = 0x33;
        rejected.body_length = 3;
        let mut wire = BytesMut::new();
        encode_object(&rejected, &mut wire).unwrap();
        wire.put_slice(b"abc");
        encode_legacy_header(&Header::new().with_message_type(4), 3, &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert!(reader.read_header(3).unwrap_err().is_protocol());
        assert_eq!(reader.read_header(3).unwrap().message_type, 4);
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            if buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: wire_with_body(&Header::new().with_message_type(8), b""),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        assert_eq!(framed.read_header(6).unwrap().message_type, 8);
    }

    #[test]
    fn would_block_propagates_as_timeout() {
        let reader = WouldBlockThenData {
            state: 0,
            bytes: wire_with_body(&Header::new(), b""),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let err = framed.read_header(6).unwrap_err();
        assert!(err.is_timeout());
        assert!(framed.read_header(6).is_ok(), "retry after timeout succeeds");
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct WouldBlockThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for WouldBlockThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::new(stream);
            let header = reader.read_header(6).unwrap();
            let body = reader.read_body_exact(header.body_length as usize).unwrap();
            (header, body)
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = crate::writer::FrameWriter::new(stream);
        let mut header = Header::new().with_message_type(11);
        header.body_length = 3;
        writer.write_header(&header, 6).unwrap();
        writer.write_body(b"tcp").unwrap();
        writer.flush().unwrap();

        let (received, body) = server.join().unwrap();
        assert_eq!(received.message_type, 11);
        assert_eq!(body.as_ref(), b"tcp");
    }

    #[test]
    fn applies_read_timeout_for_net_stream() {
        let listener = msgprims_transport::TcpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();
        let connector =
            std::thread::spawn(move || msgprims_transport::TcpTransport::connect(addr).unwrap());
        let (stream, _) = listener.accept().unwrap();
        let _client = connector.join().unwrap();

        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_net(stream, cfg).unwrap();
        let err = reader.read_header(6).unwrap_err();
        assert!(err.is_timeout());
    }
}
