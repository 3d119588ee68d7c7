use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, BytesMut};
use msgprims_transport::NetStream;
use serde::Serialize;

use crate::codec::{encode_header, is_length_prefixed, FrameConfig, RESET_MARKER};
use crate::error::{FrameError, Result};
use crate::header::Header;
use crate::legacy::{encode_legacy_header, encode_object};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const COPY_CHUNK_SIZE: usize = 8 * 1024;

/// Writes headers, bodies and handshake objects to any `Write` stream.
///
/// `write_header`, `write_body` and `copy_body` do not flush, so a header
/// and its body can go out together; call [`FrameWriter::flush`] once the
/// message is complete. [`FrameWriter::send`] does all three.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write a header using the encoding for `protocol_version`.
    ///
    /// Returns the number of header bytes written.
    pub fn write_header(&mut self, header: &Header, protocol_version: u8) -> Result<usize> {
        self.buf.clear();
        let written = if is_length_prefixed(protocol_version) {
            let written = encode_header(header, &mut self.buf)?;
            if written > self.config.max_header_size {
                return Err(FrameError::HeaderTooLarge {
                    size: written,
                    max: self.config.max_header_size,
                });
            }
            written
        } else {
            encode_legacy_header(header, protocol_version, &mut self.buf)?
        };
        self.write_buffered()?;
        Ok(written)
    }

    /// Write body bytes.
    pub fn write_body(&mut self, body: &[u8]) -> Result<()> {
        write_all(&mut self.inner, body)
    }

    /// Copy exactly `len` body bytes from `src`.
    ///
    /// Fails with `ConnectionClosed` if `src` ends early; the peer then sees
    /// a short body and drops the connection.
    pub fn copy_body<R: Read>(&mut self, src: &mut R, len: u64) -> Result<u64> {
        let mut chunk = [0u8; COPY_CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(COPY_CHUNK_SIZE as u64) as usize;
            let n = match src.read(&mut chunk[..want]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };
            write_all(&mut self.inner, &chunk[..n])?;
            remaining -= n as u64;
        }
        Ok(len)
    }

    /// Write a header followed by an in-memory body, then flush.
    ///
    /// The header's `body_length` is expected to match `body.len()`.
    pub fn send(&mut self, header: &Header, body: &[u8], protocol_version: u8) -> Result<()> {
        self.buf.clear();
        if is_length_prefixed(protocol_version) {
            encode_header(header, &mut self.buf)?;
        } else {
            encode_legacy_header(header, protocol_version, &mut self.buf)?;
        }
        self.buf.put_slice(body);
        self.write_buffered()?;
        self.flush()
    }

    /// Write one self-delimited object and flush.
    pub fn write_object<O: Serialize>(&mut self, object: &O) -> Result<()> {
        self.buf.clear();
        let written = encode_object(object, &mut self.buf)?;
        if written > self.config.max_object_size {
            return Err(FrameError::ObjectTooLarge {
                size: written,
                max: self.config.max_object_size,
            });
        }
        self.write_buffered()?;
        self.flush()
    }

    /// Write the post-handshake reset marker and flush.
    pub fn write_reset_marker(&mut self) -> Result<()> {
        write_all(&mut self.inner, &[RESET_MARKER])?;
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_failure(err)),
            }
        }
    }

    fn write_buffered(&mut self) -> Result<()> {
        write_all(&mut self.inner, &self.buf)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn write_all<T: Write>(inner: &mut T, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match inner.write(&bytes[offset..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_failure(err)),
        }
    }
    Ok(())
}

/// Blocking sockets report an expired write timeout as `WouldBlock` on
/// some platforms; both spellings surface as `TimedOut`.
fn io_failure(err: std::io::Error) -> FrameError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => FrameError::Io(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("write timed out: {err}"),
        )),
        _ => FrameError::Io(err),
    }
}

impl FrameWriter<NetStream> {
    /// Create a frame writer for `NetStream` and apply write timeout from config.
    pub fn with_config_net(inner: NetStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
