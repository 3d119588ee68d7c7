use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::header::{FieldMap, FieldValue, Header, HeaderType};

/// Size of the big-endian header length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Marker byte exchanged once after the handshake on length-prefixed
/// connections.
pub const RESET_MARKER: u8 = 0x79;

/// First protocol version that uses length-prefixed headers.
pub const LENGTH_PREFIXED_VERSION: u8 = 4;

/// Highest protocol version this codec speaks.
pub const MESSAGING_PROTOCOL_VERSION: u8 = 6;

/// Default maximum encoded header size: 1 MiB.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Default maximum size of a self-delimited object: 16 MiB.
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 16 * 1024 * 1024;

const TAG_NULL: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_OBJECT: u8 = 2;

/// Whether headers on a connection of this version carry a length prefix.
pub fn is_length_prefixed(protocol_version: u8) -> bool {
    protocol_version >= LENGTH_PREFIXED_VERSION
}

/// Encode a header into the length-prefixed wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬────────┬──────────┬───────────┬──────────────┬──────────┐
/// │ Length (4B)  │ Type   │ Sender   │ MessageId │ ResponseToId │ MsgType  │
/// │ BE i32       │ (1B)   │ (8B BE)  │ (8B BE)   │ (8B BE)      │ (4B BE)  │
/// ├──────────────┼────────┴────┬─────┴───────┬───┴──────────────┴──────────┤
/// │ BodyLen (8B) │ Description │ TTL (8B BE) │ Asynch (1B) │ Custom │ Meta │
/// └──────────────┴─────────────┴─────────────┴─────────────┴────────┴──────┘
/// ```
///
/// The length is written as a placeholder and patched once the header is
/// encoded. Returns the number of bytes appended to `dst`.
pub fn encode_header(header: &Header, dst: &mut BytesMut) -> Result<usize> {
    let start = dst.len();
    dst.put_i32(0);

    dst.put_u8(header.header_type.as_u8());
    dst.put_i64(header.sender_id);
    dst.put_i64(header.message_id);
    dst.put_i64(header.response_to_id);
    dst.put_i32(header.message_type);
    dst.put_i64(header.body_length);
    put_utf(dst, &header.description)?;
    dst.put_i64(header.time_to_live);
    dst.put_u8(u8::from(header.asynch));
    put_map(dst, header.custom_fields.as_ref())?;
    put_map(dst, header.system_metadata.as_ref())?;

    let header_len = dst.len() - start - LENGTH_PREFIX_SIZE;
    let prefix = i32::try_from(header_len).map_err(|_| FrameError::HeaderTooLarge {
        size: header_len,
        max: i32::MAX as usize,
    })?;
    dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());

    Ok(dst.len() - start)
}

/// Decode a length-prefixed header from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete header yet.
/// Once the declared length is available the header bytes are consumed,
/// so a parse error leaves the buffer aligned on the body that follows;
/// [`FrameError::MalformedFrame`] says how long that body is.
pub fn decode_header(src: &mut BytesMut, max_header_size: usize) -> Result<Option<Header>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
    let declared = i32::from_be_bytes(prefix);
    if declared < 0 {
        return Err(FrameError::StreamCorrupted(format!(
            "negative header length {declared}"
        )));
    }

    let header_len = declared as usize;
    if header_len > max_header_size {
        return Err(FrameError::HeaderTooLarge {
            size: header_len,
            max: max_header_size,
        });
    }

    if src.len() < LENGTH_PREFIX_SIZE + header_len {
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    let mut bytes = src.split_to(header_len).freeze();
    read_fields(&mut bytes).map(Some)
}

/// Parse header fields. The fixed prefix up to `body_length` is read
/// first; any later failure is reported as [`FrameError::MalformedFrame`]
/// so the body of the rejected frame can still be skipped.
fn read_fields(src: &mut Bytes) -> Result<Header> {
    let type_byte = take_u8(src)?;
    let mut header = Header {
        sender_id: take_i64(src)?,
        message_id: take_i64(src)?,
        response_to_id: take_i64(src)?,
        message_type: take_i32(src)?,
        body_length: take_i64(src)?,
        ..Header::default()
    };

    read_variable_fields(src, type_byte, &mut header)
        .map_err(|err| FrameError::malformed(err, header.body_length))?;
    Ok(header)
}

fn read_variable_fields(src: &mut Bytes, type_byte: u8, header: &mut Header) -> Result<()> {
    header.header_type = HeaderType::from_u8(type_byte)?;
    header.description = take_utf(src)?;
    header.time_to_live = take_i64(src)?;
    header.asynch = take_u8(src)? != 0;
    header.custom_fields = take_map(src)?;
    header.system_metadata = take_map(src)?;

    if src.has_remaining() {
        return Err(FrameError::InvalidHeader(format!(
            "{} trailing bytes after header",
            src.remaining()
        )));
    }
    Ok(())
}

fn put_utf(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        FrameError::InvalidHeader(format!("string too long to encode ({} bytes)", value.len()))
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_map(dst: &mut BytesMut, map: Option<&FieldMap>) -> Result<()> {
    let Some(map) = map else {
        dst.put_i32(0);
        return Ok(());
    };

    let count = i32::try_from(map.len())
        .map_err(|_| FrameError::InvalidHeader(format!("too many fields ({})", map.len())))?;
    dst.put_i32(count);

    for (key, value) in map {
        put_utf(dst, key)?;
        match value {
            FieldValue::Null => dst.put_u8(TAG_NULL),
            FieldValue::Text(text) => {
                dst.put_u8(TAG_TEXT);
                put_utf(dst, text)?;
            }
            FieldValue::Object(object) => {
                dst.put_u8(TAG_OBJECT);
                let encoded = serde_json::to_vec(object)?;
                let len = u32::try_from(encoded.len()).map_err(|_| {
                    FrameError::InvalidHeader(format!("field '{key}' too large"))
                })?;
                dst.put_u32(len);
                dst.put_slice(&encoded);
            }
        }
    }
    Ok(())
}

fn ensure(src: &Bytes, needed: usize, what: &str) -> Result<()> {
    if src.remaining() < needed {
        return Err(FrameError::InvalidHeader(format!(
            "truncated {what}: need {needed} bytes, have {}",
            src.remaining()
        )));
    }
    Ok(())
}

fn take_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1, "byte")?;
    Ok(src.get_u8())
}

fn take_i32(src: &mut Bytes) -> Result<i32> {
    ensure(src, 4, "int")?;
    Ok(src.get_i32())
}

fn take_i64(src: &mut Bytes) -> Result<i64> {
    ensure(src, 8, "long")?;
    Ok(src.get_i64())
}

fn take_utf(src: &mut Bytes) -> Result<String> {
    ensure(src, 2, "string length")?;
    let len = src.get_u16() as usize;
    ensure(src, len, "string")?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::InvalidHeader("string is not valid UTF-8".to_string()))
}

fn take_map(src: &mut Bytes) -> Result<Option<FieldMap>> {
    let count = take_i32(src)?;
    if count < 0 {
        return Err(FrameError::InvalidHeader(format!(
            "negative field count {count}"
        )));
    }
    if count == 0 {
        return Ok(None);
    }

    let mut map = FieldMap::new();
    for _ in 0..count {
        let key = take_utf(src)?;
        let value = match take_u8(src)? {
            TAG_TEXT => FieldValue::Text(take_utf(src)?),
            TAG_OBJECT => {
                ensure(src, 4, "object length")?;
                let len = src.get_u32() as usize;
                ensure(src, len, "object")?;
                let raw = src.split_to(len);
                FieldValue::Object(serde_json::from_slice(&raw)?)
            }
            _ => FieldValue::Null,
        };
        map.insert(key, value);
    }
    Ok(Some(map))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum encoded header size in bytes. Default: 1 MiB.
    pub max_header_size: usize,
    /// Maximum size of a self-delimited object. Default: 16 MiB.
    pub max_object_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
