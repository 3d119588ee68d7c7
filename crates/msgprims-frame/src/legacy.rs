//! Compatibility framing for protocol versions 1 to 3.
//!
//! Older peers do not length-prefix their headers. Each header is written
//! as one self-delimiting serialized object, and the message body follows
//! directly on the same stream. The end of the object is the only framing
//! signal. The same object stream carries the handshake messages for every
//! protocol version.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::header::{
    FieldMap, FieldValue, Header, HeaderType, NAMED_MESSAGE_RECEIVER_KEY, UNDEFINED,
};

/// Header shape used on pre-v4 connections.
///
/// Fields are gated by serial version: 3 is the base set, 4 adds the
/// time-to-live, 5 carries the named receiver outside the custom fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyHeader {
    pub serial_version: u8,
    #[serde(default)]
    pub header_type: u8,
    pub sender_id: i64,
    pub message_id: i64,
    pub response_to_id: i64,
    pub message_type: i32,
    pub body_length: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub custom_fields: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_receiver: Option<FieldValue>,
}

/// Serial version written for a given protocol version.
pub fn serial_version_for(protocol_version: u8) -> u8 {
    match protocol_version {
        0 | 1 => 3,
        2 => 4,
        _ => 5,
    }
}

impl LegacyHeader {
    pub fn from_header(header: &Header, protocol_version: u8) -> Self {
        let serial_version = serial_version_for(protocol_version);
        let mut custom_fields = header.custom_fields.clone();

        let named_receiver = if serial_version >= 5 {
            custom_fields
                .as_mut()
                .and_then(|fields| fields.remove(NAMED_MESSAGE_RECEIVER_KEY))
        } else {
            None
        };
        if custom_fields.as_ref().is_some_and(|fields| fields.is_empty()) {
            custom_fields = None;
        }

        Self {
            serial_version,
            header_type: header.header_type.as_u8(),
            sender_id: header.sender_id,
            message_id: header.message_id,
            response_to_id: header.response_to_id,
            message_type: header.message_type,
            body_length: header.body_length,
            description: (!header.description.is_empty()).then(|| header.description.clone()),
            custom_fields,
            time_to_live: (serial_version >= 4).then_some(header.time_to_live),
            named_receiver,
        }
    }

    pub fn into_header(self, protocol_version: u8) -> Result<Header> {
        let mut header = Header {
            header_type: HeaderType::from_u8(self.header_type)
                .map_err(|err| FrameError::malformed(err, self.body_length))?,
            sender_id: self.sender_id,
            message_id: self.message_id,
            response_to_id: self.response_to_id,
            message_type: self.message_type,
            body_length: self.body_length,
            description: self.description.unwrap_or_default(),
            time_to_live: UNDEFINED,
            custom_fields: self.custom_fields.filter(|fields| !fields.is_empty()),
            protocol_version,
            ..Header::default()
        };
        if self.serial_version >= 4 {
            header.time_to_live = self.time_to_live.unwrap_or(UNDEFINED);
        }
        if self.serial_version >= 5 {
            if let Some(receiver) = self.named_receiver.filter(|value| !value.is_null()) {
                header.set_custom_field(NAMED_MESSAGE_RECEIVER_KEY, receiver);
            }
        }
        Ok(header)
    }
}

/// Encode a header as a compatibility-mode object.
pub fn encode_legacy_header(
    header: &Header,
    protocol_version: u8,
    dst: &mut BytesMut,
) -> Result<usize> {
    encode_object(&LegacyHeader::from_header(header, protocol_version), dst)
}

/// Decode a compatibility-mode header from a buffer.
///
/// Returns `Ok(None)` while the object is incomplete.
pub fn decode_legacy_header(
    src: &mut BytesMut,
    max_object_size: usize,
    protocol_version: u8,
) -> Result<Option<Header>> {
    match decode_object::<LegacyHeader>(src, max_object_size)? {
        Some(legacy) => legacy.into_header(protocol_version).map(Some),
        None => Ok(None),
    }
}

/// Append one self-delimited object to `dst`.
pub fn encode_object<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<usize> {
    let start = dst.len();
    serde_json::to_writer((&mut *dst).writer(), value)?;
    Ok(dst.len() - start)
}

/// Decode one self-delimited object from the front of `src`.
///
/// Returns `Ok(None)` if the object is not complete yet. On success exactly
/// the object's bytes are consumed, so any body bytes that follow stay in
/// the buffer. A well-formed object of the wrong shape is consumed and
/// reported as [`FrameError::Object`]; bytes that are not an object at all
/// leave the stream unrecoverable.
pub fn decode_object<T: DeserializeOwned>(
    src: &mut BytesMut,
    max_object_size: usize,
) -> Result<Option<T>> {
    let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<serde_json::Value>();

    let value = match stream.next() {
        None => return Ok(None),
        Some(Ok(value)) => value,
        Some(Err(err)) if err.is_eof() => {
            if src.len() > max_object_size {
                return Err(FrameError::ObjectTooLarge {
                    size: src.len(),
                    max: max_object_size,
                });
            }
            return Ok(None);
        }
        Some(Err(err)) => return Err(FrameError::StreamCorrupted(err.to_string())),
    };

    let consumed = stream.byte_offset();
    if consumed > max_object_size {
        return Err(FrameError::ObjectTooLarge {
            size: consumed,
            max: max_object_size,
        });
    }
    src.advance(consumed);

    if !value.is_object() {
        return Err(FrameError::StreamCorrupted(
            "expected an object at frame boundary".to_string(),
        ));
    }

    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_OBJECT_SIZE;

    fn sample() -> Header {
        let mut header = Header::new()
            .with_message_type(3)
            .with_description("legacy")
            .with_named_receiver("billing")
            .with_custom_field("k", "v");
        header.sender_id = 10;
        header.message_id = 11;
        header.body_length = 4;
        header.time_to_live = 900;
        header
    }

    #[test]
    fn v3_header_keeps_named_receiver_and_ttl() {
        let mut buf = BytesMut::new();
        encode_legacy_header(&sample(), 3, &mut buf).unwrap();
        buf.put_slice(b"body");

        let decoded = decode_legacy_header(&mut buf, DEFAULT_MAX_OBJECT_SIZE, 3)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.named_receiver(), Some("billing"));
        assert_eq!(decoded.time_to_live, 900);
        assert_eq!(decoded.description, "legacy");
        assert_eq!(decoded.protocol_version, 3);
        assert_eq!(buf.as_ref(), b"body", "body bytes follow the object");
    }

    #[test]
    fn v1_header_drops_ttl() {
        let mut buf = BytesMut::new();
        encode_legacy_header(&sample(), 1, &mut buf).unwrap();

        let decoded = decode_legacy_header(&mut buf, DEFAULT_MAX_OBJECT_SIZE, 1)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.time_to_live, UNDEFINED);
        assert_eq!(decoded.message_id, 11);
        assert_eq!(decoded.custom_field("k"), Some(&FieldValue::from("v")));
    }

    #[test]
    fn v2_header_carries_ttl() {
        let legacy = LegacyHeader::from_header(&sample(), 2);
        assert_eq!(legacy.serial_version, 4);
        assert_eq!(legacy.time_to_live, Some(900));
        assert!(legacy.named_receiver.is_none());
    }

    #[test]
    fn incomplete_object_waits_for_more() {
        let mut full = BytesMut::new();
        encode_legacy_header(&sample(), 3, &mut full).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() / 2]);

        assert!(decode_legacy_header(&mut partial, DEFAULT_MAX_OBJECT_SIZE, 3)
            .unwrap()
            .is_none());
        assert_eq!(partial.len(), full.len() / 2);
    }

    #[test]
    fn oversized_partial_object_rejected() {
        let mut buf = BytesMut::from(&b"{\"serial_version\": 3, \"description\": \"xxxxxxxxxxxxxxxx"[..]);
        let result = decode_legacy_header(&mut buf, 16, 3);
        assert!(matches!(result, Err(FrameError::ObjectTooLarge { .. })));
    }

    #[test]
    fn garbage_is_stream_corruption() {
        let mut buf = BytesMut::from(&b"}}not json"[..]);
        let err = decode_object::<serde_json::Value>(&mut buf, DEFAULT_MAX_OBJECT_SIZE).unwrap_err();
        assert!(matches!(err, FrameError::StreamCorrupted(_)));
        assert!(!err.is_protocol());
    }

    #[test]
    fn unknown_legacy_type_reports_body_length() {
        let mut legacy = LegacyHeader::from_header(&sample(), 3);
        legacy.header_type = 0x33;
        let mut buf = BytesMut::new();
        encode_object(&legacy, &mut buf).unwrap();
        buf.put_slice(b"body");

        let err = decode_legacy_header(&mut buf, DEFAULT_MAX_OBJECT_SIZE, 3).unwrap_err();
        assert!(err.is_protocol());
        assert!(matches!(err, FrameError::MalformedFrame { body_length: 4, .. }));
        assert_eq!(buf.as_ref(), b"body");
    }

    #[test]
    fn wrong_shape_is_consumed() {
        let mut buf = BytesMut::from(&b"{\"unexpected\":1}{\"serial_version\":3}"[..]);
        let err = decode_object::<LegacyHeader>(&mut buf, DEFAULT_MAX_OBJECT_SIZE).unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(buf.as_ref(), b"{\"serial_version\":3}");
    }
}
