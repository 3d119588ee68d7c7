//! Versioned message headers and frame codecs for msgprims.
//!
//! Two wire encodings share one stream abstraction:
//! - protocol v4 and later: a 4-byte big-endian length prefix followed by
//!   a fixed-order binary header, then the raw body bytes
//! - protocol v1 to v3: each header is one self-delimited serialized
//!   object, followed directly by the body
//!
//! Handshake messages always use the object encoding. Callers read and write
//! whole headers; partial reads and buffering are handled here.

pub mod codec;
pub mod error;
pub mod header;
pub mod legacy;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_header, encode_header, is_length_prefixed, FrameConfig, DEFAULT_MAX_HEADER_SIZE,
    DEFAULT_MAX_OBJECT_SIZE, LENGTH_PREFIXED_VERSION, MESSAGING_PROTOCOL_VERSION, RESET_MARKER,
};
pub use error::{FrameError, Result};
pub use header::{
    FieldMap, FieldValue, Header, HeaderType, INITIAL_PROTOCOL_VERSION,
    NAMED_MESSAGE_RECEIVER_KEY, UNDEFINED,
};
pub use legacy::{decode_object, encode_object, LegacyHeader};
pub use reader::FrameReader;
pub use writer::FrameWriter;
