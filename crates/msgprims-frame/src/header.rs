//! Message header: the routing record sent in front of every message body.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Sentinel for ids, lengths and time-to-live values that are not set.
pub const UNDEFINED: i64 = -1;

/// Protocol version assumed before any negotiation has taken place.
pub const INITIAL_PROTOCOL_VERSION: u8 = 1;

/// Custom field / metadata key carrying the name of the receiver a message
/// is addressed to, or (in metadata) the list of receivers a system hosts.
pub const NAMED_MESSAGE_RECEIVER_KEY: &str = "msgprims.NamedMessageReceiver";

/// What a header means to the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HeaderType {
    Standard = 0x00,
    MetaDataUpdate = 0x01,
    EndpointCheck = 0x02,
    Disconnect = 0x03,
    Rpc = 0x04,
    ProcessingError = 0x05,
    ServerAdmin = 0x06,
    AccessDenied = 0x7F,
}

impl HeaderType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Standard),
            0x01 => Ok(Self::MetaDataUpdate),
            0x02 => Ok(Self::EndpointCheck),
            0x03 => Ok(Self::Disconnect),
            0x04 => Ok(Self::Rpc),
            0x05 => Ok(Self::ProcessingError),
            0x06 => Ok(Self::ServerAdmin),
            0x7F => Ok(Self::AccessDenied),
            other => Err(FrameError::UnknownHeaderType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control headers are consumed by the receive loop and never reach a consumer.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::MetaDataUpdate | Self::EndpointCheck | Self::Disconnect
        )
    }

    /// Error replies terminate a synchronous dispatch with a failure.
    pub fn is_error_reply(self) -> bool {
        matches!(self, Self::ProcessingError | Self::AccessDenied)
    }
}

/// A value stored in a header field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    /// Opaque structured value, carried as JSON.
    Object(serde_json::Value),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Object(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Interpret the value as a list of strings.
    ///
    /// A single text value is treated as a one-element list.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            FieldValue::Text(text) => Some(vec![text.clone()]),
            FieldValue::Object(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            FieldValue::Object(serde_json::Value::String(text)) => Some(vec![text.clone()]),
            _ => None,
        }
    }

    /// Interpret the value as an integer (text values are parsed).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Object(value) => value.as_i64(),
            FieldValue::Text(text) => text.trim().parse().ok(),
            FieldValue::Null => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            other => FieldValue::Object(other),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Object(serde_json::Value::from(value))
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::Object(serde_json::Value::from(value))
    }
}

/// String-keyed field map used for custom fields and system metadata.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Routing and metadata record sent with every frame.
///
/// Headers are plain values: the dispatch path clones the caller's header
/// for every send attempt, so routing fields set while sending never leak
/// back into the caller's copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub header_type: HeaderType,
    pub sender_id: i64,
    pub message_id: i64,
    pub response_to_id: i64,
    pub message_type: i32,
    pub body_length: i64,
    pub description: String,
    /// Milliseconds; `UNDEFINED` means no expiry.
    pub time_to_live: i64,
    pub asynch: bool,
    pub custom_fields: Option<FieldMap>,
    pub system_metadata: Option<FieldMap>,
    /// Negotiated version of the connection the header travels on. Not
    /// carried on the wire.
    pub protocol_version: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            header_type: HeaderType::Standard,
            sender_id: UNDEFINED,
            message_id: UNDEFINED,
            response_to_id: UNDEFINED,
            message_type: UNDEFINED as i32,
            body_length: UNDEFINED,
            description: String::new(),
            time_to_live: UNDEFINED,
            asynch: false,
            custom_fields: None,
            system_metadata: None,
            protocol_version: INITIAL_PROTOCOL_VERSION,
        }
    }
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// A header of the given type with all routing fields undefined.
    pub fn of_type(header_type: HeaderType) -> Self {
        Self {
            header_type,
            ..Self::default()
        }
    }

    /// A reply template for `inbound`: carries its sender and message id,
    /// which the dispatch engine turns into `response_to_id` and a target.
    pub fn reply_to(inbound: &Header) -> Self {
        Self {
            sender_id: inbound.sender_id,
            message_id: inbound.message_id,
            message_type: inbound.message_type,
            ..Self::default()
        }
    }

    pub fn with_type(mut self, header_type: HeaderType) -> Self {
        self.header_type = header_type;
        self
    }

    pub fn with_message_type(mut self, message_type: i32) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_asynch(mut self, asynch: bool) -> Self {
        self.asynch = asynch;
        self
    }

    pub fn with_custom_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set_custom_field(key, value);
        self
    }

    pub fn with_named_receiver(mut self, name: impl Into<String>) -> Self {
        self.set_named_receiver(name);
        self
    }

    /// True when this header answers an earlier message.
    pub fn is_reply(&self) -> bool {
        self.response_to_id != UNDEFINED
    }

    /// Whether the sender waits for a reply to this header.
    pub fn expecting_response(&self) -> bool {
        if self.protocol_version > 3 {
            !self.asynch
        } else {
            self.response_to_id == UNDEFINED
        }
    }

    /// Clear every field that describes one particular send.
    pub fn reset_routing_fields(&mut self) {
        self.sender_id = UNDEFINED;
        self.message_id = UNDEFINED;
        self.response_to_id = UNDEFINED;
        self.body_length = UNDEFINED;
        self.time_to_live = UNDEFINED;
    }

    /// Whether a message received `elapsed` ago has outlived its time-to-live.
    pub fn has_expired(&self, elapsed: Duration) -> bool {
        !self.asynch && self.time_to_live > 0 && elapsed.as_millis() > self.time_to_live as u128
    }

    pub fn custom_field(&self, key: &str) -> Option<&FieldValue> {
        self.custom_fields.as_ref().and_then(|fields| fields.get(key))
    }

    pub fn set_custom_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.custom_fields
            .get_or_insert_with(FieldMap::new)
            .insert(key.into(), value.into());
    }

    pub fn remove_custom_field(&mut self, key: &str) -> Option<FieldValue> {
        let removed = self.custom_fields.as_mut().and_then(|fields| fields.remove(key));
        if self.custom_fields.as_ref().is_some_and(|fields| fields.is_empty()) {
            self.custom_fields = None;
        }
        removed
    }

    /// Name of the receiver this message is addressed to, if any.
    pub fn named_receiver(&self) -> Option<&str> {
        self.custom_field(NAMED_MESSAGE_RECEIVER_KEY)
            .and_then(FieldValue::as_str)
    }

    pub fn set_named_receiver(&mut self, name: impl Into<String>) {
        self.set_custom_field(NAMED_MESSAGE_RECEIVER_KEY, FieldValue::Text(name.into()));
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[type: {:?}, sender: {}, id: {}, response to: {}, message type: {}, body: {}, ttl: {}, asynch: {}, protocol: {}",
            self.header_type,
            self.sender_id,
            self.message_id,
            self.response_to_id,
            self.message_type,
            self.body_length,
            self.time_to_live,
            self.asynch,
            self.protocol_version
        )?;
        if !self.description.is_empty() {
            write!(f, ", description: {}", self.description)?;
        }
        if let Some(fields) = &self.custom_fields {
            write!(f, ", custom fields: {}", fields.len())?;
        }
        if let Some(meta) = &self.system_metadata {
            write!(f, ", metadata: {}", meta.len())?;
        }
        write!(f, "]")
    }
}
