//! Inbound messages and their body state machine.
//!
//! A body moves through three phases: `NotRead` until an accessor claims it,
//! `Consumed` while it is being read, and `ReadCompleted` once reading is
//! over (or the body was abandoned). The receive loop of the endpoint that
//! delivered a large body waits for `ReadCompleted` before it reads the next
//! header, so consumers may read lazily on another thread.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use msgprims_frame::Header;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;

use crate::body::{BodyWriter, Streamable};
use crate::destination::Destination;
use crate::dispatch::{self, DispatchRequest};
use crate::endpoint::{Endpoint, Inbound};
use crate::error::{MessagingError, Result};
use crate::manager::MessagingHandle;

/// Upper bound on the capacity reserved up front for a streamed body.
const MAX_PREALLOC: u64 = 1024 * 1024;

/// Phase of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPhase {
    NotRead,
    Consumed,
    ReadCompleted,
}

/// Body progress shared between a message, its body stream and the receive
/// loop that waits for it.
pub(crate) struct BodyTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

struct TrackerState {
    phase: BodyPhase,
    bytes_read: u64,
    length: u64,
    handler: Option<String>,
}

impl BodyTracker {
    fn new(length: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                phase: BodyPhase::NotRead,
                bytes_read: 0,
                length,
                handler: None,
            }),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn phase(&self) -> BodyPhase {
        self.state.lock().phase
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    pub(crate) fn length(&self) -> u64 {
        self.state.lock().length
    }

    /// Name of the thread that was handed the message, if recorded.
    pub(crate) fn handler(&self) -> Option<String> {
        self.state.lock().handler.clone()
    }

    fn claim(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != BodyPhase::NotRead {
            return Err(MessagingError::BodyConsumed);
        }
        state.phase = BodyPhase::Consumed;
        Ok(())
    }

    fn progress(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.bytes_read += n;
        self.changed.notify_all();
    }

    pub(crate) fn complete(&self) {
        let mut state = self.state.lock();
        if state.phase != BodyPhase::ReadCompleted {
            state.phase = BodyPhase::ReadCompleted;
            self.changed.notify_all();
        }
    }

    fn set_handler(&self, name: String) {
        self.state.lock().handler = Some(name);
    }

    /// Wait for `ReadCompleted`, bounded by `timeout`.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase != BodyPhase::ReadCompleted {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.phase == BodyPhase::ReadCompleted;
            }
        }
        true
    }

    /// Wait for `ReadCompleted` for as long as the reader keeps making
    /// progress. Returns false once `stall` passes without any.
    pub(crate) fn wait_while_progressing(&self, stall: Duration) -> bool {
        let mut state = self.state.lock();
        let mut seen = state.bytes_read;
        let mut deadline = Instant::now() + stall;
        while state.phase != BodyPhase::ReadCompleted {
            let timed_out = self.changed.wait_until(&mut state, deadline).timed_out();
            if state.bytes_read != seen {
                seen = state.bytes_read;
                deadline = Instant::now() + stall;
            } else if timed_out {
                return state.phase == BodyPhase::ReadCompleted;
            }
        }
        true
    }
}

/// Where the body bytes of a message come from.
pub(crate) enum BodySource {
    Empty,
    /// Read by the receive loop before delivery.
    Buffered(Bytes),
    /// Still on the wire; read through the endpoint's reader.
    Live {
        inbound: Arc<Mutex<Inbound>>,
        seq: u64,
        length: u64,
    },
}

impl BodySource {
    fn length(&self) -> u64 {
        match self {
            BodySource::Empty => 0,
            BodySource::Buffered(bytes) => bytes.len() as u64,
            BodySource::Live { length, .. } => *length,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self, BodySource::Live { .. })
    }
}

/// A received message: its header, the endpoint it arrived on, and its body.
pub struct Message {
    header: Header,
    endpoint: Option<Arc<Endpoint>>,
    source: Option<BodySource>,
    tracker: Arc<BodyTracker>,
    cache: Option<Bytes>,
    caching: bool,
    received: Instant,
}

impl Message {
    pub(crate) fn inbound(header: Header, endpoint: Arc<Endpoint>, source: BodySource) -> Self {
        let tracker = BodyTracker::new(source.length());
        Self {
            header,
            endpoint: Some(endpoint),
            source: Some(source),
            tracker,
            cache: None,
            caching: false,
            received: Instant::now(),
        }
    }

    /// A message held entirely in memory, not tied to any endpoint.
    ///
    /// Replies to such a message fail; everything else behaves as for a
    /// received message.
    pub fn local(header: Header, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let source = if body.is_empty() {
            BodySource::Empty
        } else {
            BodySource::Buffered(body)
        };
        Self {
            header,
            endpoint: None,
            tracker: BodyTracker::new(source.length()),
            source: Some(source),
            cache: None,
            caching: false,
            received: Instant::now(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Declared body length in bytes.
    pub fn body_length(&self) -> u64 {
        self.tracker.length()
    }

    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    /// Destination the message came from, while it still exists.
    pub fn destination(&self) -> Option<Arc<Destination>> {
        self.endpoint.as_ref().and_then(|e| e.destination())
    }

    pub fn receive_time(&self) -> Instant {
        self.received
    }

    /// True when the sender's time-to-live has passed since receipt.
    pub fn has_expired(&self) -> bool {
        self.header.has_expired(self.received.elapsed())
    }

    pub fn body_phase(&self) -> BodyPhase {
        self.tracker.phase()
    }

    /// True when no accessor can return the body any more.
    pub fn is_body_consumed(&self) -> bool {
        self.cache.is_none() && self.tracker.phase() != BodyPhase::NotRead
    }

    /// Keep a copy of the body once read so that later accessors can
    /// return it again.
    pub fn set_caching(&mut self, caching: bool) {
        self.caching = caching;
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    /// Read the whole body now and keep it.
    pub fn read_and_cache(&mut self) -> Result<()> {
        self.caching = true;
        self.read_all().map(|_| ())
    }

    pub fn body_bytes(&mut self) -> Result<Bytes> {
        self.read_all()
    }

    /// Decode the body as JSON.
    pub fn body_object<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_all()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decode the body with the value's own [`Streamable`] encoding.
    pub fn body_streamable<T: Streamable + Default>(&mut self) -> Result<T> {
        let mut value = T::default();
        if self.caching || self.cache.is_some() {
            let bytes = self.read_all()?;
            value
                .read_from(&mut bytes.as_ref())
                .map_err(MessagingError::BodyRead)?;
            return Ok(value);
        }

        let mut stream = self.body_stream()?;
        value.read_from(&mut stream).map_err(MessagingError::BodyRead)?;
        Ok(value)
    }

    /// Raw access to the body. Dropping the stream ends the read; bytes left
    /// unread are skipped by the receive loop.
    pub fn body_stream(&mut self) -> Result<BodyStream> {
        if self.caching || self.cache.is_some() {
            let bytes = self.read_all()?;
            return Ok(BodyStream::buffered(bytes, Arc::clone(&self.tracker), None));
        }

        self.tracker.claim()?;
        let endpoint = self.endpoint.clone();
        let tracker = Arc::clone(&self.tracker);
        Ok(match self.source.take().unwrap_or(BodySource::Empty) {
            BodySource::Empty => BodyStream::buffered(Bytes::new(), tracker, endpoint),
            BodySource::Buffered(bytes) => BodyStream::buffered(bytes, tracker, endpoint),
            BodySource::Live { inbound, seq, length } => {
                BodyStream::live(inbound, seq, length, tracker, endpoint)
            }
        })
    }

    /// Give up the body without reading it.
    pub fn skip_body(&mut self) -> Result<()> {
        if self.tracker.phase() != BodyPhase::NotRead {
            return Ok(());
        }
        self.tracker.claim()?;
        let skipped = match self.source.take() {
            Some(BodySource::Live { inbound, seq, .. }) => inbound.lock().skip_body(seq),
            _ => Ok(()),
        };
        self.tracker.complete();
        skipped.map_err(|err| {
            if let Some(endpoint) = &self.endpoint {
                endpoint.body_read_error_occurred(&err);
            }
            MessagingError::BodyRead(err)
        })
    }

    /// Declare the body done with, whatever its phase.
    pub fn signal_read_completion(&self) {
        self.tracker.complete();
    }

    /// Wait until the body has been read or abandoned.
    pub fn wait_for_read_completion(&self, timeout: Duration) -> bool {
        self.tracker.wait(timeout)
    }

    /// Body bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.tracker.bytes_read()
    }

    /// Send a reply to this message.
    ///
    /// `header` is the reply's own header; its routing fields are taken from
    /// this message. The reply is dispatched asynchronously to the sender.
    pub fn reply(&self, header: Header, body: Option<&dyn BodyWriter>) -> Result<()> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            MessagingError::dispatch_failed("message was not received from a peer", false)
        })?;
        let shared = endpoint.shared().ok_or(MessagingError::Shutdown)?;

        let mut header = header;
        header.sender_id = self.header.sender_id;
        header.message_id = self.header.message_id;
        dispatch::dispatch(
            &shared,
            DispatchRequest {
                header: Some(header),
                body,
                asynch: true,
                ..DispatchRequest::default()
            },
        )
        .map(|_| ())
    }

    pub(crate) fn tracker(&self) -> Arc<BodyTracker> {
        Arc::clone(&self.tracker)
    }

    /// Remember which thread holds the message. A stalled body read is
    /// reported with it, since another thread's stack cannot be captured.
    pub(crate) fn record_handler_thread(&self) {
        let current = std::thread::current();
        let name = match current.name() {
            Some(name) => format!("{name} ({:?})", current.id()),
            None => format!("{:?}", current.id()),
        };
        self.tracker.set_handler(name);
    }

    fn read_all(&mut self) -> Result<Bytes> {
        if let Some(cached) = &self.cache {
            return Ok(cached.clone());
        }

        self.tracker.claim()?;
        let read = match self.source.take().unwrap_or(BodySource::Empty) {
            BodySource::Empty => Ok(Bytes::new()),
            BodySource::Buffered(bytes) => {
                self.tracker.progress(bytes.len() as u64);
                Ok(bytes)
            }
            BodySource::Live { inbound, seq, length } => {
                let mut stream = BodyStream::live(
                    inbound,
                    seq,
                    length,
                    Arc::clone(&self.tracker),
                    self.endpoint.clone(),
                );
                let mut buf = Vec::with_capacity(length.min(MAX_PREALLOC) as usize);
                stream.read_to_end(&mut buf).map(|_| Bytes::from(buf))
            }
        };
        self.tracker.complete();

        let bytes = read.map_err(MessagingError::BodyRead)?;
        if self.caching {
            self.cache = Some(bytes.clone());
        }
        Ok(bytes)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.tracker.phase() == BodyPhase::NotRead {
            self.tracker.complete();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("endpoint", &self.endpoint.as_ref().map(|e| e.id()))
            .field("phase", &self.tracker.phase())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

enum StreamSource {
    Buffered {
        bytes: Bytes,
        pos: usize,
    },
    Live {
        inbound: Arc<Mutex<Inbound>>,
        seq: u64,
        remaining: u64,
    },
}

/// Reader over a message body. Ends the body read when exhausted or dropped.
pub struct BodyStream {
    source: StreamSource,
    tracker: Arc<BodyTracker>,
    endpoint: Option<Arc<Endpoint>>,
}

impl BodyStream {
    fn buffered(bytes: Bytes, tracker: Arc<BodyTracker>, endpoint: Option<Arc<Endpoint>>) -> Self {
        Self {
            source: StreamSource::Buffered { bytes, pos: 0 },
            tracker,
            endpoint,
        }
    }

    fn live(
        inbound: Arc<Mutex<Inbound>>,
        seq: u64,
        length: u64,
        tracker: Arc<BodyTracker>,
        endpoint: Option<Arc<Endpoint>>,
    ) -> Self {
        Self {
            source: StreamSource::Live {
                inbound,
                seq,
                remaining: length,
            },
            tracker,
            endpoint,
        }
    }

    /// Body bytes not yet read through this stream.
    pub fn remaining(&self) -> u64 {
        match &self.source {
            StreamSource::Buffered { bytes, pos } => (bytes.len() - pos) as u64,
            StreamSource::Live { remaining, .. } => *remaining,
        }
    }

    /// End the read now. Equivalent to dropping the stream.
    pub fn close(self) {}
}

impl Read for BodyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = match &mut self.source {
            StreamSource::Buffered { bytes, pos } => {
                let n = (bytes.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            StreamSource::Live {
                inbound,
                seq,
                remaining,
            } => {
                if *remaining == 0 || buf.is_empty() {
                    Ok(0)
                } else {
                    let want = (*remaining).min(buf.len() as u64) as usize;
                    let read = inbound.lock().read_body(*seq, &mut buf[..want]);
                    if let Ok(n) = read {
                        *remaining -= n as u64;
                    }
                    read
                }
            }
        };

        match read {
            Ok(n) => {
                self.tracker.progress(n as u64);
                if self.remaining() == 0 {
                    self.tracker.complete();
                }
                Ok(n)
            }
            Err(err) => {
                self.tracker.complete();
                if let Some(endpoint) = &self.endpoint {
                    endpoint.body_read_error_occurred(&err);
                }
                Err(err)
            }
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        self.tracker.complete();
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// What a consumer callback gets alongside the message.
pub struct MessageContext {
    handle: MessagingHandle,
    receiver: Option<String>,
}

impl MessageContext {
    pub(crate) fn new(handle: MessagingHandle, receiver: Option<String>) -> Self {
        Self { handle, receiver }
    }

    /// Handle on the messaging system that received the message.
    pub fn messaging(&self) -> &MessagingHandle {
        &self.handle
    }

    /// Named receiver the message was addressed to, if any.
    pub fn receiver_name(&self) -> Option<&str> {
        self.receiver.as_deref()
    }
}
