//! Per-endpoint receive loop and consumer dispatch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use msgprims_frame::{FieldMap, FrameError, Header, HeaderType};
use tracing::{debug, error, trace, warn};

use crate::destination::Destination;
use crate::dispatch::{self, DispatchRequest};
use crate::endpoint::{endpoint_disconnected, Endpoint};
use crate::error::{BoxError, Result};
use crate::manager::{MessagingHandle, Shared};
use crate::message::{BodySource, Message, MessageContext};
use crate::pending::Completion;

/// Receiver name checked against access control for messages that do not
/// name a receiver.
pub const DEFAULT_RECEIVER_NAME: &str = "default";

/// Protocol version from which a sender waiting for a reply is told about
/// failures to process its message.
const ERROR_REPLY_VERSION: u8 = 5;

/// Handles messages delivered to a named receiver or the default consumer.
pub trait ConsumerCallback: Send + Sync {
    fn on_message(&self, ctx: &MessageContext, message: Message) -> std::result::Result<(), BoxError>;
}

impl<F> ConsumerCallback for F
where
    F: Fn(&MessageContext, Message) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn on_message(&self, ctx: &MessageContext, message: Message) -> std::result::Result<(), BoxError> {
        self(ctx, message)
    }
}

/// Authorizes operations before a consumer sees the message.
pub trait AccessControl: Send + Sync {
    /// Operation the message asks for, or `None` when no check applies.
    fn identify(&self, message: &Message) -> Option<String>;
    fn check_access(&self, receiver: &str, operation: &str) -> bool;
}

/// Told whenever a destination's metadata changes.
pub trait MetadataListener: Send + Sync {
    fn metadata_changed(&self, destination: &Arc<Destination>, previous: Option<&FieldMap>);
}

/// Read frames from `endpoint` until it closes, then clean it up.
pub(crate) fn run_receive_loop(shared: &Arc<Shared>, endpoint: &Arc<Endpoint>) {
    let version = endpoint.protocol_version();
    debug!(endpoint = endpoint.id(), peer = %endpoint.peer_addr(), "receive loop started");

    loop {
        if shared.is_shut_down() || endpoint.is_closed() {
            break;
        }

        let next = endpoint.inbound().lock().next_header(version);
        let header = match next {
            Ok(header) => header,
            // The reader already discarded the body; other protocol errors
            // leave the stream position unknown and close the endpoint below.
            Err(err @ FrameError::MalformedFrame { .. }) => {
                warn!(endpoint = endpoint.id(), %err, "skipping malformed frame");
                continue;
            }
            Err(err) if err.is_timeout() => continue,
            Err(FrameError::ConnectionClosed) => {
                debug!(endpoint = endpoint.id(), "peer closed connection");
                break;
            }
            Err(err) => {
                if endpoint.is_closed() || endpoint.disconnect_received() {
                    debug!(endpoint = endpoint.id(), %err, "receive loop ended");
                } else {
                    warn!(endpoint = endpoint.id(), %err, "receive failed, closing endpoint");
                }
                break;
            }
        };

        if let Err(err) = handle_frame(shared, endpoint, header) {
            if !endpoint.is_closed() {
                warn!(endpoint = endpoint.id(), %err, "receive failed, closing endpoint");
            }
            break;
        }
    }

    endpoint_disconnected(shared, endpoint);
}

fn handle_frame(shared: &Arc<Shared>, endpoint: &Arc<Endpoint>, header: Header) -> Result<()> {
    trace!(endpoint = endpoint.id(), header = %header, "frame received");
    match header.header_type {
        HeaderType::MetaDataUpdate => {
            endpoint.inbound().lock().skip_remaining()?;
            if let Some(update) = header.system_metadata {
                apply_metadata(shared, endpoint, update);
            }
            Ok(())
        }
        HeaderType::Disconnect => {
            debug!(endpoint = endpoint.id(), "peer announced disconnect");
            endpoint.mark_disconnect_received();
            thread::yield_now();
            endpoint.close();
            Ok(())
        }
        HeaderType::EndpointCheck => {
            endpoint.inbound().lock().skip_remaining()?;
            Ok(())
        }
        _ => handle_message(shared, endpoint, header),
    }
}

fn handle_message(shared: &Arc<Shared>, endpoint: &Arc<Endpoint>, mut header: Header) -> Result<()> {
    if let Some(update) = header.system_metadata.take() {
        apply_metadata(shared, endpoint, update);
    }

    let source = {
        let mut inbound = endpoint.inbound().lock();
        let length = inbound.body_remaining();
        if length == 0 {
            BodySource::Empty
        } else if length < shared.config.prebuffer_limit as u64 {
            BodySource::Buffered(inbound.read_remaining()?)
        } else {
            BodySource::Live {
                inbound: Arc::clone(endpoint.inbound()),
                seq: inbound.seq(),
                length,
            }
        }
    };
    let live = source.is_live();

    let message = Message::inbound(header, Arc::clone(endpoint), source);
    let tracker = message.tracker();

    let unclaimed = if message.header().is_reply() {
        let response_to = message.header().response_to_id;
        match shared.pending.complete(message) {
            Completion::Delivered => None,
            Completion::Late => {
                debug!(response_to, "dropping late reply");
                None
            }
            Completion::Unmatched(message) => Some(message),
        }
    } else {
        Some(message)
    };

    if let Some(message) = unclaimed {
        deliver(shared, message);
    }

    if live {
        if !tracker.wait_while_progressing(shared.config.message_read_timeout) {
            warn!(
                endpoint = endpoint.id(),
                bytes_read = tracker.bytes_read(),
                expected = tracker.length(),
                handler = tracker.handler().as_deref().unwrap_or("<none>"),
                timeout = ?shared.config.message_read_timeout,
                "message body read stalled, skipping the rest"
            );
        }
        endpoint.inbound().lock().skip_remaining()?;
    }
    Ok(())
}

fn apply_metadata(shared: &Shared, endpoint: &Endpoint, update: FieldMap) {
    let Some(destination) = endpoint.destination() else {
        return;
    };
    let previous = shared.registry.update_metadata(&destination, update);
    shared.notify_metadata_changed(&destination, previous.as_ref());
}

/// Hand a message to the worker pool, or run its consumer inline when
/// there is no pool.
pub(crate) fn deliver(shared: &Arc<Shared>, message: Message) {
    let Some(pool) = shared.pool() else {
        invoke_consumer(shared, message);
        return;
    };

    let job_shared = Arc::clone(shared);
    let submitted = pool.submit(move || invoke_consumer(&job_shared, message));
    if let Err(err) = submitted {
        // The job, and with it the message, is dropped; that ends its body read.
        debug!(%err, "message not delivered");
    }
}

fn invoke_consumer(shared: &Arc<Shared>, message: Message) {
    let header = message.header().clone();
    if message.has_expired() {
        debug!(message_id = header.message_id, "discarding expired message");
        return;
    }

    let receiver = header.named_receiver().map(str::to_string);
    let consumer = receiver
        .as_deref()
        .and_then(|name| shared.consumer(name))
        .or_else(|| shared.default_consumer());

    let Some(consumer) = consumer else {
        message.signal_read_completion();
        debug!(
            message_id = header.message_id,
            receiver = receiver.as_deref().unwrap_or(DEFAULT_RECEIVER_NAME),
            "no consumer for message"
        );
        send_error_reply(
            shared,
            &header,
            HeaderType::ProcessingError,
            "No handler available to process message!",
        );
        return;
    };

    if let Some(access) = shared.access_control() {
        if let Some(operation) = access.identify(&message) {
            let name = receiver.as_deref().unwrap_or(DEFAULT_RECEIVER_NAME);
            if !access.check_access(name, &operation) {
                message.signal_read_completion();
                debug!(operation, receiver = name, "access denied");
                send_error_reply(
                    shared,
                    &header,
                    HeaderType::AccessDenied,
                    &format!("No access to execute operation {operation} in {name}"),
                );
                return;
            }
        }
    }

    message.record_handler_thread();
    let ctx = MessageContext::new(MessagingHandle::from_shared(Arc::clone(shared)), receiver);
    shared.busy_consumers.fetch_add(1, Ordering::SeqCst);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| consumer.on_message(&ctx, message)));
    shared.busy_consumers.fetch_sub(1, Ordering::SeqCst);

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => {
            error!(message_id = header.message_id, %err, "consumer failed");
            err.to_string()
        }
        Err(payload) => {
            let text = panic_text(payload.as_ref());
            error!(message_id = header.message_id, panic = %text, "consumer panicked");
            text
        }
    };
    send_error_reply(shared, &header, HeaderType::ProcessingError, &failure);
}

/// Reply with an error header when the sender is waiting for a reply.
fn send_error_reply(shared: &Shared, inbound: &Header, kind: HeaderType, text: &str) {
    if !inbound.expecting_response() || inbound.protocol_version < ERROR_REPLY_VERSION {
        return;
    }
    let reply = Header::reply_to(inbound)
        .with_type(kind)
        .with_description(text);
    let sent = dispatch::dispatch(
        shared,
        DispatchRequest {
            header: Some(reply),
            asynch: true,
            ..DispatchRequest::default()
        },
    );
    if let Err(err) = sent {
        warn!(message_id = inbound.message_id, %err, "error reply not sent");
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "consumer panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_text_extracts_messages() {
        let caught = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_text(caught.as_ref()), "boom");

        let caught = panic::catch_unwind(|| panic!("{} {}", "formatted", 1)).unwrap_err();
        assert_eq!(panic_text(caught.as_ref()), "formatted 1");

        let caught = panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_text(caught.as_ref()), "consumer panicked");
    }
}
