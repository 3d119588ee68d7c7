//! Dispatch engine: endpoint selection, redispatch and reply correlation.

use std::cell::Cell;
use std::time::{Duration, Instant};

use msgprims_frame::{Header, UNDEFINED};
use tracing::debug;

use crate::body::BodyWriter;
use crate::error::{MessagingError, Result};
use crate::manager::Shared;
use crate::message::Message;
use crate::pending::PendingReplies;
use crate::selection::Target;

thread_local! {
    static RESPONSE_TIMEOUT_OVERRIDE: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// Run `f` with `timeout` as the default reply timeout of synchronous
/// dispatches made on this thread.
///
/// An explicit timeout on a [`DispatchRequest`] still wins. Calls nest; the
/// previous override is restored when `f` returns or unwinds.
pub fn with_response_timeout<R>(timeout: Duration, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Duration>);

    impl Drop for Restore {
        fn drop(&mut self) {
            RESPONSE_TIMEOUT_OVERRIDE.with(|cell| cell.set(self.0));
        }
    }

    let previous = RESPONSE_TIMEOUT_OVERRIDE.with(|cell| cell.replace(Some(timeout)));
    let _restore = Restore(previous);
    f()
}

fn response_timeout_override() -> Option<Duration> {
    RESPONSE_TIMEOUT_OVERRIDE.with(Cell::get)
}

/// Everything one dispatch needs.
///
/// A header whose `sender_id` and `message_id` are both set is treated as a
/// reply to that message and, without an explicit target, is sent back to
/// its sender.
#[derive(Default)]
pub struct DispatchRequest<'a> {
    pub header: Option<Header>,
    pub body: Option<&'a dyn BodyWriter>,
    pub target: Option<Target>,
    /// `None` or zero selects the configured default.
    pub timeout: Option<Duration>,
    /// Do not wait for a reply.
    pub asynch: bool,
    /// Relay a message whose reply is correlated elsewhere.
    pub proxied: bool,
}

impl<'a> DispatchRequest<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_body(mut self, body: &'a dyn BodyWriter) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynch = true;
        self
    }

    pub fn proxied(mut self) -> Self {
        self.proxied = true;
        self
    }
}

/// Removes the pending reply of a dispatch however the dispatch ends.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    message_id: i64,
    active: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.pending.remove(self.message_id);
        }
    }
}

/// Send one message and, for a synchronous dispatch, wait for its reply.
pub(crate) fn dispatch(shared: &Shared, request: DispatchRequest<'_>) -> Result<Option<Message>> {
    if shared.is_shut_down() {
        return Err(MessagingError::Shutdown);
    }

    let DispatchRequest {
        header,
        body,
        target,
        timeout,
        asynch,
        proxied,
    } = request;

    let mut header = header.unwrap_or_default();
    header.body_length = UNDEFINED;
    header.time_to_live = UNDEFINED;

    let mut target = target;
    if header.sender_id != UNDEFINED && header.message_id != UNDEFINED {
        header.response_to_id = header.message_id;
        if target.is_none() {
            let destination = shared.registry.by_id(header.sender_id).ok_or_else(|| {
                MessagingError::dispatch_failed(
                    format!(
                        "sender {} of message {} is not connected",
                        header.sender_id, header.message_id
                    ),
                    false,
                )
            })?;
            target = Some(Target::Destination(destination.destination_id()));
        }
    }
    let target = target.unwrap_or(Target::Any);
    let timeout = effective_timeout(shared, timeout, asynch);

    let register = !asynch && !proxied;
    let (message_id, waiter) = shared.pending.allocate(register);
    let _guard = PendingGuard {
        pending: &shared.pending,
        message_id,
        active: register,
    };
    header.message_id = message_id;
    if !proxied {
        header.asynch = asynch;
    }

    let deadline = Instant::now() + timeout;
    let mut last_error = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(last_error
                .unwrap_or_else(|| MessagingError::NoEndpointAvailable(target.to_string())));
        }

        let strategy = shared.strategy();
        let Some(endpoint) = strategy.get_endpoint(&target, remaining) else {
            return Err(MessagingError::NoEndpointAvailable(target.to_string()));
        };

        let mut attempt = header.clone();
        if !asynch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            attempt.time_to_live = (remaining.as_millis() as i64).max(1);
        }
        let sent = endpoint.send(&attempt, body);
        strategy.endpoint_ready(&endpoint);

        match sent {
            Ok(()) => break,
            Err(err) if err.is_redispatch_possible() => {
                debug!(message_id, endpoint = endpoint.id(), %err, "redispatching");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    let Some(waiter) = waiter else {
        return Ok(None);
    };

    let reply = waiter.wait(deadline.saturating_duration_since(Instant::now()));
    waiter.cancel();
    match reply {
        None => Err(MessagingError::ResponseTimeout(timeout)),
        Some(reply) if reply.is_body_consumed() => Err(MessagingError::ResponseTimeout(timeout)),
        Some(reply) if reply.header().header_type.is_error_reply() => {
            Err(MessagingError::dispatch_failed(
                reply.header().description.clone(),
                false,
            ))
        }
        Some(reply) => Ok(Some(reply)),
    }
}

fn effective_timeout(shared: &Shared, requested: Option<Duration>, asynch: bool) -> Duration {
    if let Some(timeout) = requested.filter(|t| !t.is_zero()) {
        return timeout;
    }
    if asynch {
        shared.config.async_dispatch_timeout
    } else {
        response_timeout_override().unwrap_or(shared.config.response_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_timeout_override_is_scoped_and_nests() {
        assert_eq!(response_timeout_override(), None);
        with_response_timeout(Duration::from_secs(1), || {
            assert_eq!(response_timeout_override(), Some(Duration::from_secs(1)));
            with_response_timeout(Duration::from_secs(2), || {
                assert_eq!(response_timeout_override(), Some(Duration::from_secs(2)));
            });
            assert_eq!(response_timeout_override(), Some(Duration::from_secs(1)));
        });
        assert_eq!(response_timeout_override(), None);
    }

    #[test]
    fn override_is_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            with_response_timeout(Duration::from_secs(3), || panic!("inside"))
        });
        assert!(result.is_err());
        assert_eq!(response_timeout_override(), None);
    }

    #[test]
    fn override_is_per_thread() {
        with_response_timeout(Duration::from_secs(4), || {
            let other = std::thread::spawn(response_timeout_override).join().unwrap();
            assert_eq!(other, None);
        });
    }

    #[test]
    fn request_builder() {
        let body: &dyn BodyWriter = &"x";
        let request = DispatchRequest::new()
            .with_body(body)
            .with_target(Target::NamedReceiver("orders".into()))
            .with_timeout(Duration::from_millis(5))
            .asynchronous();
        assert!(request.asynch);
        assert!(!request.proxied);
        assert_eq!(request.timeout, Some(Duration::from_millis(5)));
        assert_eq!(
            request.target,
            Some(Target::NamedReceiver("orders".into()))
        );
    }
}
