//! Choosing the endpoint a dispatch is sent on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use msgprims_frame::FieldMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::destination::{Destination, DestinationRegistry};
use crate::endpoint::{Endpoint, EndpointState};

/// How often a waiting `get_endpoint` re-resolves its target, so that
/// destinations linked while it waits are seen.
const RESOLVE_INTERVAL: Duration = Duration::from_millis(100);

/// What a dispatch is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Any linked destination.
    Any,
    /// The destination with this id.
    Destination(i64),
    /// Destinations that published this receiver name.
    NamedReceiver(String),
    /// Destinations whose metadata matches every entry.
    MetaData(FieldMap),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Any => f.write_str("any destination"),
            Target::Destination(id) => write!(f, "destination {id}"),
            Target::NamedReceiver(name) => write!(f, "named receiver '{name}'"),
            Target::MetaData(filter) => {
                let keys: Vec<&str> = filter.keys().map(String::as_str).collect();
                write!(f, "metadata [{}]", keys.join(", "))
            }
        }
    }
}

/// Hands out ready endpoints, one dispatch at a time per endpoint.
///
/// An endpoint returned by `get_endpoint` is busy until it is passed back
/// through `endpoint_ready`.
pub trait SelectionStrategy: Send + Sync {
    fn get_endpoint(&self, target: &Target, timeout: Duration) -> Option<Arc<Endpoint>>;
    fn endpoint_ready(&self, endpoint: &Arc<Endpoint>);
    fn endpoint_destroyed(&self, endpoint: &Arc<Endpoint>);
}

/// Ready lists per destination, picked by load and then by idle time.
///
/// Lock order is strategy, then registry. Nothing holding the registry lock
/// calls into the strategy.
pub struct DefaultSelectionStrategy {
    registry: Arc<DestinationRegistry>,
    ready: Mutex<HashMap<u64, Vec<Arc<Endpoint>>>>,
    available: Condvar,
}

impl DefaultSelectionStrategy {
    pub fn new(registry: Arc<DestinationRegistry>) -> Self {
        Self {
            registry,
            ready: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        }
    }

    /// Number of ready endpoints of a destination.
    pub fn ready_count(&self, destination: &Destination) -> usize {
        self.ready
            .lock()
            .get(&destination.key())
            .map_or(0, Vec::len)
    }

    fn candidates(&self, target: &Target) -> Vec<Arc<Destination>> {
        match target {
            Target::Any => self.registry.snapshot(),
            Target::Destination(id) => self.registry.by_id(*id).into_iter().collect(),
            Target::NamedReceiver(name) => self.registry.by_named_receiver(name),
            Target::MetaData(filter) => self.registry.by_metadata(filter),
        }
    }
}

impl SelectionStrategy for DefaultSelectionStrategy {
    fn get_endpoint(&self, target: &Target, timeout: Duration) -> Option<Arc<Endpoint>> {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        loop {
            let candidates = self.candidates(target);
            if let Some(endpoint) = pick(&mut ready, &candidates) {
                endpoint.set_state(EndpointState::Busy);
                trace!(endpoint = endpoint.id(), %target, "endpoint selected");
                return Some(endpoint);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake = deadline.min(now + RESOLVE_INTERVAL);
            self.available.wait_until(&mut ready, wake);
        }
    }

    fn endpoint_ready(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.is_closed() {
            self.endpoint_destroyed(endpoint);
            return;
        }
        let Some(destination) = endpoint.destination() else {
            return;
        };

        let mut ready = self.ready.lock();
        endpoint.set_last_ready_time(Instant::now());
        endpoint.set_state(EndpointState::Ready);
        let list = ready.entry(destination.key()).or_default();
        if !list.iter().any(|e| e.id() == endpoint.id()) {
            list.push(Arc::clone(endpoint));
        }
        self.available.notify_all();
    }

    fn endpoint_destroyed(&self, endpoint: &Arc<Endpoint>) {
        let mut ready = self.ready.lock();
        for list in ready.values_mut() {
            list.retain(|e| e.id() != endpoint.id());
        }
        ready.retain(|_, list| !list.is_empty());
    }
}

fn oldest_ready(ready: &HashMap<u64, Vec<Arc<Endpoint>>>, destination: &Destination) -> Option<Instant> {
    ready
        .get(&destination.key())
        .and_then(|list| list.first())
        .map(|e| e.last_ready_time())
}

/// Take the ready endpoint to use among `candidates`, if any has one.
fn pick(
    ready: &mut HashMap<u64, Vec<Arc<Endpoint>>>,
    candidates: &[Arc<Destination>],
) -> Option<Arc<Endpoint>> {
    let with_ready: Vec<&Arc<Destination>> = candidates
        .iter()
        .filter(|d| ready.get(&d.key()).is_some_and(|list| !list.is_empty()))
        .collect();

    let chosen = match with_ready.as_slice() {
        [] => return None,
        [only] => *only,
        many if many.iter().all(|d| d.load().is_some()) => many
            .iter()
            .min_by_key(|d| (d.load(), oldest_ready(ready, d)))
            .copied()?,
        many => many.iter().min_by_key(|d| oldest_ready(ready, d)).copied()?,
    };

    let list = ready.get_mut(&chosen.key())?;
    if list.is_empty() {
        return None;
    }
    Some(list.remove(0))
}
