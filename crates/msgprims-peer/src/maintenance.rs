//! Periodic upkeep: endpoint checks, reconnects, scaling and metadata
//! propagation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use msgprims_frame::{Header, HeaderType};
use tracing::{debug, info, warn};

use crate::destination::Destination;
use crate::dispatch::{self, DispatchRequest};
use crate::endpoint::{spawn_client, Endpoint};
use crate::manager::Shared;
use crate::selection::Target;

/// Pause between the endpoint checks and the destination checks of a tick.
const CHECK_SETTLE_TIME: Duration = Duration::from_millis(500);

/// While failing, a destination's reconnect attempts are logged every this
/// many consecutive failures.
const ERROR_LOG_INTERVAL: u32 = 20;

/// Body of the maintenance thread.
pub(crate) fn run(shared: Arc<Shared>) {
    let interval = shared.config.effective_check_interval();
    debug!(?interval, "maintenance started");
    while !shared.sleep_unless_shut_down(interval) {
        perform_periodic_check(&shared);
    }
    debug!("maintenance stopped");
}

/// One maintenance tick.
pub(crate) fn perform_periodic_check(shared: &Arc<Shared>) {
    check_endpoints(shared);
    if shared.sleep_unless_shut_down(CHECK_SETTLE_TIME) {
        return;
    }
    check_destinations(shared);
    dispatch_metadata_update(shared);
}

/// Send a liveness check on every endpoint that is idle right now.
fn check_endpoints(shared: &Shared) {
    let strategy = shared.strategy();
    for destination in shared.registry.snapshot() {
        if !destination.is_linked() {
            continue;
        }
        let target = Target::Destination(destination.destination_id());
        let mut idle: Vec<Arc<Endpoint>> = Vec::new();
        while let Some(endpoint) = strategy.get_endpoint(&target, Duration::ZERO) {
            idle.push(endpoint);
        }
        for endpoint in &idle {
            if let Err(err) = endpoint.check() {
                debug!(endpoint = endpoint.id(), %err, "endpoint check failed");
            }
            strategy.endpoint_ready(endpoint);
        }
    }
}

/// Reconnect, scale up and scale down client-side destinations.
fn check_destinations(shared: &Arc<Shared>) {
    let target = shared.target_endpoints();
    let mut excess: Vec<Arc<Destination>> = Vec::new();
    {
        let set = shared.registry.lock();
        for destination in set.client_side() {
            let count = destination.endpoint_count();
            let connecting = destination.is_connecting_first_endpoint();

            if count == 0 && !connecting {
                if destination.is_error() {
                    destination.set_error(true);
                    let errors = destination.error_count();
                    if errors % ERROR_LOG_INTERVAL == 0 {
                        warn!(
                            destination = %destination.description(),
                            errors,
                            "still unable to connect"
                        );
                    }
                } else {
                    warn!(destination = %destination.description(), "no endpoints, reconnecting");
                }
                spawn_client(shared, destination, true);
            } else if count < target && !connecting && destination.is_linked() {
                debug!(
                    destination = %destination.description(),
                    missing = target - count,
                    "adding endpoints"
                );
                for _ in count..target {
                    spawn_client(shared, Arc::clone(&destination), false);
                }
            } else if count > target {
                excess.push(destination);
            }
        }
    }

    if excess.is_empty() || shared.sleep_unless_shut_down(shared.config.excess_endpoint_grace) {
        return;
    }

    let target = shared.target_endpoints();
    for destination in excess {
        let endpoints = destination.endpoints();
        if endpoints.len() <= target {
            continue;
        }
        info!(
            destination = %destination.description(),
            closing = endpoints.len() - target,
            "closing excess endpoints"
        );
        for endpoint in endpoints.iter().skip(target) {
            endpoint.disconnect();
        }
    }
}

/// Propagate local metadata changes, and the current load, to every
/// linked destination.
pub(crate) fn dispatch_metadata_update(shared: &Shared) {
    let Some(update) = shared.take_metadata_update() else {
        return;
    };

    for destination in shared.registry.snapshot() {
        if !destination.is_linked() {
            continue;
        }
        let mut header = Header::of_type(HeaderType::MetaDataUpdate);
        header.system_metadata = Some(update.metadata.clone());
        let sent = dispatch::dispatch(
            shared,
            DispatchRequest {
                header: Some(header),
                target: Some(Target::Destination(destination.destination_id())),
                asynch: true,
                ..DispatchRequest::default()
            },
        );
        if let Err(err) = sent {
            debug!(destination = %destination.description(), %err, "metadata update not sent");
            if update.changed {
                shared.mark_metadata_dirty();
            }
        }
    }
}

/// Bring the client-side destinations in line with `addresses`.
pub(crate) fn reconcile_destinations(shared: &Arc<Shared>, addresses: &[SocketAddr]) {
    let (removed, added) = {
        let mut set = shared.registry.lock();
        let removed: Vec<Arc<Destination>> = set
            .client_side()
            .into_iter()
            .filter(|d| d.address().is_none_or(|addr| !addresses.contains(&addr)))
            .collect();
        for destination in &removed {
            set.remove(destination);
        }

        let mut added = Vec::new();
        for address in addresses {
            let (destination, created) = set.get_or_create(*address, true);
            if created {
                added.push(destination);
            }
        }
        (removed, added)
    };

    for destination in removed {
        info!(destination = %destination.description(), "destination removed");
        for endpoint in destination.endpoints() {
            endpoint.disconnect();
        }
    }
    for destination in added {
        info!(destination = %destination.description(), "destination added");
        spawn_client(shared, destination, true);
    }
}
