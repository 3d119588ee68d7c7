//! Remote peers and the set that tracks them.
//!
//! A [`Destination`] owns the endpoints connected to one remote messaging
//! system. The [`DestinationRegistry`] keeps every destination behind one
//! coarse lock that handshake registration, periodic reconciliation and
//! metadata updates all take, so each of them sees a consistent view of
//! which destinations and endpoints exist.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use msgprims_frame::{FieldMap, FieldValue, INITIAL_PROTOCOL_VERSION, NAMED_MESSAGE_RECEIVER_KEY, UNDEFINED};
use msgprims_transport::address_id;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::endpoint::Endpoint;
use crate::matcher::{MetaDataMatcher, ReceiverNameMatcher};

/// Metadata key carrying the number of busy consumers of a system.
pub const SERVER_LOAD_KEY: &str = "ServerLoad";

/// One remote messaging system.
pub struct Destination {
    key: u64,
    address: Option<SocketAddr>,
    client_side: bool,
    state: Mutex<DestinationState>,
}

struct DestinationState {
    destination_id: i64,
    client_id: i64,
    protocol_version: u8,
    metadata: Option<FieldMap>,
    named_receivers: Vec<String>,
    load: Option<i64>,
    endpoints: Vec<Arc<Endpoint>>,
    pending_connects: usize,
    error: bool,
    error_count: u32,
    connecting_first_endpoint: bool,
    all_endpoints_disconnected: bool,
    removed: bool,
}

impl Destination {
    fn new(key: u64, address: Option<SocketAddr>, client_side: bool) -> Self {
        Self {
            key,
            address,
            client_side,
            state: Mutex::new(DestinationState {
                destination_id: address.map(address_id).unwrap_or(UNDEFINED),
                client_id: UNDEFINED,
                protocol_version: INITIAL_PROTOCOL_VERSION,
                metadata: None,
                named_receivers: Vec::new(),
                load: None,
                endpoints: Vec::new(),
                pending_connects: 0,
                error: false,
                error_count: 0,
                connecting_first_endpoint: false,
                all_endpoints_disconnected: true,
                removed: false,
            }),
        }
    }

    /// Process-unique key of this destination object.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Configured address (client side) or the peer's address (server side).
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// True for destinations created from configuration.
    pub fn is_client_side(&self) -> bool {
        self.client_side
    }

    /// Id under which the remote system is known locally.
    pub fn destination_id(&self) -> i64 {
        self.state.lock().destination_id
    }

    pub(crate) fn set_destination_id(&self, id: i64) {
        self.state.lock().destination_id = id;
    }

    /// Id under which the local system is known by the remote system.
    pub fn client_id(&self) -> i64 {
        self.state.lock().client_id
    }

    pub(crate) fn set_client_id(&self, id: i64) {
        self.state.lock().client_id = id;
    }

    /// Protocol version negotiated by the primary endpoint.
    pub fn protocol_version(&self) -> u8 {
        self.state.lock().protocol_version
    }

    pub(crate) fn set_protocol_version(&self, version: u8) {
        self.state.lock().protocol_version = version;
    }

    pub fn metadata(&self) -> Option<FieldMap> {
        self.state.lock().metadata.clone()
    }

    pub fn metadata_value(&self, key: &str) -> Option<FieldValue> {
        self.state
            .lock()
            .metadata
            .as_ref()
            .and_then(|meta| meta.get(key).cloned())
    }

    /// Replace the metadata, returning the previous map.
    pub(crate) fn set_metadata(&self, metadata: Option<FieldMap>) -> Option<FieldMap> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.metadata, metadata);
        state.refresh_derived();
        previous
    }

    /// Merge `update` into the metadata key by key, returning the previous
    /// map. A null value removes its key.
    pub(crate) fn update_metadata(&self, update: FieldMap) -> Option<FieldMap> {
        let mut state = self.state.lock();
        let previous = state.metadata.clone();
        let metadata = state.metadata.get_or_insert_with(FieldMap::new);
        for (key, value) in update {
            if value.is_null() {
                metadata.remove(&key);
            } else {
                metadata.insert(key, value);
            }
        }
        state.refresh_derived();
        previous
    }

    /// Receiver names the remote system has published.
    pub fn named_receivers(&self) -> Vec<String> {
        self.state.lock().named_receivers.clone()
    }

    pub fn has_named_receiver(&self, name: &str) -> bool {
        self.state
            .lock()
            .named_receivers
            .iter()
            .any(|published| published == name)
    }

    /// Load last reported by the remote system.
    pub fn load(&self) -> Option<i64> {
        self.state.lock().load
    }

    /// Live endpoints in registration order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.state.lock().endpoints.clone()
    }

    /// Live endpoints plus connection attempts still in progress.
    pub fn endpoint_count(&self) -> usize {
        let state = self.state.lock();
        state.endpoints.len() + state.pending_connects
    }

    pub fn live_endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub(crate) fn add_endpoint(&self, endpoint: Arc<Endpoint>) {
        let mut state = self.state.lock();
        if !state.endpoints.iter().any(|e| e.id() == endpoint.id()) {
            state.endpoints.push(endpoint);
        }
        state.all_endpoints_disconnected = false;
    }

    /// Remove an endpoint. Returns true when no endpoints remain.
    pub(crate) fn remove_endpoint(&self, endpoint_id: u64) -> bool {
        let mut state = self.state.lock();
        state.endpoints.retain(|e| e.id() != endpoint_id);
        if state.endpoints.is_empty() {
            state.all_endpoints_disconnected = true;
        }
        state.all_endpoints_disconnected
    }

    pub(crate) fn begin_connect(&self) {
        self.state.lock().pending_connects += 1;
    }

    pub(crate) fn finish_connect(&self) {
        let mut state = self.state.lock();
        state.pending_connects = state.pending_connects.saturating_sub(1);
    }

    pub fn is_error(&self) -> bool {
        self.state.lock().error
    }

    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    /// Setting the error state bumps the consecutive error count; clearing
    /// it resets the count.
    pub fn set_error(&self, error: bool) {
        let mut state = self.state.lock();
        state.error = error;
        if error {
            state.error_count = state.error_count.saturating_add(1);
        } else {
            state.error_count = 0;
        }
    }

    pub fn is_connecting_first_endpoint(&self) -> bool {
        self.state.lock().connecting_first_endpoint
    }

    pub(crate) fn set_connecting_first_endpoint(&self, connecting: bool) {
        self.state.lock().connecting_first_endpoint = connecting;
    }

    /// Atomically claim the right to connect the primary endpoint.
    pub(crate) fn try_begin_first_connect(&self) -> bool {
        let mut state = self.state.lock();
        if state.connecting_first_endpoint || !state.endpoints.is_empty() {
            return false;
        }
        state.connecting_first_endpoint = true;
        state.pending_connects += 1;
        true
    }

    pub fn all_endpoints_disconnected(&self) -> bool {
        self.state.lock().all_endpoints_disconnected
    }

    /// True once a handshake has completed and an endpoint is live.
    pub fn is_linked(&self) -> bool {
        let state = self.state.lock();
        state.client_id != UNDEFINED && !state.endpoints.is_empty()
    }

    pub(crate) fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    /// True once the destination has been removed from its registry.
    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Log-friendly one-line description.
    pub fn description(&self) -> String {
        let state = self.state.lock();
        let address = self
            .address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        format!(
            "destination {} ({}, {}, id {}, protocol v{}, {} endpoints)",
            address,
            if self.client_side { "client side" } else { "server side" },
            if state.error { "error" } else { "ok" },
            state.destination_id,
            state.protocol_version,
            state.endpoints.len()
        )
    }
}

impl DestinationState {
    fn refresh_derived(&mut self) {
        let meta = self.metadata.as_ref();
        self.named_receivers = meta
            .and_then(|m| m.get(NAMED_MESSAGE_RECEIVER_KEY))
            .and_then(FieldValue::as_string_list)
            .unwrap_or_default();
        self.load = meta
            .and_then(|m| m.get(SERVER_LOAD_KEY))
            .and_then(FieldValue::as_i64);
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// The destinations of one messaging system. Obtained through
/// [`DestinationRegistry::lock`].
pub struct DestinationSet {
    destinations: Vec<Arc<Destination>>,
    next_key: u64,
}

impl DestinationSet {
    /// Find the destination for `address`, creating it if absent.
    ///
    /// Client-side destinations are keyed by configured address, server-side
    /// destinations by the id derived from the peer's address. Returns the
    /// destination and whether it was created.
    pub fn get_or_create(&mut self, address: SocketAddr, client_side: bool) -> (Arc<Destination>, bool) {
        let existing = if client_side {
            self.by_address(address)
        } else {
            let id = address_id(address);
            self.destinations
                .iter()
                .find(|d| !d.is_client_side() && d.destination_id() == id)
                .cloned()
        };
        if let Some(destination) = existing {
            return (destination, false);
        }

        self.next_key += 1;
        let destination = Arc::new(Destination::new(self.next_key, Some(address), client_side));
        self.destinations.push(Arc::clone(&destination));
        (destination, true)
    }

    pub fn by_id(&self, destination_id: i64) -> Option<Arc<Destination>> {
        if destination_id == UNDEFINED {
            return None;
        }
        self.destinations
            .iter()
            .find(|d| d.destination_id() == destination_id)
            .cloned()
    }

    /// Client-side destination configured for `address`.
    pub fn by_address(&self, address: SocketAddr) -> Option<Arc<Destination>> {
        self.destinations
            .iter()
            .find(|d| d.is_client_side() && d.address() == Some(address))
            .cloned()
    }

    pub fn remove(&mut self, destination: &Arc<Destination>) -> bool {
        let before = self.destinations.len();
        self.destinations.retain(|d| d.key() != destination.key());
        let removed = self.destinations.len() != before;
        if removed {
            destination.mark_removed();
        }
        removed
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.destinations.iter().any(|d| d.key() == destination.key())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Destination>> {
        self.destinations.iter()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn client_side(&self) -> Vec<Arc<Destination>> {
        self.destinations
            .iter()
            .filter(|d| d.is_client_side())
            .cloned()
            .collect()
    }
}

/// Destination set behind one coarse lock, plus the metadata matcher used
/// for metadata-filtered lookups.
pub struct DestinationRegistry {
    set: Mutex<DestinationSet>,
    matcher: RwLock<Arc<dyn MetaDataMatcher>>,
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(DestinationSet {
                destinations: Vec::new(),
                next_key: 0,
            }),
            matcher: RwLock::new(Arc::new(ReceiverNameMatcher)),
        }
    }

    /// Take the destination-set lock for a compound operation.
    pub fn lock(&self) -> MutexGuard<'_, DestinationSet> {
        self.set.lock()
    }

    pub fn get_or_create(&self, address: SocketAddr, client_side: bool) -> (Arc<Destination>, bool) {
        self.lock().get_or_create(address, client_side)
    }

    pub fn by_id(&self, destination_id: i64) -> Option<Arc<Destination>> {
        self.lock().by_id(destination_id)
    }

    pub fn by_address(&self, address: SocketAddr) -> Option<Arc<Destination>> {
        self.lock().by_address(address)
    }

    pub fn remove(&self, destination: &Arc<Destination>) -> bool {
        self.lock().remove(destination)
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.lock().contains(destination)
    }

    /// All destinations at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Destination>> {
        self.lock().destinations.clone()
    }

    pub fn client_side(&self) -> Vec<Arc<Destination>> {
        self.lock().client_side()
    }

    /// Destinations that published `name` as a named receiver.
    pub fn by_named_receiver(&self, name: &str) -> Vec<Arc<Destination>> {
        self.lock()
            .iter()
            .filter(|d| d.has_named_receiver(name))
            .cloned()
            .collect()
    }

    /// Destinations whose metadata satisfies every entry of `filter`.
    pub fn by_metadata(&self, filter: &FieldMap) -> Vec<Arc<Destination>> {
        let matcher = self.matcher();
        self.lock()
            .iter()
            .filter(|d| {
                let meta = d.metadata();
                filter.iter().all(|(key, wanted)| {
                    let actual = meta.as_ref().and_then(|m| m.get(key));
                    matcher.matches(key, actual, Some(wanted))
                })
            })
            .cloned()
            .collect()
    }

    pub fn matcher(&self) -> Arc<dyn MetaDataMatcher> {
        Arc::clone(&self.matcher.read())
    }

    pub fn set_matcher(&self, matcher: Arc<dyn MetaDataMatcher>) {
        *self.matcher.write() = matcher;
    }

    /// Merge metadata into a destination under the destination-set lock.
    pub fn update_metadata(&self, destination: &Destination, update: FieldMap) -> Option<FieldMap> {
        let _set = self.lock();
        destination.update_metadata(update)
    }

    /// Replace a destination's metadata under the destination-set lock.
    pub fn set_metadata(&self, destination: &Destination, metadata: Option<FieldMap>) -> Option<FieldMap> {
        let _set = self.lock();
        destination.set_metadata(metadata)
    }
}
