//! The messaging system facade.
//!
//! [`MessagingManager`] owns the accept thread, the maintenance thread and
//! the worker pool. Everything else is reached through [`MessagingHandle`],
//! a cheap clone that consumers receive in their [`MessageContext`].
//!
//! [`MessageContext`]: crate::message::MessageContext

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use msgprims_frame::{FieldMap, FieldValue, Header, NAMED_MESSAGE_RECEIVER_KEY};
use msgprims_transport::TcpTransport;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::body::BodyWriter;
use crate::config::MessagingConfig;
use crate::destination::{Destination, DestinationRegistry, SERVER_LOAD_KEY};
use crate::dispatch::{self, DispatchRequest};
use crate::endpoint::{self, spawn_client};
use crate::error::{MessagingError, Result};
use crate::maintenance;
use crate::matcher::MetaDataMatcher;
use crate::message::Message;
use crate::pending::PendingReplies;
use crate::pool::WorkerPool;
use crate::receive::{AccessControl, ConsumerCallback, MetadataListener};
use crate::selection::{DefaultSelectionStrategy, SelectionStrategy, Target};

/// How long shutdown waits for the accept thread's wake-up connection.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Metadata to send to every linked destination.
pub(crate) struct MetadataUpdate {
    pub(crate) metadata: FieldMap,
    /// True when local metadata changed, false for a load-only update.
    pub(crate) changed: bool,
}

/// State shared by every thread of one messaging system.
pub(crate) struct Shared {
    pub(crate) config: MessagingConfig,
    pub(crate) registry: Arc<DestinationRegistry>,
    pub(crate) pending: PendingReplies,
    /// Consumers currently running, published as `ServerLoad`.
    pub(crate) busy_consumers: AtomicUsize,
    strategy: RwLock<Arc<dyn SelectionStrategy>>,
    consumers: RwLock<HashMap<String, Arc<dyn ConsumerCallback>>>,
    default_consumer: RwLock<Option<Arc<dyn ConsumerCallback>>>,
    access_control: RwLock<Option<Arc<dyn AccessControl>>>,
    metadata_listener: RwLock<Option<Arc<dyn MetadataListener>>>,
    /// Local metadata. Removed keys stay behind as `Null` so that updates
    /// delete them on the peers.
    local_metadata: Mutex<FieldMap>,
    metadata_dirty: AtomicBool,
    last_reported_load: AtomicI64,
    connections_per_destination: AtomicUsize,
    next_endpoint_id: AtomicU64,
    pool: Option<WorkerPool>,
    shut_down: AtomicBool,
    stop: Mutex<bool>,
    stop_signal: Condvar,
}

impl Shared {
    fn new(config: MessagingConfig, pool: Option<WorkerPool>) -> Self {
        let registry = Arc::new(DestinationRegistry::new());
        let strategy: Arc<dyn SelectionStrategy> =
            Arc::new(DefaultSelectionStrategy::new(Arc::clone(&registry)));
        Self {
            connections_per_destination: AtomicUsize::new(config.connections_per_destination),
            config,
            registry,
            pending: PendingReplies::new(),
            busy_consumers: AtomicUsize::new(0),
            strategy: RwLock::new(strategy),
            consumers: RwLock::new(HashMap::new()),
            default_consumer: RwLock::new(None),
            access_control: RwLock::new(None),
            metadata_listener: RwLock::new(None),
            local_metadata: Mutex::new(FieldMap::new()),
            metadata_dirty: AtomicBool::new(false),
            last_reported_load: AtomicI64::new(-1),
            next_endpoint_id: AtomicU64::new(1),
            pool,
            shut_down: AtomicBool::new(false),
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
        }
    }

    pub(crate) fn strategy(&self) -> Arc<dyn SelectionStrategy> {
        Arc::clone(&self.strategy.read())
    }

    pub(crate) fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    pub(crate) fn consumer(&self, name: &str) -> Option<Arc<dyn ConsumerCallback>> {
        self.consumers.read().get(name).cloned()
    }

    pub(crate) fn default_consumer(&self) -> Option<Arc<dyn ConsumerCallback>> {
        self.default_consumer.read().clone()
    }

    pub(crate) fn access_control(&self) -> Option<Arc<dyn AccessControl>> {
        self.access_control.read().clone()
    }

    pub(crate) fn next_endpoint_id(&self) -> u64 {
        self.next_endpoint_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn target_endpoints(&self) -> usize {
        self.connections_per_destination.load(Ordering::Relaxed).max(1)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until shutdown. Returns true once shut down.
    pub(crate) fn sleep_unless_shut_down(&self, duration: Duration) -> bool {
        let mut stopped = self.stop.lock();
        if !*stopped {
            self.stop_signal.wait_for(&mut stopped, duration);
        }
        *stopped
    }

    /// Flag shutdown and wake every sleeper. False when already shut down.
    fn begin_shutdown(&self) -> bool {
        let mut stopped = self.stop.lock();
        if *stopped {
            return false;
        }
        *stopped = true;
        self.shut_down.store(true, Ordering::SeqCst);
        self.stop_signal.notify_all();
        true
    }

    /// Metadata sent in a handshake: local entries plus the current load.
    pub(crate) fn handshake_metadata(&self) -> Option<FieldMap> {
        let mut metadata: FieldMap = self
            .local_metadata
            .lock()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if self.config.report_load {
            metadata.insert(SERVER_LOAD_KEY.to_string(), FieldValue::from(self.current_load()));
        }
        (!metadata.is_empty()).then_some(metadata)
    }

    pub(crate) fn notify_metadata_changed(&self, destination: &Arc<Destination>, previous: Option<&FieldMap>) {
        let listener = self.metadata_listener.read().clone();
        if let Some(listener) = listener {
            listener.metadata_changed(destination, previous);
        }
    }

    pub(crate) fn mark_metadata_dirty(&self) {
        self.metadata_dirty.store(true, Ordering::SeqCst);
    }

    /// The update the next maintenance tick should send, if any.
    ///
    /// A changed local metadata set is sent whole, removed keys included as
    /// `Null`. Otherwise only a changed load is sent.
    pub(crate) fn take_metadata_update(&self) -> Option<MetadataUpdate> {
        let changed = self.metadata_dirty.swap(false, Ordering::SeqCst);
        let load = self.current_load();
        let load_changed = self.config.report_load
            && self.last_reported_load.swap(load, Ordering::SeqCst) != load;
        if !changed && !load_changed {
            return None;
        }

        let mut metadata = if changed {
            self.local_metadata.lock().clone()
        } else {
            FieldMap::new()
        };
        if self.config.report_load {
            metadata.insert(SERVER_LOAD_KEY.to_string(), FieldValue::from(load));
        }
        Some(MetadataUpdate { metadata, changed })
    }

    fn current_load(&self) -> i64 {
        self.busy_consumers.load(Ordering::SeqCst) as i64
    }

    fn set_local_metadata(&self, key: String, value: FieldValue) {
        self.local_metadata.lock().insert(key, value);
        self.mark_metadata_dirty();
    }

    fn publish_receiver_names(&self) {
        let mut names: Vec<String> = self.consumers.read().keys().cloned().collect();
        names.sort();
        let value = if names.is_empty() {
            FieldValue::Null
        } else {
            FieldValue::from(names)
        };
        self.set_local_metadata(NAMED_MESSAGE_RECEIVER_KEY.to_string(), value);
    }
}

/// Cloneable access to a running messaging system.
#[derive(Clone)]
pub struct MessagingHandle(Arc<Shared>);

impl MessagingHandle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self(shared)
    }

    /// Dispatch with full control over target, timeout and mode.
    ///
    /// Returns the reply of a synchronous dispatch and `None` for an
    /// asynchronous one.
    pub fn dispatch(&self, request: DispatchRequest<'_>) -> Result<Option<Message>> {
        dispatch::dispatch(&self.0, request)
    }

    /// Send to any linked destination and wait for the reply.
    pub fn send(&self, header: Header, body: Option<&dyn BodyWriter>) -> Result<Message> {
        self.send_sync(header, body, Target::Any)
    }

    /// Send to any linked destination without waiting for a reply.
    pub fn send_async(&self, header: Header, body: Option<&dyn BodyWriter>) -> Result<()> {
        self.dispatch(DispatchRequest {
            header: Some(header),
            body,
            asynch: true,
            ..DispatchRequest::default()
        })
        .map(|_| ())
    }

    /// Send to one destination by id and wait for the reply.
    pub fn send_to(&self, destination_id: i64, header: Header, body: Option<&dyn BodyWriter>) -> Result<Message> {
        self.send_sync(header, body, Target::Destination(destination_id))
    }

    /// Send to a destination that published `receiver`, addressed to that
    /// receiver, and wait for the reply.
    pub fn send_to_named(&self, receiver: &str, header: Header, body: Option<&dyn BodyWriter>) -> Result<Message> {
        let header = header.with_named_receiver(receiver);
        self.send_sync(header, body, Target::NamedReceiver(receiver.to_string()))
    }

    /// Send to a destination whose metadata matches `filter` and wait for
    /// the reply.
    pub fn send_matching(&self, filter: FieldMap, header: Header, body: Option<&dyn BodyWriter>) -> Result<Message> {
        self.send_sync(header, body, Target::MetaData(filter))
    }

    fn send_sync(&self, header: Header, body: Option<&dyn BodyWriter>, target: Target) -> Result<Message> {
        let reply = self.dispatch(DispatchRequest {
            header: Some(header),
            body,
            target: Some(target),
            ..DispatchRequest::default()
        })?;
        reply.ok_or_else(|| MessagingError::dispatch_failed("no reply to a synchronous dispatch", false))
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.0.registry.snapshot()
    }

    pub fn destination(&self, destination_id: i64) -> Option<Arc<Destination>> {
        self.0.registry.by_id(destination_id)
    }

    /// Replace the configured destinations with `addresses`.
    pub fn set_destinations(&self, addresses: &[SocketAddr]) {
        if self.0.is_shut_down() {
            return;
        }
        maintenance::reconcile_destinations(&self.0, addresses);
    }

    /// Add a destination and start connecting to it. Returns the existing
    /// destination when the address is already configured.
    pub fn add_destination(&self, address: SocketAddr) -> Arc<Destination> {
        let (destination, created) = self.0.registry.get_or_create(address, true);
        if created && !self.0.is_shut_down() {
            info!(destination = %destination.description(), "destination added");
            spawn_client(&self.0, Arc::clone(&destination), true);
        }
        destination
    }

    /// Remove a configured destination and disconnect its endpoints.
    pub fn remove_destination(&self, address: SocketAddr) -> bool {
        let removed = {
            let mut set = self.0.registry.lock();
            match set.by_address(address).filter(|d| d.is_client_side()) {
                Some(destination) => {
                    set.remove(&destination);
                    Some(destination)
                }
                None => None,
            }
        };
        let Some(destination) = removed else {
            return false;
        };
        info!(destination = %destination.description(), "destination removed");
        for endpoint in destination.endpoints() {
            endpoint.disconnect();
        }
        true
    }

    /// Publish a metadata entry to every peer.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.set_local_metadata(key.into(), value.into());
    }

    /// Withdraw a metadata entry from every peer.
    pub fn remove_metadata(&self, key: &str) {
        let mut local = self.0.local_metadata.lock();
        if let Some(value) = local.get_mut(key) {
            *value = FieldValue::Null;
            drop(local);
            self.0.mark_metadata_dirty();
        }
    }

    /// Current local metadata, removed entries excluded.
    pub fn metadata(&self) -> FieldMap {
        self.0
            .local_metadata
            .lock()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Route messages addressed to `name` to `consumer`, and advertise the
    /// name to peers.
    pub fn register_consumer(&self, name: impl Into<String>, consumer: impl ConsumerCallback + 'static) {
        let name = name.into();
        debug!(receiver = %name, "consumer registered");
        self.0.consumers.write().insert(name, Arc::new(consumer));
        self.0.publish_receiver_names();
    }

    pub fn unregister_consumer(&self, name: &str) -> bool {
        let removed = self.0.consumers.write().remove(name).is_some();
        if removed {
            self.0.publish_receiver_names();
        }
        removed
    }

    /// Consumer for messages that name no receiver, or a receiver with no
    /// consumer of its own.
    pub fn set_default_consumer(&self, consumer: impl ConsumerCallback + 'static) {
        *self.0.default_consumer.write() = Some(Arc::new(consumer));
    }

    pub fn set_access_control(&self, access: impl AccessControl + 'static) {
        *self.0.access_control.write() = Some(Arc::new(access));
    }

    pub fn set_metadata_listener(&self, listener: impl MetadataListener + 'static) {
        *self.0.metadata_listener.write() = Some(Arc::new(listener));
    }

    /// Replace the selection strategy. Endpoints become known to the new
    /// strategy as they are released or re-established.
    pub fn set_selection_strategy(&self, strategy: Arc<dyn SelectionStrategy>) {
        *self.0.strategy.write() = strategy;
    }

    pub fn set_metadata_matcher(&self, matcher: Arc<dyn MetaDataMatcher>) {
        self.0.registry.set_matcher(matcher);
    }

    /// Change the endpoint target per destination. Maintenance converges
    /// on it.
    pub fn set_connections_per_destination(&self, count: usize) {
        self.0
            .connections_per_destination
            .store(count.max(1), Ordering::Relaxed);
    }

    pub fn connections_per_destination(&self) -> usize {
        self.0.target_endpoints()
    }

    /// Run one maintenance tick now, on the calling thread.
    pub fn perform_periodic_check(&self) {
        maintenance::perform_periodic_check(&self.0);
    }

    /// Consumers currently running.
    pub fn busy_consumers(&self) -> usize {
        self.0.busy_consumers.load(Ordering::SeqCst)
    }

    /// Synchronous dispatches currently waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.0.pending.len()
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.0.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.is_shut_down()
    }
}

impl fmt::Debug for MessagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingHandle")
            .field("destinations", &self.0.registry.snapshot().len())
            .field("pending_replies", &self.0.pending.len())
            .field("shut_down", &self.0.is_shut_down())
            .finish()
    }
}

/// A running messaging system.
///
/// Dereferences to [`MessagingHandle`] for everything but lifecycle.
/// Dropping the manager shuts it down.
///
/// # Example
///
/// ```no_run
/// use msgprims_frame::Header;
/// use msgprims_peer::{MessagingConfig, MessagingManager};
///
/// let manager = MessagingManager::start(MessagingConfig::default(), None)?;
/// manager.add_destination("127.0.0.1:7400".parse().unwrap());
/// let reply = manager.send(Header::new(), Some(&"ping"))?;
/// println!("{} byte reply", reply.body_length());
/// # Ok::<(), msgprims_peer::MessagingError>(())
/// ```
pub struct MessagingManager {
    handle: MessagingHandle,
    local_addr: Option<SocketAddr>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingManager {
    /// Start a messaging system. With `bind_addr` it also accepts inbound
    /// connections.
    pub fn start(config: MessagingConfig, bind_addr: Option<SocketAddr>) -> Result<Self> {
        let pool = if config.worker_pool_size > 0 {
            Some(WorkerPool::new(
                "msgprims-worker",
                config.worker_pool_size,
                config.worker_queue_capacity,
            )?)
        } else {
            None
        };
        let listener = bind_addr.map(TcpTransport::bind).transpose()?;
        let local_addr = listener.as_ref().map(TcpTransport::local_addr);
        let shared = Arc::new(Shared::new(config, pool));

        let mut threads = Vec::new();
        if let Some(listener) = listener {
            let accept_shared = Arc::clone(&shared);
            threads.push(spawn_named("msgprims-accept", move || {
                accept_loop(accept_shared, listener)
            })?);
        }
        let maintenance_shared = Arc::clone(&shared);
        threads.push(spawn_named("msgprims-maintenance", move || {
            maintenance::run(maintenance_shared)
        })?);

        info!(addr = ?local_addr, "messaging system started");
        Ok(Self {
            handle: MessagingHandle(shared),
            local_addr,
            threads: Mutex::new(threads),
        })
    }

    pub fn handle(&self) -> MessagingHandle {
        self.handle.clone()
    }

    /// Address inbound connections are accepted on, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, disconnect every endpoint, stop the worker pool and
    /// join the system threads. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.handle.0;
        if !shared.begin_shutdown() {
            return;
        }

        if let Some(addr) = self.local_addr {
            let _ = TcpTransport::connect_timeout(wake_address(addr), WAKE_CONNECT_TIMEOUT);
        }
        for destination in shared.registry.snapshot() {
            for endpoint in destination.endpoints() {
                endpoint.disconnect();
            }
        }
        if let Some(pool) = shared.pool() {
            pool.shutdown();
        }

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("messaging thread panicked");
            }
        }
        info!("messaging system shut down");
    }
}

impl Deref for MessagingManager {
    type Target = MessagingHandle;

    fn deref(&self) -> &MessagingHandle {
        &self.handle
    }
}

impl Drop for MessagingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MessagingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingManager")
            .field("local_addr", &self.local_addr)
            .field("handle", &self.handle)
            .finish()
    }
}

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|err| MessagingError::Transport(err.into()))
}

fn accept_loop(shared: Arc<Shared>, listener: TcpTransport) {
    debug!(addr = %listener.local_addr(), "accepting connections");
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                if shared.is_shut_down() {
                    let _ = stream.shutdown();
                    break;
                }
                if let Err(err) = endpoint::spawn_server(&shared, stream, remote) {
                    warn!(%remote, %err, "unable to start inbound endpoint");
                }
            }
            Err(err) => {
                if shared.is_shut_down() {
                    break;
                }
                warn!(%err, "accept failed");
                if shared.sleep_unless_shut_down(ACCEPT_RETRY_DELAY) {
                    break;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Address that reaches a listener bound to `addr`.
fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}
