//! Device registry and per-device shared handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::client::DeviceClient;
use crate::entity::EntityCatalog;
use crate::store::StateStore;

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Discovering,
    Subscribing,
    Ready,
    /// Cancelled; the supervisor will not reconnect.
    Stopped,
}

/// Live connection of one epoch together with the catalog it discovered.
pub struct Connection {
    pub epoch: u64,
    pub client: Arc<dyn DeviceClient>,
    pub catalog: Arc<EntityCatalog>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("epoch", &self.epoch)
            .field("entities", &self.catalog.len())
            .finish()
    }
}

/// Shared state of one device.
///
/// Only the device's supervisor attaches or detaches the connection;
/// everyone else reads it.
pub struct DeviceHandle {
    id: String,
    store: StateStore,
    connection: ArcSwapOption<Connection>,
    catalog: ArcSwap<EntityCatalog>,
    initialized: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    lost_tx: mpsc::Sender<u64>,
    lost_rx: Mutex<Option<mpsc::Receiver<u64>>>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::channel(8);
        Self {
            id: id.into(),
            store: StateStore::new(),
            connection: ArcSwapOption::from(None),
            catalog: ArcSwap::from_pointee(EntityCatalog::default()),
            initialized: AtomicBool::new(false),
            state_tx,
            lost_tx,
            lost_rx: Mutex::new(Some(lost_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The attached connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.load_full()
    }

    pub fn is_attached(&self) -> bool {
        self.connection.load().is_some()
    }

    /// Catalog of the most recent successful discovery.
    ///
    /// Survives disconnects so listings keep working while offline.
    pub fn catalog(&self) -> Arc<EntityCatalog> {
        self.catalog.load_full()
    }

    /// True only once discovery, subscription and the initial pull all succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Ask the supervisor to drop the connection of `epoch`.
    ///
    /// Stale epochs are ignored by the supervisor.
    pub fn report_connection_lost(&self, epoch: u64) {
        if self.lost_tx.try_send(epoch).is_err() {
            tracing::debug!(device = %self.id, epoch, "Connection-lost report already pending");
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::Release);
    }

    /// Install a freshly discovered catalog. Numeric keys of the previous
    /// epoch are dropped from the store.
    pub(crate) fn install_catalog(&self, catalog: Arc<EntityCatalog>) {
        self.store.clear_numeric_keys();
        self.catalog.store(catalog);
    }

    /// Attach a connection and wake anyone waiting for one.
    pub(crate) fn attach(&self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        self.connection.store(Some(connection.clone()));
        self.state_tx.send_replace(ConnectionState::Subscribing);
        connection
    }

    pub(crate) fn detach(&self) -> Option<Arc<Connection>> {
        self.connection.swap(None)
    }

    /// Take the receiving end of connection-lost reports. Only the first caller gets it.
    pub(crate) fn take_lost_receiver(&self) -> Option<mpsc::Receiver<u64>> {
        self.lost_rx.lock().take()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[derive(Default)]
struct Devices {
    by_id: HashMap<String, Arc<DeviceHandle>>,
    order: Vec<String>,
}

/// All devices known to the process.
///
/// Lookups are lock-free; creation is serialized.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: ArcSwap<Devices>,
    create_lock: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.load().by_id.get(device_id).cloned()
    }

    /// Handle for `device_id`, created on first access.
    pub fn get_or_create(&self, device_id: &str) -> Arc<DeviceHandle> {
        if let Some(handle) = self.get(device_id) {
            return handle;
        }

        let _guard = self.create_lock.lock();
        let current = self.devices.load();
        if let Some(handle) = current.by_id.get(device_id) {
            return handle.clone();
        }

        let handle = Arc::new(DeviceHandle::new(device_id));
        let mut by_id = current.by_id.clone();
        let mut order = current.order.clone();
        by_id.insert(device_id.to_string(), handle.clone());
        order.push(device_id.to_string());
        self.devices.store(Arc::new(Devices { by_id, order }));

        tracing::debug!(device = %device_id, "Registered device");
        handle
    }

    /// Resolve a vehicle id, ignoring ASCII case.
    pub fn find_ignore_case(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        if let Some(handle) = self.get(device_id) {
            return Some(handle);
        }
        let devices = self.devices.load();
        devices
            .order
            .iter()
            .find(|id| id.eq_ignore_ascii_case(device_id))
            .and_then(|id| devices.by_id.get(id).cloned())
    }

    /// The first registered device.
    pub fn primary(&self) -> Option<Arc<DeviceHandle>> {
        let devices = self.devices.load();
        devices
            .order
            .first()
            .and_then(|id| devices.by_id.get(id).cloned())
    }

    /// Every device in registration order.
    pub fn devices(&self) -> Vec<Arc<DeviceHandle>> {
        let devices = self.devices.load();
        devices
            .order
            .iter()
            .filter_map(|id| devices.by_id.get(id).cloned())
            .collect()
    }

    /// Whether any device currently has an attached connection.
    pub fn any_attached(&self) -> bool {
        self.devices.load().by_id.values().any(|d| d.is_attached())
    }

    pub fn len(&self) -> usize {
        self.devices.load().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
