//! Host-stack bus abstraction
//!
//! The orchestration logic never talks to D-Bus directly; it goes through
//! [`BluezBus`], an async contract shaped like the BlueZ D-Bus surface:
//! named objects, interfaces, property get/set, method calls and signals.
//! The production implementation is [`crate::zbus_backend::ZbusBus`]; tests
//! drive the same code paths through the in-memory mock in
//! [`crate::testing`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gattling_core::{BusError, BusResult};
use tokio::sync::mpsc;

use crate::gatt::{GattApplication, GattObjectKind};

// ----------------------------------------------------------------------------
// Well-Known Names
// ----------------------------------------------------------------------------

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const GATT_MANAGER_IFACE: &str = "org.bluez.GattManager1";
pub const ADVERTISING_MANAGER_IFACE: &str = "org.bluez.LEAdvertisingManager1";
pub const ADVERTISEMENT_IFACE: &str = "org.bluez.LEAdvertisement1";
pub const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";

// ----------------------------------------------------------------------------
// Property Values
// ----------------------------------------------------------------------------

/// Transport-free rendition of a D-Bus property value, restricted to the
/// types the Adapter1/Device1 surfaces actually use.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    U16(u16),
    I16(i16),
    U32(u32),
    Str(String),
    List(Vec<String>),
}

impl PropValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            PropValue::I16(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PropValue::List(values) => Some(values),
            _ => None,
        }
    }
}

/// Property name → value map for one interface.
pub type InterfaceProps = HashMap<String, PropValue>;

/// Object path → interface name → properties, as returned by the host
/// stack's object manager.
pub type ManagedObjects = HashMap<String, HashMap<String, InterfaceProps>>;

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

/// Bus events delivered to the worker loop.
#[derive(Debug, Clone)]
pub enum BusSignal {
    PropertiesChanged {
        object_path: String,
        interface: String,
        changed: InterfaceProps,
    },
    InterfacesAdded {
        object_path: String,
        interfaces: HashMap<String, InterfaceProps>,
    },
    InterfacesRemoved {
        object_path: String,
        interfaces: Vec<String>,
    },
    NameOwnerChanged {
        name: String,
        old_owner: String,
        new_owner: String,
    },
    /// Our own owned name was taken away from us.
    NameLost { name: String },
    /// The host stack revoked our advertisement via its Release method.
    AdvertisementReleased { object_path: String },
}

pub type BusSignalSender = mpsc::UnboundedSender<BusSignal>;
pub type BusSignalReceiver = mpsc::UnboundedReceiver<BusSignal>;

/// Guard over an active set of signal subscriptions. Dropping it tears the
/// subscriptions down, so shutdown cannot leave a dangling handler behind.
pub struct SignalSubscription {
    count: usize,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SignalSubscription {
    pub fn new(
        count: usize,
        tasks: Vec<tokio::task::JoinHandle<()>>,
        on_drop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            count,
            tasks,
            on_drop,
        }
    }

    /// Number of distinct signal classes subscribed.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl std::fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("count", &self.count)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Advertisement Export Surface
// ----------------------------------------------------------------------------

/// Read-only property surface of the exported advertisement object.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementProps {
    /// Advertisement type, `"peripheral"` for a connectable peripheral.
    pub kind: String,
    pub service_uuids: Vec<String>,
    /// Data elements the host stack should include on our behalf.
    pub includes: Vec<String>,
}

// ----------------------------------------------------------------------------
// Bus Contract
// ----------------------------------------------------------------------------

/// Async contract to the host Bluetooth stack's bus API.
///
/// All errors crossing this boundary are already classified ([`BusError`]);
/// implementations must not surface raw transport errors.
#[async_trait]
pub trait BluezBus: Send + Sync {
    /// Acquire our well-known name on the bus.
    async fn acquire_name(&self, name: &str) -> BusResult<()>;

    /// Release the well-known name. Teardown path, best effort.
    async fn release_name(&self, name: &str) -> BusResult<()>;

    /// Create the object-manager client scoped to the host stack.
    async fn connect_object_manager(&self) -> BusResult<()>;

    /// Enumerate every object the host stack exposes.
    async fn managed_objects(&self) -> BusResult<ManagedObjects>;

    /// Read one Adapter1 property.
    async fn adapter_property(&self, adapter_path: &str, name: &str) -> BusResult<PropValue>;

    /// Write one Adapter1 property.
    async fn set_adapter_property(
        &self,
        adapter_path: &str,
        name: &str,
        value: PropValue,
    ) -> BusResult<()>;

    /// Export the advertisement object at `path`. Fails with AlreadyExists
    /// when an object is already exported there.
    async fn export_advertisement(&self, path: &str, props: AdvertisementProps) -> BusResult<()>;

    /// Remove the advertisement object. Returns whether anything was
    /// exported. Idempotent.
    async fn unexport_advertisement(&self, path: &str) -> BusResult<bool>;

    /// Ask the host stack's advertising manager to start broadcasting the
    /// advertisement exported at `advertisement_path`. Implementations give
    /// this call an extended timeout; registration is observed to be slower
    /// than generic calls.
    async fn register_advertisement(
        &self,
        adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()>;

    /// Stop broadcasting the advertisement.
    async fn unregister_advertisement(
        &self,
        adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()>;

    /// Export one node of the GATT application tree. AlreadyExists when the
    /// (path, interface) pair is already exported.
    async fn export_gatt_object(
        &self,
        app: Arc<GattApplication>,
        path: &str,
        kind: GattObjectKind,
    ) -> BusResult<()>;

    /// Remove one exported GATT node. Idempotent.
    async fn unexport_gatt_object(&self, path: &str, kind: GattObjectKind) -> BusResult<bool>;

    /// Emit a value-change notification for an exported characteristic so
    /// subscribed clients see the new value.
    async fn notify_characteristic_value(&self, path: &str, value: Vec<u8>) -> BusResult<()>;

    /// Register the application root with the host stack's GATT manager.
    async fn register_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()>;

    /// Unregister the application root. Teardown path, best effort.
    async fn unregister_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()>;

    /// Subscribe the four signal classes (properties-changed,
    /// interfaces-added, interfaces-removed, and name-owner-changed scoped
    /// to the host stack's well-known name), delivering them to `tx`. The
    /// returned guard unsubscribes on drop.
    async fn subscribe_signals(&self, tx: BusSignalSender) -> BusResult<SignalSubscription>;
}

/// Shared handle to a bus implementation.
pub type SharedBus = Arc<dyn BluezBus>;

/// Factory used by the initialization state machine to acquire a bus
/// connection: the one dependency injected from the outside, so tests can
/// substitute the mock and production code the zbus backend.
pub type BusConnector = Arc<
    dyn Fn(BusSignalSender) -> futures::future::BoxFuture<'static, BusResult<SharedBus>>
        + Send
        + Sync,
>;

/// Convenience for building a [`BusConnector`] from an async closure.
pub fn connector<F, Fut>(connect: F) -> BusConnector
where
    F: Fn(BusSignalSender) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = BusResult<SharedBus>> + Send + 'static,
{
    Arc::new(move |tx| Box::pin(connect(tx)))
}

/// Classify a failure from [`tokio::time::timeout`] wrapping a bus call.
pub fn call_timed_out(operation: &str) -> BusError {
    BusError::timeout(format!("{operation} timed out"))
}
