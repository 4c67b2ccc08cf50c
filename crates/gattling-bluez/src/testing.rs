//! In-memory mock of the host-stack bus
//!
//! Drives the same orchestration code paths as the zbus backend, with
//! scripted failures, call counters, an exported-object ledger and signal
//! injection. Used by the unit tests here and available to embedders through
//! the `testing` feature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gattling_core::{BusError, BusResult, ErrorKind};

use crate::bus::{
    connector, AdvertisementProps, BluezBus, BusConnector, BusSignal, BusSignalSender,
    InterfaceProps, ManagedObjects, PropValue, SharedBus, SignalSubscription, ADAPTER_IFACE,
    ADVERTISING_MANAGER_IFACE, GATT_MANAGER_IFACE,
};
use crate::gatt::{GattApplication, GattObjectKind};

// ----------------------------------------------------------------------------
// Mock Bus
// ----------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    adapters: HashMap<String, InterfaceProps>,
    owned_names: HashSet<String>,
    object_manager_connected: bool,
    exported_advertisements: HashMap<String, AdvertisementProps>,
    registered_advertisements: HashSet<String>,
    exported_gatt: HashSet<(String, GattObjectKind)>,
    registered_applications: HashSet<(String, String)>,
    notifications: Vec<(String, Vec<u8>)>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<ErrorKind>>,
    signal_tx: Option<BusSignalSender>,
}

/// Scriptable in-memory [`BluezBus`] implementation.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockState>,
    active_subscriptions: Arc<AtomicUsize>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock with one adapter, powered and ready.
    pub fn with_powered_adapter(path: &str) -> Self {
        let bus = Self::new();
        bus.add_adapter(path, true);
        bus
    }

    /// Add an adapter object with standard Adapter1 properties.
    pub fn add_adapter(&self, path: &str, powered: bool) {
        let mut props = InterfaceProps::new();
        props.insert("Address".into(), PropValue::Str("00:11:22:33:44:55".into()));
        props.insert("Name".into(), PropValue::Str("mock-adapter".into()));
        props.insert("Alias".into(), PropValue::Str("mock-adapter".into()));
        props.insert("Powered".into(), PropValue::Bool(powered));
        props.insert("Discoverable".into(), PropValue::Bool(false));
        props.insert("Pairable".into(), PropValue::Bool(false));
        props.insert("Discovering".into(), PropValue::Bool(false));
        props.insert("UUIDs".into(), PropValue::List(Vec::new()));
        self.lock().adapters.insert(path.to_string(), props);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock bus mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Fail the next call of `operation` with the given kind. Operations:
    /// `connect`, `acquire_name`, `connect_object_manager`,
    /// `managed_objects`, `get_property`, `set_property`,
    /// `export_advertisement`, `register_advertisement`,
    /// `unregister_advertisement`, `export_gatt_object`,
    /// `register_application`, `notify`.
    pub fn fail_next(&self, operation: &'static str, kind: ErrorKind) {
        self.fail_times(operation, kind, 1);
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail_times(&self, operation: &'static str, kind: ErrorKind, times: usize) {
        let mut state = self.lock();
        let queue = state.failures.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(kind);
        }
    }

    pub fn fail_next_register_advertisement(&self, kind: ErrorKind) {
        self.fail_next("register_advertisement", kind);
    }

    fn take_failure(&self, operation: &'static str) -> Option<BusError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .map(|kind| BusError::new(kind, format!("scripted {operation} failure")))
    }

    pub(crate) fn take_connect_failure(&self) -> Option<BusError> {
        self.take_failure("connect")
    }

    pub(crate) fn install_signal_sender(&self, tx: BusSignalSender) {
        self.lock().signal_tx = Some(tx);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self, operation: &'static str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn export_advertisement_calls(&self) -> usize {
        self.calls("export_advertisement")
    }

    pub fn unexport_advertisement_calls(&self) -> usize {
        self.calls("unexport_advertisement")
    }

    pub fn register_advertisement_calls(&self) -> usize {
        self.calls("register_advertisement")
    }

    pub fn unregister_advertisement_calls(&self) -> usize {
        self.calls("unregister_advertisement")
    }

    pub fn is_advertisement_registered(&self, path: &str) -> bool {
        self.lock().registered_advertisements.contains(path)
    }

    pub fn exported_advertisement(&self, path: &str) -> Option<AdvertisementProps> {
        self.lock().exported_advertisements.get(path).cloned()
    }

    pub fn exported_gatt_objects(&self) -> Vec<(String, GattObjectKind)> {
        let mut objects: Vec<_> = self.lock().exported_gatt.iter().cloned().collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects
    }

    pub fn is_application_registered(&self) -> bool {
        !self.lock().registered_applications.is_empty()
    }

    pub fn owns_name(&self, name: &str) -> bool {
        self.lock().owned_names.contains(name)
    }

    pub fn notifications(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().notifications.clone()
    }

    /// Number of currently live signal subscriptions (signal classes).
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    /// Flip an adapter property from the outside, as the stack would.
    pub fn set_adapter_state(&self, path: &str, name: &str, value: PropValue) {
        if let Some(props) = self.lock().adapters.get_mut(path) {
            props.insert(name.to_string(), value);
        }
    }

    /// Inject a bus signal into the worker, if anyone is subscribed.
    pub fn emit(&self, signal: BusSignal) {
        if let Some(tx) = self.lock().signal_tx.as_ref() {
            let _ = tx.send(signal);
        }
    }
}

// ----------------------------------------------------------------------------
// BluezBus Implementation
// ----------------------------------------------------------------------------

#[async_trait]
impl BluezBus for MockBus {
    async fn acquire_name(&self, name: &str) -> BusResult<()> {
        if let Some(err) = self.take_failure("acquire_name") {
            return Err(err);
        }
        self.lock().owned_names.insert(name.to_string());
        Ok(())
    }

    async fn release_name(&self, name: &str) -> BusResult<()> {
        self.lock().owned_names.remove(name);
        Ok(())
    }

    async fn connect_object_manager(&self) -> BusResult<()> {
        if let Some(err) = self.take_failure("connect_object_manager") {
            return Err(err);
        }
        self.lock().object_manager_connected = true;
        Ok(())
    }

    async fn managed_objects(&self) -> BusResult<ManagedObjects> {
        if let Some(err) = self.take_failure("managed_objects") {
            return Err(err);
        }

        let state = self.lock();
        let mut objects = ManagedObjects::new();
        for (path, props) in &state.adapters {
            let mut interfaces = HashMap::new();
            interfaces.insert(ADAPTER_IFACE.to_string(), props.clone());
            interfaces.insert(GATT_MANAGER_IFACE.to_string(), InterfaceProps::new());
            interfaces.insert(ADVERTISING_MANAGER_IFACE.to_string(), InterfaceProps::new());
            objects.insert(path.clone(), interfaces);
        }
        Ok(objects)
    }

    async fn adapter_property(&self, adapter_path: &str, name: &str) -> BusResult<PropValue> {
        if let Some(err) = self.take_failure("get_property") {
            return Err(err);
        }
        self.lock()
            .adapters
            .get(adapter_path)
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| BusError::not_found(format!("property {name} on {adapter_path}")))
    }

    async fn set_adapter_property(
        &self,
        adapter_path: &str,
        name: &str,
        value: PropValue,
    ) -> BusResult<()> {
        if let Some(err) = self.take_failure("set_property") {
            return Err(err);
        }
        let mut state = self.lock();
        let props = state
            .adapters
            .get_mut(adapter_path)
            .ok_or_else(|| BusError::not_found(format!("adapter {adapter_path}")))?;
        props.insert(name.to_string(), value);
        Ok(())
    }

    async fn export_advertisement(&self, path: &str, props: AdvertisementProps) -> BusResult<()> {
        if let Some(err) = self.take_failure("export_advertisement") {
            return Err(err);
        }
        let mut state = self.lock();
        if state.exported_advertisements.contains_key(path) {
            return Err(BusError::new(
                ErrorKind::AlreadyExists,
                format!("object already exported at {path}"),
            ));
        }
        state.exported_advertisements.insert(path.to_string(), props);
        Ok(())
    }

    async fn unexport_advertisement(&self, path: &str) -> BusResult<bool> {
        let mut state = self.lock();
        *state.calls.entry("unexport_advertisement").or_insert(0) += 1;
        state.registered_advertisements.remove(path);
        Ok(state.exported_advertisements.remove(path).is_some())
    }

    async fn register_advertisement(
        &self,
        _adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()> {
        if let Some(err) = self.take_failure("register_advertisement") {
            return Err(err);
        }
        let mut state = self.lock();
        if !state.exported_advertisements.contains_key(advertisement_path) {
            return Err(BusError::not_found(format!(
                "no advertisement exported at {advertisement_path}"
            )));
        }
        state
            .registered_advertisements
            .insert(advertisement_path.to_string());
        Ok(())
    }

    async fn unregister_advertisement(
        &self,
        _adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()> {
        if let Some(err) = self.take_failure("unregister_advertisement") {
            return Err(err);
        }
        self.lock()
            .registered_advertisements
            .remove(advertisement_path);
        Ok(())
    }

    async fn export_gatt_object(
        &self,
        _app: Arc<GattApplication>,
        path: &str,
        kind: GattObjectKind,
    ) -> BusResult<()> {
        if let Some(err) = self.take_failure("export_gatt_object") {
            return Err(err);
        }
        let mut state = self.lock();
        if !state.exported_gatt.insert((path.to_string(), kind)) {
            return Err(BusError::new(
                ErrorKind::AlreadyExists,
                format!("object already exported at {path}"),
            ));
        }
        Ok(())
    }

    async fn unexport_gatt_object(&self, path: &str, kind: GattObjectKind) -> BusResult<bool> {
        Ok(self.lock().exported_gatt.remove(&(path.to_string(), kind)))
    }

    async fn notify_characteristic_value(&self, path: &str, value: Vec<u8>) -> BusResult<()> {
        if let Some(err) = self.take_failure("notify") {
            return Err(err);
        }
        self.lock().notifications.push((path.to_string(), value));
        Ok(())
    }

    async fn register_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()> {
        if let Some(err) = self.take_failure("register_application") {
            return Err(err);
        }
        self.lock()
            .registered_applications
            .insert((gatt_manager_path.to_string(), root.to_string()));
        Ok(())
    }

    async fn unregister_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()> {
        self.lock()
            .registered_applications
            .remove(&(gatt_manager_path.to_string(), root.to_string()));
        Ok(())
    }

    async fn subscribe_signals(&self, tx: BusSignalSender) -> BusResult<SignalSubscription> {
        // Four signal classes, mirroring the production subscription set.
        const SIGNAL_CLASSES: usize = 4;

        self.install_signal_sender(tx);
        self.active_subscriptions
            .fetch_add(SIGNAL_CLASSES, Ordering::SeqCst);

        let active = Arc::clone(&self.active_subscriptions);
        Ok(SignalSubscription::new(
            SIGNAL_CLASSES,
            Vec::new(),
            Some(Box::new(move || {
                active.fetch_sub(SIGNAL_CLASSES, Ordering::SeqCst);
            })),
        ))
    }
}

/// Bus connector that hands out the given mock, wiring the worker's signal
/// channel into it. Script `fail_next("connect", ...)` to simulate an
/// unobtainable bus.
pub fn mock_connector(bus: Arc<MockBus>) -> BusConnector {
    connector(move |tx| {
        let bus = Arc::clone(&bus);
        async move {
            if let Some(err) = bus.take_connect_failure() {
                return Err(err);
            }
            bus.install_signal_sender(tx);
            Ok(bus as SharedBus)
        }
    })
}
