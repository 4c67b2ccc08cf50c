//! Adapter management
//!
//! Discovers the host's Bluetooth radios, selects and configures one, owns
//! the advertisement and its retry machinery, tracks connected remote
//! devices through bus signals, and self-heals when the host stack drops off
//! the bus. One instance per server, constructed by the lifecycle and
//! mutated exclusively on the worker task; only the connection counter is
//! shared across threads.
//!
//! Timers are deadline records owned by this struct and polled by the
//! worker loop, so cancelling a retry is simply dropping its record: a
//! cancelled timer cannot fire into freed state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gattling_core::{AdapterInfo, BluezCapabilities, BusError, BusResult, DeviceInfo, RetryPolicy};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::advertisement::Advertisement;
use crate::bus::{
    BusSignal, BusSignalSender, InterfaceProps, ManagedObjects, PropValue, SharedBus,
    SignalSubscription, ADAPTER_IFACE, ADVERTISING_MANAGER_IFACE, BLUEZ_SERVICE, DEVICE_IFACE,
    GATT_MANAGER_IFACE,
};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Adapter1 properties the host stack exposes read-only; setting them is
/// rejected up front instead of bouncing off the stack.
const READONLY_PROPERTIES: &[&str] = &[
    "Address",
    "AddressType",
    "Name",
    "Class",
    "UUIDs",
    "Modalias",
    "Roles",
    "ExperimentalFeatures",
];

const RECONNECT_FIRST_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_SECOND_DELAY: Duration = Duration::from_secs(15);

/// Callback invoked when a remote device connects or disconnects.
pub type ConnectionCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// Completion callback for asynchronous advertising changes. Fires exactly
/// once: on final success, retry exhaustion, or a non-retryable failure.
pub type AdvertisingCallback = Box<dyn FnOnce(BusResult<()>) + Send>;

// ----------------------------------------------------------------------------
// Retry / Recovery State
// ----------------------------------------------------------------------------

struct AdvertisingRetryState {
    attempt: u32,
    policy: RetryPolicy,
    next_at: Instant,
    callback: Option<AdvertisingCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectStage {
    /// Full shutdown + initialize, re-establishing advertising if it existed.
    FullRestart,
    /// Second-chance initialize after the first restart failed.
    RetryInitialize,
}

struct ReconnectState {
    at: Instant,
    stage: ReconnectStage,
}

// ----------------------------------------------------------------------------
// Adapter Manager
// ----------------------------------------------------------------------------

/// Coordinator for adapter discovery, configuration, advertising and
/// connection tracking.
pub struct AdapterManager {
    initialized: bool,
    bus: Option<SharedBus>,
    adapter_path: String,
    advertisement_path: String,
    available_adapters: Vec<AdapterInfo>,
    capabilities: BluezCapabilities,
    supported_interfaces: HashMap<String, bool>,
    connected_devices: HashMap<String, DeviceInfo>,
    active_connections: Arc<AtomicUsize>,
    signal_subscription: Option<SignalSubscription>,
    signal_tx: BusSignalSender,
    advertisement: Option<Advertisement>,
    advertising_retry: Option<AdvertisingRetryState>,
    reconnect: Option<ReconnectState>,
    retry_policy: RetryPolicy,
    advertising_retry_policy: RetryPolicy,
    preferred_adapter: Option<String>,
    connection_callback: Option<ConnectionCallback>,
}

impl AdapterManager {
    /// `connections` is the cross-thread connection counter, created by the
    /// lifecycle so its handle can read it without reaching into the worker.
    pub fn new(
        advertisement_path: String,
        retry_policy: RetryPolicy,
        advertising_retry_policy: RetryPolicy,
        preferred_adapter: Option<String>,
        signal_tx: BusSignalSender,
        connection_callback: Option<ConnectionCallback>,
        connections: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            initialized: false,
            bus: None,
            adapter_path: String::new(),
            advertisement_path,
            available_adapters: Vec::new(),
            capabilities: BluezCapabilities::default(),
            supported_interfaces: HashMap::new(),
            connected_devices: HashMap::new(),
            active_connections: connections,
            signal_subscription: None,
            signal_tx,
            advertisement: None,
            advertising_retry: None,
            reconnect: None,
            retry_policy,
            advertising_retry_policy,
            preferred_adapter,
            connection_callback,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn adapter_path(&self) -> &str {
        &self.adapter_path
    }

    pub fn capabilities(&self) -> &BluezCapabilities {
        &self.capabilities
    }

    pub fn has_capability(&self, interface: &str) -> bool {
        self.supported_interfaces
            .get(interface)
            .copied()
            .unwrap_or(false)
    }

    /// Lock-free connection count handle for cross-thread reads.
    pub fn connection_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connections)
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertisement
            .as_ref()
            .is_some_and(Advertisement::is_registered)
    }

    pub fn adapter_info(&self) -> BusResult<AdapterInfo> {
        self.available_adapters
            .iter()
            .find(|adapter| adapter.path == self.adapter_path)
            .cloned()
            .ok_or_else(|| BusError::not_found("current adapter not found"))
    }

    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        self.connected_devices.values().cloned().collect()
    }

    fn ready_bus(&self) -> BusResult<SharedBus> {
        if !self.initialized || self.adapter_path.is_empty() {
            return Err(BusError::not_ready("adapter manager not initialized"));
        }
        self.bus
            .clone()
            .ok_or_else(|| BusError::not_ready("no bus connection"))
    }

    // ------------------------------------------------------------------
    // Initialization / Shutdown
    // ------------------------------------------------------------------

    /// Discover radios, select one and arm signal tracking. Calling again
    /// without an intervening [`shutdown`](Self::shutdown) is a no-op
    /// success and does not duplicate signal subscriptions.
    pub async fn initialize(&mut self, bus: &SharedBus) -> BusResult<()> {
        if self.initialized {
            debug!("adapter manager already initialized");
            return Ok(());
        }

        let objects = bus.managed_objects().await?;
        let adapters = adapters_from_objects(&objects);
        if adapters.is_empty() {
            return Err(BusError::not_found("no Bluetooth adapters available"));
        }
        for adapter in &adapters {
            debug!(path = %adapter.path, address = %adapter.address, powered = adapter.powered, "found adapter");
        }

        let selected = select_adapter(&adapters, self.preferred_adapter.as_deref());
        info!(path = %selected, "selected adapter");

        let subscription = bus.subscribe_signals(self.signal_tx.clone()).await?;

        self.capabilities = detect_capabilities(&objects, &selected);
        self.supported_interfaces.insert(
            ADVERTISING_MANAGER_IFACE.to_string(),
            self.capabilities.has_advertising_manager,
        );
        self.supported_interfaces.insert(
            GATT_MANAGER_IFACE.to_string(),
            self.capabilities.has_gatt_manager,
        );
        info!(
            advertising = self.capabilities.has_advertising_manager,
            gatt = self.capabilities.has_gatt_manager,
            "host stack capabilities detected"
        );

        self.available_adapters = adapters;
        self.adapter_path = selected;
        self.signal_subscription = Some(subscription);
        self.bus = Some(Arc::clone(bus));
        self.initialized = true;
        Ok(())
    }

    /// Tear down tracking state. Idempotent. Every pending retry or
    /// reconnect record is dropped here, before the bus handle goes away.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }

        self.signal_subscription = None;
        if self.advertising_retry.take().is_some() {
            debug!("pending advertising retry cancelled by shutdown");
        }
        self.reconnect = None;
        // The advertisement object survives (the bus export is ours, not the
        // host stack's) but any registration with the stack is void now.
        if let Some(advertisement) = self.advertisement.as_mut() {
            advertisement.handle_release();
        }
        self.available_adapters.clear();
        self.connected_devices.clear();
        self.supported_interfaces.clear();
        self.active_connections.store(0, Ordering::Release);
        self.adapter_path.clear();
        self.bus = None;
        self.initialized = false;
        debug!("adapter manager shutdown complete");
    }

    /// Final teardown of the advertisement object: unregister with the host
    /// stack (best effort) and remove it from the bus. Called on the worker
    /// stop path before the connection handle is released.
    pub async fn teardown_advertisement(&mut self, bus: &SharedBus) {
        if let Some(mut advertisement) = self.advertisement.take() {
            let _ = advertisement
                .unregister(bus.as_ref(), &self.adapter_path)
                .await;
            advertisement.unexport(bus.as_ref()).await;
        }
    }

    /// Fresh adapter snapshot, independent of the cached discovery.
    pub async fn discover_adapters(&self, bus: &SharedBus) -> BusResult<Vec<AdapterInfo>> {
        let objects = bus.managed_objects().await?;
        let adapters = adapters_from_objects(&objects);
        if adapters.is_empty() {
            return Err(BusError::not_found("no Bluetooth adapters available"));
        }
        Ok(adapters)
    }

    // ------------------------------------------------------------------
    // Adapter Configuration
    // ------------------------------------------------------------------

    async fn set_adapter_property(&self, name: &str, value: PropValue) -> BusResult<()> {
        let bus = self.ready_bus()?;

        if READONLY_PROPERTIES.contains(&name) {
            return Err(BusError::not_supported(format!(
                "property '{name}' is read-only"
            )));
        }

        let path = self.adapter_path.clone();
        retry_operation(&self.retry_policy, || {
            let bus = Arc::clone(&bus);
            let path = path.clone();
            let value = value.clone();
            let name = name.to_string();
            async move { bus.set_adapter_property(&path, &name, value).await }
        })
        .await
    }

    pub async fn set_powered(&self, enabled: bool) -> BusResult<()> {
        self.set_adapter_property("Powered", PropValue::Bool(enabled)).await
    }

    /// Make the adapter discoverable. A nonzero `timeout` (seconds) bounds
    /// how long discoverability stays on.
    pub async fn set_discoverable(&self, enabled: bool, timeout: u16) -> BusResult<()> {
        self.set_adapter_property("Discoverable", PropValue::Bool(enabled))
            .await?;

        if enabled && timeout > 0 {
            return self
                .set_adapter_property("DiscoverableTimeout", PropValue::U32(timeout as u32))
                .await;
        }
        Ok(())
    }

    /// Connectable state is managed by the host stack through the
    /// advertisement type for LE peripherals; this surface is a deliberate
    /// no-op.
    pub async fn set_connectable(&self, _enabled: bool) -> BusResult<()> {
        Err(BusError::not_supported(
            "Connectable is managed through the advertisement type on LE adapters",
        ))
    }

    pub async fn set_bondable(&self, enabled: bool) -> BusResult<()> {
        self.set_adapter_property("Pairable", PropValue::Bool(enabled)).await
    }

    /// Set the adapter alias, the name clients see. The short name has no
    /// adapter property; the host stack derives it when the full name does
    /// not fit the advertising payload.
    pub async fn set_name(&self, name: &str, short_name: &str) -> BusResult<()> {
        if !short_name.is_empty() {
            debug!(short_name, "short name noted; host stack truncates automatically");
        }
        self.set_adapter_property("Alias", PropValue::Str(name.to_string()))
            .await
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    /// Turn advertising on or off. The callback fires exactly once with the
    /// final outcome; transient registration failures are retried in the
    /// background under the advertising retry policy.
    pub async fn set_advertising_async(&mut self, enabled: bool, callback: AdvertisingCallback) {
        let bus = match self.ready_bus() {
            Ok(bus) => bus,
            Err(err) => {
                callback(Err(err));
                return;
            }
        };

        // A newer request supersedes any retry in flight; the stale retry's
        // callback is dropped unfired.
        if self.advertising_retry.take().is_some() {
            warn!("cancelling outstanding advertising retry");
        }

        if enabled {
            self.enable_advertising(bus, callback).await;
        } else {
            self.disable_advertising(bus, callback).await;
        }
    }

    async fn enable_advertising(&mut self, bus: SharedBus, callback: AdvertisingCallback) {
        let powered = match bus.adapter_property(&self.adapter_path, "Powered").await {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(_) => false,
        };
        if !powered {
            if let Err(err) = self.set_powered(true).await {
                warn!(error = %err, "adapter not powered and power-on failed");
                callback(Err(BusError::not_ready(
                    "adapter not powered and cannot be powered on",
                )));
                return;
            }
        }

        let advertisement_path = self.advertisement_path.clone();
        let advertisement = self
            .advertisement
            .get_or_insert_with(|| Advertisement::with_defaults(advertisement_path));

        match advertisement.register(bus.as_ref(), &self.adapter_path).await {
            Ok(()) => {
                info!("advertising started");
                callback(Ok(()));
            }
            Err(err) if is_advertising_retryable(&err) => {
                let policy = self.advertising_retry_policy;
                let delay = policy.delay(1);
                info!(error = %err, delay_ms = delay.as_millis() as u64, attempt = 1, max = policy.max_attempts, "advertising registration failed, scheduling retry");
                self.advertising_retry = Some(AdvertisingRetryState {
                    attempt: 1,
                    policy,
                    next_at: Instant::now() + delay,
                    callback: Some(callback),
                });
            }
            Err(err) => callback(Err(err)),
        }
    }

    async fn disable_advertising(&mut self, bus: SharedBus, callback: AdvertisingCallback) {
        match self.advertisement.as_mut() {
            Some(advertisement) if advertisement.is_registered() => {
                let result = advertisement.unregister(bus.as_ref(), &self.adapter_path).await;
                callback(result);
            }
            _ => {
                debug!("advertising already stopped");
                callback(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Deadline-Driven Work
    // ------------------------------------------------------------------

    /// Earliest pending deadline (advertising retry or reconnect), for the
    /// worker's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry_at = self.advertising_retry.as_ref().map(|r| r.next_at);
        let reconnect_at = self.reconnect.as_ref().map(|r| r.at);
        match (retry_at, reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Run any deadline that has come due.
    pub async fn poll(&mut self) {
        let now = Instant::now();

        if self
            .advertising_retry
            .as_ref()
            .is_some_and(|retry| retry.next_at <= now)
        {
            self.poll_advertising_retry().await;
        }

        if self.reconnect.as_ref().is_some_and(|r| r.at <= now) {
            self.poll_reconnect().await;
        }
    }

    async fn poll_advertising_retry(&mut self) {
        let bus = match self.ready_bus() {
            Ok(bus) => bus,
            Err(err) => {
                if let Some(mut retry) = self.advertising_retry.take() {
                    if let Some(callback) = retry.callback.take() {
                        callback(Err(err));
                    }
                }
                return;
            }
        };

        let adapter_path = self.adapter_path.clone();
        let advertisement_path = self.advertisement_path.clone();
        let advertisement = self
            .advertisement
            .get_or_insert_with(|| Advertisement::with_defaults(advertisement_path));

        let result = advertisement.register(bus.as_ref(), &adapter_path).await;

        // Decide with a scoped borrow, then complete outside it.
        let outcome = {
            let Some(retry) = self.advertising_retry.as_mut() else {
                return;
            };
            match result {
                Ok(()) => {
                    info!(attempts = retry.attempt + 1, "advertising registered after retry");
                    Some(Ok(()))
                }
                Err(err)
                    if retry.attempt < retry.policy.max_attempts
                        && is_advertising_retryable(&err) =>
                {
                    retry.attempt += 1;
                    let delay = retry.policy.delay(retry.attempt);
                    warn!(error = %err, attempt = retry.attempt, max = retry.policy.max_attempts, delay_ms = delay.as_millis() as u64, "advertising retry failed, scheduling next attempt");
                    retry.next_at = Instant::now() + delay;
                    None
                }
                Err(err) => {
                    warn!(error = %err, "advertising retries exhausted");
                    Some(Err(err))
                }
            }
        };

        if let Some(final_result) = outcome {
            if let Some(mut finished) = self.advertising_retry.take() {
                if let Some(callback) = finished.callback.take() {
                    callback(final_result);
                }
            }
        }
    }

    async fn poll_reconnect(&mut self) {
        let Some(state) = self.reconnect.take() else {
            return;
        };

        match state.stage {
            ReconnectStage::FullRestart => {
                info!("host stack returned check: cleaning up stale state before reconnection");
                let was_advertising = self.advertisement.is_some();
                let bus = self.bus.clone();
                self.shutdown();

                let Some(bus) = bus else { return };
                match self.initialize(&bus).await {
                    Ok(()) => {
                        info!("host stack reconnection successful");
                        if was_advertising {
                            self.set_advertising_async(
                                true,
                                Box::new(|result| match result {
                                    Ok(()) => info!("advertising re-registered after host stack restart"),
                                    Err(err) => warn!(error = %err, "failed to re-register advertising"),
                                }),
                            )
                            .await;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "host stack reconnection failed, scheduling delayed retry");
                        self.bus = Some(bus);
                        self.reconnect = Some(ReconnectState {
                            at: Instant::now() + RECONNECT_SECOND_DELAY,
                            stage: ReconnectStage::RetryInitialize,
                        });
                    }
                }
            }
            ReconnectStage::RetryInitialize => {
                let Some(bus) = self.bus.clone() else { return };
                match self.initialize(&bus).await {
                    Ok(()) => info!("delayed host stack reconnection successful"),
                    Err(err) => warn!(error = %err, "delayed host stack reconnection failed"),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Signal Handling
    // ------------------------------------------------------------------

    pub fn handle_signal(&mut self, signal: &BusSignal) {
        match signal {
            BusSignal::PropertiesChanged {
                object_path,
                interface,
                changed,
            } if interface == DEVICE_IFACE => {
                if let Some(connected) = changed.get("Connected").and_then(PropValue::as_bool) {
                    if connected {
                        self.handle_device_connected(object_path, changed);
                    } else {
                        self.handle_device_disconnected(object_path);
                    }
                }
            }
            BusSignal::InterfacesAdded {
                object_path,
                interfaces,
            } => {
                if let Some(props) = interfaces.get(DEVICE_IFACE) {
                    if props.get("Connected").and_then(PropValue::as_bool) == Some(true) {
                        self.handle_device_connected(object_path, props);
                    }
                }
            }
            BusSignal::InterfacesRemoved {
                object_path,
                interfaces,
            } => {
                if interfaces.iter().any(|iface| iface == DEVICE_IFACE) {
                    if self
                        .connected_devices
                        .get(object_path)
                        .is_some_and(|device| device.connected)
                    {
                        self.handle_device_disconnected(object_path);
                    }
                    self.connected_devices.remove(object_path);
                }
            }
            BusSignal::NameOwnerChanged {
                name, new_owner, ..
            } if name == BLUEZ_SERVICE => {
                if new_owner.is_empty() {
                    warn!("host stack disappeared from the bus, scheduling reconnection");
                    self.reconnect = Some(ReconnectState {
                        at: Instant::now() + RECONNECT_FIRST_DELAY,
                        stage: ReconnectStage::FullRestart,
                    });
                } else {
                    info!("host stack service available");
                }
            }
            BusSignal::AdvertisementReleased { object_path } => {
                if let Some(advertisement) = self.advertisement.as_mut() {
                    if advertisement.object_path() == object_path {
                        advertisement.handle_release();
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_device_connected(&mut self, device_path: &str, props: &InterfaceProps) {
        if self
            .connected_devices
            .get(device_path)
            .is_some_and(|device| device.connected)
        {
            return;
        }

        let device = self
            .connected_devices
            .entry(device_path.to_string())
            .or_insert_with(|| DeviceInfo {
                path: device_path.to_string(),
                ..DeviceInfo::default()
            });
        device.connected = true;
        if let Some(address) = props.get("Address").and_then(PropValue::as_str) {
            device.address = address.to_string();
        }
        if let Some(rssi) = props.get("RSSI").and_then(PropValue::as_i16) {
            device.rssi = rssi;
        }

        let total = self.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(device = device_path, total, "device connected");

        if let Some(callback) = &self.connection_callback {
            callback(true, device_path);
        }
    }

    fn handle_device_disconnected(&mut self, device_path: &str) {
        let Some(device) = self.connected_devices.get_mut(device_path) else {
            return;
        };
        if !device.connected {
            return;
        }
        device.connected = false;

        let total = self
            .active_connections
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        debug!(device = device_path, total, "device disconnected");

        if let Some(callback) = &self.connection_callback {
            callback(false, device_path);
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Generic retry wrapper: attempt the operation, backing off between
/// attempts while the failure stays retryable and the policy allows.
pub async fn retry_operation<F, Fut>(policy: &RetryPolicy, mut operation: F) -> BusResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BusResult<()>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                debug!(error = %err, attempt, max = policy.max_attempts, delay_ms = delay.as_millis() as u64, "operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retryability test for the advertising path. The Timeout/Failed arms are
/// already covered by the shared predicate; they stay spelled out because
/// the advertising manager retries them even if the shared policy ever
/// tightens.
fn is_advertising_retryable(err: &BusError) -> bool {
    err.is_retryable()
        || matches!(
            err.kind,
            gattling_core::ErrorKind::Timeout | gattling_core::ErrorKind::Failed
        )
}

fn prop_bool(props: &InterfaceProps, name: &str) -> bool {
    props.get(name).and_then(PropValue::as_bool).unwrap_or(false)
}

fn prop_string(props: &InterfaceProps, name: &str) -> String {
    props
        .get(name)
        .and_then(PropValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn adapters_from_objects(objects: &ManagedObjects) -> Vec<AdapterInfo> {
    let mut adapters: Vec<AdapterInfo> = objects
        .iter()
        .filter_map(|(path, interfaces)| {
            let props = interfaces.get(ADAPTER_IFACE)?;
            Some(AdapterInfo {
                path: path.clone(),
                address: prop_string(props, "Address"),
                name: prop_string(props, "Name"),
                alias: prop_string(props, "Alias"),
                powered: prop_bool(props, "Powered"),
                discoverable: prop_bool(props, "Discoverable"),
                connectable: prop_bool(props, "Connectable"),
                pairable: prop_bool(props, "Pairable"),
                discovering: prop_bool(props, "Discovering"),
                uuids: props
                    .get("UUIDs")
                    .and_then(PropValue::as_list)
                    .map(<[String]>::to_vec)
                    .unwrap_or_default(),
            })
        })
        .collect();
    adapters.sort_by(|a, b| a.path.cmp(&b.path));
    adapters
}

/// Selection priority: hint match (exact path, exact address, or path
/// substring), else first powered, else first discovered.
fn select_adapter(adapters: &[AdapterInfo], preferred: Option<&str>) -> String {
    if let Some(hint) = preferred.filter(|hint| !hint.is_empty()) {
        if let Some(adapter) = adapters.iter().find(|adapter| {
            adapter.path == hint || adapter.address == hint || adapter.path.contains(hint)
        }) {
            return adapter.path.clone();
        }
        warn!(hint, "preferred adapter not found, using default selection");
    }

    adapters
        .iter()
        .find(|adapter| adapter.powered)
        .or_else(|| adapters.first())
        .map(|adapter| adapter.path.clone())
        .expect("selection requires a non-empty adapter list")
}

fn detect_capabilities(objects: &ManagedObjects, adapter_path: &str) -> BluezCapabilities {
    let interfaces = objects.get(adapter_path);
    BluezCapabilities {
        has_advertising_manager: interfaces
            .is_some_and(|ifaces| ifaces.contains_key(ADVERTISING_MANAGER_IFACE)),
        has_gatt_manager: interfaces.is_some_and(|ifaces| ifaces.contains_key(GATT_MANAGER_IFACE)),
        ..BluezCapabilities::default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;
    use gattling_core::ErrorKind;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    const ADAPTER: &str = "/org/bluez/hci0";
    const ADV_PATH: &str = "/com/gattling/advertisement0";

    fn manager() -> (AdapterManager, crate::bus::BusSignalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = AdapterManager::new(
            ADV_PATH.to_string(),
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            RetryPolicy::advertising(),
            None,
            tx,
            None,
            Arc::new(AtomicUsize::new(0)),
        );
        (manager, rx)
    }

    fn shared(bus: MockBus) -> (Arc<MockBus>, SharedBus) {
        let bus = Arc::new(bus);
        (Arc::clone(&bus), bus as SharedBus)
    }

    #[tokio::test]
    async fn initialize_twice_is_noop_and_keeps_four_subscriptions() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();

        manager.initialize(&bus).await.unwrap();
        assert!(manager.is_initialized());
        assert_eq!(manager.adapter_path(), ADAPTER);
        assert_eq!(mock.active_subscriptions(), 4);

        manager.initialize(&bus).await.unwrap();
        assert_eq!(mock.active_subscriptions(), 4);
    }

    #[tokio::test]
    async fn initialize_fails_not_found_without_adapters() {
        let (_mock, bus) = shared(MockBus::new());
        let (mut manager, _rx) = manager();

        let err = manager.initialize(&bus).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn shutdown_releases_subscriptions_and_is_idempotent() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();

        manager.initialize(&bus).await.unwrap();
        manager.shutdown();
        assert_eq!(mock.active_subscriptions(), 0);
        assert!(!manager.is_initialized());

        manager.shutdown();
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn prefers_hinted_then_powered_adapter() {
        let adapters = vec![
            AdapterInfo {
                path: "/org/bluez/hci0".into(),
                powered: false,
                ..AdapterInfo::default()
            },
            AdapterInfo {
                path: "/org/bluez/hci1".into(),
                address: "AA:BB:CC:DD:EE:FF".into(),
                powered: true,
                ..AdapterInfo::default()
            },
        ];

        assert_eq!(select_adapter(&adapters, Some("hci0")), "/org/bluez/hci0");
        assert_eq!(
            select_adapter(&adapters, Some("AA:BB:CC:DD:EE:FF")),
            "/org/bluez/hci1"
        );
        assert_eq!(select_adapter(&adapters, Some("nonsense")), "/org/bluez/hci1");
        assert_eq!(select_adapter(&adapters, None), "/org/bluez/hci1");
    }

    #[tokio::test]
    async fn rejects_readonly_properties() {
        let (_mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        let err = manager
            .set_adapter_property("Address", PropValue::Str("x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);

        let err = manager.set_connectable(true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn property_set_retries_transient_failures() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        mock.fail_times("set_property", ErrorKind::NotReady, 2);
        manager.set_bondable(true).await.unwrap();
        // Two scripted failures plus the success.
        assert_eq!(mock.calls("set_property"), 3);
    }

    #[tokio::test]
    async fn property_set_does_not_retry_nonretryable() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        mock.fail_next("set_property", ErrorKind::PermissionDenied);
        let err = manager.set_powered(true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(mock.calls("set_property"), 1);
    }

    #[tokio::test]
    async fn retry_parity_between_generic_and_advertising_paths() {
        // Both retry sites must agree on what is worth retrying.
        for kind in ErrorKind::ALL {
            let attempts = Arc::new(AtomicU32::new(0));
            let counted = Arc::clone(&attempts);
            let policy = RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
                backoff_multiplier: 1.0,
            };
            let _ = retry_operation(&policy, move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(BusError::new(kind, "scripted"))
                }
            })
            .await;

            let generic_retried = attempts.load(Ordering::SeqCst) > 1;
            let advertising_retried = is_advertising_retryable(&BusError::new(kind, "scripted"));
            assert_eq!(
                generic_retried, advertising_retried,
                "retry decision diverges for {kind:?}"
            );
            assert_eq!(generic_retried, kind.is_retryable());
        }
    }

    #[tokio::test]
    async fn disable_when_never_registered_succeeds_without_bus_call() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        manager
            .set_advertising_async(
                false,
                Box::new(move |result| {
                    done_tx.send(result).unwrap();
                }),
            )
            .await;

        done_rx.await.unwrap().unwrap();
        assert_eq!(mock.unregister_advertisement_calls(), 0);
    }

    #[tokio::test]
    async fn enable_advertising_powers_adapter_first() {
        let (mock, bus) = shared(MockBus::new());
        mock.add_adapter(ADAPTER, false);
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        manager
            .set_advertising_async(true, Box::new(move |result| {
                done_tx.send(result).unwrap();
            }))
            .await;

        done_rx.await.unwrap().unwrap();
        assert_eq!(
            mock.exported_advertisement(ADV_PATH).unwrap().includes,
            vec!["local-name".to_string()]
        );
        assert!(mock.is_advertisement_registered(ADV_PATH));
        assert!(manager.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn advertising_retry_succeeds_after_transient_timeouts() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        mock.fail_times("register_advertisement", ErrorKind::Timeout, 3);

        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .set_advertising_async(true, Box::new(move |result| {
                done_tx.send(result).unwrap();
            }))
            .await;

        // Three scheduled delays before the fourth attempt succeeds.
        let mut polls = 0;
        while let Some(deadline) = manager.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            manager.poll().await;
            polls += 1;
            assert!(polls < 10, "retry did not converge");
        }

        let result = done_rx.recv().await.unwrap();
        result.unwrap();
        assert!(done_rx.try_recv().is_err(), "callback fired more than once");
        assert_eq!(mock.register_advertisement_calls(), 4);
        assert!(polls >= 3);
        assert!(manager.is_advertising());
        assert!(manager.next_deadline().is_none(), "retry state lingered");
    }

    #[tokio::test(start_paused = true)]
    async fn advertising_retry_exhausts_with_single_callback() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        mock.fail_times("register_advertisement", ErrorKind::Timeout, 10);

        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        manager
            .set_advertising_async(true, Box::new(move |result| {
                done_tx.send(result).unwrap();
            }))
            .await;

        while let Some(deadline) = manager.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            manager.poll().await;
        }

        let result = done_rx.recv().await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert!(done_rx.try_recv().is_err());
        // Initial attempt plus the policy's retry budget.
        assert_eq!(
            mock.register_advertisement_calls() as u32,
            RetryPolicy::advertising().max_attempts + 1
        );
    }

    #[tokio::test]
    async fn nonretryable_advertising_failure_reports_immediately() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        mock.fail_next_register_advertisement(ErrorKind::NotSupported);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        manager
            .set_advertising_async(true, Box::new(move |result| {
                done_tx.send(result).unwrap();
            }))
            .await;

        assert_eq!(done_rx.await.unwrap().unwrap_err().kind, ErrorKind::NotSupported);
        assert!(manager.next_deadline().is_none());
    }

    #[tokio::test]
    async fn tracks_device_connections_via_signals() {
        let (_mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        let device = "/org/bluez/hci0/dev_AA_BB";
        let mut props = InterfaceProps::new();
        props.insert("Connected".into(), PropValue::Bool(true));
        manager.handle_signal(&BusSignal::PropertiesChanged {
            object_path: device.into(),
            interface: DEVICE_IFACE.into(),
            changed: props.clone(),
        });
        assert_eq!(manager.connection_count(), 1);

        // A duplicate connect signal does not double count.
        manager.handle_signal(&BusSignal::PropertiesChanged {
            object_path: device.into(),
            interface: DEVICE_IFACE.into(),
            changed: props,
        });
        assert_eq!(manager.connection_count(), 1);

        let mut props = InterfaceProps::new();
        props.insert("Connected".into(), PropValue::Bool(false));
        manager.handle_signal(&BusSignal::PropertiesChanged {
            object_path: device.into(),
            interface: DEVICE_IFACE.into(),
            changed: props,
        });
        assert_eq!(manager.connection_count(), 0);
        // Disconnected devices stay in the map until InterfacesRemoved.
        assert_eq!(manager.connected_devices().len(), 1);

        manager.handle_signal(&BusSignal::InterfacesRemoved {
            object_path: device.into(),
            interfaces: vec![DEVICE_IFACE.into()],
        });
        assert!(manager.connected_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn name_owner_loss_schedules_reconnect_and_restores_advertising() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        manager
            .set_advertising_async(true, Box::new(move |result| {
                done_tx.send(result).unwrap();
            }))
            .await;
        done_rx.await.unwrap().unwrap();

        manager.handle_signal(&BusSignal::NameOwnerChanged {
            name: BLUEZ_SERVICE.into(),
            old_owner: ":1.2".into(),
            new_owner: String::new(),
        });

        let deadline = manager.next_deadline().expect("reconnect scheduled");
        tokio::time::sleep_until(deadline).await;
        manager.poll().await;

        assert!(manager.is_initialized());
        // Advertising was re-registered after the restart.
        assert!(mock.is_advertisement_registered(ADV_PATH));
        assert_eq!(mock.active_subscriptions(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_schedules_second_attempt() {
        let (mock, bus) = shared(MockBus::with_powered_adapter(ADAPTER));
        let (mut manager, _rx) = manager();
        manager.initialize(&bus).await.unwrap();

        manager.handle_signal(&BusSignal::NameOwnerChanged {
            name: BLUEZ_SERVICE.into(),
            old_owner: ":1.2".into(),
            new_owner: String::new(),
        });

        mock.fail_next("managed_objects", ErrorKind::NotReady);
        let deadline = manager.next_deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        manager.poll().await;
        assert!(!manager.is_initialized());

        // Second, longer-delayed attempt succeeds.
        let deadline = manager.next_deadline().expect("second reconnect scheduled");
        tokio::time::sleep_until(deadline).await;
        manager.poll().await;
        assert!(manager.is_initialized());
    }
}
