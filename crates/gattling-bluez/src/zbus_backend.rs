//! Production [`BluezBus`] backend over the system D-Bus
//!
//! Talks to bluetoothd through zbus: an object-manager proxy for discovery,
//! direct Properties calls for adapter configuration, served
//! `LEAdvertisement1`/`GattService1`/`GattCharacteristic1`/`GattDescriptor1`
//! interfaces for the exported tree, and message streams pumping the four
//! signal classes into the worker channel. Every zbus error is classified at
//! this boundary; raw transport errors never reach the orchestration logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gattling_core::{classify_error_name, BusError, BusResult, ErrorKind};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use zbus::fdo::{self, ObjectManagerProxy};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, Connection, MatchRule, MessageStream};

use crate::bus::{
    call_timed_out, connector, AdvertisementProps, BluezBus, BusConnector, BusSignal,
    BusSignalSender, InterfaceProps, ManagedObjects, PropValue, SharedBus, SignalSubscription,
    ADVERTISING_MANAGER_IFACE, BLUEZ_SERVICE, GATT_MANAGER_IFACE,
};
use crate::gatt::{GattApplication, GattObjectKind};

const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Timeout for ordinary bus calls.
const GENERIC_CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Advertising and application registration are observed to take longer,
/// especially right after a bluetoothd restart.
const EXTENDED_CALL_TIMEOUT: Duration = Duration::from_secs(15);

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// [`BluezBus`] implementation over a zbus system-bus connection.
pub struct ZbusBus {
    connection: Connection,
    bluez_objects: tokio::sync::Mutex<Option<ObjectManagerProxy<'static>>>,
    signal_tx: BusSignalSender,
}

impl ZbusBus {
    /// Connect to the system bus. `signal_tx` also receives the
    /// advertisement Release callback when BlueZ revokes a registration.
    pub async fn connect(signal_tx: BusSignalSender) -> BusResult<Self> {
        let connection = Connection::system().await.map_err(|err| {
            BusError::connection_failed(format!("unable to connect to the system bus: {err}"))
        })?;
        debug!(unique_name = ?connection.unique_name(), "system bus connected");

        Ok(Self {
            connection,
            bluez_objects: tokio::sync::Mutex::new(None),
            signal_tx,
        })
    }

    async fn object_manager(&self) -> BusResult<ObjectManagerProxy<'static>> {
        self.bluez_objects
            .lock()
            .await
            .clone()
            .ok_or_else(|| BusError::not_ready("BlueZ object manager not connected"))
    }
}

/// Connector for the production system bus, the value handed to
/// [`PeripheralServer::start`](crate::lifecycle::PeripheralServer::start)
/// outside of tests.
pub fn system_connector() -> BusConnector {
    connector(|tx| async move {
        let bus = ZbusBus::connect(tx).await?;
        Ok(Arc::new(bus) as SharedBus)
    })
}

#[async_trait]
impl BluezBus for ZbusBus {
    async fn acquire_name(&self, name: &str) -> BusResult<()> {
        let well_known = zbus::names::WellKnownName::try_from(name)
            .map_err(|err| BusError::invalid_args(format!("bad bus name '{name}': {err}")))?;
        self.connection
            .request_name(well_known)
            .await
            .map_err(classify)?;
        info!(name, "bus name acquired");
        Ok(())
    }

    async fn release_name(&self, name: &str) -> BusResult<()> {
        let well_known = zbus::names::WellKnownName::try_from(name)
            .map_err(|err| BusError::invalid_args(format!("bad bus name '{name}': {err}")))?;
        self.connection
            .release_name(well_known)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn connect_object_manager(&self) -> BusResult<()> {
        let proxy = ObjectManagerProxy::builder(&self.connection)
            .destination(BLUEZ_SERVICE)
            .map_err(classify)?
            .path("/")
            .map_err(classify)?
            .build()
            .await
            .map_err(classify)?;
        *self.bluez_objects.lock().await = Some(proxy);
        Ok(())
    }

    async fn managed_objects(&self) -> BusResult<ManagedObjects> {
        let proxy = self.object_manager().await?;
        let objects = timeout(GENERIC_CALL_TIMEOUT, proxy.get_managed_objects())
            .await
            .map_err(|_| call_timed_out("GetManagedObjects"))?
            .map_err(|err| classify(err.into()))?;

        let mut converted = ManagedObjects::new();
        for (path, interfaces) in objects {
            let interfaces = interfaces
                .into_iter()
                .map(|(name, props)| (name.to_string(), convert_props(&props)))
                .collect();
            converted.insert(path.to_string(), interfaces);
        }
        Ok(converted)
    }

    async fn adapter_property(&self, adapter_path: &str, name: &str) -> BusResult<PropValue> {
        let reply = timeout(
            GENERIC_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                adapter_path,
                Some(PROPERTIES_IFACE),
                "Get",
                &(crate::bus::ADAPTER_IFACE, name),
            ),
        )
        .await
        .map_err(|_| call_timed_out("property get"))?
        .map_err(classify)?;

        let body = reply.body();
        let value: Value<'_> = body
            .deserialize()
            .map_err(|err| BusError::failed(format!("malformed property reply: {err}")))?;
        prop_value(&value)
            .ok_or_else(|| BusError::not_supported(format!("unhandled type for property {name}")))
    }

    async fn set_adapter_property(
        &self,
        adapter_path: &str,
        name: &str,
        value: PropValue,
    ) -> BusResult<()> {
        timeout(
            GENERIC_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                adapter_path,
                Some(PROPERTIES_IFACE),
                "Set",
                &(crate::bus::ADAPTER_IFACE, name, to_value(&value)),
            ),
        )
        .await
        .map_err(|_| call_timed_out("property set"))?
        .map_err(classify)?;
        debug!(adapter = adapter_path, property = name, "adapter property set");
        Ok(())
    }

    async fn export_advertisement(&self, path: &str, props: AdvertisementProps) -> BusResult<()> {
        let object = AdvertisementObject {
            props,
            path: path.to_string(),
            signal_tx: self.signal_tx.clone(),
        };
        let added = self
            .connection
            .object_server()
            .at(path, object)
            .await
            .map_err(classify)?;
        if !added {
            return Err(BusError::new(
                ErrorKind::AlreadyExists,
                format!("an object is already exported at {path}"),
            ));
        }
        Ok(())
    }

    async fn unexport_advertisement(&self, path: &str) -> BusResult<bool> {
        match self
            .connection
            .object_server()
            .remove::<AdvertisementObject, _>(path)
            .await
        {
            Ok(removed) => Ok(removed),
            Err(zbus::Error::InterfaceNotFound) => Ok(false),
            Err(err) => Err(classify(err)),
        }
    }

    async fn register_advertisement(
        &self,
        adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()> {
        let path = object_path(advertisement_path)?;
        timeout(
            EXTENDED_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                adapter_path,
                Some(ADVERTISING_MANAGER_IFACE),
                "RegisterAdvertisement",
                &(path, HashMap::<String, Value<'_>>::new()),
            ),
        )
        .await
        .map_err(|_| call_timed_out("RegisterAdvertisement"))?
        .map_err(classify)?;
        Ok(())
    }

    async fn unregister_advertisement(
        &self,
        adapter_path: &str,
        advertisement_path: &str,
    ) -> BusResult<()> {
        let path = object_path(advertisement_path)?;
        timeout(
            GENERIC_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                adapter_path,
                Some(ADVERTISING_MANAGER_IFACE),
                "UnregisterAdvertisement",
                &(path,),
            ),
        )
        .await
        .map_err(|_| call_timed_out("UnregisterAdvertisement"))?
        .map_err(classify)?;
        Ok(())
    }

    async fn export_gatt_object(
        &self,
        app: Arc<GattApplication>,
        path: &str,
        kind: GattObjectKind,
    ) -> BusResult<()> {
        let server = self.connection.object_server();
        let added = match kind {
            GattObjectKind::ObjectManager => {
                // BlueZ enumerates our application through this root.
                server.at(path, fdo::ObjectManager).await.map_err(classify)?
            }
            GattObjectKind::Service => {
                let service = app
                    .find_service(path)
                    .ok_or_else(|| BusError::not_found(format!("no service at {path}")))?;
                let object = GattServiceObject {
                    uuid: service.uuid.to_string(),
                    primary: service.primary,
                };
                server.at(path, object).await.map_err(classify)?
            }
            GattObjectKind::Characteristic => {
                let characteristic = app
                    .find_characteristic(path)
                    .ok_or_else(|| BusError::not_found(format!("no characteristic at {path}")))?;
                let service_path = parent_object_path(path)?;
                let object = GattCharacteristicObject {
                    app: Arc::clone(&app),
                    path: path.to_string(),
                    uuid: characteristic.uuid.to_string(),
                    flags: characteristic.flags.clone(),
                    service_path,
                    value: Vec::new(),
                };
                server.at(path, object).await.map_err(classify)?
            }
            GattObjectKind::Descriptor => {
                let descriptor = app
                    .find_descriptor(path)
                    .ok_or_else(|| BusError::not_found(format!("no descriptor at {path}")))?;
                let characteristic_path = parent_object_path(path)?;
                let object = GattDescriptorObject {
                    app: Arc::clone(&app),
                    path: path.to_string(),
                    uuid: descriptor.uuid.to_string(),
                    flags: descriptor.flags.clone(),
                    characteristic_path,
                };
                server.at(path, object).await.map_err(classify)?
            }
        };

        if !added {
            return Err(BusError::new(
                ErrorKind::AlreadyExists,
                format!("an object is already exported at {path}"),
            ));
        }
        Ok(())
    }

    async fn unexport_gatt_object(&self, path: &str, kind: GattObjectKind) -> BusResult<bool> {
        let server = self.connection.object_server();
        let result = match kind {
            GattObjectKind::ObjectManager => server.remove::<fdo::ObjectManager, _>(path).await,
            GattObjectKind::Service => server.remove::<GattServiceObject, _>(path).await,
            GattObjectKind::Characteristic => {
                server.remove::<GattCharacteristicObject, _>(path).await
            }
            GattObjectKind::Descriptor => server.remove::<GattDescriptorObject, _>(path).await,
        };
        match result {
            Ok(removed) => Ok(removed),
            Err(zbus::Error::InterfaceNotFound) => Ok(false),
            Err(err) => Err(classify(err)),
        }
    }

    async fn notify_characteristic_value(&self, path: &str, value: Vec<u8>) -> BusResult<()> {
        let iface = self
            .connection
            .object_server()
            .interface::<_, GattCharacteristicObject>(path)
            .await
            .map_err(classify)?;

        let mut object = iface.get_mut().await;
        object.value = value;
        object
            .value_changed(iface.signal_context())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn register_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()> {
        let root = object_path(root)?;
        timeout(
            EXTENDED_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                gatt_manager_path,
                Some(GATT_MANAGER_IFACE),
                "RegisterApplication",
                &(root, HashMap::<String, Value<'_>>::new()),
            ),
        )
        .await
        .map_err(|_| call_timed_out("RegisterApplication"))?
        .map_err(classify)?;
        Ok(())
    }

    async fn unregister_application(&self, gatt_manager_path: &str, root: &str) -> BusResult<()> {
        let root = object_path(root)?;
        timeout(
            GENERIC_CALL_TIMEOUT,
            self.connection.call_method(
                Some(BLUEZ_SERVICE),
                gatt_manager_path,
                Some(GATT_MANAGER_IFACE),
                "UnregisterApplication",
                &(root,),
            ),
        )
        .await
        .map_err(|_| call_timed_out("UnregisterApplication"))?
        .map_err(classify)?;
        Ok(())
    }

    async fn subscribe_signals(&self, tx: BusSignalSender) -> BusResult<SignalSubscription> {
        let mut tasks = Vec::new();

        // 1. Property changes on anything the host stack owns (adapters,
        // devices). One broad match beats one subscription per object.
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(BLUEZ_SERVICE)
            .map_err(classify)?
            .interface(PROPERTIES_IFACE)
            .map_err(classify)?
            .member("PropertiesChanged")
            .map_err(classify)?
            .build();
        let mut stream = MessageStream::for_match_rule(rule, &self.connection, None)
            .await
            .map_err(classify)?;
        let changed_tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                let object_path = match message.header().path() {
                    Some(path) => path.to_string(),
                    None => continue,
                };
                let Ok((interface, changed, _invalidated)) = message
                    .body()
                    .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                else {
                    continue;
                };
                let changed = convert_props(&changed);
                if changed_tx
                    .send(BusSignal::PropertiesChanged {
                        object_path,
                        interface,
                        changed,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));

        // 2 + 3. Object appearance/disappearance under the BlueZ root.
        let objects = self.object_manager().await?;
        let mut added = objects
            .receive_interfaces_added()
            .await
            .map_err(|err| classify(err.into()))?;
        let added_tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = added.next().await {
                let Ok(args) = signal.args() else { continue };
                let interfaces = args
                    .interfaces_and_properties()
                    .iter()
                    .map(|(name, props)| {
                        let owned: HashMap<String, OwnedValue> = props
                            .iter()
                            .filter_map(|(k, v)| {
                                OwnedValue::try_from(v).ok().map(|ov| (k.to_string(), ov))
                            })
                            .collect();
                        (name.to_string(), convert_props(&owned))
                    })
                    .collect();
                if added_tx
                    .send(BusSignal::InterfacesAdded {
                        object_path: args.object_path().to_string(),
                        interfaces,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));

        let mut removed = objects
            .receive_interfaces_removed()
            .await
            .map_err(|err| classify(err.into()))?;
        let removed_tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = removed.next().await {
                let Ok(args) = signal.args() else { continue };
                let interfaces = args
                    .interfaces()
                    .iter()
                    .map(|name| name.to_string())
                    .collect();
                if removed_tx
                    .send(BusSignal::InterfacesRemoved {
                        object_path: args.object_path().to_string(),
                        interfaces,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }));

        // 4. Bus-level name signals: bluetoothd coming and going, and our
        // own well-known name being taken from us.
        let dbus = fdo::DBusProxy::new(&self.connection)
            .await
            .map_err(|err| classify(err.into()))?;
        let mut owner_changed = dbus
            .receive_name_owner_changed_with_args(&[(0, BLUEZ_SERVICE)])
            .await
            .map_err(|err| classify(err.into()))?;
        let mut name_lost = dbus
            .receive_name_lost()
            .await
            .map_err(|err| classify(err.into()))?;
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = owner_changed.next() => {
                        let Some(signal) = signal else { break };
                        let Ok(args) = signal.args() else { continue };
                        let old_owner = args
                            .old_owner()
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        let new_owner = args
                            .new_owner()
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        if tx
                            .send(BusSignal::NameOwnerChanged {
                                name: args.name().to_string(),
                                old_owner,
                                new_owner,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    signal = name_lost.next() => {
                        let Some(signal) = signal else { break };
                        let Ok(args) = signal.args() else { continue };
                        if tx
                            .send(BusSignal::NameLost {
                                name: args.name().to_string(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }));

        Ok(SignalSubscription::new(4, tasks, None))
    }
}

// ----------------------------------------------------------------------------
// Served Objects
// ----------------------------------------------------------------------------

struct AdvertisementObject {
    props: AdvertisementProps,
    path: String,
    signal_tx: BusSignalSender,
}

#[interface(name = "org.bluez.LEAdvertisement1")]
impl AdvertisementObject {
    #[zbus(property, name = "Type")]
    fn advertisement_type(&self) -> String {
        self.props.kind.clone()
    }

    #[zbus(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        self.props.service_uuids.clone()
    }

    #[zbus(property)]
    fn includes(&self) -> Vec<String> {
        self.props.includes.clone()
    }

    /// BlueZ revokes the registration (adapter power-cycle, daemon restart).
    fn release(&self) {
        info!(path = %self.path, "advertisement released by BlueZ");
        let _ = self.signal_tx.send(BusSignal::AdvertisementReleased {
            object_path: self.path.clone(),
        });
    }
}

struct GattServiceObject {
    uuid: String,
    primary: bool,
}

#[interface(name = "org.bluez.GattService1")]
impl GattServiceObject {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        self.primary
    }
}

struct GattCharacteristicObject {
    app: Arc<GattApplication>,
    path: String,
    uuid: String,
    flags: Vec<String>,
    service_path: OwnedObjectPath,
    /// Last notified value, what subscribed clients read back.
    value: Vec<u8>,
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl GattCharacteristicObject {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        self.service_path.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        self.value.clone()
    }

    fn read_value(&self, _options: HashMap<&str, Value<'_>>) -> fdo::Result<Vec<u8>> {
        let characteristic = self
            .app
            .find_characteristic(&self.path)
            .ok_or_else(|| fdo::Error::UnknownObject(self.path.clone()))?;
        let context = self.app.context_for(&self.path);
        debug!(path = %self.path, "characteristic read");
        match &characteristic.on_read {
            Some(handler) => handler(&context).map_err(bus_to_fdo),
            None => context
                .get_own()
                .ok_or_else(|| fdo::Error::Failed(format!("no data for {}", self.path))),
        }
    }

    fn write_value(&mut self, value: Vec<u8>, _options: HashMap<&str, Value<'_>>) -> fdo::Result<()> {
        let characteristic = self
            .app
            .find_characteristic(&self.path)
            .ok_or_else(|| fdo::Error::UnknownObject(self.path.clone()))?;
        let context = self.app.context_for(&self.path);
        debug!(path = %self.path, len = value.len(), "characteristic write");
        match &characteristic.on_write {
            Some(handler) => handler(&context, &value).map_err(bus_to_fdo)?,
            None => {
                if !context.set(&context.name, &value) {
                    return Err(fdo::Error::Failed(format!(
                        "write rejected for {}",
                        self.path
                    )));
                }
            }
        }
        self.value = value;
        Ok(())
    }
}

struct GattDescriptorObject {
    app: Arc<GattApplication>,
    path: String,
    uuid: String,
    flags: Vec<String>,
    characteristic_path: OwnedObjectPath,
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl GattDescriptorObject {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    #[zbus(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        self.characteristic_path.clone()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    fn read_value(&self, _options: HashMap<&str, Value<'_>>) -> fdo::Result<Vec<u8>> {
        let descriptor = self
            .app
            .find_descriptor(&self.path)
            .ok_or_else(|| fdo::Error::UnknownObject(self.path.clone()))?;
        let context = self.app.context_for(&self.path);
        match &descriptor.on_read {
            Some(handler) => handler(&context).map_err(bus_to_fdo),
            None => context
                .get_own()
                .ok_or_else(|| fdo::Error::Failed(format!("no data for {}", self.path))),
        }
    }

    fn write_value(&self, value: Vec<u8>, _options: HashMap<&str, Value<'_>>) -> fdo::Result<()> {
        let descriptor = self
            .app
            .find_descriptor(&self.path)
            .ok_or_else(|| fdo::Error::UnknownObject(self.path.clone()))?;
        let context = self.app.context_for(&self.path);
        match &descriptor.on_write {
            Some(handler) => handler(&context, &value).map_err(bus_to_fdo),
            None => {
                if context.set(&context.name, &value) {
                    Ok(())
                } else {
                    Err(fdo::Error::Failed(format!(
                        "write rejected for {}",
                        self.path
                    )))
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

/// Classify any zbus failure through the shared classifier.
fn classify(err: zbus::Error) -> BusError {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            BusError::from_dbus(Some(name.as_str()), message.unwrap_or_default())
        }
        zbus::Error::NameTaken => {
            BusError::new(ErrorKind::AlreadyExists, "bus name already taken")
        }
        zbus::Error::FDO(err) => {
            // The variant name carries the D-Bus error suffix.
            BusError::new(classify_error_name(None, &format!("{err:?}")), err.to_string())
        }
        other => BusError::from_dbus(None, other.to_string()),
    }
}

fn bus_to_fdo(err: BusError) -> fdo::Error {
    warn!(error = %err, "handler failure surfaced to the bus");
    fdo::Error::Failed(err.to_string())
}

fn object_path(path: &str) -> BusResult<ObjectPath<'_>> {
    ObjectPath::try_from(path)
        .map_err(|err| BusError::invalid_args(format!("bad object path '{path}': {err}")))
}

fn parent_object_path(path: &str) -> BusResult<OwnedObjectPath> {
    let parent = GattApplication::parent_path(path)
        .ok_or_else(|| BusError::invalid_args(format!("path '{path}' has no parent")))?;
    Ok(object_path(parent)?.into())
}

fn prop_value(value: &Value<'_>) -> Option<PropValue> {
    match value {
        Value::Bool(v) => Some(PropValue::Bool(*v)),
        Value::U16(v) => Some(PropValue::U16(*v)),
        Value::I16(v) => Some(PropValue::I16(*v)),
        Value::U32(v) => Some(PropValue::U32(*v)),
        Value::Str(v) => Some(PropValue::Str(v.to_string())),
        Value::Array(items) => Some(PropValue::List(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Str(v) => Some(v.to_string()),
                    _ => None,
                })
                .collect(),
        )),
        Value::Value(inner) => prop_value(inner),
        _ => None,
    }
}

fn to_value(value: &PropValue) -> Value<'static> {
    match value {
        PropValue::Bool(v) => Value::from(*v),
        PropValue::U16(v) => Value::from(*v),
        PropValue::I16(v) => Value::from(*v),
        PropValue::U32(v) => Value::from(*v),
        PropValue::Str(v) => Value::from(v.clone()),
        PropValue::List(items) => Value::from(items.clone()),
    }
}

fn convert_props(props: &HashMap<String, OwnedValue>) -> InterfaceProps {
    props
        .iter()
        .filter_map(|(name, value)| prop_value(value).map(|prop| (name.clone(), prop)))
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
