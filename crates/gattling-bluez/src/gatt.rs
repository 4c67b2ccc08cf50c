//! GATT application tree
//!
//! Thin data model for the service/characteristic/descriptor hierarchy the
//! server exports: node names compose into stable object paths under the
//! configured root, and each node carries its UUID, flags and handler
//! closures. The tree is addressed by path lookup rather than parent
//! back-references, so nodes can be exported and unexported without aliasing
//! concerns.

use std::collections::HashSet;
use std::sync::Arc;

use gattling_core::{BusError, BusResult};
use uuid::Uuid;

use crate::bus::{GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE};

/// Expand a 16-bit Bluetooth assigned number over the Bluetooth Base UUID:
/// `0x180F` becomes `0000180f-0000-1000-8000-00805f9b34fb`.
pub fn bluetooth_uuid(short: u16) -> Uuid {
    const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;
    Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96))
}

// ----------------------------------------------------------------------------
// Data Accessors
// ----------------------------------------------------------------------------

/// Pulls named data out of the embedding application. Called from the server
/// worker; implementations must be thread safe and return an owned copy.
pub type DataGetter = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

/// Pushes written data back into the embedding application. Returns whether
/// the application accepted the value.
pub type DataSetter = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Context handed to characteristic/descriptor handlers.
#[derive(Clone)]
pub struct GattContext {
    /// Object path of the node being handled.
    pub path: String,
    /// Node name, the key the data accessors are addressed with.
    pub name: String,
    getter: DataGetter,
    setter: DataSetter,
}

impl GattContext {
    /// Fetch a named value from the application.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        (self.getter)(name)
    }

    /// Fetch this node's own value from the application.
    pub fn get_own(&self) -> Option<Vec<u8>> {
        self.get(&self.name)
    }

    /// Store a named value into the application.
    pub fn set(&self, name: &str, data: &[u8]) -> bool {
        (self.setter)(name, data)
    }
}

pub type ReadHandler = Arc<dyn Fn(&GattContext) -> BusResult<Vec<u8>> + Send + Sync>;
pub type WriteHandler = Arc<dyn Fn(&GattContext, &[u8]) -> BusResult<()> + Send + Sync>;
/// Invoked when the update queue delivers a change notification for the
/// node. Returning a value asks the server to notify connected clients.
pub type UpdateHandler = Arc<dyn Fn(&GattContext) -> Option<Vec<u8>> + Send + Sync>;

// ----------------------------------------------------------------------------
// Tree Nodes
// ----------------------------------------------------------------------------

/// Which bus interface an exported tree node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattObjectKind {
    ObjectManager,
    Service,
    Characteristic,
    Descriptor,
}

const CHARACTERISTIC_FLAGS: &[&str] = &[
    "broadcast",
    "read",
    "write-without-response",
    "write",
    "notify",
    "indicate",
    "authenticated-signed-writes",
    "extended-properties",
    "reliable-write",
    "writable-auxiliaries",
    "encrypt-read",
    "encrypt-write",
    "encrypt-authenticated-read",
    "encrypt-authenticated-write",
    "secure-read",
    "secure-write",
    "authorize",
];

const DESCRIPTOR_FLAGS: &[&str] = &[
    "read",
    "write",
    "encrypt-read",
    "encrypt-write",
    "encrypt-authenticated-read",
    "encrypt-authenticated-write",
    "secure-read",
    "secure-write",
    "authorize",
];

/// A GATT descriptor: metadata attached to a characteristic.
#[derive(Clone)]
pub struct GattDescriptor {
    pub node: String,
    pub uuid: Uuid,
    pub flags: Vec<String>,
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
}

impl GattDescriptor {
    pub fn new(node: impl Into<String>, uuid: Uuid, flags: &[&str]) -> Self {
        Self {
            node: node.into(),
            uuid,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            on_read: None,
            on_write: None,
        }
    }

    pub fn on_read(
        mut self,
        handler: impl Fn(&GattContext) -> BusResult<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.on_read = Some(Arc::new(handler));
        self
    }

    pub fn on_write(
        mut self,
        handler: impl Fn(&GattContext, &[u8]) -> BusResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_write = Some(Arc::new(handler));
        self
    }
}

/// A GATT characteristic: a value slot under a service.
#[derive(Clone)]
pub struct GattCharacteristic {
    pub node: String,
    pub uuid: Uuid,
    pub flags: Vec<String>,
    pub descriptors: Vec<GattDescriptor>,
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
    pub on_update: Option<UpdateHandler>,
}

impl GattCharacteristic {
    pub fn new(node: impl Into<String>, uuid: Uuid, flags: &[&str]) -> Self {
        Self {
            node: node.into(),
            uuid,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            descriptors: Vec::new(),
            on_read: None,
            on_write: None,
            on_update: None,
        }
    }

    pub fn on_read(
        mut self,
        handler: impl Fn(&GattContext) -> BusResult<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.on_read = Some(Arc::new(handler));
        self
    }

    pub fn on_write(
        mut self,
        handler: impl Fn(&GattContext, &[u8]) -> BusResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_write = Some(Arc::new(handler));
        self
    }

    pub fn on_update(
        mut self,
        handler: impl Fn(&GattContext) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(handler));
        self
    }

    pub fn descriptor(mut self, descriptor: GattDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A primary GATT service grouping characteristics.
#[derive(Clone)]
pub struct GattService {
    pub node: String,
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(node: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            node: node.into(),
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

/// The full GATT tree a server exports, plus the data accessors shared by
/// every handler.
pub struct GattApplication {
    root_path: String,
    services: Vec<GattService>,
    getter: DataGetter,
    setter: DataSetter,
}

impl GattApplication {
    pub fn new(root_path: impl Into<String>, getter: DataGetter, setter: DataSetter) -> Self {
        Self {
            root_path: root_path.into(),
            services: Vec::new(),
            getter,
            setter,
        }
    }

    pub fn service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    /// Check tree consistency: non-empty node names, unique paths, and flags
    /// drawn from the GATT vocabulary.
    pub fn validate(&self) -> BusResult<()> {
        let mut seen = HashSet::new();
        for (path, kind) in self.object_paths() {
            if !seen.insert(path.clone()) {
                return Err(BusError::invalid_args(format!("duplicate object path {path}")));
            }
            if matches!(kind, GattObjectKind::Service | GattObjectKind::Characteristic | GattObjectKind::Descriptor)
                && path.split('/').next_back().is_some_and(str::is_empty)
            {
                return Err(BusError::invalid_args(format!("empty node name in {path}")));
            }
        }

        for service in &self.services {
            for characteristic in &service.characteristics {
                for flag in &characteristic.flags {
                    if !CHARACTERISTIC_FLAGS.contains(&flag.as_str()) {
                        return Err(BusError::invalid_args(format!(
                            "unknown characteristic flag '{flag}' on {}",
                            characteristic.node
                        )));
                    }
                }
                for descriptor in &characteristic.descriptors {
                    for flag in &descriptor.flags {
                        if !DESCRIPTOR_FLAGS.contains(&flag.as_str()) {
                            return Err(BusError::invalid_args(format!(
                                "unknown descriptor flag '{flag}' on {}",
                                descriptor.node
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Every object path in the tree with the interface it exports, root
    /// (object manager) first, in registration order.
    pub fn object_paths(&self) -> Vec<(String, GattObjectKind)> {
        let mut paths = vec![(self.root_path.clone(), GattObjectKind::ObjectManager)];
        for service in &self.services {
            let service_path = format!("{}/{}", self.root_path, service.node);
            paths.push((service_path.clone(), GattObjectKind::Service));
            for characteristic in &service.characteristics {
                let char_path = format!("{service_path}/{}", characteristic.node);
                paths.push((char_path.clone(), GattObjectKind::Characteristic));
                for descriptor in &characteristic.descriptors {
                    paths.push((
                        format!("{char_path}/{}", descriptor.node),
                        GattObjectKind::Descriptor,
                    ));
                }
            }
        }
        paths
    }

    /// Path of the service a characteristic/descriptor path belongs to.
    pub fn parent_path(path: &str) -> Option<&str> {
        path.rfind('/').map(|idx| &path[..idx])
    }

    pub fn find_service(&self, path: &str) -> Option<&GattService> {
        self.services.iter().find(|service| {
            format!("{}/{}", self.root_path, service.node) == path
        })
    }

    pub fn find_characteristic(&self, path: &str) -> Option<&GattCharacteristic> {
        let service_path = Self::parent_path(path)?;
        let service = self.find_service(service_path)?;
        let node = path.rsplit('/').next()?;
        service.characteristics.iter().find(|c| c.node == node)
    }

    pub fn find_descriptor(&self, path: &str) -> Option<&GattDescriptor> {
        let char_path = Self::parent_path(path)?;
        let characteristic = self.find_characteristic(char_path)?;
        let node = path.rsplit('/').next()?;
        characteristic.descriptors.iter().find(|d| d.node == node)
    }

    /// Build the handler context for a node path.
    pub fn context_for(&self, path: &str) -> GattContext {
        GattContext {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            getter: Arc::clone(&self.getter),
            setter: Arc::clone(&self.setter),
        }
    }

    /// Resolve an update-queue entry to its update handler and run it,
    /// returning the value to notify, if any. `None` outer value means the
    /// entry did not match a known node.
    pub fn run_update_handler(
        &self,
        path: &str,
        interface_name: &str,
    ) -> Option<Option<Vec<u8>>> {
        match interface_name {
            GATT_CHARACTERISTIC_IFACE => {
                let characteristic = self.find_characteristic(path)?;
                let handler = characteristic.on_update.as_ref()?;
                Some(handler(&self.context_for(path)))
            }
            GATT_DESCRIPTOR_IFACE => {
                // Descriptor updates resolve but have no notify path.
                self.find_descriptor(path)?;
                Some(None)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for GattApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattApplication")
            .field("root_path", &self.root_path)
            .field("services", &self.services.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app() -> GattApplication {
        let getter: DataGetter = Arc::new(|name| {
            (name == "level").then(|| vec![87u8])
        });
        let setter: DataSetter = Arc::new(|_, _| true);

        GattApplication::new("/com/gattling", getter, setter).service(
            GattService::new("battery", Uuid::from_u128(0x180F)).characteristic(
                GattCharacteristic::new("level", Uuid::from_u128(0x2A19), &["read", "notify"])
                    .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default()))
                    .on_update(|ctx| ctx.get_own())
                    .descriptor(GattDescriptor::new(
                        "description",
                        Uuid::from_u128(0x2901),
                        &["read"],
                    )),
            ),
        )
    }

    #[test]
    fn walks_paths_root_first() {
        let app = test_app();
        let paths = app.object_paths();
        assert_eq!(
            paths,
            vec![
                ("/com/gattling".to_string(), GattObjectKind::ObjectManager),
                ("/com/gattling/battery".to_string(), GattObjectKind::Service),
                (
                    "/com/gattling/battery/level".to_string(),
                    GattObjectKind::Characteristic
                ),
                (
                    "/com/gattling/battery/level/description".to_string(),
                    GattObjectKind::Descriptor
                ),
            ]
        );
    }

    #[test]
    fn finds_nodes_by_path() {
        let app = test_app();
        assert!(app.find_service("/com/gattling/battery").is_some());
        assert!(app.find_characteristic("/com/gattling/battery/level").is_some());
        assert!(app
            .find_descriptor("/com/gattling/battery/level/description")
            .is_some());
        assert!(app.find_characteristic("/com/gattling/battery/charge").is_none());
    }

    #[test]
    fn update_handler_resolves_and_returns_value() {
        let app = test_app();
        let outcome = app.run_update_handler(
            "/com/gattling/battery/level",
            GATT_CHARACTERISTIC_IFACE,
        );
        assert_eq!(outcome, Some(Some(vec![87u8])));

        let missing = app.run_update_handler(
            "/com/gattling/battery/charge",
            GATT_CHARACTERISTIC_IFACE,
        );
        assert!(missing.is_none());
    }

    #[test]
    fn expands_short_uuids_over_the_base() {
        assert_eq!(
            bluetooth_uuid(0x180F).to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            bluetooth_uuid(0x2A19).to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn validate_rejects_unknown_flags() {
        let getter: DataGetter = Arc::new(|_| None);
        let setter: DataSetter = Arc::new(|_, _| false);
        let app = GattApplication::new("/com/gattling", getter, setter).service(
            GattService::new("svc", Uuid::from_u128(1)).characteristic(
                GattCharacteristic::new("chr", Uuid::from_u128(2), &["levitate"]),
            ),
        );
        assert!(app.validate().is_err());
        assert!(test_app().validate().is_ok());
    }
}
