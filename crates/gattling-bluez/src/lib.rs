//! BLE GATT peripheral server over the BlueZ D-Bus API.
//!
//! The embedding application declares a GATT tree ([`gatt`]), hands it to a
//! [`PeripheralServer`](lifecycle::PeripheralServer) and starts it; the
//! server owns a worker thread that connects to the system bus, selects and
//! configures a Bluetooth adapter, exports the tree and an LE advertisement,
//! registers both with BlueZ, and then brokers read/write/notify traffic
//! between remote centrals and the application's data callbacks.
//!
//! Initialization is a retrying asynchronous protocol ([`init`]), adapter
//! and advertising state live in [`adapter`]/[`advertisement`], and all bus
//! traffic goes through the [`bus::BluezBus`] contract, implemented by
//! [`zbus_backend::ZbusBus`] in production and by an in-memory mock (the
//! `testing` feature) in tests.

pub mod adapter;
pub mod advertisement;
pub mod bus;
pub mod gatt;
pub mod init;
pub mod lifecycle;
pub mod zbus_backend;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::AdapterManager;
pub use advertisement::Advertisement;
pub use bus::{BluezBus, BusConnector, BusSignal, PropValue, SharedBus};
pub use gatt::{
    bluetooth_uuid, DataGetter, DataSetter, GattApplication, GattCharacteristic, GattContext,
    GattDescriptor, GattService,
};
pub use lifecycle::PeripheralServer;
pub use zbus_backend::system_connector;

// The core types embedders need alongside the server.
pub use gattling_core::{
    BusError, BusResult, ErrorKind, RetryPolicy, ServerConfig, ServerHealth, ServerRunState,
    UpdateQueue,
};
