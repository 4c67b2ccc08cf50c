//! Core building blocks for the Gattling BLE GATT peripheral server.
//!
//! This crate is transport-free: it holds the classified error model shared
//! by every bus operation, the retry policy math, the server run-state and
//! health types, adapter/device records, the update queue that carries data
//! change notifications from the embedding application to the server worker,
//! and the server configuration surface.
//!
//! The D-Bus facing pieces (adapter management, advertisement lifecycle and
//! the initialization state machine) live in `gattling-bluez` and depend on
//! everything here.

pub mod config;
pub mod error;
pub mod queue;
pub mod retry;
pub mod types;

pub use config::ServerConfig;
pub use error::{classify_error_name, BusError, BusResult, ErrorKind};
pub use queue::{UpdateEntry, UpdateQueue};
pub use retry::RetryPolicy;
pub use types::{
    AdapterInfo, BluezCapabilities, DeviceInfo, ServerHealth, ServerRunState, StateCell,
};
