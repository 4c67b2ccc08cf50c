//! LE advertisement lifecycle
//!
//! One advertisement object per server, exported on the bus and registered
//! with the host stack's advertising manager. The object moves through
//! Unexported → Exported → Registered; the host stack can revoke a
//! registration at any time via its Release callback (adapter power-cycle),
//! which silently drops us back to Exported so the next registration attempt
//! proceeds cleanly.

use gattling_core::{BusError, BusResult};
use tracing::{debug, info, warn};

use crate::bus::{AdvertisementProps, BluezBus};

/// 16-bit standard service UUIDs placed in the advertisement payload:
/// Device Information, Battery, Current Time. Deliberately small so the
/// advertisement fits the legacy 31-byte budget; custom 128-bit service
/// UUIDs stay discoverable through the GATT tree after connection.
pub const DEFAULT_ADVERTISED_SERVICES: &[&str] = &["180A", "180F", "1805"];

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdvState {
    Unexported,
    Exported,
    Registered,
}

/// The single advertisement object owned by the adapter manager.
#[derive(Debug)]
pub struct Advertisement {
    object_path: String,
    kind: String,
    service_uuids: Vec<String>,
    include_tx_power: bool,
    state: AdvState,
}

impl Advertisement {
    pub fn new(object_path: impl Into<String>) -> Self {
        Self {
            object_path: object_path.into(),
            kind: "peripheral".to_string(),
            service_uuids: Vec::new(),
            include_tx_power: true,
            state: AdvState::Unexported,
        }
    }

    /// Advertisement configured the way the server advertises by default:
    /// connectable peripheral, standard 16-bit services, no tx-power.
    pub fn with_defaults(object_path: impl Into<String>) -> Self {
        let mut advertisement = Self::new(object_path);
        advertisement.set_service_uuids(
            DEFAULT_ADVERTISED_SERVICES
                .iter()
                .map(|uuid| uuid.to_string())
                .collect(),
        );
        // Excluding tx-power saves ~3 bytes of advertising payload.
        advertisement.set_include_tx_power(false);
        advertisement
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn set_service_uuids(&mut self, uuids: Vec<String>) {
        debug!(count = uuids.len(), "advertisement service UUIDs set");
        self.service_uuids = uuids;
    }

    pub fn set_advertisement_type(&mut self, kind: impl Into<String>) {
        self.kind = kind.into();
    }

    pub fn set_include_tx_power(&mut self, include: bool) {
        self.include_tx_power = include;
    }

    pub fn is_exported(&self) -> bool {
        self.state != AdvState::Unexported
    }

    pub fn is_registered(&self) -> bool {
        self.state == AdvState::Registered
    }

    /// Data elements the host stack includes on our behalf. The local name
    /// is always included (the adapter alias carries the advertised name);
    /// tx-power only when enabled.
    pub fn includes(&self) -> Vec<String> {
        let mut includes = vec!["local-name".to_string()];
        if self.include_tx_power {
            includes.push("tx-power".to_string());
        }
        includes
    }

    fn props(&self) -> AdvertisementProps {
        AdvertisementProps {
            kind: self.kind.clone(),
            service_uuids: self.service_uuids.clone(),
            includes: self.includes(),
        }
    }

    /// Export the advertisement object on the bus.
    pub async fn export(&mut self, bus: &dyn BluezBus) -> BusResult<()> {
        if self.is_exported() {
            return Err(BusError::in_progress("advertisement already exported"));
        }

        bus.export_advertisement(&self.object_path, self.props())
            .await?;
        self.state = AdvState::Exported;
        info!(path = %self.object_path, "advertisement exported");
        Ok(())
    }

    /// Remove the advertisement object from the bus. Idempotent; safe to
    /// call repeatedly on the teardown path.
    pub async fn unexport(&mut self, bus: &dyn BluezBus) {
        if !self.is_exported() {
            return;
        }

        match bus.unexport_advertisement(&self.object_path).await {
            Ok(_) => info!(path = %self.object_path, "advertisement unexported"),
            Err(err) => warn!(path = %self.object_path, error = %err, "advertisement unexport failed"),
        }
        self.state = AdvState::Unexported;
    }

    /// Register the advertisement with the host stack's advertising manager,
    /// exporting the object first when needed. Re-registering while already
    /// registered is a no-op success: the bus call is not re-issued.
    pub async fn register(&mut self, bus: &dyn BluezBus, adapter_path: &str) -> BusResult<()> {
        if self.is_registered() {
            return Ok(());
        }

        if !self.is_exported() {
            self.export(bus).await?;
        }

        match bus
            .register_advertisement(adapter_path, &self.object_path)
            .await
        {
            Ok(()) => {
                self.state = AdvState::Registered;
                info!(path = %self.object_path, adapter = adapter_path, "advertisement registered");
                Ok(())
            }
            Err(err) => {
                warn!(path = %self.object_path, error = %err, "advertisement registration failed");
                Err(err)
            }
        }
    }

    /// Unregister from the advertising manager. Not being registered is a
    /// success ("already stopped"). The registered flag clears whether the
    /// call succeeds or fails, so teardown converges even against a wedged
    /// stack.
    pub async fn unregister(&mut self, bus: &dyn BluezBus, adapter_path: &str) -> BusResult<()> {
        if !self.is_registered() {
            return Ok(());
        }

        let result = bus
            .unregister_advertisement(adapter_path, &self.object_path)
            .await;
        self.state = AdvState::Exported;

        match &result {
            Ok(()) => info!(path = %self.object_path, "advertisement unregistered"),
            Err(err) => warn!(path = %self.object_path, error = %err, "advertisement unregister failed"),
        }
        result
    }

    /// The host stack revoked the registration (its Release callback). The
    /// next registration attempt proceeds from Exported.
    pub fn handle_release(&mut self) {
        if self.state == AdvState::Registered {
            info!(path = %self.object_path, "advertisement released by host stack");
            self.state = AdvState::Exported;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
