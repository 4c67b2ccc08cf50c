//! Initialization state processor
//!
//! A re-entrant step function rather than a counter-driven state machine:
//! every invocation inspects the accumulated state and performs exactly the
//! next unmet step, so an out-of-order failure (a retry, a lost bus name, a
//! restarted host stack) is handled by simply running the processor again.
//! The worker loops [`step`](InitProcessor::step) until the processor settles
//! and re-enters it from the periodic tick once a scheduled retry delay has
//! elapsed.
//!
//! Retries are a single shared timestamp for the whole processor, not one
//! timer per step: when any step fails, the processor waits out the delay and
//! then re-validates from the first gate. Earlier gates are cheap to
//! re-check, and re-validating everything is what makes recovery from
//! mid-sequence surprises correct.

use std::collections::HashSet;
use std::sync::Arc;

use gattling_core::{ErrorKind, ServerConfig, ServerHealth, ServerRunState, StateCell};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterManager;
use crate::bus::{
    BusConnector, BusSignal, BusSignalSender, SharedBus, GATT_MANAGER_IFACE,
};
use crate::gatt::{GattApplication, GattObjectKind};

/// Delay between a failed step and the retry re-entering the processor.
const RETRY_DELAY: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Step Outcome
// ----------------------------------------------------------------------------

/// What one invocation of the processor did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A gate was cleared; invoke the processor again for the next one.
    Advanced,
    /// Nothing to do: fully initialized, or waiting out a retry delay.
    Idle,
    /// The current gate failed; a retry delay is now pending.
    RetryScheduled,
    /// An unrecoverable failure; the caller must tear the server down.
    Fatal,
}

// ----------------------------------------------------------------------------
// Initialization Processor
// ----------------------------------------------------------------------------

/// Drives the peripheral from nothing to Running: bus connection, owned
/// name, object manager, GATT-manager discovery, adapter configuration,
/// GATT tree export and application registration, in that order.
pub struct InitProcessor {
    connector: BusConnector,
    signal_tx: BusSignalSender,
    config: ServerConfig,
    app: Arc<GattApplication>,

    bus: Option<SharedBus>,
    name_acquired: bool,
    object_manager_ready: bool,
    gatt_manager_path: Option<String>,
    adapter_configured: bool,
    exported: HashSet<(String, GattObjectKind)>,
    application_registered: bool,

    retry_since: Option<Instant>,
}

impl InitProcessor {
    pub fn new(
        config: ServerConfig,
        app: Arc<GattApplication>,
        connector: BusConnector,
        signal_tx: BusSignalSender,
    ) -> Self {
        Self {
            connector,
            signal_tx,
            config,
            app,
            bus: None,
            name_acquired: false,
            object_manager_ready: false,
            gatt_manager_path: None,
            adapter_configured: false,
            exported: HashSet::new(),
            application_registered: false,
            retry_since: None,
        }
    }

    /// The bus connection, once gate 1 has cleared.
    pub fn bus(&self) -> Option<SharedBus> {
        self.bus.clone()
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_since.is_some()
    }

    /// Periodic-tick entry: clears the retry timestamp once the delay has
    /// elapsed. Returns whether the processor should be stepped again.
    pub fn poll_retry(&mut self) -> bool {
        match self.retry_since {
            Some(since) if since.elapsed() >= RETRY_DELAY => {
                debug!("retry delay elapsed, re-entering initialization");
                self.retry_since = None;
                true
            }
            _ => false,
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_since.is_none() {
            self.retry_since = Some(Instant::now());
            warn!(
                delay_secs = RETRY_DELAY.as_secs(),
                "will retry the failed operation"
            );
        }
    }

    /// Signals that unwind accumulated state. Losing the owned name after
    /// acquisition is retryable here, because the worker loop (our recovery
    /// timer) is already running; failing the initial acquisition is fatal
    /// and handled in [`step`](Self::step).
    pub fn handle_signal(&mut self, signal: &BusSignal) {
        if let BusSignal::NameLost { name } = signal {
            if *name == self.config.owned_name() && self.name_acquired {
                warn!(name = %name, "lost owned bus name, scheduling re-acquisition");
                self.name_acquired = false;
                self.schedule_retry();
            }
        }
    }

    /// Perform the next unmet initialization step.
    pub async fn step(&mut self, adapter: &mut AdapterManager, state: &StateCell) -> StepOutcome {
        // End-of-life or waiting out a retry: leave the state alone.
        if state.run_state() > ServerRunState::Running || self.retry_pending() {
            return StepOutcome::Idle;
        }

        // Gate 1: bus connection. No bus means no recovery path, so a
        // failure here is fatal rather than retried.
        let Some(bus) = self.bus.clone() else {
            debug!("acquiring bus connection");
            return match (self.connector)(self.signal_tx.clone()).await {
                Ok(bus) => {
                    self.bus = Some(bus);
                    StepOutcome::Advanced
                }
                Err(err) => {
                    error!(error = %err, "unable to acquire a bus connection");
                    state.set_health(ServerHealth::FailedInit);
                    StepOutcome::Fatal
                }
            };
        };

        // Gate 2: owned bus name. The initial acquisition failing means the
        // name is taken or denied to us; nothing we retry will change that.
        if !self.name_acquired {
            let name = self.config.owned_name();
            debug!(name = %name, "acquiring owned bus name");
            return match bus.acquire_name(&name).await {
                Ok(()) => {
                    self.name_acquired = true;
                    StepOutcome::Advanced
                }
                Err(err) => {
                    error!(name = %name, error = %err, "unable to acquire owned bus name");
                    state.set_health(ServerHealth::FailedInit);
                    StepOutcome::Fatal
                }
            };
        }

        // Gate 3: the host stack's object manager.
        if !self.object_manager_ready {
            debug!("connecting host stack object manager");
            return match bus.connect_object_manager().await {
                Ok(()) => {
                    self.object_manager_ready = true;
                    StepOutcome::Advanced
                }
                Err(err) => {
                    warn!(error = %err, "object manager unavailable");
                    self.schedule_retry();
                    StepOutcome::RetryScheduled
                }
            };
        }

        // Gate 4: locate the GATT manager interface.
        if self.gatt_manager_path.is_none() {
            debug!("locating GATT manager interface");
            return match self.find_gatt_manager(&bus).await {
                Ok(path) => {
                    info!(path = %path, "GATT manager located");
                    self.gatt_manager_path = Some(path);
                    StepOutcome::Advanced
                }
                Err(err) => {
                    warn!(error = %err, "GATT manager not found");
                    self.schedule_retry();
                    StepOutcome::RetryScheduled
                }
            };
        }

        // Gate 5: adapter configuration.
        if !self.adapter_configured {
            debug!("configuring adapter");
            return match self.configure_adapter(adapter, &bus).await {
                Ok(()) => {
                    self.adapter_configured = true;
                    StepOutcome::Advanced
                }
                Err(err) => {
                    warn!(error = %err, "adapter configuration failed");
                    self.schedule_retry();
                    StepOutcome::RetryScheduled
                }
            };
        }

        // Gate 6: export the GATT object tree on the bus.
        let tree = self.app.object_paths();
        if self.exported.len() < tree.len() {
            debug!(total = tree.len(), done = self.exported.len(), "exporting GATT objects");
            return match self.export_objects(&bus, &tree).await {
                Ok(()) => StepOutcome::Advanced,
                Err(err) => {
                    warn!(error = %err, "GATT object export failed");
                    self.schedule_retry();
                    StepOutcome::RetryScheduled
                }
            };
        }

        // Gate 7: register the application with the GATT manager.
        if !self.application_registered {
            // Present whenever this gate is reached; located above.
            let manager = self.gatt_manager_path.clone().unwrap_or_default();
            debug!(manager = %manager, "registering GATT application");
            return match bus.register_application(&manager, self.app.root_path()).await {
                Ok(()) => {
                    info!(root = self.app.root_path(), "GATT application registered");
                    self.application_registered = true;
                    StepOutcome::Advanced
                }
                Err(err) => {
                    warn!(error = %err, "application registration failed");
                    self.schedule_retry();
                    StepOutcome::RetryScheduled
                }
            };
        }

        // All gates cleared. Health should always be Ok here; if something
        // went bad along the way, stop instead of claiming to run.
        if state.health() != ServerHealth::Ok {
            error!("initialization complete but health is degraded, shutting down");
            return StepOutcome::Fatal;
        }

        if state.run_state() < ServerRunState::Running {
            info!("initialization complete");
            state.set_run_state(ServerRunState::Running);
        }
        StepOutcome::Idle
    }

    async fn find_gatt_manager(&self, bus: &SharedBus) -> gattling_core::BusResult<String> {
        let objects = bus.managed_objects().await?;
        let mut paths: Vec<&String> = objects
            .iter()
            .filter(|(_, interfaces)| interfaces.contains_key(GATT_MANAGER_IFACE))
            .map(|(path, _)| path)
            .collect();
        paths.sort();
        paths
            .first()
            .map(|path| (*path).clone())
            .ok_or_else(|| {
                gattling_core::BusError::not_found("no object exposes a GATT manager interface")
            })
    }

    /// Adapter bring-up, powered-on deliberately last: the property writes
    /// before it work on an unpowered adapter, advertising does not.
    async fn configure_adapter(
        &mut self,
        adapter: &mut AdapterManager,
        bus: &SharedBus,
    ) -> gattling_core::BusResult<()> {
        adapter.initialize(bus).await?;

        if self.config.list_adapters {
            for info in adapter.discover_adapters(bus).await? {
                info!(
                    path = %info.path,
                    address = %info.address,
                    name = %info.name,
                    powered = info.powered,
                    "available adapter"
                );
            }
        }

        let name = self.config.truncated_advertising_name().to_string();
        if !name.is_empty() {
            adapter
                .set_name(&name, self.config.truncated_advertising_short_name())
                .await?;
        }

        adapter.set_bondable(self.config.enable_bondable).await?;
        adapter
            .set_discoverable(self.config.enable_discoverable, 0)
            .await?;

        if self.config.enable_advertising {
            // Background operation with its own retry budget; a peripheral
            // that cannot currently advertise still serves connected
            // clients, so failures here never gate initialization.
            adapter
                .set_advertising_async(
                    true,
                    Box::new(|result| match result {
                        Ok(()) => info!("advertising enabled"),
                        Err(err) => warn!(error = %err, "advertising could not be enabled"),
                    }),
                )
                .await;
        }

        adapter.set_powered(true).await?;
        info!(adapter = adapter.adapter_path(), "adapter configured");
        Ok(())
    }

    /// Export every tree node not yet known to be exported. One failure
    /// aborts the batch; already-exported siblings stay exported and the
    /// retry re-walk skips them. A transport-side AlreadyExists counts as
    /// exported too, covering a duplicate we failed to record.
    async fn export_objects(
        &mut self,
        bus: &SharedBus,
        tree: &[(String, GattObjectKind)],
    ) -> gattling_core::BusResult<()> {
        for (path, kind) in tree {
            let key = (path.clone(), *kind);
            if self.exported.contains(&key) {
                continue;
            }

            match bus.export_gatt_object(Arc::clone(&self.app), path, *kind).await {
                Ok(()) => {
                    debug!(path = %path, kind = ?kind, "GATT object exported");
                    self.exported.insert(key);
                }
                Err(err) if err.kind == ErrorKind::AlreadyExists => {
                    debug!(path = %path, "GATT object was already exported");
                    self.exported.insert(key);
                }
                Err(err) => return Err(err),
            }
        }
        info!(count = self.exported.len(), "GATT object tree exported");
        Ok(())
    }

    /// Teardown in reverse registration order. Every exported object is
    /// removed before the bus handle is dropped; all steps are best effort.
    pub async fn uninit(&mut self) {
        let Some(bus) = self.bus.take() else {
            self.reset();
            return;
        };

        if self.application_registered {
            if let Some(manager) = self.gatt_manager_path.as_deref() {
                if let Err(err) = bus.unregister_application(manager, self.app.root_path()).await {
                    warn!(error = %err, "application unregister failed");
                }
            }
            self.application_registered = false;
        }

        for (path, kind) in self.app.object_paths().into_iter().rev() {
            if self.exported.remove(&(path.clone(), kind)) {
                if let Err(err) = bus.unexport_gatt_object(&path, kind).await {
                    warn!(path = %path, error = %err, "GATT object unexport failed");
                }
            }
        }

        if self.name_acquired {
            if let Err(err) = bus.release_name(&self.config.owned_name()).await {
                warn!(error = %err, "bus name release failed");
            }
            self.name_acquired = false;
        }

        self.reset();
        debug!("initialization state torn down");
    }

    fn reset(&mut self) {
        self.bus = None;
        self.name_acquired = false;
        self.object_manager_ready = false;
        self.gatt_manager_path = None;
        self.adapter_configured = false;
        self.exported.clear();
        self.application_registered = false;
        self.retry_since = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterManager;
    use crate::bus::BluezBus;
    use crate::gatt::{DataGetter, DataSetter, GattCharacteristic, GattService};
    use crate::testing::{mock_connector, MockBus};
    use gattling_core::RetryPolicy;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const ADAPTER: &str = "/org/bluez/hci0";

    struct Fixture {
        mock: Arc<MockBus>,
        adapter: AdapterManager,
        processor: InitProcessor,
        state: StateCell,
    }

    fn fixture(mock: MockBus) -> Fixture {
        let mock = Arc::new(mock);
        let config = ServerConfig::new("gattling").validated().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let getter: DataGetter = Arc::new(|_| Some(vec![42]));
        let setter: DataSetter = Arc::new(|_, _| true);
        let app = Arc::new(
            GattApplication::new(config.root_path(), getter, setter).service(
                GattService::new("battery", Uuid::from_u128(0x180F)).characteristic(
                    GattCharacteristic::new("level", Uuid::from_u128(0x2A19), &["read", "notify"]),
                ),
            ),
        );

        let adapter = AdapterManager::new(
            config.advertisement_path(),
            RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            },
            RetryPolicy::advertising(),
            None,
            tx.clone(),
            None,
            Arc::new(AtomicUsize::new(0)),
        );
        let processor = InitProcessor::new(config, app, mock_connector(Arc::clone(&mock)), tx);

        Fixture {
            mock,
            adapter,
            processor,
            state: StateCell::new(),
        }
    }

    async fn drive(fixture: &mut Fixture) -> StepOutcome {
        loop {
            match fixture
                .processor
                .step(&mut fixture.adapter, &fixture.state)
                .await
            {
                StepOutcome::Advanced => continue,
                outcome => return outcome,
            }
        }
    }

    #[tokio::test]
    async fn clears_all_gates_and_reaches_running() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.state.set_run_state(ServerRunState::Initializing);

        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);
        assert_eq!(fixture.state.run_state(), ServerRunState::Running);
        assert!(fixture.mock.owns_name("com.gattling"));
        assert!(fixture.mock.is_application_registered());
        // Root object manager, service, characteristic.
        assert_eq!(fixture.mock.exported_gatt_objects().len(), 3);
        assert!(fixture.mock.is_advertisement_registered("/com/gattling/advertisement0"));
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.mock.fail_next("connect", ErrorKind::ConnectionFailed);
        fixture.state.set_run_state(ServerRunState::Initializing);

        assert_eq!(drive(&mut fixture).await, StepOutcome::Fatal);
        assert_eq!(fixture.state.health(), ServerHealth::FailedInit);
        assert!(!fixture.processor.retry_pending());
    }

    #[tokio::test]
    async fn name_acquisition_failure_is_fatal() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.mock.fail_next("acquire_name", ErrorKind::PermissionDenied);
        fixture.state.set_run_state(ServerRunState::Initializing);

        assert_eq!(drive(&mut fixture).await, StepOutcome::Fatal);
        assert_eq!(fixture.state.health(), ServerHealth::FailedInit);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_schedules_shared_retry_and_recovers() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.mock.fail_next("managed_objects", ErrorKind::NotReady);
        fixture.state.set_run_state(ServerRunState::Initializing);

        assert_eq!(drive(&mut fixture).await, StepOutcome::RetryScheduled);
        assert!(fixture.processor.retry_pending());
        // While the retry delay is pending the processor refuses to step.
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);
        assert!(!fixture.processor.poll_retry());

        tokio::time::sleep(RETRY_DELAY).await;
        assert!(fixture.processor.poll_retry());
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);
        assert_eq!(fixture.state.run_state(), ServerRunState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn export_failure_keeps_siblings_and_tolerates_duplicates() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.state.set_run_state(ServerRunState::Initializing);

        // Pre-export the root from the outside: the processor does not know
        // about it and must tolerate AlreadyExists on its own attempt.
        fixture
            .mock
            .as_ref()
            .export_gatt_object(
                Arc::new(GattApplication::new(
                    "/com/gattling",
                    Arc::new(|_| None),
                    Arc::new(|_, _| false),
                )),
                "/com/gattling",
                GattObjectKind::ObjectManager,
            )
            .await
            .unwrap();

        // Fail the first export attempt; the batch aborts without touching
        // what is already on the bus.
        fixture.mock.fail_next("export_gatt_object", ErrorKind::Failed);
        assert_eq!(drive(&mut fixture).await, StepOutcome::RetryScheduled);
        assert_eq!(fixture.mock.exported_gatt_objects().len(), 1);

        tokio::time::sleep(RETRY_DELAY).await;
        assert!(fixture.processor.poll_retry());
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);
        assert_eq!(fixture.state.run_state(), ServerRunState::Running);
        assert_eq!(fixture.mock.exported_gatt_objects().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn name_lost_after_acquisition_schedules_retry() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.state.set_run_state(ServerRunState::Initializing);
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);

        fixture.processor.handle_signal(&BusSignal::NameLost {
            name: "com.gattling".to_string(),
        });
        assert!(fixture.processor.retry_pending());

        tokio::time::sleep(RETRY_DELAY).await;
        assert!(fixture.processor.poll_retry());
        // The re-walk re-acquires the name and settles again.
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);
        assert!(fixture.mock.owns_name("com.gattling"));
    }

    #[tokio::test]
    async fn uninit_unwinds_in_reverse_and_is_idempotent() {
        let mut fixture = fixture(MockBus::with_powered_adapter(ADAPTER));
        fixture.state.set_run_state(ServerRunState::Initializing);
        assert_eq!(drive(&mut fixture).await, StepOutcome::Idle);

        fixture.processor.uninit().await;
        assert!(!fixture.mock.is_application_registered());
        assert!(fixture.mock.exported_gatt_objects().is_empty());
        assert!(!fixture.mock.owns_name("com.gattling"));
        assert!(fixture.processor.bus().is_none());

        fixture.processor.uninit().await;
    }
}
