//! Server lifecycle
//!
//! [`PeripheralServer`] is the embedding-facing shell: it validates the
//! configuration, spawns one worker thread running a single-threaded event
//! loop, and exposes the thread-safe surface (state/health reads, the update
//! queue, shutdown trigger, join). Everything that talks to the host stack
//! lives on the worker; the only state crossing the thread boundary is the
//! run-state cell, the connection counter, the update queue and the control
//! channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use gattling_core::{
    BusError, BusResult, ServerConfig, ServerHealth, ServerRunState, StateCell, UpdateQueue,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterManager, ConnectionCallback};
use crate::bus::{
    BusConnector, BusSignalReceiver, GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE,
};
use crate::gatt::GattApplication;
use crate::init::{InitProcessor, StepOutcome};

/// Cadence of the init-retry tick.
const PERIODIC_TICK: Duration = Duration::from_secs(1);
/// Cadence of the update-queue processor; one entry per tick.
const UPDATE_TICK: Duration = Duration::from_millis(10);
/// Bound on the synchronous advertising wrapper.
const SET_ADVERTISING_TIMEOUT: Duration = Duration::from_secs(20);

// ----------------------------------------------------------------------------
// Shutdown Signal
// ----------------------------------------------------------------------------

/// Cross-thread shutdown request. `trigger` only flips a flag and wakes the
/// worker, so it is safe from restrictive contexts (signal handlers in the
/// embedding application).
#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn trigger(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

// ----------------------------------------------------------------------------
// Control Channel
// ----------------------------------------------------------------------------

enum ControlRequest {
    SetAdvertising {
        enabled: bool,
        reply: std::sync::mpsc::SyncSender<BusResult<()>>,
    },
}

// ----------------------------------------------------------------------------
// Peripheral Server
// ----------------------------------------------------------------------------

/// A BLE GATT peripheral server instance.
///
/// Construct with a validated configuration and a GATT application tree,
/// then [`start`](Self::start) it with a bus connector. One server per
/// process is the intended deployment; nothing enforces it beyond each
/// instance owning its own bus name.
pub struct PeripheralServer {
    config: ServerConfig,
    app: Arc<GattApplication>,
    state: Arc<StateCell>,
    queue: Arc<UpdateQueue>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownSignal>,
    connection_callback: Option<ConnectionCallback>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<ControlRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeripheralServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralServer")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl PeripheralServer {
    /// Validate the configuration and the application tree and build a
    /// server ready to start.
    pub fn new(config: ServerConfig, app: GattApplication) -> BusResult<Self> {
        let config = config.validated()?;
        app.validate()?;

        Ok(Self {
            config,
            app: Arc::new(app),
            state: Arc::new(StateCell::new()),
            queue: Arc::new(UpdateQueue::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(ShutdownSignal::default()),
            connection_callback: None,
            control_tx: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Register a callback fired on every remote connect/disconnect. Must be
    /// set before [`start`](Self::start).
    pub fn with_connection_callback(
        mut self,
        callback: impl Fn(bool, &str) + Send + Sync + 'static,
    ) -> Self {
        self.connection_callback = Some(Arc::new(callback));
        self
    }

    /// Spawn the worker and block until initialization completes or the
    /// configured timeout elapses. Returns success only when the server
    /// reached Running; on failure the health is left inspectable.
    pub fn start(&self, connector: BusConnector) -> BusResult<()> {
        if self.state.run_state() != ServerRunState::Uninitialized {
            return Err(BusError::in_progress("server already started"));
        }

        info!(service = %self.config.service_name, "starting peripheral server");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.control_tx.lock().expect("control mutex poisoned") = Some(control_tx);

        let context = WorkerContext {
            config: self.config.clone(),
            app: Arc::clone(&self.app),
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
            connections: Arc::clone(&self.connections),
            shutdown: Arc::clone(&self.shutdown),
            connection_callback: self.connection_callback.clone(),
            connector,
            control_rx,
        };

        let handle = std::thread::Builder::new()
            .name("gattling-worker".to_string())
            .spawn(move || run_worker(context))
            .map_err(|err| BusError::failed(format!("unable to spawn worker thread: {err}")))?;
        *self.worker.lock().expect("worker mutex poisoned") = Some(handle);

        let initialized = self
            .state
            .wait_for(self.config.init_timeout, |run_state| {
                run_state > ServerRunState::Initializing
            });

        if !initialized {
            error!(
                timeout_ms = self.config.init_timeout.as_millis() as u64,
                "initialization timed out"
            );
            self.state.set_health(ServerHealth::FailedInit);
            self.shutdown.trigger();
            self.wait();
            return Err(BusError::timeout("server initialization timed out"));
        }

        if self.state.run_state() != ServerRunState::Running {
            // The worker stopped on its own: a fatal initialization failure.
            self.wait();
            return Err(BusError::failed(format!(
                "server initialization failed ({})",
                self.state.health()
            )));
        }

        info!("peripheral server running");
        Ok(())
    }

    /// Ask the server to stop. Non-blocking and callable from any thread;
    /// repeat calls while already stopping are ignored with a warning.
    pub fn trigger_shutdown(&self) {
        let run_state = self.state.run_state();
        if run_state.is_stopping_or_stopped() {
            warn!(state = %run_state, "shutdown requested but server is already stopping");
            return;
        }

        info!("shutdown requested");
        self.state.set_run_state(ServerRunState::Stopping);
        self.shutdown.trigger();
    }

    /// Join the worker thread. Idempotent: joining a server that never
    /// started, or joining twice, is a warning rather than an error.
    pub fn wait(&self) {
        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("worker thread panicked");
                    self.state.set_health(ServerHealth::FailedRun);
                    self.state.set_run_state(ServerRunState::Stopped);
                }
            }
            None => warn!("wait called but there is no worker thread to join"),
        }
    }

    pub fn shutdown_and_wait(&self) {
        self.trigger_shutdown();
        self.wait();
    }

    pub fn run_state(&self) -> ServerRunState {
        self.state.run_state()
    }

    pub fn health(&self) -> ServerHealth {
        self.state.health()
    }

    pub fn is_running(&self) -> bool {
        self.state.run_state() == ServerRunState::Running
    }

    /// Number of currently connected remote devices. Lock-free.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Update Queue Producers
    // ------------------------------------------------------------------

    /// Queue an update notification for any (path, interface) pair.
    pub fn push_update(&self, object_path: &str, interface_name: &str) {
        self.queue.push(object_path, interface_name);
    }

    /// Queue an update for a characteristic by object path.
    pub fn notify_characteristic_updated(&self, object_path: &str) {
        self.push_update(object_path, GATT_CHARACTERISTIC_IFACE);
    }

    /// Queue an update for a descriptor by object path.
    pub fn notify_descriptor_updated(&self, object_path: &str) {
        self.push_update(object_path, GATT_DESCRIPTOR_IFACE);
    }

    pub fn update_queue(&self) -> Arc<UpdateQueue> {
        Arc::clone(&self.queue)
    }

    // ------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------

    /// Turn advertising on or off, blocking the calling thread until the
    /// final outcome (bounded to 20 s). Background retries under the
    /// advertising policy happen transparently before the bound expires.
    /// Must be called off the worker thread; the async path is what the
    /// server itself uses internally.
    pub fn set_advertising(&self, enabled: bool) -> BusResult<()> {
        let control_tx = self
            .control_tx
            .lock()
            .expect("control mutex poisoned")
            .clone()
            .ok_or_else(|| BusError::not_ready("server not started"))?;

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        control_tx
            .send(ControlRequest::SetAdvertising {
                enabled,
                reply: reply_tx,
            })
            .map_err(|_| BusError::not_ready("server worker is not running"))?;

        reply_rx
            .recv_timeout(SET_ADVERTISING_TIMEOUT)
            .map_err(|_| BusError::timeout("advertising change did not complete in time"))?
    }
}

impl Drop for PeripheralServer {
    fn drop(&mut self) {
        if !self.state.run_state().is_stopping_or_stopped()
            && self.state.run_state() != ServerRunState::Uninitialized
        {
            self.trigger_shutdown();
        }
        self.wait_quietly();
    }
}

impl PeripheralServer {
    fn wait_quietly(&self) {
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct WorkerContext {
    config: ServerConfig,
    app: Arc<GattApplication>,
    state: Arc<StateCell>,
    queue: Arc<UpdateQueue>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownSignal>,
    connection_callback: Option<ConnectionCallback>,
    connector: BusConnector,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
}

fn run_worker(context: WorkerContext) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "unable to build worker runtime");
            context.state.set_health(ServerHealth::FailedInit);
            context.state.set_run_state(ServerRunState::Stopped);
            return;
        }
    };

    runtime.block_on(worker_loop(context));
}

/// The single-threaded event loop. All adapter, advertisement and
/// registration state is owned here; nothing else writes it.
async fn worker_loop(mut context: WorkerContext) {
    context.state.set_run_state(ServerRunState::Initializing);

    let (signal_tx, mut signal_rx): (_, BusSignalReceiver) = mpsc::unbounded_channel();
    let mut adapter = AdapterManager::new(
        context.config.advertisement_path(),
        context.config.retry_policy,
        context.config.advertising_retry_policy,
        context.config.preferred_adapter.clone(),
        signal_tx.clone(),
        context.connection_callback.clone(),
        Arc::clone(&context.connections),
    );
    let mut processor = InitProcessor::new(
        context.config.clone(),
        Arc::clone(&context.app),
        context.connector.clone(),
        signal_tx,
    );

    let mut periodic = tokio::time::interval(PERIODIC_TICK);
    periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut update_tick = tokio::time::interval(UPDATE_TICK);
    update_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'run: loop {
        // Drive the processor until it settles: fully running, waiting out a
        // retry, or dead.
        loop {
            match processor.step(&mut adapter, &context.state).await {
                StepOutcome::Advanced => continue,
                StepOutcome::Idle | StepOutcome::RetryScheduled => break,
                StepOutcome::Fatal => {
                    error!("fatal initialization failure, stopping worker");
                    break 'run;
                }
            }
        }

        if context.shutdown.requested() {
            break;
        }

        let manager_deadline = adapter.next_deadline();
        tokio::select! {
            _ = context.shutdown.notified() => break,

            signal = signal_rx.recv() => {
                if let Some(signal) = signal {
                    debug!(signal = ?signal, "bus signal");
                    adapter.handle_signal(&signal);
                    processor.handle_signal(&signal);
                }
            }

            request = context.control_rx.recv() => match request {
                Some(request) => handle_control(request, &mut adapter).await,
                // The server handle is gone; nobody is left to stop us.
                None => break,
            },

            _ = periodic.tick() => {
                processor.poll_retry();
            }

            _ = async {
                // Deadline is checked by the branch guard.
                tokio::time::sleep_until(manager_deadline.unwrap_or_else(tokio::time::Instant::now)).await
            }, if manager_deadline.is_some() => {
                adapter.poll().await;
            }

            _ = update_tick.tick() => {
                process_one_update(&context, &processor).await;
            }
        }
    }

    // Teardown, in reverse of bring-up: stop advertising and drop every
    // pending timer before the registrations, registrations before the bus
    // handle.
    context.state.set_run_state(ServerRunState::Stopping);
    if let Some(bus) = processor.bus() {
        adapter.teardown_advertisement(&bus).await;
    }
    adapter.shutdown();
    processor.uninit().await;
    context.state.set_run_state(ServerRunState::Stopped);
    info!("peripheral server stopped");
}

async fn handle_control(request: ControlRequest, adapter: &mut AdapterManager) {
    match request {
        ControlRequest::SetAdvertising { enabled, reply } => {
            adapter
                .set_advertising_async(
                    enabled,
                    Box::new(move |result| {
                        // The caller may have timed out and gone away.
                        let _ = reply.send(result);
                    }),
                )
                .await;
        }
    }
}

/// One update-queue entry per tick, only while Running. Empty ticks are
/// cheap no-ops so the loop stays responsive to bus events.
async fn process_one_update(context: &WorkerContext, processor: &InitProcessor) {
    if context.state.run_state() != ServerRunState::Running {
        return;
    }
    let Some(entry) = context.queue.pop(false) else {
        return;
    };

    match context
        .app
        .run_update_handler(&entry.object_path, &entry.interface_name)
    {
        None => {
            warn!(
                path = %entry.object_path,
                interface = %entry.interface_name,
                "update for unknown object dropped"
            );
        }
        Some(None) => {}
        Some(Some(value)) => {
            let Some(bus) = processor.bus() else { return };
            debug!(path = %entry.object_path, len = value.len(), "notifying updated value");
            if let Err(err) = bus
                .notify_characteristic_value(&entry.object_path, value)
                .await
            {
                warn!(path = %entry.object_path, error = %err, "value notification failed");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
