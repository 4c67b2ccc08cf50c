//! Server state, health and host-stack record types

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Run State and Health
// ----------------------------------------------------------------------------

/// Lifecycle state of the peripheral server.
///
/// States advance in declaration order. The only permitted skip is
/// `Initializing` directly to `Stopped` when initialization fails fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerRunState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl ServerRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRunState::Uninitialized => "Uninitialized",
            ServerRunState::Initializing => "Initializing",
            ServerRunState::Running => "Running",
            ServerRunState::Stopping => "Stopping",
            ServerRunState::Stopped => "Stopped",
        }
    }

    /// True once shutdown has begun.
    pub fn is_stopping_or_stopped(self) -> bool {
        self >= ServerRunState::Stopping
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerRunState::Uninitialized,
            1 => ServerRunState::Initializing,
            2 => ServerRunState::Running,
            3 => ServerRunState::Stopping,
            _ => ServerRunState::Stopped,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ServerRunState::Uninitialized => 0,
            ServerRunState::Initializing => 1,
            ServerRunState::Running => 2,
            ServerRunState::Stopping => 3,
            ServerRunState::Stopped => 4,
        }
    }
}

impl std::fmt::Display for ServerRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of the server, readable after shutdown to tell a graceful stop
/// from a failed one. Sticky: once failed, only a fresh server resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerHealth {
    Ok,
    FailedInit,
    FailedRun,
}

impl ServerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerHealth::Ok => "Ok",
            ServerHealth::FailedInit => "Failed initialization",
            ServerHealth::FailedRun => "Failed run",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerHealth::Ok,
            1 => ServerHealth::FailedInit,
            _ => ServerHealth::FailedRun,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ServerHealth::Ok => 0,
            ServerHealth::FailedInit => 1,
            ServerHealth::FailedRun => 2,
        }
    }
}

impl std::fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// State Cell
// ----------------------------------------------------------------------------

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Shared run-state/health cell.
///
/// Reads go through atomics so any thread (including signal-handler-adjacent
/// contexts) can sample the state without locking; writes additionally take
/// the mutex and notify the condvar so `start()` can block on a transition.
#[derive(Debug)]
pub struct StateCell {
    run_state: AtomicU8,
    health: AtomicU8,
    changed: Mutex<()>,
    condvar: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            run_state: AtomicU8::new(ServerRunState::Uninitialized.as_u8()),
            health: AtomicU8::new(ServerHealth::Ok.as_u8()),
            changed: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn run_state(&self) -> ServerRunState {
        ServerRunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    pub fn health(&self) -> ServerHealth {
        ServerHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_run_state(&self, new_state: ServerRunState) {
        let old = self.run_state();
        if old == new_state {
            return;
        }
        tracing::info!(from = old.as_str(), to = new_state.as_str(), "server run state changed");
        let _guard = self.changed.lock().expect("state mutex poisoned");
        self.run_state.store(new_state.as_u8(), Ordering::Release);
        self.condvar.notify_all();
    }

    pub fn set_health(&self, new_health: ServerHealth) {
        let old = self.health();
        if old == new_health {
            return;
        }
        tracing::info!(from = old.as_str(), to = new_health.as_str(), "server health changed");
        self.health.store(new_health.as_u8(), Ordering::Release);
    }

    /// Block until `predicate` holds for the run state, or `timeout` elapses.
    /// Returns whether the predicate held on exit.
    pub fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(ServerRunState) -> bool,
    ) -> bool {
        let guard = self.changed.lock().expect("state mutex poisoned");
        let (_guard, result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |_| !predicate(self.run_state()))
            .expect("state mutex poisoned");
        !result.timed_out() || predicate(self.run_state())
    }
}

// ----------------------------------------------------------------------------
// Host Stack Records
// ----------------------------------------------------------------------------

/// Snapshot of one Bluetooth adapter as discovered from the host stack.
///
/// Not live-bound: re-discover to observe changes, except the connected
/// device set which is tracked through bus signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub path: String,
    pub address: String,
    pub name: String,
    pub alias: String,
    pub powered: bool,
    pub discoverable: bool,
    pub connectable: bool,
    pub pairable: bool,
    pub discovering: bool,
    pub uuids: Vec<String>,
}

/// A remote device as tracked from bus signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    pub address: String,
    pub name: String,
    pub alias: String,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    pub rssi: i16,
    pub uuids: Vec<String>,
}

/// Host-stack feature detection, computed once after adapter selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BluezCapabilities {
    pub has_advertising_manager: bool,
    pub has_gatt_manager: bool,
    pub has_acquire_write: bool,
    pub has_acquire_notify: bool,
    pub has_extended_advertising: bool,
    pub version: String,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
