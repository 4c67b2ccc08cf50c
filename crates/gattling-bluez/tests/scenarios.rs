//! End-to-end server scenarios against the in-memory mock bus.
//!
//! These drive the full stack: `PeripheralServer` worker thread, the
//! initialization state processor, adapter/advertising management and the
//! update queue, with the mock standing in for bluetoothd.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gattling_bluez::testing::{mock_connector, MockBus};
use gattling_bluez::{
    bluetooth_uuid, BusSignal, DataGetter, DataSetter, ErrorKind, GattApplication,
    GattCharacteristic, GattService, PeripheralServer, PropValue, RetryPolicy, ServerConfig,
    ServerHealth, ServerRunState,
};

const ADAPTER: &str = "/org/bluez/hci0";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const LEVEL_PATH: &str = "/com/gattling/battery/level";

fn battery_app() -> GattApplication {
    let getter: DataGetter = Arc::new(|name| (name == "level").then(|| vec![87u8]));
    let setter: DataSetter = Arc::new(|_, _| true);

    GattApplication::new("/com/gattling", getter, setter).service(
        GattService::new("battery", bluetooth_uuid(0x180F)).characteristic(
            GattCharacteristic::new("level", bluetooth_uuid(0x2A19), &["read", "notify"])
                .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default()))
                .on_update(|ctx| ctx.get_own()),
        ),
    )
}

fn server(config: ServerConfig) -> PeripheralServer {
    PeripheralServer::new(config, battery_app()).expect("valid configuration")
}

/// Poll `predicate` until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn start_fails_after_timeout_when_no_adapters_reachable() {
    let mock = Arc::new(MockBus::new());
    let mut config = ServerConfig::new("gattling");
    config.init_timeout = Duration::from_millis(300);
    let server = server(config);

    let started = Instant::now();
    let err = server.start(mock_connector(mock)).unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(server.health(), ServerHealth::FailedInit);
    assert_eq!(server.run_state(), ServerRunState::Stopped);
}

#[test]
fn fatal_bus_failure_fails_start_before_the_timeout() {
    let mock = Arc::new(MockBus::new());
    mock.fail_next("connect", ErrorKind::ConnectionFailed);
    let mut config = ServerConfig::new("gattling");
    config.init_timeout = Duration::from_secs(10);
    let server = server(config);

    let started = Instant::now();
    let err = server.start(mock_connector(mock)).unwrap_err();

    // No bus means no recovery path: this does not wait out the timeout.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.kind, ErrorKind::Failed);
    assert_eq!(server.health(), ServerHealth::FailedInit);
    assert_eq!(server.run_state(), ServerRunState::Stopped);
}

#[test]
fn happy_path_reaches_running_and_delivers_one_update() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let server = server(ServerConfig::new("gattling"));

    server.start(mock_connector(Arc::clone(&mock))).unwrap();
    assert!(server.is_running());
    assert!(mock.owns_name("com.gattling"));
    assert!(mock.is_application_registered());
    // Root object manager, battery service, level characteristic.
    assert_eq!(mock.exported_gatt_objects().len(), 3);
    assert!(mock.is_advertisement_registered("/com/gattling/advertisement0"));

    server.notify_characteristic_updated(LEVEL_PATH);
    assert!(wait_until(Duration::from_secs(2), || {
        mock.notifications().len() == 1
    }));
    assert_eq!(
        mock.notifications(),
        vec![(LEVEL_PATH.to_string(), vec![87u8])]
    );
    assert!(server.update_queue().is_empty());

    server.shutdown_and_wait();
    assert_eq!(server.run_state(), ServerRunState::Stopped);
    assert_eq!(server.health(), ServerHealth::Ok);
    assert!(mock.exported_gatt_objects().is_empty());
    assert!(!mock.is_application_registered());
    assert!(!mock.owns_name("com.gattling"));
}

#[test]
fn second_start_is_rejected() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let server = server(ServerConfig::new("gattling"));

    server.start(mock_connector(Arc::clone(&mock))).unwrap();
    let err = server.start(mock_connector(mock)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InProgress);

    server.shutdown_and_wait();
}

#[test]
fn advertising_retries_transient_timeouts_until_success() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let mut config = ServerConfig::new("gattling");
    config.enable_advertising = false;
    config.advertising_retry_policy = RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    };
    let server = server(config);
    server.start(mock_connector(Arc::clone(&mock))).unwrap();
    assert_eq!(mock.register_advertisement_calls(), 0);

    // Three transient failures, then success on the fourth attempt. The
    // blocking wrapper returns once, with the final outcome.
    mock.fail_times("register_advertisement", ErrorKind::Timeout, 3);
    server.set_advertising(true).unwrap();
    assert_eq!(mock.register_advertisement_calls(), 4);
    assert!(mock.is_advertisement_registered("/com/gattling/advertisement0"));

    server.shutdown_and_wait();
    // No retry state survived the success.
    assert_eq!(mock.register_advertisement_calls(), 4);
}

#[test]
fn advertising_retry_exhaustion_reports_the_last_error() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let mut config = ServerConfig::new("gattling");
    config.enable_advertising = false;
    config.advertising_retry_policy = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 10,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    };
    let server = server(config);
    server.start(mock_connector(Arc::clone(&mock))).unwrap();

    mock.fail_times("register_advertisement", ErrorKind::Timeout, 10);
    let err = server.set_advertising(true).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    // Initial attempt plus the policy's retry budget.
    assert_eq!(mock.register_advertisement_calls(), 3);

    server.shutdown_and_wait();
}

#[test]
fn shutdown_cancels_a_pending_advertising_retry() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    // Every registration attempt fails, so a retry is always pending.
    mock.fail_times("register_advertisement", ErrorKind::Timeout, 50);
    let mut config = ServerConfig::new("gattling");
    config.advertising_retry_policy = RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 100,
        max_delay_ms: 200,
        backoff_multiplier: 2.0,
    };
    let server = server(config);

    // A peripheral that cannot advertise still starts and runs.
    server.start(mock_connector(Arc::clone(&mock))).unwrap();
    assert!(server.is_running());

    server.shutdown_and_wait();
    assert_eq!(server.run_state(), ServerRunState::Stopped);
    assert_eq!(server.health(), ServerHealth::Ok);

    // The cancelled timer must never fire into torn-down state.
    let calls_at_shutdown = mock.register_advertisement_calls();
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(mock.register_advertisement_calls(), calls_at_shutdown);
}

#[test]
fn repeated_shutdown_and_wait_are_idempotent() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let server = server(ServerConfig::new("gattling"));
    server.start(mock_connector(mock)).unwrap();

    server.trigger_shutdown();
    server.trigger_shutdown();
    server.wait();
    server.wait();
    assert_eq!(server.run_state(), ServerRunState::Stopped);
    assert_eq!(server.health(), ServerHealth::Ok);
}

#[test]
fn connection_count_tracks_device_signals() {
    let mock = Arc::new(MockBus::with_powered_adapter(ADAPTER));
    let server = server(ServerConfig::new("gattling"));
    server.start(mock_connector(Arc::clone(&mock))).unwrap();
    assert_eq!(server.connection_count(), 0);

    let device = format!("{ADAPTER}/dev_AA_BB_CC_DD_EE_FF");
    let mut props = std::collections::HashMap::new();
    props.insert("Connected".to_string(), PropValue::Bool(true));
    props.insert(
        "Address".to_string(),
        PropValue::Str("AA:BB:CC:DD:EE:FF".to_string()),
    );
    mock.emit(BusSignal::PropertiesChanged {
        object_path: device.clone(),
        interface: DEVICE_IFACE.to_string(),
        changed: props,
    });
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 1
    }));

    let mut props = std::collections::HashMap::new();
    props.insert("Connected".to_string(), PropValue::Bool(false));
    mock.emit(BusSignal::PropertiesChanged {
        object_path: device,
        interface: DEVICE_IFACE.to_string(),
        changed: props,
    });
    assert!(wait_until(Duration::from_secs(2), || {
        server.connection_count() == 0
    }));

    server.shutdown_and_wait();
}
