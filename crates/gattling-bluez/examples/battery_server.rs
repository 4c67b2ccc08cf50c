//! Standalone battery/device-info peripheral
//!
//! Runs a GATT server against the real bluetoothd on the system bus:
//! a Battery service whose level drains over time, a Device Information
//! service, and a writable text characteristic that echoes what a central
//! writes. Needs a Bluetooth adapter and bus permissions (run as root or add
//! a D-Bus policy for `com.gattling`).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gattling_bluez::{
    bluetooth_uuid, system_connector, DataGetter, DataSetter, GattApplication, GattCharacteristic,
    GattDescriptor, GattService, PeripheralServer, ServerConfig,
};
use uuid::Uuid;

const TEXT_SERVICE_UUID: Uuid = Uuid::from_u128(0x1E4F_9C2D_7A83_4B61_9D55_3F20_8A6B_41C7);
const TEXT_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x1E4F_9C2E_7A83_4B61_9D55_3F20_8A6B_41C7);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // The application-side data store the server reads and writes through
    // its callbacks.
    let battery_level = Arc::new(AtomicU8::new(100));
    let text = Arc::new(Mutex::new(b"Hello over GATT".to_vec()));

    let getter: DataGetter = {
        let battery_level = Arc::clone(&battery_level);
        let text = Arc::clone(&text);
        Arc::new(move |name| match name {
            "level" => Some(vec![battery_level.load(Ordering::Relaxed)]),
            "manufacturer" => Some(b"Acme Peripherals".to_vec()),
            "model" => Some(b"GATTLING-1".to_vec()),
            "text" => Some(text.lock().expect("text mutex poisoned").clone()),
            _ => None,
        })
    };
    let setter: DataSetter = {
        let text = Arc::clone(&text);
        Arc::new(move |name, data| match name {
            "text" => {
                *text.lock().expect("text mutex poisoned") = data.to_vec();
                true
            }
            _ => false,
        })
    };

    let config = ServerConfig::new("gattling.demo");
    let app = GattApplication::new(config.root_path(), getter, setter)
        .service(
            GattService::new("battery", bluetooth_uuid(0x180F)).characteristic(
                GattCharacteristic::new("level", bluetooth_uuid(0x2A19), &["read", "notify"])
                    .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default()))
                    .on_update(|ctx| ctx.get_own())
                    .descriptor(
                        GattDescriptor::new("description", bluetooth_uuid(0x2901), &["read"])
                            .on_read(|_| Ok(b"Battery level 0-100%".to_vec())),
                    ),
            ),
        )
        .service(
            GattService::new("device_info", bluetooth_uuid(0x180A))
                .characteristic(
                    GattCharacteristic::new("manufacturer", bluetooth_uuid(0x2A29), &["read"])
                        .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default())),
                )
                .characteristic(
                    GattCharacteristic::new("model", bluetooth_uuid(0x2A24), &["read"])
                        .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default())),
                ),
        )
        .service(
            GattService::new("text", TEXT_SERVICE_UUID).characteristic(
                GattCharacteristic::new("text", TEXT_CHARACTERISTIC_UUID, &["read", "write"])
                    .on_read(|ctx| Ok(ctx.get_own().unwrap_or_default()))
                    .on_write(|ctx, data| {
                        ctx.set("text", data);
                        Ok(())
                    }),
            ),
        );

    let level_path = format!("{}/battery/level", config.root_path());

    let mut config = config;
    config.advertising_name = "Gattling Demo".to_string();
    config.advertising_short_name = "Gattling".to_string();

    let server = PeripheralServer::new(config, app)?
        .with_connection_callback(|connected, device| {
            if connected {
                println!("central connected: {device}");
            } else {
                println!("central disconnected: {device}");
            }
        });

    server.start(system_connector())?;
    println!("peripheral running; press Ctrl-C to stop");

    // Drain the battery and push a change notification every few seconds
    // until interrupted.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut drain = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = drain.tick() => {
                    let level = battery_level.load(Ordering::Relaxed);
                    let next = if level == 0 { 100 } else { level - 1 };
                    battery_level.store(next, Ordering::Relaxed);
                    server.notify_characteristic_updated(&level_path);
                }
            }
        }
    });

    println!("stopping");
    server.shutdown_and_wait();
    Ok(())
}
