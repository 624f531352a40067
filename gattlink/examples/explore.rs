use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gattlink::fake::{FakeCharacteristic, FakeDevice, FakeService, FakeTransport};
use gattlink::records::{CharacteristicRecord, ServiceRecord};
use gattlink::transport::Filter;
use gattlink::uuid::{uuid_from_u16, BluetoothUuid};
use gattlink::{DeviceAddress, SessionConfig};
use log::info;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
const HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A37);
const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180F);
const BATTERY_LEVEL_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A19);

// A couple of pretend peripherals standing in for a real radio
fn create_transport() -> Arc<FakeTransport> {
    let transport = Arc::new(FakeTransport::new());

    let heart_rate = FakeService::new(HEART_RATE_SERVICE_UUID)
        .with_characteristic(FakeCharacteristic::new(HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID)
            .with_description("Heart Rate Measurement"));
    let battery = FakeService::new(BATTERY_SERVICE_UUID)
        .with_characteristic(FakeCharacteristic::new(BATTERY_LEVEL_CHARACTERISTIC_UUID)
            .with_value(&[93]));

    transport.add_device(FakeDevice::new("C0:FF:EE:00:00:01".parse().unwrap_or_default())
                             .with_name("HRM")
                             .with_service(heart_rate)
                             .with_service(battery.clone()));
    transport.add_device(FakeDevice::new("C0:FF:EE:00:00:02".parse().unwrap_or_default())
                             .with_name("Tag")
                             .with_service(battery));
    transport
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Info) // Default Log Level
                         .parse_default_env()
                         .init();

    let transport = create_transport();

    let mut config = SessionConfig::new(transport.clone());
    config.set_shutdown_grace(Some(Duration::from_secs(1)))
          .on_notification(|notification| {
              println!("Notification from {}: {:?}", notification.address, notification.value);
          });
    let session = config.start().await?;

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    session.start_scan(Filter::new(),
                       move |advertisement| {
                           println!("{} rssi={} tx_power={} name={:?}",
                                    advertisement.address,
                                    advertisement.rssi,
                                    advertisement.tx_power,
                                    advertisement.name.as_str());
                           let _ = found_tx.send(advertisement.address);
                       },
                       || println!("scan stopped"))
           .await?;
    println!("scan started");

    for address in ["C0:FF:EE:00:00:01", "C0:FF:EE:00:00:02"] {
        let address: DeviceAddress = address.parse()?;
        for rssi in [-60, -62] {
            transport.advertise_device(address, rssi);
        }
    }

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        let address = match found_rx.recv().await {
            Some(address) => address,
            None => break,
        };
        if !seen.insert(address) {
            continue;
        }

        let (tx, rx) = oneshot::channel();
        session.enumerate_services(address.as_u64(), move |services: &[ServiceRecord]| {
                   let _ = tx.send(services.to_vec());
               });
        let services = rx.await?;

        let mut report = format!("{} >>> {} service(s)\n", address, services.len());
        for service in services {
            report += &format!("- {}\n", service.uuid.short());

            let (tx, rx) = oneshot::channel();
            session.enumerate_characteristics(address.as_u64(), service.uuid,
                                              move |characteristics: &[CharacteristicRecord]| {
                                                  let _ = tx.send(characteristics.to_vec());
                                              });
            for characteristic in rx.await? {
                report += &format!("  {} ({})\n", characteristic.uuid.short(),
                                   characteristic.description);
            }
        }
        println!("{}", report);

        if services_include_heart_rate(&session, address).await {
            let (tx, rx) = oneshot::channel();
            session.subscribe(address.as_u64(), HEART_RATE_SERVICE_UUID,
                              HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID,
                              move |ok| {
                                  let _ = tx.send(ok);
                              });
            if rx.await? {
                for bpm in [72u8, 75, 71] {
                    transport.notify(address, HEART_RATE_SERVICE_UUID,
                                     HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID, &[0, bpm]);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        session.read_bytes(address.as_u64(), BATTERY_SERVICE_UUID,
                           BATTERY_LEVEL_CHARACTERISTIC_UUID,
                           move |value| {
                               let _ = tx.send(value.map(|v| v.to_vec()));
                           });
        match rx.await? {
            Some(value) => println!("{} battery level: {:?}", address, value),
            None => println!("{} battery level: unavailable", address),
        }
    }

    session.stop_scan().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("Shutting down");
    session.shutdown().await;

    Ok(())
}

async fn services_include_heart_rate(session: &gattlink::Session, address: DeviceAddress) -> bool {
    match session.pipeline().services(address).await {
        Ok(services) => services.iter().any(|s| s.uuid == HEART_RATE_SERVICE_UUID),
        Err(_) => false,
    }
}
