//! Example: Poll a VRCOP Z-Wave interface and print field updates.

use framelink::units::device_info::DeviceCatalog;
use framelink::{spawn_driver, DriverConfig, DriverEvent, FieldValue, Unit};
use tokio::time::{interval, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = DriverConfig::builder()
        .name("zwave")
        .serial("/dev/ttyUSB0", 9600)
        .active_poll_interval_ms(60_000)
        .build();
    let (driver, task) = spawn_driver(config);

    let catalog = DeviceCatalog::builtin();
    for (id, name, key) in [(4, "Lamp", "dimmer"), (6, "Porch", "binary-switch"), (9, "Door", "door-sensor")] {
        let mut unit = Unit::new(id, name);
        if let Some(info) = catalog.get(key) {
            unit.apply_device_info(info);
        }
        driver.configure_unit(unit).await?;
    }

    let fields = driver.register_fields(1).await?;
    println!("--- Fields ({}) ---", fields.len());
    for (i, def) in fields.iter().enumerate() {
        println!("  {:3}: {:24} {:?} {:?}", i + 1, def.name, def.kind, def.access);
    }

    let mut events = driver.subscribe();
    let names: Vec<String> = fields.iter().map(|d| d.name.clone()).collect();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DriverEvent::FieldChanged { field, value } => {
                    let name = (field as usize)
                        .checked_sub(1)
                        .and_then(|i| names.get(i))
                        .map(String::as_str)
                        .unwrap_or("?");
                    println!("  {name} = {value}");
                }
                DriverEvent::UnitAwake { unit } => println!("  unit {unit} woke up"),
                DriverEvent::ConnectionLost { reason } => println!("  connection lost: {reason}"),
                other => println!("  {other:?}"),
            }
        }
    });

    // Turn the lamp on to half brightness
    let result = driver.write_field(1, FieldValue::Card(50)).await?;
    println!("Lamp write: {result:?}");

    println!("\nPolling, press Ctrl+C to stop...");
    let mut ticker = interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                driver.poll().await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Stats: {:?}", driver.stats().await?);
    driver.shutdown();
    task.await?;
    println!("Disconnected.");
    Ok(())
}
