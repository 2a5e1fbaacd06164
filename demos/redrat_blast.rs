//! Example: Blast an IR signal through a RedRat, then learn a new one.

use framelink::{spawn_driver, DriverConfig, DriverEvent, DriverKind, FieldValue};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let signal = std::env::args().nth(1).unwrap_or_else(|| "TV-POWER".to_string());

    let config = DriverConfig::builder()
        .name("IR")
        .kind(DriverKind::Redrat)
        .tcp("192.168.0.120", 4001)
        .build();
    let (driver, task) = spawn_driver(config);

    // Firmware, Blast, Learn, LastLearned
    let fields = driver.register_fields(1).await?;
    let mut events = driver.subscribe();

    let result = driver.write_field(2, FieldValue::String(signal.clone())).await?;
    println!("Blast {signal}: {result:?}");

    println!("Point a remote at the RedRat and press a button...");
    driver.write_field(3, FieldValue::Bool(true)).await?;
    for _ in 0..40 {
        driver.poll().await?;
        while let Ok(event) = events.try_recv() {
            if let DriverEvent::FieldChanged { field, value } = event {
                println!("  {} = {}", fields[(field - 1) as usize].name, value);
                if field == 4 {
                    println!("Learned.");
                }
            }
        }
        sleep(Duration::from_millis(250)).await;
    }
    driver.write_field(3, FieldValue::Bool(false)).await?;

    driver.shutdown();
    task.await?;
    Ok(())
}
