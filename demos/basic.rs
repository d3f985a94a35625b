//! Minimal host application wiring for the gateway protocol client.
//!
//! Run against a real gateway with:
//! ```bash
//! GATEWAY_URL=wss://gw.local/ws GATEWAY_USER=op GATEWAY_PASS=hunter2 cargo run --example basic
//! ```

use std::env;

use gateway_client::{ClientConfig, GatewayFacade, Manager};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let url = env::var("GATEWAY_URL").unwrap_or_else(|_| "wss://gw.local/ws".into());
    let username = env::var("GATEWAY_USER").unwrap_or_else(|_| "op".into());
    let password = env::var("GATEWAY_PASS").unwrap_or_else(|_| "hunter2".into());

    let manager = Manager::new(ClientConfig::default());
    let facade = GatewayFacade::new(manager.clone(), "gw-1");

    // Subscribe before connecting so the handshake's own transitions aren't
    // missed.
    let mut events = facade.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("gw-1 event: {event:?}");
        }
    });

    if let Err(e) = facade.connect(url, username, password).await {
        eprintln!("connect failed: {e}");
        return;
    }

    println!("status: {:?}", facade.status());

    match facade.fetch_connected_sensors().await {
        Ok(sensors) => println!("{} sensor(s) connected", sensors.len()),
        Err(e) => eprintln!("fetch_connected_sensors failed: {e}"),
    }

    for sensor in facade.connected_sensors() {
        match facade.take_battery_reading(sensor.serial).await {
            Ok(reading) => println!("sensor {}: battery {}%", sensor.serial, reading.percent),
            Err(e) => eprintln!("battery reading for {} failed: {e}", sensor.serial),
        }
    }

    facade.disconnect().await;
}
