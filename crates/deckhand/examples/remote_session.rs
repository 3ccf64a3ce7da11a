//! Basic usage example for Deckhand
//!
//! This example demonstrates the core functionality of Deckhand including:
//! - Supervised connect/disconnect
//! - Executing commands on persistent logical channels
//! - The ephemeral exec path
//! - Observing lifecycle events

use std::error::Error;
use std::time::Duration;

use deckhand::{ExecuteOptions, LinkEvent, Supervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing for better debugging
    tracing_subscriber::fmt::init();

    println!("Deckhand Remote Session Example");
    println!("===============================");

    // Replace with your actual desktop's SSH details.
    let host = std::env::args().nth(1).unwrap_or_else(|| "desk.local".to_string());
    let user = std::env::var("DECKHAND_USER").unwrap_or_else(|_| "media".to_string());
    let pass = std::env::var("DECKHAND_PASS").unwrap_or_default();

    let (supervisor, mut events) = Supervisor::new(SupervisorConfig::default());

    // Lifecycle events arrive on a push stream; a UI would drive its
    // reconnect affordance from these.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::StateChanged(state) => println!("   [state] {:?}", state),
                LinkEvent::ConnectionLost(reason) => {
                    println!("   [lost] reason: {:?}", reason)
                }
            }
        }
    });

    println!("Connecting to {}@{} ...", user, host);
    supervisor.connect(&host, &user, &pass).await?;
    println!("Connected.");

    // Commands for the same application share one persistent channel and
    // resolve strictly in submission order.
    let volume = supervisor
        .execute(
            "osascript -e 'output volume of (get volume settings)'",
            ExecuteOptions::default()
                .with_channel("system")
                .with_description("get volume"),
        )
        .await?;
    println!("System volume: {}", volume);

    supervisor
        .execute(
            "osascript -e 'set volume output volume 40'",
            ExecuteOptions::default()
                .with_channel("system")
                .with_description("set volume"),
        )
        .await?;
    println!("Volume set.");

    // A one-off command with no channel key runs on an ephemeral exec
    // channel instead.
    let uptime = supervisor
        .execute("uptime", ExecuteOptions::default())
        .await?;
    println!("Desktop uptime: {}", uptime);

    // Let a couple of heartbeat cycles run before shutting down.
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("Disconnecting ...");
    supervisor.disconnect().await;
    println!("Done.");

    Ok(())
}
