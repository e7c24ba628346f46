//! Discovers renderers on the local network and prints lifecycle events.
//!
//! Runs every adapter (DLNA, DIAL, Chromecast) for 30 seconds, printing
//! devices as they appear and disappear, then dumps the final table.
//!
//! Usage:
//!   cargo run --example discover
//!   RUST_LOG=omnicast=debug cargo run --example discover

use std::sync::Arc;
use std::time::Duration;

use omnicast::adapters::{
    ChromecastAdapter, ChromecastConfig, DialAdapter, DialConfig, DlnaAdapter, DlnaConfig,
};
use omnicast::{DeviceEvent, Registry, RegistryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let registry = Registry::new(RegistryConfig::default());
    registry.add_adapter(Arc::new(DlnaAdapter::new(DlnaConfig::default())));
    registry.add_adapter(Arc::new(DialAdapter::new(DialConfig::default())));
    registry.add_adapter(Arc::new(ChromecastAdapter::new(ChromecastConfig::default())));

    // Keep the subscription alive for the whole run; dropping it unsubscribes.
    let _sub = registry.subscribe(|event| match event {
        DeviceEvent::Added { device, .. } => {
            println!("+ {} [{}] {}", device.name, device.transport, device.id);
        }
        DeviceEvent::Removed { id, reason, .. } => {
            println!("- {} ({})", id, reason.as_deref().unwrap_or("gone"));
        }
        _ => {}
    });

    registry.start().await?;
    println!("Discovering for 30 seconds...");
    tokio::time::sleep(Duration::from_secs(30)).await;

    let devices = registry.list_devices();
    println!("\n{} device(s) discovered:", devices.len());
    for device in &devices {
        println!(
            "- [{}] {} | {} | caps={:?}",
            device.id,
            device.name,
            device.model.as_deref().unwrap_or("unknown model"),
            device.capabilities
        );
    }

    registry.stop().await?;
    Ok(())
}
