//! Casts a local media file to a renderer on the network.
//!
//! Discovers devices for 10 seconds, picks the requested one (or the first
//! found), serves the file over the embedded HTTP server and sends it.
//! Playback runs for 60 seconds, then the session is stopped.
//!
//! Usage:
//!   cargo run --example cast_file -- <path> [device-id]
//!   cargo run --example cast_file -- track.flac
//!   cargo run --example cast_file -- movie.mp4 uuid:12345678-90ab-cdef-1234-567890abcdef

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use omnicast::adapters::{ChromecastAdapter, ChromecastConfig, DlnaAdapter, DlnaConfig};
use omnicast::{MediaPayload, Registry, RegistryConfig, SendOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next().map(PathBuf::from) else {
        eprintln!("Usage: cargo run --example cast_file -- <path> [device-id]");
        std::process::exit(1);
    };
    let wanted: Option<String> = args.next();

    let registry = Registry::new(RegistryConfig::default());
    registry.add_adapter(Arc::new(DlnaAdapter::new(DlnaConfig::default())));
    registry.add_adapter(Arc::new(ChromecastAdapter::new(ChromecastConfig::default())));
    registry.start().await?;

    println!("Waiting 10 seconds for discovery...");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let devices = registry.list_devices();
    let Some(device) = devices
        .iter()
        .find(|d| wanted.as_deref().is_none_or(|w| d.id.as_str() == w))
    else {
        eprintln!("No matching device found ({} discovered).", devices.len());
        registry.stop().await?;
        std::process::exit(1);
    };
    println!("Casting {} to {} ({})", path.display(), device.name, device.id);

    let payload = MediaPayload::from_path(&path).with_mime_type(guess_mime(&path));
    let result = registry
        .send_media(&device.id, payload, SendOptions::default())
        .await;

    if result.success {
        println!("Playing for 60 seconds...");
        tokio::time::sleep(Duration::from_secs(60)).await;
        if let Some(controller) = &result.controller {
            let _ = controller.stop().await;
        }
    } else {
        eprintln!(
            "Send failed: {}",
            result.reason.as_deref().unwrap_or("unknown reason")
        );
    }

    registry.stop().await?;
    Ok(())
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "m4a" | "aac" => "audio/mp4",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
