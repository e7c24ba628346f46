//! Chromecast adapter: mDNS discovery plus the cast v2 protocol through
//! `rust_cast`.
//!
//! The cast protocol client is blocking, so every device conversation runs
//! inside `spawn_blocking`. Discovery runs on its own thread because the
//! mDNS stream is driven by async-std rather than tokio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use rust_cast::channels::media::{
    Image, Media, Metadata, MusicTrackMediaMetadata, PlayerState, ResumeState, StreamType,
};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::CastDevice;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::adapter::{MediaAdapter, MediaController, RegistryHandle, SessionGuard};
use crate::errors::CastError;
use crate::model::{
    Device, DeviceId, MediaStatus, PlaybackState, SendRequest, SendResult,
};

const SERVICE_NAME: &str = "_googlecast._tcp.local";
const DEFAULT_DESTINATION_ID: &str = "receiver-0";
const ABSENCE_WINDOWS: u32 = 3;

/// Installs the Rustls crypto provider exactly once; `rust_cast` needs one
/// before its first TLS connection.
fn ensure_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
    });
}

#[derive(Clone, Debug)]
pub struct ChromecastConfig {
    pub discovery_interval: Duration,
}

impl Default for ChromecastConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(10),
        }
    }
}

impl ChromecastConfig {
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }
}

pub struct ChromecastAdapter {
    config: ChromecastConfig,
    runtime: Mutex<Option<RegistryHandle>>,
}

impl ChromecastAdapter {
    pub fn new(config: ChromecastConfig) -> Self {
        Self {
            config,
            runtime: Mutex::new(None),
        }
    }
}

/// One cast device as seen in an mDNS response.
#[derive(Clone, Debug, PartialEq)]
struct CastEndpoint {
    uuid: String,
    host: String,
    port: u16,
    name: String,
    model: Option<String>,
}

enum DiscoveryMessage {
    Endpoint(CastEndpoint),
    Failed(String),
}

#[async_trait]
impl MediaAdapter for ChromecastAdapter {
    fn name(&self) -> &str {
        "chromecast"
    }

    async fn start(&self, handle: RegistryHandle) -> Result<()> {
        *self.runtime.lock().unwrap() = Some(handle.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let _discovery = DiscoveryThread::spawn(self.config.discovery_interval, tx)?;
        info!(interval_s = self.config.discovery_interval.as_secs(), "Chromecast discovery started");

        let mut known: HashMap<String, KnownCast> = HashMap::new();
        let expiry = self.config.discovery_interval * ABSENCE_WINDOWS;
        let mut sweep = tokio::time::interval(self.config.discovery_interval);

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(DiscoveryMessage::Endpoint(endpoint)) => {
                            register_endpoint(&handle, &mut known, endpoint);
                        }
                        Some(DiscoveryMessage::Failed(detail)) => {
                            bail!("mDNS discovery failed: {detail}");
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = known
                        .iter()
                        .filter(|(_, k)| now.duration_since(k.last_seen) > expiry)
                        .map(|(uuid, _)| uuid.clone())
                        .collect();
                    for uuid in expired {
                        if let Some(k) = known.remove(&uuid) {
                            info!(device = %k.device_id, "Chromecast disappeared");
                            handle.unregister_device(&k.device_id, "lost");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send_media(&self, device: Device, request: SendRequest) -> Result<SendResult> {
        let target = CastTarget::from_device(&device)?;
        let media = build_media(&request);

        let load_target = target.clone();
        let loaded = tokio::task::spawn_blocking(move || load_media(&load_target, &media))
            .await
            .context("cast load task failed")??;

        info!(
            device = %device.id,
            session = %loaded.session_id,
            media_session = loaded.media_session_id,
            "Cast media loaded"
        );
        let handle = self.runtime.lock().unwrap().clone();
        if let Some(handle) = &handle {
            handle.publish_media_status(&device.id, MediaStatus::new(loaded.state));
            if let Some((level, muted)) = loaded.volume {
                handle.publish_volume(&device.id, level, muted);
            }
        }

        let guard = handle.map(|h| h.session_guard()).unwrap_or_default();
        let controller = Arc::new(ChromecastController {
            target,
            session: loaded.clone(),
            guard,
        });
        Ok(SendResult::ok_with_controller(controller)
            .with_metadata("session_id", json!(loaded.session_id))
            .with_metadata("media_session_id", json!(loaded.media_session_id)))
    }
}

struct KnownCast {
    device_id: DeviceId,
    last_seen: Instant,
    host: String,
    port: u16,
}

fn register_endpoint(
    handle: &RegistryHandle,
    known: &mut HashMap<String, KnownCast>,
    endpoint: CastEndpoint,
) {
    if let Some(existing) = known.get_mut(&endpoint.uuid) {
        existing.last_seen = Instant::now();
        if existing.host == endpoint.host && existing.port == endpoint.port {
            return;
        }
        debug!(device = %existing.device_id, host = %endpoint.host, "Chromecast moved");
    }

    let capabilities: &[&str] = if endpoint
        .model
        .as_deref()
        .is_some_and(|m| m.to_lowercase().contains("audio"))
    {
        &["audio"]
    } else {
        &["audio", "video"]
    };

    let mut device = Device::new(endpoint.uuid.clone(), endpoint.name.clone(), "chromecast")
        .with_capabilities(capabilities.iter().copied())
        .with_transport_info("host", json!(endpoint.host))
        .with_transport_info("port", json!(endpoint.port))
        .with_transport_info("uuid", json!(endpoint.uuid));
    device.model = endpoint.model.clone();

    known.insert(
        endpoint.uuid.clone(),
        KnownCast {
            device_id: device.id.clone(),
            last_seen: Instant::now(),
            host: endpoint.host,
            port: endpoint.port,
        },
    );
    handle.register_device(device);
}

/// mDNS listener thread. Dropping the handle stops the thread.
struct DiscoveryThread {
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DiscoveryThread {
    fn spawn(
        interval: Duration,
        tx: tokio::sync::mpsc::Sender<DiscoveryMessage>,
    ) -> Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_flag = stop_flag.clone();
        let thread = std::thread::Builder::new()
            .name("chromecast-mdns".to_string())
            .spawn(move || discovery_loop(interval, tx, thread_flag))
            .context("spawning mDNS thread")?;
        Ok(Self {
            stop_flag,
            thread: Some(thread),
        })
    }
}

impl Drop for DiscoveryThread {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn discovery_loop(
    interval: Duration,
    tx: tokio::sync::mpsc::Sender<DiscoveryMessage>,
    stop_flag: Arc<AtomicBool>,
) {
    async_std::task::block_on(async move {
        let discovery = match mdns::discover::all(SERVICE_NAME, interval) {
            Ok(discovery) => discovery,
            Err(e) => {
                let _ = tx.try_send(DiscoveryMessage::Failed(e.to_string()));
                return;
            }
        };
        let stream = discovery.listen();
        pin_mut!(stream);

        while !stop_flag.load(Ordering::Acquire) {
            // Short poll timeout so the stop flag is rechecked regularly.
            match async_std::future::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(response))) => {
                    if let Some(endpoint) = parse_response(&response) {
                        if tx.try_send(DiscoveryMessage::Endpoint(endpoint)).is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(Err(e))) => warn!(error = %e, "mDNS response error"),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        debug!("Chromecast mDNS thread exiting");
    });
}

/// Builds an endpoint from one mDNS response, when it carries enough
/// records (an address plus a TXT `id`).
fn parse_response(response: &mdns::Response) -> Option<CastEndpoint> {
    let mut host: Option<String> = None;
    let mut port: u16 = 8009;
    let mut service_name: Option<String> = None;
    let mut txt: HashMap<String, String> = HashMap::new();

    for record in response.records() {
        match &record.kind {
            mdns::RecordKind::A(addr) => host = Some(addr.to_string()),
            mdns::RecordKind::AAAA(addr) => {
                if host.is_none() {
                    host = Some(addr.to_string());
                }
            }
            mdns::RecordKind::SRV { port: p, .. } => port = *p,
            mdns::RecordKind::PTR(name) => service_name = Some(name.clone()),
            mdns::RecordKind::TXT(entries) => {
                for entry in entries {
                    if let Some((key, value)) = entry.split_once('=') {
                        txt.insert(key.to_string(), value.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let host = host?;
    let uuid = txt.get("id")?.clone();
    let name = txt
        .get("fn")
        .cloned()
        .or_else(|| {
            service_name
                .as_deref()
                .and_then(|n| n.split("._googlecast._tcp.local").next())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Chromecast".to_string());

    Some(CastEndpoint {
        uuid,
        host,
        port,
        name,
        model: txt.get("md").cloned(),
    })
}

#[derive(Clone)]
struct CastTarget {
    host: String,
    port: u16,
}

impl CastTarget {
    fn from_device(device: &Device) -> Result<Self> {
        let host = device
            .transport_info
            .get("host")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("device {} has no cast host", device.id))?;
        let port = device
            .transport_info
            .get("port")
            .and_then(|v| v.as_u64())
            .unwrap_or(8009) as u16;
        Ok(Self { host, port })
    }

    fn connect(&self) -> Result<CastDevice<'_>, CastError> {
        ensure_crypto_provider();
        CastDevice::connect_without_host_verification(self.host.as_str(), self.port)
            .map_err(|e| CastError::adapter_failure(format!("cast connect failed: {e}")))
    }
}

fn build_media(request: &SendRequest) -> Media {
    let metadata = request.metadata.as_ref().map(|m| {
        Metadata::MusicTrack(MusicTrackMediaMetadata {
            title: m.title.clone(),
            artist: m.artist.clone(),
            album_name: m.album.clone(),
            images: m
                .images
                .iter()
                .map(|image| Image {
                    url: image.url.clone(),
                    dimensions: match (image.width, image.height) {
                        (Some(w), Some(h)) => Some((w, h)),
                        _ => None,
                    },
                })
                .collect(),
            release_date: None,
            ..Default::default()
        })
    });

    Media {
        content_id: request.url.clone(),
        stream_type: StreamType::Buffered,
        content_type: request.mime_type.clone(),
        metadata,
        duration: None,
    }
}

/// Outcome of a successful load, enough to control the session later.
#[derive(Clone)]
struct LoadedSession {
    transport_id: String,
    session_id: String,
    media_session_id: i32,
    state: PlaybackState,
    volume: Option<(f32, bool)>,
}

fn load_media(target: &CastTarget, media: &Media) -> Result<LoadedSession> {
    ensure_crypto_provider();
    let device = CastDevice::connect_without_host_verification(target.host.as_str(), target.port)
        .map_err(|e| anyhow!("cast connect failed: {e}"))?;
    device
        .connection
        .connect(DEFAULT_DESTINATION_ID)
        .map_err(|e| anyhow!("cast handshake failed: {e}"))?;
    let app = device
        .receiver
        .launch_app(&CastDeviceApp::DefaultMediaReceiver)
        .map_err(|e| anyhow!("launching media receiver failed: {e}"))?;
    device
        .connection
        .connect(app.transport_id.as_str())
        .map_err(|e| anyhow!("connecting to receiver app failed: {e}"))?;

    let status = device
        .media
        .load(app.transport_id.as_str(), app.session_id.as_str(), media)
        .map_err(|e| anyhow!("loading media failed: {e}"))?;
    let entry = status
        .entries
        .first()
        .ok_or_else(|| anyhow!("load returned no media status"))?;

    // Volume is reported best-effort; a failed status read never fails the send.
    let volume = device
        .receiver
        .get_status()
        .ok()
        .map(|s| (s.volume.level.unwrap_or(0.0), s.volume.muted.unwrap_or(false)));

    Ok(LoadedSession {
        transport_id: app.transport_id.clone(),
        session_id: app.session_id.clone(),
        media_session_id: entry.media_session_id,
        state: map_player_state(&entry.player_state),
        volume,
    })
}

fn map_player_state(state: &PlayerState) -> PlaybackState {
    match state {
        PlayerState::Playing => PlaybackState::Playing,
        PlayerState::Paused => PlaybackState::Paused,
        PlayerState::Buffering => PlaybackState::Transitioning,
        PlayerState::Idle => PlaybackState::NoMedia,
    }
}

/// Controls one cast session. Each operation opens a fresh connection; the
/// receiver keeps the session alive between them.
struct ChromecastController {
    target: CastTarget,
    session: LoadedSession,
    guard: SessionGuard,
}

impl ChromecastController {
    async fn with_media<F>(&self, op: F) -> Result<(), CastError>
    where
        F: FnOnce(&CastDevice<'_>, &str, i32) -> Result<(), CastError> + Send + 'static,
    {
        self.guard.ensure_active()?;
        let target = self.target.clone();
        let transport_id = self.session.transport_id.clone();
        let media_session_id = self.session.media_session_id;
        tokio::task::spawn_blocking(move || {
            let device = target.connect()?;
            device
                .connection
                .connect(transport_id.as_str())
                .map_err(|e| CastError::adapter_failure(format!("cast handshake failed: {e}")))?;
            op(&device, &transport_id, media_session_id)
        })
        .await
        .map_err(|_| CastError::adapter_failure("cast control task failed"))?
    }

    async fn with_receiver<F>(&self, op: F) -> Result<(), CastError>
    where
        F: FnOnce(&CastDevice<'_>) -> Result<(), CastError> + Send + 'static,
    {
        self.guard.ensure_active()?;
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || {
            let device = target.connect()?;
            device
                .connection
                .connect(DEFAULT_DESTINATION_ID)
                .map_err(|e| CastError::adapter_failure(format!("cast handshake failed: {e}")))?;
            op(&device)
        })
        .await
        .map_err(|_| CastError::adapter_failure("cast control task failed"))?
    }
}

#[async_trait]
impl MediaController for ChromecastController {
    async fn play(&self) -> Result<(), CastError> {
        self.with_media(|device, transport_id, media_session_id| {
            device
                .media
                .play(transport_id, media_session_id)
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("play failed: {e}")))
        })
        .await
    }

    async fn pause(&self) -> Result<(), CastError> {
        self.with_media(|device, transport_id, media_session_id| {
            device
                .media
                .pause(transport_id, media_session_id)
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("pause failed: {e}")))
        })
        .await
    }

    async fn stop(&self) -> Result<(), CastError> {
        self.with_media(|device, transport_id, media_session_id| {
            device
                .media
                .stop(transport_id, media_session_id)
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("stop failed: {e}")))
        })
        .await
    }

    async fn seek(&self, position: Duration) -> Result<(), CastError> {
        let seconds = position.as_secs_f32();
        self.with_media(move |device, transport_id, media_session_id| {
            device
                .media
                .seek(
                    transport_id,
                    media_session_id,
                    Some(seconds),
                    Some(ResumeState::PlaybackStart),
                )
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("seek failed: {e}")))
        })
        .await
    }

    async fn set_volume(&self, level: f32) -> Result<(), CastError> {
        let level = level.clamp(0.0, 1.0);
        self.with_receiver(move |device| {
            device
                .receiver
                .set_volume(level)
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("set_volume failed: {e}")))
        })
        .await
    }

    async fn set_mute(&self, muted: bool) -> Result<(), CastError> {
        self.with_receiver(move |device| {
            device
                .receiver
                .set_volume(muted)
                .map(|_| ())
                .map_err(|e| CastError::adapter_failure(format!("set_mute failed: {e}")))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_state_mapping() {
        assert_eq!(map_player_state(&PlayerState::Playing), PlaybackState::Playing);
        assert_eq!(map_player_state(&PlayerState::Paused), PlaybackState::Paused);
        assert_eq!(
            map_player_state(&PlayerState::Buffering),
            PlaybackState::Transitioning
        );
        assert_eq!(map_player_state(&PlayerState::Idle), PlaybackState::NoMedia);
    }

    #[test]
    fn cast_target_reads_transport_info() {
        let device = Device::new("abc", "Kitchen speaker", "chromecast")
            .with_transport_info("host", json!("192.168.1.77"))
            .with_transport_info("port", json!(8010));
        let target = CastTarget::from_device(&device).unwrap();
        assert_eq!(target.host, "192.168.1.77");
        assert_eq!(target.port, 8010);

        let bare = Device::new("abc", "Kitchen speaker", "chromecast");
        assert!(CastTarget::from_device(&bare).is_err());
    }

    #[test]
    fn media_is_built_from_the_request() {
        let request = SendRequest {
            url: "http://192.168.1.5:8080/track".to_string(),
            mime_type: "audio/mp3".to_string(),
            metadata: Some(crate::model::MediaMetadata {
                title: Some("Song".to_string()),
                artist: Some("Band".to_string()),
                ..Default::default()
            }),
            options: Default::default(),
        };
        let media = build_media(&request);
        assert_eq!(media.content_id, "http://192.168.1.5:8080/track");
        assert_eq!(media.content_type, "audio/mp3");
        match media.metadata {
            Some(Metadata::MusicTrack(ref m)) => {
                assert_eq!(m.title.as_deref(), Some("Song"));
                assert_eq!(m.artist.as_deref(), Some("Band"));
            }
            ref other => panic!("expected MusicTrack metadata, got {other:?}"),
        }
    }
}
