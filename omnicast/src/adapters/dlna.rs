//! DLNA/UPnP-AV adapter: MediaRenderer discovery over SSDP, playback via
//! AVTransport and RenderingControl SOAP actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};
use xmltree::{Element, XMLNode};

use crate::adapter::{MediaAdapter, MediaController, RegistryHandle, SessionGuard};
use crate::errors::CastError;
use crate::model::{
    Device, DeviceId, MediaStatus, PlaybackState, SendRequest, SendResult,
};
use crate::ssdp::{extract_udn_from_usn, SsdpEvent, SsdpListener, SsdpMessage};

use super::description::fetch_description;
use super::soap;

const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";
const ABSENCE_WINDOWS: u32 = 3;

const DLNA_PROTOCOL_FLAGS: &str =
    "DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=01700000000000000000000000000000";

#[derive(Clone, Debug)]
pub struct DlnaConfig {
    pub discovery_interval: Duration,
}

impl Default for DlnaConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(60),
        }
    }
}

impl DlnaConfig {
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }
}

pub struct DlnaAdapter {
    config: DlnaConfig,
    http: reqwest::Client,
    runtime: Mutex<Option<RegistryHandle>>,
}

impl DlnaAdapter {
    pub fn new(config: DlnaConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            runtime: Mutex::new(None),
        }
    }

    async fn handle_alive(
        &self,
        handle: &RegistryHandle,
        known: &mut HashMap<String, (DeviceId, Instant)>,
        message: SsdpMessage,
    ) {
        let Some(usn) = message.usn.as_deref() else { return };
        let Some(udn) = extract_udn_from_usn(usn) else { return };
        if let Some(entry) = known.get_mut(&udn) {
            entry.1 = Instant::now();
            return;
        }
        let Some(location) = message.location.as_deref() else { return };

        let description = match fetch_description(&self.http, location).await {
            Ok(description) => description,
            Err(e) => {
                debug!(location = %location, error = %format!("{e:#}"), "Renderer description fetch failed");
                return;
            }
        };
        let Some(avtransport) = description.find_service("AVTransport") else {
            debug!(location = %location, "Renderer without AVTransport skipped");
            return;
        };

        let id = description
            .udn
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| udn.clone());
        let name = description
            .friendly_name
            .clone()
            .unwrap_or_else(|| "DLNA renderer".to_string());

        let mut device = Device::new(id, name, self.name())
            .with_capabilities(["audio", "video"])
            .with_transport_info("location", json!(location))
            .with_transport_info("avtransport_control", json!(avtransport.control_url))
            .with_transport_info("avtransport_type", json!(avtransport.service_type));
        if let Some(rendering) = description.find_service("RenderingControl") {
            device = device
                .with_transport_info("rendering_control", json!(rendering.control_url))
                .with_transport_info("rendering_type", json!(rendering.service_type));
        }
        device.model = description.model_name.clone();

        known.insert(udn, (device.id.clone(), Instant::now()));
        handle.register_device(device);
    }
}

#[async_trait]
impl MediaAdapter for DlnaAdapter {
    fn name(&self) -> &str {
        "dlna"
    }

    async fn start(&self, handle: RegistryHandle) -> Result<()> {
        *self.runtime.lock().unwrap() = Some(handle.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut listener = SsdpListener::spawn(
            SEARCH_TARGET.to_string(),
            self.config.discovery_interval,
            tx,
        )
        .context("starting DLNA SSDP listener")?;
        info!(interval_s = self.config.discovery_interval.as_secs(), "DLNA discovery started");

        let mut known: HashMap<String, (DeviceId, Instant)> = HashMap::new();
        let expiry = self.config.discovery_interval * ABSENCE_WINDOWS;
        let mut sweep = tokio::time::interval(self.config.discovery_interval);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SsdpEvent::Alive(msg) | SsdpEvent::SearchResponse(msg) => {
                            self.handle_alive(&handle, &mut known, msg).await;
                        }
                        SsdpEvent::ByeBye { usn } => {
                            let Some(udn) = extract_udn_from_usn(&usn) else { continue };
                            if let Some((id, _)) = known.remove(&udn) {
                                handle.unregister_device(&id, "lost");
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = known
                        .iter()
                        .filter(|(_, (_, seen))| now.duration_since(*seen) > expiry)
                        .map(|(udn, _)| udn.clone())
                        .collect();
                    for udn in expired {
                        if let Some((id, _)) = known.remove(&udn) {
                            info!(device = %id, "DLNA renderer disappeared");
                            handle.unregister_device(&id, "lost");
                        }
                    }
                }
            }
        }

        listener.stop();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send_media(&self, device: Device, request: SendRequest) -> Result<SendResult> {
        let endpoints = Endpoints::from_device(&device)?;
        let metadata = didl_metadata(&request)?;

        soap::invoke(
            &self.http,
            &endpoints.avtransport_control,
            &endpoints.avtransport_type,
            "SetAVTransportURI",
            &[
                ("InstanceID", "0".to_string()),
                ("CurrentURI", request.url.clone()),
                ("CurrentURIMetaData", metadata),
            ],
        )
        .await?;

        soap::invoke(
            &self.http,
            &endpoints.avtransport_control,
            &endpoints.avtransport_type,
            "Play",
            &[
                ("InstanceID", "0".to_string()),
                ("Speed", "1".to_string()),
            ],
        )
        .await?;

        info!(device = %device.id, url = %request.url, "DLNA playback started");
        let handle = self.runtime.lock().unwrap().clone();
        if let Some(handle) = &handle {
            handle.publish_media_status(&device.id, MediaStatus::new(PlaybackState::Playing));
        }

        let guard = handle
            .map(|h| h.session_guard())
            .unwrap_or_default();
        let controller = Arc::new(DlnaController {
            http: self.http.clone(),
            endpoints,
            guard,
        });
        Ok(SendResult::ok_with_controller(controller))
    }
}

/// Control endpoints pulled out of a device's `transport_info`.
struct Endpoints {
    avtransport_control: String,
    avtransport_type: String,
    rendering: Option<(String, String)>,
}

impl Endpoints {
    fn from_device(device: &Device) -> Result<Self> {
        let field = |key: &str| {
            device
                .transport_info
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let (Some(avtransport_control), Some(avtransport_type)) =
            (field("avtransport_control"), field("avtransport_type"))
        else {
            bail!("device {} has no AVTransport endpoint", device.id);
        };
        let rendering = match (field("rendering_control"), field("rendering_type")) {
            (Some(control), Some(service)) => Some((control, service)),
            _ => None,
        };
        Ok(Self {
            avtransport_control,
            avtransport_type,
            rendering,
        })
    }
}

/// DIDL-Lite metadata for one item, serialized without a declaration.
fn didl_metadata(request: &SendRequest) -> Result<String> {
    let title = request
        .metadata
        .as_ref()
        .and_then(|m| m.title.clone())
        .unwrap_or_else(|| "Media".to_string());
    let kind = request.metadata.as_ref().and_then(|m| m.kind.as_deref());
    let class = match kind {
        Some("music") => "object.item.audioItem",
        Some("movie") => "object.item.videoItem",
        Some("photo") => "object.item.imageItem",
        _ if request.mime_type.starts_with("audio/") => "object.item.audioItem",
        _ if request.mime_type.starts_with("image/") => "object.item.imageItem",
        _ => "object.item.videoItem",
    };

    let mut item = Element::new("item");
    item.attributes.insert("id".to_string(), "0".to_string());
    item.attributes.insert("parentID".to_string(), "-1".to_string());
    item.attributes.insert("restricted".to_string(), "1".to_string());

    let mut title_el = Element::new("dc:title");
    title_el.children.push(XMLNode::Text(title));
    item.children.push(XMLNode::Element(title_el));

    let mut class_el = Element::new("upnp:class");
    class_el.children.push(XMLNode::Text(class.to_string()));
    item.children.push(XMLNode::Element(class_el));

    if let Some(metadata) = &request.metadata {
        if let Some(artist) = &metadata.artist {
            let mut artist_el = Element::new("dc:creator");
            artist_el.children.push(XMLNode::Text(artist.clone()));
            item.children.push(XMLNode::Element(artist_el));
        }
        if let Some(album) = &metadata.album {
            let mut album_el = Element::new("upnp:album");
            album_el.children.push(XMLNode::Text(album.clone()));
            item.children.push(XMLNode::Element(album_el));
        }
        if let Some(image) = metadata.images.first() {
            let mut art_el = Element::new("upnp:albumArtURI");
            art_el.children.push(XMLNode::Text(image.url.clone()));
            item.children.push(XMLNode::Element(art_el));
        }
    }

    let mut res = Element::new("res");
    res.attributes.insert(
        "protocolInfo".to_string(),
        format!("http-get:*:{}:{}", request.mime_type, DLNA_PROTOCOL_FLAGS),
    );
    res.children.push(XMLNode::Text(request.url.clone()));
    item.children.push(XMLNode::Element(res));

    let mut didl = Element::new("DIDL-Lite");
    didl.attributes.insert(
        "xmlns".to_string(),
        "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/".to_string(),
    );
    didl.attributes.insert(
        "xmlns:dc".to_string(),
        "http://purl.org/dc/elements/1.1/".to_string(),
    );
    didl.attributes.insert(
        "xmlns:upnp".to_string(),
        "urn:schemas-upnp-org:metadata-1-0/upnp/".to_string(),
    );
    didl.children.push(XMLNode::Element(item));

    soap::element_to_string(&didl, false)
}

/// Target string for AVTransport Seek, e.g. `0:02:33`.
fn format_reltime(position: Duration) -> String {
    let total = position.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn volume_percent(level: f32) -> u32 {
    (level.clamp(0.0, 1.0) * 100.0).round() as u32
}

struct DlnaController {
    http: reqwest::Client,
    endpoints: Endpoints,
    guard: SessionGuard,
}

impl DlnaController {
    async fn avtransport(&self, action: &str, args: &[(&str, String)]) -> Result<(), CastError> {
        self.guard.ensure_active()?;
        soap::invoke(
            &self.http,
            &self.endpoints.avtransport_control,
            &self.endpoints.avtransport_type,
            action,
            args,
        )
        .await
        .map(|_| ())
        .map_err(|e| CastError::adapter_failure(format!("{e:#}")))
    }

    async fn rendering(&self, action: &str, args: &[(&str, String)]) -> Result<(), CastError> {
        self.guard.ensure_active()?;
        let Some((control, service)) = &self.endpoints.rendering else {
            return Err(CastError::unsupported(action, "dlna"));
        };
        soap::invoke(&self.http, control, service, action, args)
            .await
            .map(|_| ())
            .map_err(|e| CastError::adapter_failure(format!("{e:#}")))
    }
}

#[async_trait]
impl MediaController for DlnaController {
    async fn play(&self) -> Result<(), CastError> {
        self.avtransport(
            "Play",
            &[
                ("InstanceID", "0".to_string()),
                ("Speed", "1".to_string()),
            ],
        )
        .await
    }

    async fn pause(&self) -> Result<(), CastError> {
        self.avtransport("Pause", &[("InstanceID", "0".to_string())]).await
    }

    async fn stop(&self) -> Result<(), CastError> {
        self.avtransport("Stop", &[("InstanceID", "0".to_string())]).await
    }

    async fn seek(&self, position: Duration) -> Result<(), CastError> {
        self.avtransport(
            "Seek",
            &[
                ("InstanceID", "0".to_string()),
                ("Unit", "REL_TIME".to_string()),
                ("Target", format_reltime(position)),
            ],
        )
        .await
    }

    async fn set_volume(&self, level: f32) -> Result<(), CastError> {
        self.rendering(
            "SetVolume",
            &[
                ("InstanceID", "0".to_string()),
                ("Channel", "Master".to_string()),
                ("DesiredVolume", volume_percent(level).to_string()),
            ],
        )
        .await
    }

    async fn set_mute(&self, muted: bool) -> Result<(), CastError> {
        self.rendering(
            "SetMute",
            &[
                ("InstanceID", "0".to_string()),
                ("Channel", "Master".to_string()),
                ("DesiredMute", if muted { "1" } else { "0" }.to_string()),
            ],
        )
        .await
    }
}
