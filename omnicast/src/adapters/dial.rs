//! DIAL adapter: SSDP discovery plus app launch over the DIAL REST API.
//!
//! DIAL devices do not play raw media; they launch a named application
//! (YouTube by default) with the media URL as its payload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::adapter::{MediaAdapter, MediaController, RegistryHandle, SessionGuard};
use crate::errors::CastError;
use crate::model::{Device, DeviceId, SendRequest, SendResult};
use crate::ssdp::{extract_udn_from_usn, SsdpEvent, SsdpListener, SsdpMessage};

use super::description::fetch_description;

const SEARCH_TARGET: &str = "urn:dial-multiscreen-org:service:dial:1";
const DIAL_VERSION: &str = "2.1";
const DEFAULT_APP: &str = "YouTube";

/// Devices unseen for this many search windows are dropped.
const ABSENCE_WINDOWS: u32 = 3;

#[derive(Clone, Debug)]
pub struct DialConfig {
    pub discovery_interval: Duration,
    /// Reported to devices in launch requests.
    pub friendly_name: String,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(60),
            friendly_name: "omnicast".to_string(),
        }
    }
}

impl DialConfig {
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = name.into();
        self
    }
}

pub struct DialAdapter {
    config: DialConfig,
    http: reqwest::Client,
    guard: Mutex<Option<SessionGuard>>,
}

impl DialAdapter {
    pub fn new(config: DialConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            guard: Mutex::new(None),
        }
    }

    async fn handle_alive(
        &self,
        handle: &RegistryHandle,
        known: &mut HashMap<String, (DeviceId, Instant)>,
        message: SsdpMessage,
    ) {
        let Some(usn) = message.usn.as_deref() else { return };
        let Some(udn) = extract_udn_from_usn(usn) else {
            debug!(usn = %usn, "DIAL announce without a UDN");
            return;
        };
        if let Some(entry) = known.get_mut(&udn) {
            entry.1 = Instant::now();
            return;
        }
        let Some(location) = message.location.as_deref() else { return };

        let description = match fetch_description(&self.http, location).await {
            Ok(description) => description,
            Err(e) => {
                debug!(location = %location, error = %format!("{e:#}"), "DIAL description fetch failed");
                return;
            }
        };
        let Some(app_url) = description.application_url.clone() else {
            debug!(location = %location, "No Application-URL header, not a DIAL device");
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
            .unwrap_or_else(|| "DIAL device".to_string());

        let mut device = Device::new(id.clone(), name, self.name())
            .with_capabilities(["audio", "video"])
            .with_transport_info("app_url", json!(app_url))
            .with_transport_info("location", json!(location));
        device.model = description.model_name.clone();

        known.insert(udn, (device.id.clone(), Instant::now()));
        handle.register_device(device);
    }
}

#[async_trait]
impl MediaAdapter for DialAdapter {
    fn name(&self) -> &str {
        "dial"
    }

    async fn start(&self, handle: RegistryHandle) -> Result<()> {
        *self.guard.lock().unwrap() = Some(handle.session_guard());

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut listener = SsdpListener::spawn(
            SEARCH_TARGET.to_string(),
            self.config.discovery_interval,
            tx,
        )
        .context("starting DIAL SSDP listener")?;
        info!(interval_s = self.config.discovery_interval.as_secs(), "DIAL discovery started");

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
                            info!(device = %id, "DIAL device disappeared");
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
        let app = request
            .options
            .app
            .clone()
            .unwrap_or_else(|| DEFAULT_APP.to_string());
        let Some(app_url) = device
            .transport_info
            .get("app_url")
            .and_then(|v| v.as_str())
        else {
            bail!("device {} has no application URL", device.id);
        };
        let launch = launch_url(app_url, &app);

        // Availability probe before launching.
        let probe = self
            .http
            .get(&launch)
            .query(&[("clientDialVer", DIAL_VERSION)])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("querying application {app}"))?;
        if probe.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("application {app} not found on {}", device.name);
        }

        let response = self
            .http
            .post(&launch)
            .query(&[
                ("clientDialVer", DIAL_VERSION),
                ("friendlyName", self.config.friendly_name.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(request.url.clone())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("launching application {app}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("application launch returned {status}");
        }
        let instance = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| resolve_instance(&launch, loc));

        info!(device = %device.id, app = %app, "DIAL application launched");
        let guard = self
            .guard
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        let controller = Arc::new(DialController {
            http: self.http.clone(),
            instance: instance.clone(),
            guard,
        });

        let mut result = SendResult::ok_with_controller(controller).with_metadata("app", json!(app));
        if let Some(instance) = instance {
            result = result.with_metadata("instance_url", json!(instance));
        }
        Ok(result)
    }
}

/// Launch endpoint for an application: `{app_url}/{app}`.
fn launch_url(app_url: &str, app: &str) -> String {
    format!("{}/{}", app_url.trim_end_matches('/'), app)
}

/// Resolves a launch response `LOCATION` header against the launch URL.
fn resolve_instance(launch: &str, location: &str) -> Option<String> {
    let base = url::Url::parse(&format!("{launch}/")).ok()?;
    base.join(location).ok().map(|u| u.to_string())
}

/// Running DIAL application instance. Only `stop` is expressible in the
/// protocol.
struct DialController {
    http: reqwest::Client,
    instance: Option<String>,
    guard: SessionGuard,
}

#[async_trait]
impl MediaController for DialController {
    async fn play(&self) -> Result<(), CastError> {
        Err(CastError::unsupported("play", "dial"))
    }

    async fn pause(&self) -> Result<(), CastError> {
        Err(CastError::unsupported("pause", "dial"))
    }

    async fn stop(&self) -> Result<(), CastError> {
        self.guard.ensure_active()?;
        let Some(instance) = self.instance.as_deref() else {
            return Err(CastError::adapter_failure(
                "device reported no instance URL to stop",
            ));
        };
        let response = self
            .http
            .delete(instance)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CastError::adapter_failure(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CastError::adapter_failure(format!(
                "stop returned {}",
                response.status()
            )))
        }
    }

    async fn seek(&self, _position: Duration) -> Result<(), CastError> {
        Err(CastError::unsupported("seek", "dial"))
    }

    async fn set_volume(&self, _level: f32) -> Result<(), CastError> {
        Err(CastError::unsupported("set_volume", "dial"))
    }

    async fn set_mute(&self, _muted: bool) -> Result<(), CastError> {
        Err(CastError::unsupported("set_mute", "dial"))
    }
}
