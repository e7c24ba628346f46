//! Fetching and parsing of UPnP device descriptions.

use anyhow::{Context, Result};
use xmltree::Element;

#[derive(Clone, Debug)]
pub(crate) struct ServiceDescription {
    pub service_type: String,
    pub control_url: String,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceDescription {
    pub friendly_name: Option<String>,
    pub model_name: Option<String>,
    pub manufacturer: Option<String>,
    pub udn: Option<String>,
    pub services: Vec<ServiceDescription>,
    /// DIAL `Application-URL` response header, when the device sent one.
    pub application_url: Option<String>,
}

impl DeviceDescription {
    /// Finds a service by its short name, e.g. `"AVTransport"`.
    pub fn find_service(&self, name: &str) -> Option<&ServiceDescription> {
        let needle = format!(":service:{name}:");
        self.services.iter().find(|s| s.service_type.contains(&needle))
    }
}

/// Fetches and parses the description document at `location`.
pub(crate) async fn fetch_description(
    client: &reqwest::Client,
    location: &str,
) -> Result<DeviceDescription> {
    let response = client
        .get(location)
        .send()
        .await
        .with_context(|| format!("fetching device description from {location}"))?;
    let application_url = response
        .headers()
        .get("application-url")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string());
    let body = response
        .text()
        .await
        .context("reading device description body")?;
    parse_description(&body, location, application_url)
}

/// Parses a description document. Control URLs are resolved against the
/// `URLBase` element when present, the fetch location otherwise.
pub(crate) fn parse_description(
    body: &str,
    location: &str,
    application_url: Option<String>,
) -> Result<DeviceDescription> {
    let root = Element::parse(body.as_bytes()).context("parsing device description XML")?;
    let device = root
        .get_child("device")
        .context("description has no device element")?;

    let base = child_text(&root, "URLBase").unwrap_or_else(|| location.to_string());
    let base_url = url::Url::parse(&base)
        .with_context(|| format!("invalid description base URL {base}"))?;

    let mut services = Vec::new();
    if let Some(list) = device.get_child("serviceList") {
        for child in &list.children {
            let Some(service) = child.as_element() else { continue };
            if service.name != "service" {
                continue;
            }
            let (Some(service_type), Some(control)) = (
                child_text(service, "serviceType"),
                child_text(service, "controlURL"),
            ) else {
                continue;
            };
            match base_url.join(&control) {
                Ok(control_url) => services.push(ServiceDescription {
                    service_type,
                    control_url: control_url.to_string(),
                }),
                Err(e) => {
                    tracing::debug!(control = %control, error = %e, "Unresolvable control URL skipped");
                }
            }
        }
    }

    Ok(DeviceDescription {
        friendly_name: child_text(device, "friendlyName"),
        model_name: child_text(device, "modelName"),
        manufacturer: child_text(device, "manufacturer"),
        udn: child_text(device, "UDN"),
        services,
        application_url,
    })
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .and_then(|c| c.get_text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
