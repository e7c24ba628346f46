//! Minimal SOAP client for UPnP control endpoints.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use xmltree::{Element, EmitterConfig, XMLNode};

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Serializes a SOAP envelope for `action` on `service_type`.
pub(crate) fn envelope(
    service_type: &str,
    action: &str,
    args: &[(&str, String)],
) -> Result<String> {
    let mut action_el = Element::new(&format!("u:{action}"));
    action_el
        .attributes
        .insert("xmlns:u".to_string(), service_type.to_string());
    for (name, value) in args {
        let mut arg = Element::new(name);
        arg.children.push(XMLNode::Text(value.clone()));
        action_el.children.push(XMLNode::Element(arg));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(action_el));

    let mut envelope = Element::new("s:Envelope");
    envelope
        .attributes
        .insert("xmlns:s".to_string(), SOAP_ENVELOPE_NS.to_string());
    envelope
        .attributes
        .insert("s:encodingStyle".to_string(), SOAP_ENCODING.to_string());
    envelope.children.push(XMLNode::Element(body));

    element_to_string(&envelope, true)
}

/// Writes an element tree to a string, optionally with an XML declaration.
pub(crate) fn element_to_string(element: &Element, declaration: bool) -> Result<String> {
    let mut out = Vec::new();
    let config = EmitterConfig::new().write_document_declaration(declaration);
    element
        .write_with_config(&mut out, config)
        .context("serializing XML")?;
    String::from_utf8(out).context("serialized XML is not UTF-8")
}

/// Invokes one SOAP action and returns the `{action}Response` element.
pub(crate) async fn invoke(
    client: &reqwest::Client,
    control_url: &str,
    service_type: &str,
    action: &str,
    args: &[(&str, String)],
) -> Result<Element> {
    let body = envelope(service_type, action, args)?;
    let response = client
        .post(control_url)
        .header("SOAPAction", format!(r#""{service_type}#{action}""#))
        .header(reqwest::header::CONTENT_TYPE, r#"text/xml; charset="utf-8""#)
        .body(body)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("SOAP {action} request to {control_url}"))?;

    let status = response.status();
    // The body is read on errors too; faults arrive as 500s with details.
    let text = response
        .text()
        .await
        .with_context(|| format!("reading SOAP {action} response"))?;
    if !status.is_success() {
        bail!("SOAP {action} returned {status}: {}", fault_string(&text));
    }

    let root = Element::parse(text.as_bytes())
        .with_context(|| format!("parsing SOAP {action} response"))?;
    let body = find_child(&root, "Body").context("SOAP response has no Body")?;
    let response_name = format!("{action}Response");
    find_child(body, &response_name)
        .cloned()
        .with_context(|| format!("SOAP response has no {response_name}"))
}

/// Direct child lookup by local name, ignoring namespace prefixes.
pub(crate) fn find_child<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .find(|c| c.name == name)
}

/// Text content of a direct child, trimmed.
pub(crate) fn child_text(element: &Element, name: &str) -> Option<String> {
    find_child(element, name)
        .and_then(|c| c.get_text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Best-effort human-readable detail from a SOAP fault body.
fn fault_string(body: &str) -> String {
    if let Ok(root) = Element::parse(body.as_bytes()) {
        let mut queue = vec![&root];
        while let Some(element) = queue.pop() {
            if element.name == "faultstring" || element.name == "errorDescription" {
                if let Some(text) = element.get_text() {
                    return text.trim().to_string();
                }
            }
            queue.extend(element.children.iter().filter_map(XMLNode::as_element));
        }
    }
    let trimmed = body.trim();
    if trimmed.len() > 200 {
        format!("{}...", &trimmed[..200])
    } else {
        trimmed.to_string()
    }
}
