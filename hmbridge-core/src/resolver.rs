//! Display name resolution.
//!
//! Controllers only know devices by address. Depending on the remote's
//! `resolve_names` setting, names are pulled from RPC metadata, from the
//! CCU's JSON API, or from the XML-API add-on and applied to the registry.

use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, info, warn};

use hmbridge_common::{RpcValue, value_as_str};

use crate::config::{RemoteConfig, ResolveNames, XML_API_PATH};
use crate::error::RpcError;
use crate::registry::DeviceRegistry;
use crate::session::{DeviceDetail, SessionClient};
use crate::transport::build_http_client;

/// Timeout of the XML-API request.
pub const XML_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata key holding a device's name.
pub const METADATA_NAME: &str = "NAME";

/// Resolve names with the remote's configured strategy.
///
/// Never fails: problems are logged. Returns the number of names applied.
pub async fn resolve_names(remote: &RemoteConfig, registry: &DeviceRegistry) -> usize {
    let applied = match remote.resolve_names {
        ResolveNames::None => return 0,
        ResolveNames::Metadata => resolve_from_metadata(registry).await,
        ResolveNames::Json => resolve_from_session(remote, registry).await,
        ResolveNames::Xml => resolve_from_xml(remote, registry).await,
    };

    info!(remote = %remote.name, strategy = ?remote.resolve_names, applied, "Resolved device names");
    applied
}

/// Ask the remote for each device's `NAME` metadata.
pub async fn resolve_from_metadata(registry: &DeviceRegistry) -> usize {
    let mut applied = 0;
    for device in registry.devices() {
        let address = device.address().to_string();
        match registry.proxy().get_metadata(&address, METADATA_NAME).await {
            Ok(value) => {
                if let Some(name) = metadata_name(&value) {
                    if registry.apply_name(&address, name) {
                        applied += 1;
                    }
                }
            }
            Err(e) => debug!(address = %address, error = %e, "No name in metadata"),
        }
    }
    applied
}

/// Fetch names through a JSON API session.
///
/// Needs credentials. The session is always closed once it is open.
pub async fn resolve_from_session(remote: &RemoteConfig, registry: &DeviceRegistry) -> usize {
    let client = match SessionClient::new(remote) {
        Ok(Some(client)) => client,
        Ok(None) => {
            warn!(remote = %remote.name, "JSON name resolution needs username and password");
            return 0;
        }
        Err(e) => {
            warn!(remote = %remote.name, error = %e, "Failed to create JSON API client");
            return 0;
        }
    };

    let ports = remote.interface_ports();
    let client = &client;
    let result = client
        .with_session(|session| async move {
            let interfaces = client.list_interfaces(&session).await?;
            let Some(interface) = interfaces
                .iter()
                .find(|i| ports.iter().any(|p| i64::from(*p) == i.port))
            else {
                return Ok(None);
            };
            debug!(interface = %interface.name, "Matched JSON API interface");
            client.list_all_detail(&session).await.map(Some)
        })
        .await;

    match result {
        Ok(Some(Some(details))) => apply_details(registry, &details),
        Ok(Some(None)) => {
            warn!(remote = %remote.name, port = remote.port, "No matching interface in JSON API");
            0
        }
        Ok(None) => 0,
        Err(e) => {
            warn!(remote = %remote.name, error = %e, "JSON name resolution failed");
            0
        }
    }
}

fn apply_details(registry: &DeviceRegistry, details: &[DeviceDetail]) -> usize {
    let mut applied = 0;
    for detail in details {
        if registry.device(&detail.address).is_none() {
            continue;
        }
        if registry.apply_name(&detail.address, &detail.name) {
            applied += 1;
        }
        for channel in &detail.channels {
            if registry.apply_name(&channel.address, &channel.name) {
                applied += 1;
            }
        }
    }
    applied
}

/// Fetch names from the XML-API add-on's device list.
pub async fn resolve_from_xml(remote: &RemoteConfig, registry: &DeviceRegistry) -> usize {
    warn!(remote = %remote.name, "Name resolution via the XML-API add-on is deprecated, use json");

    let body = match fetch_device_list(remote).await {
        Ok(body) => body,
        Err(e) => {
            warn!(remote = %remote.name, error = %e, "Could not access XML-API");
            return 0;
        }
    };

    let entries = match parse_device_list(&body) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(remote = %remote.name, error = %e, "Invalid XML-API device list");
            return 0;
        }
    };

    entries
        .iter()
        .filter(|(address, _)| registry.device(address).is_some())
        .filter(|(address, name)| registry.apply_name(address, name))
        .count()
}

async fn fetch_device_list(remote: &RemoteConfig) -> Result<String, RpcError> {
    let http = build_http_client(remote.verify_tls, Some(XML_API_TIMEOUT))?;
    let url = format!("{}{}", remote.web_url(), XML_API_PATH);

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| RpcError::Transport(e.without_url().to_string()))?;
    if !response.status().is_success() {
        return Err(RpcError::Transport(format!("HTTP status {}", response.status())));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RpcError::Transport(e.without_url().to_string()))?;
    Ok(decode_latin1(&bytes))
}

/// ISO-8859-1 maps every byte to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Extract `(address, name)` of every `<device>` element.
pub fn parse_device_list(xml: &str) -> Result<Vec<(String, String)>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(element) | Event::Empty(element) if element.name().as_ref() == b"device" => {
                let mut address = None;
                let mut name = None;
                for attribute in element.attributes().flatten() {
                    let value = attribute.unescape_value()?.into_owned();
                    match attribute.key.as_ref() {
                        b"address" => address = Some(value),
                        b"name" => name = Some(value),
                        _ => {}
                    }
                }
                if let (Some(address), Some(name)) = (address, name) {
                    entries.push((address, name));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// Name from a `getMetadata` answer, if it is a non-empty string.
pub fn metadata_name(value: &RpcValue) -> Option<&str> {
    value_as_str(value).filter(|name| !name.is_empty())
}
