//! Bridge configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hmbridge_common::LoggingConfig;

use crate::error::{BridgeError, Result};

/// Ports of the HomeMatic IP interface (plain, TLS, and the CCU3 proxy).
pub const HMIP_PORTS: [u16; 3] = [2010, 32010, 42010];

/// Path of the CCU JSON API.
pub const JSON_API_PATH: &str = "/api/homematic.cgi";

/// Path of the XML-API add-on device listing.
pub const XML_API_PATH: &str = "/config/xmlapi/devicelist.cgi";

/// Root configuration file.
///
/// # Example
///
/// ```json5
/// {
///   logging: { level: "info" },
///   bridge: { interface_id: "hmbridge", device_file: "devices_%s.json" },
///   remotes: [
///     { name: "rf", host: "192.168.1.10", port: 2001 },
///     { name: "hg", host: "192.168.1.20", port: 2001, encoding: "json" },
///     { name: "ip", host: "192.168.1.10", port: 2010, resolve_names: "json",
///       username: "Admin", password: "secret" },
///   ],
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmBridgeConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bridge-level settings.
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Controllers to connect to.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

impl HmBridgeConfig {
    /// Build a configuration from settings and remotes with default logging.
    pub fn new(bridge: BridgeSettings, remotes: Vec<RemoteConfig>) -> Self {
        Self {
            logging: LoggingConfig::default(),
            bridge,
            remotes,
        }
    }

    /// Load configuration from a JSON5 file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string and validate it.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = hmbridge_common::parse_config(content)
            .map_err(|e| BridgeError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.interface_id.is_empty() {
            return Err(BridgeError::validation("interface_id must not be empty"));
        }

        if self.remotes.is_empty() {
            return Err(BridgeError::validation("At least one remote required"));
        }

        let mut names = HashSet::new();
        for remote in &self.remotes {
            if remote.name.is_empty() {
                return Err(BridgeError::validation("Remote name must not be empty"));
            }
            // The remote name is recovered from the interface id by splitting on '-'.
            if remote.name.contains('-') {
                return Err(BridgeError::validation(format!(
                    "Remote name '{}' must not contain '-'",
                    remote.name
                )));
            }
            if !names.insert(remote.name.as_str()) {
                return Err(BridgeError::validation(format!(
                    "Duplicate remote name '{}'",
                    remote.name
                )));
            }
            if remote.host.is_empty() {
                return Err(BridgeError::validation(format!(
                    "Remote '{}' has no host",
                    remote.name
                )));
            }
            if remote.port == 0 {
                return Err(BridgeError::validation(format!(
                    "Remote '{}' has an invalid port",
                    remote.name
                )));
            }
        }

        Ok(())
    }
}

/// Bridge-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Address the callback server binds to.
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Port the callback server binds to (0 = OS assigned).
    #[serde(default)]
    pub local_port: u16,

    /// Interface id announced to the controllers.
    #[serde(default = "default_interface_id")]
    pub interface_id: String,

    /// Device cache file template, `%s` is replaced by the remote name.
    #[serde(default)]
    pub device_file: Option<String>,

    /// Paramset cache file template, `%s` is replaced by the remote name.
    #[serde(default)]
    pub paramset_file: Option<String>,

    /// Fetch all paramsets of every channel when it is created.
    #[serde(default)]
    pub resolve_paramsets: bool,
}

fn default_local_host() -> String {
    "0.0.0.0".to_string()
}

fn default_interface_id() -> String {
    "hmbridge".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            local_host: default_local_host(),
            local_port: 0,
            interface_id: default_interface_id(),
            device_file: None,
            paramset_file: None,
            resolve_paramsets: false,
        }
    }
}

impl BridgeSettings {
    /// Interface id for a remote as sent in `init`.
    pub fn interface_id_for(&self, remote: &str) -> String {
        format!("{}-{}", self.interface_id, remote)
    }

    /// Device cache path for a remote, if a valid template is configured.
    pub fn device_file_for(&self, remote: &str) -> Option<PathBuf> {
        expand_template(self.device_file.as_deref(), remote, "device_file")
    }

    /// Paramset cache path for a remote, if a valid template is configured.
    pub fn paramset_file_for(&self, remote: &str) -> Option<PathBuf> {
        expand_template(self.paramset_file.as_deref(), remote, "paramset_file")
    }
}

fn expand_template(template: Option<&str>, remote: &str, field: &str) -> Option<PathBuf> {
    let template = template?;
    if !template.contains("%s") {
        tracing::warn!(field, template, "Invalid file template (missing %s), caching disabled");
        return None;
    }
    Some(PathBuf::from(template.replace("%s", remote)))
}

/// Recover the remote name from an interface id (`{interface_id}-{remote}`).
pub fn remote_from_interface_id(interface_id: &str) -> &str {
    interface_id.rsplit('-').next().unwrap_or(interface_id)
}

/// Name resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveNames {
    /// Keep raw addresses as names.
    #[default]
    None,
    /// Per-device `getMetadata(address, "NAME")`.
    Metadata,
    /// Session based JSON API of the CCU.
    Json,
    /// XML-API add-on device listing.
    Xml,
}

/// Wire encoding used towards a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcEncoding {
    /// XML-RPC, spoken by CCU and Homegear.
    #[default]
    Xml,
    /// JSON-RPC 2.0 over HTTP.
    Json,
}

/// Configuration for a single controller interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote name (used in the interface id and cache file names).
    pub name: String,

    /// Controller host name or IP.
    pub host: String,

    /// RPC port (2001 BidCos-RF, 2010 HmIP, 2000 wired, ...).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path appended to the RPC URL.
    #[serde(default)]
    pub path: String,

    /// Wire encoding of outbound calls.
    #[serde(default)]
    pub encoding: RpcEncoding,

    /// RPC / JSON API username.
    #[serde(default)]
    pub username: Option<String>,

    /// RPC / JSON API password.
    #[serde(default)]
    pub password: Option<String>,

    /// Name resolution strategy.
    #[serde(default)]
    pub resolve_names: ResolveNames,

    /// Perform the init handshake on start.
    #[serde(default = "default_true")]
    pub connect: bool,

    /// Port of the controller's web server (JSON API, XML-API).
    #[serde(default = "default_json_port", alias = "jsonport")]
    pub json_port: u16,

    /// Use HTTPS towards the controller.
    #[serde(default)]
    pub tls: bool,

    /// Verify the controller's TLS certificate.
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Callback host announced in `init` instead of the discovered local IP.
    #[serde(default)]
    pub callback_host: Option<String>,

    /// Callback port announced in `init` instead of the server's port.
    #[serde(default)]
    pub callback_port: Option<u16>,

    /// Optional per-request timeout in seconds (none by default).
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    2001
}

fn default_json_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

impl RemoteConfig {
    /// Create a remote with defaults for everything but name, host and port.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            path: String::new(),
            encoding: RpcEncoding::Xml,
            username: None,
            password: None,
            resolve_names: ResolveNames::None,
            connect: true,
            json_port: default_json_port(),
            tls: false,
            verify_tls: true,
            callback_host: None,
            callback_port: None,
            request_timeout_secs: None,
        }
    }

    /// Whether this remote is a HomeMatic IP interface.
    ///
    /// HmIP answers `init` without pushing its device list reliably, and
    /// limits the size of `listDevices` answers it accepts.
    pub fn is_hmip(&self) -> bool {
        HMIP_PORTS.contains(&self.port)
    }

    /// Whether both username and password are set and non-empty.
    pub fn has_credentials(&self) -> bool {
        matches!(
            (&self.username, &self.password),
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty()
        )
    }

    /// Basic-auth credentials for the RPC endpoint.
    ///
    /// A username containing ':' is taken to be pre-encoded and is not used.
    pub fn rpc_credentials(&self) -> Option<(String, Option<String>)> {
        let user = self.username.as_deref().filter(|u| !u.is_empty())?;
        if user.contains(':') {
            return None;
        }
        Some((user.to_string(), self.password.clone()))
    }

    /// RPC endpoint URL (without credentials).
    pub fn rpc_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }

    /// Base URL of the controller's web server.
    pub fn web_url(&self) -> String {
        let scheme = if self.tls || self.json_port == 443 {
            "https"
        } else {
            "http"
        };
        format!("{}://{}:{}", scheme, self.host, self.json_port)
    }

    /// Ports under which the JSON API may list this interface.
    pub fn interface_ports(&self) -> [u32; 3] {
        let port = u32::from(self.port);
        [port, port + 30000, port + 40000]
    }
}
