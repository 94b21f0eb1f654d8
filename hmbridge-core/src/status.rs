//! Bridge status reporting.

use serde::{Deserialize, Serialize};

use crate::health::{HealthSnapshot, RemoteStatus};

/// Status of one remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatusEntry {
    pub name: String,
    pub interface_id: String,
    pub health: HealthSnapshot,
    /// Number of device nodes.
    pub devices: usize,
    /// Number of device and channel nodes.
    pub nodes: usize,
    /// Whether the init handshake succeeded.
    pub initialized: bool,
}

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Lifecycle state ("created", "running", ...).
    pub state: String,
    /// Address of the callback server, once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_address: Option<String>,
    pub remotes: Vec<RemoteStatusEntry>,
}

impl BridgeStatus {
    pub fn new(state: impl Into<String>, callback_address: Option<String>) -> Self {
        Self {
            state: state.into(),
            callback_address,
            remotes: Vec::new(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteStatusEntry) -> Self {
        self.remotes.push(remote);
        self
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteStatusEntry> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// Total device nodes across remotes.
    pub fn device_count(&self) -> usize {
        self.remotes.iter().map(|r| r.devices).sum()
    }

    /// Whether every remote is initialized and online.
    pub fn is_healthy(&self) -> bool {
        self.remotes
            .iter()
            .all(|r| r.initialized && r.health.status == RemoteStatus::Online)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::RemoteHealth;

    fn entry(name: &str, initialized: bool, online: bool) -> RemoteStatusEntry {
        let health = RemoteHealth::new(name);
        if online {
            health.record_success();
        }
        RemoteStatusEntry {
            name: name.to_string(),
            interface_id: format!("hmbridge-{name}"),
            health: health.snapshot(),
            devices: 2,
            nodes: 5,
            initialized,
        }
    }

    #[test]
    fn test_status_serialization() {
        let status = BridgeStatus::new("running", Some("10.0.0.2:40001".to_string()))
            .with_remote(entry("rf", true, true));

        let json = status.to_json().unwrap();
        assert!(json.contains("\"state\": \"running\""));
        assert!(json.contains("\"interface_id\": \"hmbridge-rf\""));
        assert!(json.contains("\"status\": \"online\""));

        let parsed: BridgeStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.remote("rf").unwrap().nodes, 5);
    }

    #[test]
    fn test_health_aggregation() {
        let status = BridgeStatus::new("running", None)
            .with_remote(entry("rf", true, true))
            .with_remote(entry("ip", true, true));
        assert!(status.is_healthy());
        assert_eq!(status.device_count(), 4);

        let status = status.with_remote(entry("wired", false, false));
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_callback_address_omitted_when_unset() {
        let json = BridgeStatus::new("created", None).to_json().unwrap();
        assert!(!json.contains("callback_address"));
    }
}
