//! Raw device descriptions as delivered by `listDevices` / `newDevices`.

use serde::{Deserialize, Serialize};

use hmbridge_common::{RpcStruct, RpcValue, value_as_i64, value_as_str};

/// An untyped device or channel description.
///
/// Only a handful of keys are interpreted; everything else is kept as is and
/// written back to the device cache unchanged. Missing or mistyped fields
/// fall back to defaults instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDeviceDescription(RpcStruct);

impl RawDeviceDescription {
    pub fn new(fields: RpcStruct) -> Self {
        Self(fields)
    }

    /// Build a description from an arbitrary value (non-objects are rejected).
    pub fn from_value(value: RpcValue) -> Option<Self> {
        match value {
            RpcValue::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    fn str_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(value_as_str).unwrap_or_default()
    }

    pub fn address(&self) -> &str {
        self.str_field("ADDRESS")
    }

    pub fn device_type(&self) -> &str {
        self.str_field("TYPE")
    }

    /// Parent address; `None` for devices (missing or empty `PARENT`).
    pub fn parent(&self) -> Option<&str> {
        Some(self.str_field("PARENT")).filter(|p| !p.is_empty())
    }

    pub fn is_device(&self) -> bool {
        self.parent().is_none()
    }

    pub fn parent_type(&self) -> &str {
        self.str_field("PARENT_TYPE")
    }

    /// Channel index (0 when missing).
    pub fn index(&self) -> i64 {
        self.0.get("INDEX").and_then(value_as_i64).unwrap_or(0)
    }

    /// Names of the paramsets the node supports (`MASTER`, `VALUES`, `LINK`).
    pub fn paramsets(&self) -> Vec<String> {
        self.string_list("PARAMSETS")
    }

    /// Child addresses of a device.
    pub fn children(&self) -> Vec<String> {
        self.string_list("CHILDREN")
    }

    pub fn flags(&self) -> i64 {
        self.0.get("FLAGS").and_then(value_as_i64).unwrap_or(0)
    }

    pub fn firmware(&self) -> &str {
        self.str_field("FIRMWARE")
    }

    pub fn version(&self) -> i64 {
        self.0.get("VERSION").and_then(value_as_i64).unwrap_or(0)
    }

    pub fn rx_mode(&self) -> i64 {
        self.0.get("RX_MODE").and_then(value_as_i64).unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &RpcStruct {
        &self.0
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(RpcValue::Array(items)) => items
                .iter()
                .filter_map(value_as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<RawDeviceDescription> for RpcValue {
    fn from(description: RawDeviceDescription) -> Self {
        RpcValue::Object(description.0)
    }
}
