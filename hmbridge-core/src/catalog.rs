//! Device catalog: behavior selected by the device's type string.
//!
//! A [`DeviceProfile`] describes how a device's logical names map to
//! parameters on its channels. Profiles are built from node tables plus
//! [`Capability`] flags that add common entries. The [`DeviceCatalog`] maps
//! type strings to profile constructors and falls back to
//! [`DeviceProfile::generic`] for anything unknown.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::description::RawDeviceDescription;

/// The kind of a node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Read-only measured values.
    Sensor,
    /// Read-only boolean states.
    Binary,
    /// Read-only device attributes (battery, sabotage, ...).
    Attribute,
    /// Writable values.
    Write,
    /// Fire-and-forget actions.
    Action,
    /// Parameters only ever seen as events.
    Event,
}

/// Logical name to channel list. An empty list means "the channel the
/// caller asks for", defaulting to the profile's element channels.
pub type NodeTable = BTreeMap<String, Vec<i64>>;

/// Reusable feature flags that add node-table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    LowBattery,
    Sabotage,
    Working,
    OnTime,
    BinaryState,
    RssiDevice,
}

impl Capability {
    /// The node-table entry this capability contributes.
    pub fn node(self) -> (NodeKind, &'static str, Vec<i64>) {
        match self {
            Capability::LowBattery => (NodeKind::Attribute, "LOWBAT", vec![]),
            Capability::Sabotage => (NodeKind::Attribute, "ERROR", vec![]),
            Capability::Working => (NodeKind::Attribute, "WORKING", vec![]),
            Capability::OnTime => (NodeKind::Write, "ON_TIME", vec![]),
            Capability::BinaryState => (NodeKind::Binary, "STATE", vec![]),
            Capability::RssiDevice => (NodeKind::Attribute, "RSSI_DEVICE", vec![0]),
        }
    }
}

/// Behavior of a device type.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    kind: String,
    element: Vec<i64>,
    tables: HashMap<NodeKind, NodeTable>,
    capabilities: BTreeSet<Capability>,
}

impl DeviceProfile {
    /// Create an empty profile with the given default channels.
    pub fn new(kind: impl Into<String>, element: Vec<i64>) -> Self {
        Self {
            kind: kind.into(),
            element,
            tables: HashMap::new(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Profile for unknown types: no logical names, channel 1 by default.
    pub fn generic() -> Self {
        Self::new("Generic", vec![1])
    }

    /// Add a node-table entry.
    pub fn with_node(mut self, kind: NodeKind, name: &str, channels: Vec<i64>) -> Self {
        self.tables
            .entry(kind)
            .or_default()
            .insert(name.to_string(), channels);
        self
    }

    /// Attach a capability and its node-table entry.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if self.capabilities.insert(capability) {
            let (kind, name, channels) = capability.node();
            self = self.with_node(kind, name, channels);
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Default channel indices.
    pub fn element(&self) -> &[i64] {
        &self.element
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    pub fn nodes(&self, kind: NodeKind) -> Option<&NodeTable> {
        self.tables.get(&kind)
    }

    /// Logical names of a table, sorted.
    pub fn node_names(&self, kind: NodeKind) -> Vec<&str> {
        self.tables
            .get(&kind)
            .map(|table| table.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Channels a logical name lives on, with caller-channel entries expanded
    /// to the element channels.
    pub fn channels_for(&self, kind: NodeKind, name: &str) -> Option<Vec<i64>> {
        let channels = self.tables.get(&kind)?.get(name)?;
        if channels.is_empty() {
            Some(self.element.clone())
        } else {
            Some(channels.clone())
        }
    }

    /// Pick the channel for a logical name.
    ///
    /// A table entry pinned to a single channel always uses it; otherwise the
    /// caller's channel wins and defaults to the first listed index.
    pub fn resolve_channel(&self, kind: NodeKind, name: &str, channel: Option<i64>) -> Option<i64> {
        let pinned = self.tables.get(&kind)?.get(name)?;
        let listed = if pinned.is_empty() {
            &self.element
        } else {
            pinned
        };
        match (pinned.as_slice(), channel) {
            ([only], _) => Some(*only),
            (_, Some(channel)) => Some(channel),
            (_, None) => listed.first().copied(),
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::generic()
    }
}

/// Constructor building a profile from the device's description.
pub type ProfileConstructor = fn(&RawDeviceDescription) -> DeviceProfile;

/// Type string to profile constructor.
#[derive(Debug, Clone)]
pub struct DeviceCatalog {
    constructors: HashMap<String, ProfileConstructor>,
}

impl DeviceCatalog {
    /// An empty catalog: every device gets the generic profile.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A catalog with the built-in profiles registered.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::empty();
        for device_type in ["HM-Sec-SC", "HM-Sec-SC-2", "ZEL STG RM FFK", "HmIP-SWDO"] {
            catalog.register(device_type, shutter_contact);
        }
        for device_type in [
            "HM-LC-Sw1-Pl",
            "HM-LC-Sw1-Pl-2",
            "HM-LC-Sw1-FM",
            "HM-LC-Sw2-FM",
            "HM-LC-Sw4-DR",
            "HM-LC-Sw4-SM",
            "HM-LC-Sw1PBU-FM",
            "HM-LC-Sw4-PCB",
            "HM-MOD-Re-8",
        ] {
            catalog.register(device_type, switch);
        }
        for device_type in ["HM-LC-Bl1-SM", "HM-LC-Bl1-FM", "HM-LC-Bl1PBU-FM", "ZEL STG RM FEP 230V"] {
            catalog.register(device_type, blind);
        }
        for device_type in [
            "HM-RC-4",
            "HM-RC-4-2",
            "HM-RC-4-3",
            "HM-RC-8",
            "HM-RC-Key4-2",
            "HM-RC-Sec4-2",
            "HM-RC-Sec3",
            "HM-PB-2-WM55",
            "HM-PB-4-WM",
        ] {
            catalog.register(device_type, remote);
        }
        catalog
    }

    /// Register (or replace) the constructor for a type string.
    pub fn register(&mut self, device_type: impl Into<String>, constructor: ProfileConstructor) {
        self.constructors.insert(device_type.into(), constructor);
    }

    pub fn supports(&self, device_type: &str) -> bool {
        self.constructors.contains_key(device_type)
    }

    /// Profile for a device description; unknown types get the generic profile.
    pub fn profile_for(&self, description: &RawDeviceDescription) -> DeviceProfile {
        match self.constructors.get(description.device_type()) {
            Some(constructor) => constructor(description),
            None => DeviceProfile::generic(),
        }
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl Default for DeviceCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Door / window contact.
pub fn shutter_contact(_: &RawDeviceDescription) -> DeviceProfile {
    DeviceProfile::new("ShutterContact", vec![1])
        .with_capability(Capability::BinaryState)
        .with_capability(Capability::LowBattery)
        .with_capability(Capability::Sabotage)
        .with_capability(Capability::RssiDevice)
}

/// Switch actuator; multi-channel variants expose every relay.
pub fn switch(description: &RawDeviceDescription) -> DeviceProfile {
    let device_type = description.device_type();
    let element = if device_type.contains("LC-Sw2") {
        vec![1, 2]
    } else if device_type.contains("LC-Sw4") {
        vec![1, 2, 3, 4]
    } else if device_type.contains("Re-8") {
        (1..=8).collect()
    } else {
        vec![1]
    };

    DeviceProfile::new("Switch", element)
        .with_node(NodeKind::Write, "STATE", vec![])
        .with_capability(Capability::BinaryState)
        .with_capability(Capability::Working)
        .with_capability(Capability::OnTime)
        .with_capability(Capability::RssiDevice)
}

/// Roller shutter / blind actuator.
pub fn blind(_: &RawDeviceDescription) -> DeviceProfile {
    DeviceProfile::new("Blind", vec![1])
        .with_node(NodeKind::Sensor, "LEVEL", vec![])
        .with_node(NodeKind::Write, "LEVEL", vec![])
        .with_node(NodeKind::Action, "STOP", vec![])
        .with_capability(Capability::Working)
        .with_capability(Capability::RssiDevice)
}

/// Button remote; the number of buttons follows the type string.
pub fn remote(description: &RawDeviceDescription) -> DeviceProfile {
    let device_type = description.device_type();
    let buttons = if device_type.contains("RC-2") || device_type.contains("PB-2") {
        2
    } else if device_type.contains("Sec3") || device_type.contains("Key3") {
        3
    } else if device_type.contains("RC-4")
        || device_type.contains("PB-4")
        || device_type.contains("Sec4")
        || device_type.contains("Key4")
    {
        4
    } else if device_type.contains("RC-8") {
        8
    } else {
        1
    };

    let mut profile = DeviceProfile::new("Remote", (1..=buttons).collect());
    for name in ["PRESS_SHORT", "PRESS_LONG", "PRESS_CONT", "PRESS_LONG_RELEASE"] {
        profile = profile.with_node(NodeKind::Event, name, vec![]);
    }
    profile
        .with_node(NodeKind::Action, "PRESS_SHORT", vec![])
        .with_node(NodeKind::Action, "PRESS_LONG", vec![])
        .with_capability(Capability::LowBattery)
}
