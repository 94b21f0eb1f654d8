//! Typed device and channel nodes.
//!
//! A [`DeviceNode`] wraps a parentless description and owns its
//! [`ChannelNode`]s by index. Channels point back to their device through a
//! `Weak` reference. Both share a [`NodeCore`] holding the description, the
//! remote's proxy, the shared paramset store, the display name, the unreach
//! flag and the event subscriptions.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use hmbridge_common::{RpcStruct, RpcValue, value_as_bool};

use crate::catalog::{DeviceProfile, NodeKind};
use crate::description::RawDeviceDescription;
use crate::error::{BridgeError, Result, RpcError};
use crate::paramsets::{AddressParamsets, ParamsetStore};
use crate::proxy::LockingProxy;

/// Parameter carrying the reachability of a node.
pub const PARAM_UNREACH: &str = "UNREACH";
/// Paramset holding the live values of a channel.
pub const PARAMSET_VALUES: &str = "VALUES";
/// Device-level signal strength parameter.
pub const PARAM_RSSI_DEVICE: &str = "RSSI_DEVICE";

/// An event pushed by a controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEvent {
    pub interface_id: String,
    pub address: String,
    pub key: String,
    pub value: RpcValue,
}

/// Event subscription callback.
pub type EventCallback = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// State shared by devices and channels.
pub struct NodeCore {
    description: RawDeviceDescription,
    interface_id: String,
    proxy: Arc<LockingProxy>,
    store: Arc<ParamsetStore>,
    name: RwLock<String>,
    unreach: AtomicBool,
    values: RwLock<RpcStruct>,
    subscriptions: RwLock<Vec<EventCallback>>,
    paramset_descriptions: RwLock<BTreeMap<String, RpcStruct>>,
}

impl NodeCore {
    pub fn new(
        description: RawDeviceDescription,
        interface_id: impl Into<String>,
        proxy: Arc<LockingProxy>,
        store: Arc<ParamsetStore>,
    ) -> Self {
        // Nodes are named after their address until a resolver runs
        let name = description.address().to_string();
        Self {
            description,
            interface_id: interface_id.into(),
            proxy,
            store,
            name: RwLock::new(name),
            unreach: AtomicBool::new(false),
            values: RwLock::new(RpcStruct::new()),
            subscriptions: RwLock::new(Vec::new()),
            paramset_descriptions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn address(&self) -> &str {
        self.description.address()
    }

    pub fn device_type(&self) -> &str {
        self.description.device_type()
    }

    pub fn description(&self) -> &RawDeviceDescription {
        &self.description
    }

    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub fn proxy(&self) -> &Arc<LockingProxy> {
        &self.proxy
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// This node's own unreach flag (channels are not consulted).
    pub fn own_unreach(&self) -> bool {
        self.unreach.load(Ordering::SeqCst)
    }

    /// Last value seen for `key` through events or `VALUES` refreshes.
    pub fn cached_value(&self, key: &str) -> Option<RpcValue> {
        self.values.read().get(key).cloned()
    }

    pub async fn get_value(&self, key: &str) -> std::result::Result<RpcValue, RpcError> {
        self.proxy.get_value(self.address(), key).await
    }

    pub async fn set_value(&self, key: &str, value: RpcValue) -> std::result::Result<(), RpcError> {
        self.proxy.set_value(self.address(), key, value).await
    }

    /// Cached value, fetched from the remote on a miss.
    pub async fn cached_or_fetched(&self, key: &str) -> std::result::Result<RpcValue, RpcError> {
        if let Some(value) = self.cached_value(key) {
            return Ok(value);
        }
        let value = self.get_value(key).await?;
        self.values.write().insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Fetch and remember the description of a paramset.
    pub async fn get_paramset_description(&self, paramset: &str) -> std::result::Result<RpcStruct, RpcError> {
        let description = self
            .proxy
            .get_paramset_description(self.address(), paramset)
            .await?;
        self.paramset_descriptions
            .write()
            .insert(paramset.to_string(), description.clone());
        Ok(description)
    }

    /// Previously fetched paramset description.
    pub fn paramset_description(&self, paramset: &str) -> Option<RpcStruct> {
        self.paramset_descriptions.read().get(paramset).cloned()
    }

    /// Pull one paramset from the remote into the shared store.
    ///
    /// Empty answers are not stored. Refreshing `VALUES` also refreshes the
    /// unreach flag. Returns whether something was stored.
    pub async fn update_paramset(&self, paramset: &str) -> std::result::Result<bool, RpcError> {
        if paramset.is_empty() {
            return Ok(false);
        }

        let values = self.proxy.get_paramset(self.address(), paramset).await?;
        if values.is_empty() {
            return Ok(false);
        }

        if paramset == PARAMSET_VALUES {
            if let Some(unreach) = values.get(PARAM_UNREACH).and_then(value_as_bool) {
                self.unreach.store(unreach, Ordering::SeqCst);
            }
            self.values
                .write()
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        self.store.insert(self.address(), paramset, values);
        Ok(true)
    }

    /// Pull every paramset the node declares. Failures are logged and skipped.
    pub async fn update_paramsets(&self) -> usize {
        let mut updated = 0;
        for paramset in self.description.paramsets() {
            match self.update_paramset(&paramset).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => debug!(
                    address = %self.address(),
                    paramset = %paramset,
                    error = %e,
                    "Failed to update paramset"
                ),
            }
        }
        updated
    }

    /// Write (part of) a paramset, then refresh all paramsets.
    ///
    /// Nothing is sent when the node does not declare `paramset` or `data`
    /// is empty; returns whether the write happened.
    pub async fn put_paramset(
        &self,
        paramset: &str,
        data: RpcStruct,
        rx_mode: Option<&str>,
    ) -> std::result::Result<bool, RpcError> {
        if data.is_empty() || !self.description.paramsets().iter().any(|p| p == paramset) {
            return Ok(false);
        }

        self.proxy
            .put_paramset(self.address(), paramset, data, rx_mode)
            .await?;
        self.update_paramsets().await;
        Ok(true)
    }

    /// Cached paramsets of this node.
    pub fn paramsets(&self) -> AddressParamsets {
        self.store.get(self.address()).unwrap_or_default()
    }

    /// Register a callback on this node only.
    pub fn subscribe_local(&self, callback: EventCallback) {
        self.subscriptions.write().push(callback);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Apply an event to this node and fan it out to its subscriptions.
    ///
    /// The key must already be upper-cased.
    pub fn handle_event(&self, event: &NodeEvent) {
        trace!(address = %self.address(), key = %event.key, "Node event");

        if event.key == PARAM_UNREACH {
            self.unreach
                .store(value_as_bool(&event.value).unwrap_or(false), Ordering::SeqCst);
        }
        self.values
            .write()
            .insert(event.key.clone(), event.value.clone());

        // Callbacks run without the subscription lock held
        let callbacks: Vec<EventCallback> = self.subscriptions.read().clone();
        for callback in callbacks {
            callback(event);
        }
    }

    fn clear_subscriptions(&self) {
        self.subscriptions.write().clear();
    }
}

/// A device (parentless node).
pub struct DeviceNode {
    core: NodeCore,
    profile: DeviceProfile,
    channels: RwLock<BTreeMap<i64, Arc<ChannelNode>>>,
}

impl DeviceNode {
    pub fn new(core: NodeCore, profile: DeviceProfile) -> Self {
        Self {
            core,
            profile,
            channels: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn channel(&self, index: i64) -> Option<Arc<ChannelNode>> {
        self.channels.read().get(&index).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<ChannelNode>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn channel_indices(&self) -> Vec<i64> {
        self.channels.read().keys().copied().collect()
    }

    pub(crate) fn attach_channel(&self, channel: Arc<ChannelNode>) {
        self.channels.write().insert(channel.index(), channel);
    }

    pub(crate) fn detach_channel(&self, index: i64) -> Option<Arc<ChannelNode>> {
        self.channels.write().remove(&index)
    }

    /// Drop all channels and subscriptions.
    pub(crate) fn tear_down(&self) -> Vec<Arc<ChannelNode>> {
        self.core.clear_subscriptions();
        let channels: Vec<_> = std::mem::take(&mut *self.channels.write())
            .into_values()
            .collect();
        for channel in &channels {
            channel.tear_down();
        }
        channels
    }

    /// Whether the device or any of its channels is unreachable.
    pub fn unreachable(&self) -> bool {
        self.core.own_unreach() || self.channels.read().values().any(|c| c.own_unreach())
    }

    /// Subscribe to events of this device and, with `bequeath`, of every
    /// channel it currently owns.
    pub fn subscribe(&self, callback: EventCallback, bequeath: bool) {
        self.core.subscribe_local(callback.clone());
        if bequeath {
            for channel in self.channels() {
                channel.subscribe_local(callback.clone());
            }
        }
    }

    /// Device-level signal strength.
    pub async fn rssi(&self) -> std::result::Result<RpcValue, RpcError> {
        self.core.get_value(PARAM_RSSI_DEVICE).await
    }

    /// The channel a logical name resolves to.
    fn node_channel(&self, kind: NodeKind, name: &str, channel: Option<i64>) -> Result<Arc<ChannelNode>> {
        self.profile
            .resolve_channel(kind, name, channel)
            .and_then(|index| self.channel(index))
            .ok_or_else(|| BridgeError::unknown_node(self.core.address(), name))
    }

    async fn read_node(&self, kind: NodeKind, name: &str, channel: Option<i64>) -> Result<RpcValue> {
        let node = self.node_channel(kind, name, channel)?;
        Ok(node.cached_or_fetched(name).await?)
    }

    /// Read a sensor value.
    pub async fn sensor_data(&self, name: &str, channel: Option<i64>) -> Result<RpcValue> {
        self.read_node(NodeKind::Sensor, name, channel).await
    }

    /// Read a boolean state.
    pub async fn binary_data(&self, name: &str, channel: Option<i64>) -> Result<bool> {
        let value = self.read_node(NodeKind::Binary, name, channel).await?;
        value_as_bool(&value).ok_or_else(|| BridgeError::UnexpectedValue {
            key: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Read a device attribute (battery, sabotage, working, ...).
    pub async fn attribute_data(&self, name: &str, channel: Option<i64>) -> Result<RpcValue> {
        self.read_node(NodeKind::Attribute, name, channel).await
    }

    /// Write a value.
    pub async fn write_data(&self, name: &str, value: RpcValue, channel: Option<i64>) -> Result<()> {
        let node = self.node_channel(NodeKind::Write, name, channel)?;
        Ok(node.set_value(name, value).await?)
    }

    /// Trigger an action.
    pub async fn action(&self, name: &str, value: RpcValue, channel: Option<i64>) -> Result<()> {
        let node = self.node_channel(NodeKind::Action, name, channel)?;
        Ok(node.set_value(name, value).await?)
    }
}

impl Deref for DeviceNode {
    type Target = NodeCore;

    fn deref(&self) -> &NodeCore {
        &self.core
    }
}

/// A channel of a device.
pub struct ChannelNode {
    core: NodeCore,
    index: i64,
    parent: Weak<DeviceNode>,
}

impl ChannelNode {
    pub fn new(core: NodeCore, parent: &Arc<DeviceNode>) -> Self {
        let index = core.description().index();
        Self {
            core,
            index,
            parent: Arc::downgrade(parent),
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    /// Parent address as listed in the description.
    pub fn parent_address(&self) -> &str {
        self.core.description().parent().unwrap_or_default()
    }

    /// The owning device, if it is still alive.
    pub fn parent(&self) -> Option<Arc<DeviceNode>> {
        self.parent.upgrade()
    }

    pub fn unreachable(&self) -> bool {
        self.core.own_unreach()
    }

    /// Signal strength of the owning device.
    pub async fn rssi(&self) -> std::result::Result<RpcValue, RpcError> {
        self.core
            .proxy()
            .get_value(self.parent_address(), PARAM_RSSI_DEVICE)
            .await
    }

    fn tear_down(&self) {
        self.core.clear_subscriptions();
    }
}

impl Deref for ChannelNode {
    type Target = NodeCore;

    fn deref(&self) -> &NodeCore {
        &self.core
    }
}

/// Any node of the address map.
#[derive(Clone)]
pub enum Node {
    Device(Arc<DeviceNode>),
    Channel(Arc<ChannelNode>),
}

impl Node {
    pub fn as_device(&self) -> Option<&Arc<DeviceNode>> {
        match self {
            Node::Device(device) => Some(device),
            Node::Channel(_) => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Arc<ChannelNode>> {
        match self {
            Node::Device(_) => None,
            Node::Channel(channel) => Some(channel),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Node::Device(_))
    }

    /// Device: own flag or any channel; channel: own flag.
    pub fn unreachable(&self) -> bool {
        match self {
            Node::Device(device) => device.unreachable(),
            Node::Channel(channel) => channel.unreachable(),
        }
    }

    /// Subscribe to events; `bequeath` only has an effect on devices.
    pub fn subscribe(&self, callback: EventCallback, bequeath: bool) {
        match self {
            Node::Device(device) => device.subscribe(callback, bequeath),
            Node::Channel(channel) => channel.subscribe_local(callback),
        }
    }

    pub async fn rssi(&self) -> std::result::Result<RpcValue, RpcError> {
        match self {
            Node::Device(device) => device.rssi().await,
            Node::Channel(channel) => channel.rssi().await,
        }
    }

    pub(crate) fn tear_down(&self) {
        match self {
            Node::Device(device) => {
                device.tear_down();
            }
            Node::Channel(channel) => channel.tear_down(),
        }
    }
}

impl Deref for Node {
    type Target = NodeCore;

    fn deref(&self) -> &NodeCore {
        match self {
            Node::Device(device) => &device.core,
            Node::Channel(channel) => &channel.core,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_device() { "Device" } else { "Channel" };
        f.debug_struct(kind)
            .field("address", &self.address())
            .field("type", &self.device_type())
            .field("name", &self.name())
            .finish()
    }
}
