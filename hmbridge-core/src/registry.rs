//! Per-remote device registry.
//!
//! Keeps the raw description list (as persisted in the device cache) and the
//! typed node tree in lockstep. All state sits behind one `RwLock`; nothing
//! in here calls back into user code or touches the network while it is
//! held.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::DeviceCatalog;
use crate::description::RawDeviceDescription;
use crate::error::Result;
use crate::node::{ChannelNode, DeviceNode, Node, NodeCore, NodeEvent};
use crate::paramsets::ParamsetStore;
use crate::proxy::LockingProxy;

/// Addresses touched by a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Devices created by this rebuild.
    pub devices: Vec<String>,
    /// Channels created by this rebuild.
    pub channels: Vec<String>,
    /// Channels whose parent is not known yet.
    pub skipped: Vec<String>,
}

impl BuildReport {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.channels.is_empty()
    }

    /// Number of nodes created.
    pub fn created(&self) -> usize {
        self.devices.len() + self.channels.len()
    }
}

#[derive(Default)]
struct RegistryState {
    raw: Vec<RawDeviceDescription>,
    devices: BTreeMap<String, Arc<DeviceNode>>,
    nodes: BTreeMap<String, Node>,
}

/// Devices and channels of one remote.
pub struct DeviceRegistry {
    remote: String,
    interface_id: String,
    proxy: Arc<LockingProxy>,
    catalog: Arc<DeviceCatalog>,
    store: Arc<ParamsetStore>,
    device_file: Option<PathBuf>,
    paramset_file: Option<PathBuf>,
    state: RwLock<RegistryState>,
}

impl DeviceRegistry {
    /// Create an empty registry without cache files.
    pub fn new(proxy: Arc<LockingProxy>, catalog: Arc<DeviceCatalog>) -> Self {
        Self {
            remote: proxy.remote().to_string(),
            interface_id: proxy.interface_id().to_string(),
            proxy,
            catalog,
            store: Arc::new(ParamsetStore::new()),
            device_file: None,
            paramset_file: None,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Create a registry backed by cache files and load them.
    ///
    /// Missing files yield an empty registry; unreadable ones are logged and
    /// ignored.
    pub fn open(
        proxy: Arc<LockingProxy>,
        catalog: Arc<DeviceCatalog>,
        device_file: Option<PathBuf>,
        paramset_file: Option<PathBuf>,
    ) -> Result<Self> {
        let store = match &paramset_file {
            Some(path) => ParamsetStore::load(path)?,
            None => ParamsetStore::new(),
        };
        let raw = match &device_file {
            Some(path) => load_descriptions(path)?,
            None => Vec::new(),
        };

        let mut registry = Self::new(proxy, catalog);
        registry.store = Arc::new(store);
        registry.device_file = device_file;
        registry.paramset_file = paramset_file;
        registry.state.write().raw = raw;

        let report = registry.rebuild();
        info!(
            remote = %registry.remote,
            devices = report.devices.len(),
            channels = report.channels.len(),
            "Loaded device cache"
        );
        Ok(registry)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub fn proxy(&self) -> &Arc<LockingProxy> {
        &self.proxy
    }

    pub fn paramset_store(&self) -> &Arc<ParamsetStore> {
        &self.store
    }

    /// Persist the raw description list.
    pub async fn save_devices(&self) -> Result<()> {
        let Some(path) = &self.device_file else {
            return Ok(());
        };
        let content = serde_json::to_string(&self.state.read().raw)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Persist the paramset store.
    pub async fn save_paramsets(&self) -> Result<()> {
        match &self.paramset_file {
            Some(path) => self.store.save(path).await,
            None => Ok(()),
        }
    }

    /// Write both cache files. Failures are logged.
    pub async fn persist(&self) {
        if let Err(e) = self.save_devices().await {
            warn!(remote = %self.remote, error = %e, "Failed to save device cache");
        }
        if let Err(e) = self.save_paramsets().await {
            warn!(remote = %self.remote, error = %e, "Failed to save paramset cache");
        }
    }

    /// Create nodes for every description that has none yet.
    ///
    /// Devices are created first, then channels are attached to their
    /// parents. A channel whose parent is unknown is skipped and picked up
    /// by a later rebuild. Running it twice creates nothing new.
    pub fn rebuild(&self) -> BuildReport {
        let mut report = BuildReport::default();
        let mut guard = self.state.write();
        let state = &mut *guard;

        for description in state.raw.iter().filter(|d| d.is_device()) {
            let address = description.address();
            if address.is_empty() || state.nodes.contains_key(address) {
                continue;
            }

            let profile = self.catalog.profile_for(description);
            let device = Arc::new(DeviceNode::new(self.core(description), profile));
            state.devices.insert(address.to_string(), device.clone());
            state.nodes.insert(address.to_string(), Node::Device(device));
            report.devices.push(address.to_string());
        }

        for description in state.raw.iter().filter(|d| !d.is_device()) {
            let address = description.address();
            if address.is_empty() || state.nodes.contains_key(address) {
                continue;
            }

            let parent_address = description.parent().unwrap_or_default();
            let Some(parent) = state.devices.get(parent_address) else {
                debug!(remote = %self.remote, address, parent = parent_address, "Parent not known yet, skipping channel");
                report.skipped.push(address.to_string());
                continue;
            };

            let channel = Arc::new(ChannelNode::new(self.core(description), parent));
            parent.attach_channel(channel.clone());
            state.nodes.insert(address.to_string(), Node::Channel(channel));
            report.channels.push(address.to_string());
        }

        if !report.is_empty() {
            debug!(
                remote = %self.remote,
                devices = report.devices.len(),
                channels = report.channels.len(),
                skipped = report.skipped.len(),
                "Registry rebuilt"
            );
        }
        report
    }

    fn core(&self, description: &RawDeviceDescription) -> NodeCore {
        NodeCore::new(
            description.clone(),
            self.interface_id.clone(),
            self.proxy.clone(),
            self.store.clone(),
        )
    }

    /// Merge descriptions announced by the remote and rebuild.
    ///
    /// Addresses already known are ignored, as are duplicates within the
    /// batch. Cache files are written by [`DeviceRegistry::persist`].
    pub fn add_descriptions(&self, descriptions: Vec<RawDeviceDescription>) -> BuildReport {
        let mut added = 0;
        {
            let mut state = self.state.write();
            let mut known: HashSet<String> =
                state.raw.iter().map(|d| d.address().to_string()).collect();

            for description in descriptions {
                let address = description.address().to_string();
                if address.is_empty() {
                    continue;
                }
                self.store.ensure(&address);
                if known.insert(address) {
                    state.raw.push(description);
                    added += 1;
                }
            }
        }

        debug!(remote = %self.remote, added, "New device descriptions");
        self.rebuild()
    }

    /// Forget addresses: prune the raw list and paramset store and tear down
    /// the live nodes.
    ///
    /// Channels of a deleted device go with it. Returns the addresses
    /// actually removed.
    pub fn remove_addresses(&self, addresses: &[String]) -> Vec<String> {
        let requested: HashSet<&str> = addresses.iter().map(String::as_str).collect();
        let mut removed_nodes = Vec::new();

        let removed: Vec<String> = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            // Channels of deleted devices, from the raw list and the live tree
            let cascaded: Vec<String> = state
                .raw
                .iter()
                .filter(|d| d.parent().is_some_and(|p| requested.contains(p)))
                .map(|d| d.address().to_string())
                .chain(
                    requested
                        .iter()
                        .filter_map(|a| state.devices.get(*a))
                        .flat_map(|d| d.channels())
                        .map(|c| c.address().to_string()),
                )
                .collect();

            let mut all: Vec<String> = addresses.to_vec();
            all.extend(cascaded);
            all.sort();
            all.dedup();

            let doomed: HashSet<&str> = all.iter().map(String::as_str).collect();
            state.raw.retain(|d| !doomed.contains(d.address()));

            for address in &all {
                self.store.remove(address);
                if let Some(node) = state.nodes.remove(address) {
                    if let Node::Channel(channel) = &node {
                        if let Some(parent) = channel.parent() {
                            parent.detach_channel(channel.index());
                        }
                    }
                    state.devices.remove(address);
                    removed_nodes.push(node);
                }
            }
            all
        };

        for node in &removed_nodes {
            node.tear_down();
        }

        info!(remote = %self.remote, count = removed.len(), "Deleted devices");
        removed
    }

    /// The raw description list.
    pub fn raw_descriptions(&self) -> Vec<RawDeviceDescription> {
        self.state.read().raw.clone()
    }

    pub fn device(&self, address: &str) -> Option<Arc<DeviceNode>> {
        self.state.read().devices.get(address).cloned()
    }

    pub fn node(&self, address: &str) -> Option<Node> {
        self.state.read().nodes.get(address).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<DeviceNode>> {
        self.state.read().devices.values().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.state.read().nodes.keys().cloned().collect()
    }

    /// Route an event to its node. Returns `false` for unknown addresses.
    pub fn handle_event(&self, event: &NodeEvent) -> bool {
        let node = self.node(&event.address);
        match node {
            Some(node) => {
                node.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Set the display name of a node; a device passes it on to its channels.
    pub fn apply_name(&self, address: &str, name: &str) -> bool {
        match self.node(address) {
            Some(Node::Device(device)) => {
                device.set_name(name);
                for channel in device.channels() {
                    channel.set_name(name);
                }
                true
            }
            Some(Node::Channel(channel)) => {
                channel.set_name(name);
                true
            }
            None => false,
        }
    }

    /// Pull all paramsets of the given channels and persist the store.
    pub async fn refresh_paramsets(&self, addresses: &[String]) -> usize {
        let mut updated = 0;
        for address in addresses {
            if let Some(node) = self.node(address) {
                updated += node.update_paramsets().await;
            }
        }
        if updated > 0 {
            if let Err(e) = self.save_paramsets().await {
                warn!(remote = %self.remote, error = %e, "Failed to save paramset cache");
            }
        }
        updated
    }

    /// Drop every node and description (the cache files are left alone).
    pub fn clear(&self) {
        let nodes: Vec<Node> = {
            let mut state = self.state.write();
            state.raw.clear();
            state.devices.clear();
            std::mem::take(&mut state.nodes).into_values().collect()
        };
        for node in &nodes {
            node.tear_down();
        }
    }
}

fn load_descriptions(path: &Path) -> Result<Vec<RawDeviceDescription>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(raw) => Ok(raw),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable device cache");
            Ok(Vec::new())
        }
    }
}
