//! Per-remote paramset cache.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use tracing::warn;

use hmbridge_common::{RpcStruct, RpcValue};

use crate::error::Result;

/// Paramsets of one address, keyed by paramset name (`MASTER`, `VALUES`, ...).
pub type AddressParamsets = BTreeMap<String, RpcStruct>;

/// `address -> paramset name -> values`, shared by every node of a remote.
///
/// Persisted as `{address: {paramset: {...}}}`.
#[derive(Debug, Default)]
pub struct ParamsetStore {
    inner: RwLock<BTreeMap<String, AddressParamsets>>,
}

impl ParamsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a cache file. A missing file yields an empty store;
    /// an unreadable one is logged and ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let store = Self::new();
        if !path.exists() {
            return Ok(store);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<BTreeMap<String, AddressParamsets>>(&content) {
            Ok(map) => *store.inner.write() = map,
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable paramset cache"),
        }
        Ok(store)
    }

    /// Write the store to a cache file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string(&*self.inner.read())?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Make sure an (empty) entry exists for `address`.
    pub fn ensure(&self, address: &str) {
        self.inner.write().entry(address.to_string()).or_default();
    }

    pub fn insert(&self, address: &str, paramset: &str, values: RpcStruct) {
        self.inner
            .write()
            .entry(address.to_string())
            .or_default()
            .insert(paramset.to_string(), values);
    }

    pub fn remove(&self, address: &str) -> bool {
        self.inner.write().remove(address).is_some()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<AddressParamsets> {
        self.inner.read().get(address).cloned()
    }

    pub fn get_paramset(&self, address: &str, paramset: &str) -> Option<RpcStruct> {
        self.inner.read().get(address)?.get(paramset).cloned()
    }

    pub fn value(&self, address: &str, paramset: &str, key: &str) -> Option<RpcValue> {
        self.inner.read().get(address)?.get(paramset)?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, AddressParamsets> {
        self.inner.read().clone()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
