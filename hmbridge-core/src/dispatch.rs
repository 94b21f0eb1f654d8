//! Inbound call handling.
//!
//! [`CallbackHandler`] implements the methods a controller calls on us
//! (`event`, `newDevices`, `listDevices`, ...). Calls arrive from the HTTP
//! server through a [`DispatchHandle`] and are processed one at a time by a
//! single dispatcher task, so handlers never run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hmbridge_common::{RpcValue, value_as_i64, value_as_str};

use crate::config::{RemoteConfig, ResolveNames, remote_from_interface_id};
use crate::description::RawDeviceDescription;
use crate::error::RpcError;
use crate::jsonrpc::{METHOD_NOT_FOUND, fault_struct};
use crate::node::{EventCallback, NodeEvent};
use crate::registry::DeviceRegistry;
use crate::resolver::resolve_names;

/// Methods served to controllers.
pub const METHODS: &[&str] = &[
    "event",
    "newDevices",
    "deleteDevices",
    "listDevices",
    "error",
    "updateDevice",
    "replaceDevice",
    "readdedDevice",
    "system.listMethods",
    "system.multicall",
];

/// Queue depth between the HTTP server and the dispatcher.
pub const DISPATCH_QUEUE: usize = 64;

/// Notifications about the device set and controller errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// The registry of a remote was (re)built.
    DevicesCreated { interface_id: String },
    NewDevices {
        interface_id: String,
        descriptions: Vec<RawDeviceDescription>,
    },
    DeleteDevices {
        interface_id: String,
        addresses: Vec<String>,
    },
    ListDevices { interface_id: String },
    Error {
        interface_id: String,
        code: i64,
        message: String,
    },
    UpdateDevice {
        interface_id: String,
        address: String,
        hint: i64,
    },
    ReplaceDevice {
        interface_id: String,
        old_address: String,
        new_address: String,
    },
    ReaddedDevice {
        interface_id: String,
        addresses: Vec<String>,
    },
}

/// System notification callback.
pub type SystemCallback = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Implementation of the inbound method contract.
pub struct CallbackHandler {
    remotes: HashMap<String, RemoteConfig>,
    registries: RwLock<HashMap<String, Arc<DeviceRegistry>>>,
    resolve_paramsets: bool,
    on_event: Option<EventCallback>,
    on_system: Option<SystemCallback>,
}

impl CallbackHandler {
    pub fn new(remotes: &[RemoteConfig], resolve_paramsets: bool) -> Self {
        Self {
            remotes: remotes
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect(),
            registries: RwLock::new(HashMap::new()),
            resolve_paramsets,
            on_event: None,
            on_system: None,
        }
    }

    /// Callback invoked for every event after node subscriptions.
    pub fn with_event_callback(mut self, callback: Option<EventCallback>) -> Self {
        self.on_event = callback;
        self
    }

    /// Callback invoked for system notifications.
    pub fn with_system_callback(mut self, callback: Option<SystemCallback>) -> Self {
        self.on_system = callback;
        self
    }

    pub fn register(&self, registry: Arc<DeviceRegistry>) {
        self.registries
            .write()
            .insert(registry.remote().to_string(), registry);
    }

    pub fn registry(&self, remote: &str) -> Option<Arc<DeviceRegistry>> {
        self.registries.read().get(remote).cloned()
    }

    pub fn registries(&self) -> Vec<Arc<DeviceRegistry>> {
        self.registries.read().values().cloned().collect()
    }

    /// Drop every registry (their proxies go with them).
    pub fn clear(&self) {
        let registries: Vec<_> = self.registries.write().drain().map(|(_, r)| r).collect();
        for registry in registries {
            registry.clear();
        }
    }

    fn registry_for(&self, interface_id: &str) -> Option<Arc<DeviceRegistry>> {
        self.registry(remote_from_interface_id(interface_id))
    }

    fn notify(&self, event: SystemEvent) {
        if let Some(callback) = &self.on_system {
            callback(&event);
        }
    }

    /// A value changed on a device or channel.
    pub fn event(&self, interface_id: &str, address: &str, key: &str, value: RpcValue) {
        let event = NodeEvent {
            interface_id: interface_id.to_string(),
            address: address.to_string(),
            key: key.to_uppercase(),
            value,
        };
        debug!(interface_id, address, key = %event.key, value = %event.value, "Event");

        let routed = self
            .registry_for(interface_id)
            .is_some_and(|registry| registry.handle_event(&event));
        if !routed {
            debug!(interface_id, address, "Event for unknown address");
        }

        if let Some(callback) = &self.on_event {
            callback(&event);
        }
    }

    /// The controller announces devices.
    pub async fn new_devices(&self, interface_id: &str, descriptions: Vec<RawDeviceDescription>) {
        let Some(registry) = self.registry_for(interface_id) else {
            warn!(interface_id, "newDevices for unknown remote");
            return;
        };
        info!(interface_id, count = descriptions.len(), "New devices");

        let report = registry.add_descriptions(descriptions.clone());
        registry.persist().await;

        if let Some(remote) = self.remotes.get(registry.remote()) {
            if remote.resolve_names != ResolveNames::None && registry.node_count() > 0 {
                resolve_names(remote, &registry).await;
            }
        }
        if self.resolve_paramsets && !report.channels.is_empty() {
            registry.refresh_paramsets(&report.channels).await;
        }

        self.notify(SystemEvent::DevicesCreated {
            interface_id: interface_id.to_string(),
        });
        self.notify(SystemEvent::NewDevices {
            interface_id: interface_id.to_string(),
            descriptions,
        });
    }

    /// The controller removed devices.
    pub async fn delete_devices(&self, interface_id: &str, addresses: Vec<String>) {
        match self.registry_for(interface_id) {
            Some(registry) => {
                registry.remove_addresses(&addresses);
                registry.persist().await;
            }
            None => warn!(interface_id, "deleteDevices for unknown remote"),
        }
        self.notify(SystemEvent::DeleteDevices {
            interface_id: interface_id.to_string(),
            addresses,
        });
    }

    /// Devices we know about. HmIP remotes get an empty list because the
    /// controller cannot take large answers.
    pub fn list_devices(&self, interface_id: &str) -> Vec<RawDeviceDescription> {
        self.notify(SystemEvent::ListDevices {
            interface_id: interface_id.to_string(),
        });

        match self.registry_for(interface_id) {
            Some(registry) if registry.proxy().is_hmip() => Vec::new(),
            Some(registry) => registry.raw_descriptions(),
            None => Vec::new(),
        }
    }

    pub fn error(&self, interface_id: &str, code: i64, message: &str) {
        warn!(interface_id, code, message, "Controller reported an error");
        self.notify(SystemEvent::Error {
            interface_id: interface_id.to_string(),
            code,
            message: message.to_string(),
        });
    }

    pub fn update_device(&self, interface_id: &str, address: &str, hint: i64) {
        debug!(interface_id, address, hint, "updateDevice");
        self.notify(SystemEvent::UpdateDevice {
            interface_id: interface_id.to_string(),
            address: address.to_string(),
            hint,
        });
    }

    pub fn replace_device(&self, interface_id: &str, old_address: &str, new_address: &str) {
        debug!(interface_id, old_address, new_address, "replaceDevice");
        self.notify(SystemEvent::ReplaceDevice {
            interface_id: interface_id.to_string(),
            old_address: old_address.to_string(),
            new_address: new_address.to_string(),
        });
    }

    pub fn readded_device(&self, interface_id: &str, addresses: Vec<String>) {
        debug!(interface_id, count = addresses.len(), "readdedDevice");
        self.notify(SystemEvent::ReaddedDevice {
            interface_id: interface_id.to_string(),
            addresses,
        });
    }

    /// Dispatch one inbound call, including `system.multicall`.
    pub async fn dispatch(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        if method != "system.multicall" {
            return self.dispatch_single(method, params).await;
        }

        let calls = match params.into_iter().next() {
            Some(RpcValue::Array(calls)) => calls,
            _ => return Err(RpcError::invalid_params("system.multicall expects a list of calls")),
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let name = call.get("methodName").and_then(value_as_str).unwrap_or_default().to_string();
            let params = match call.get("params") {
                Some(RpcValue::Array(params)) => params.clone(),
                _ => Vec::new(),
            };

            let result = if name == "system.multicall" {
                Err(RpcError::invalid_params("Recursive system.multicall"))
            } else {
                self.dispatch_single(&name, params).await
            };
            results.push(match result {
                // Each successful result is wrapped in a one-element list
                Ok(value) => json!([value]),
                Err(err) => fault_struct(&err),
            });
        }
        Ok(RpcValue::Array(results))
    }

    async fn dispatch_single(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        match method {
            "event" => {
                let interface_id = str_param(&params, 0)?;
                let address = str_param(&params, 1)?;
                let key = str_param(&params, 2)?;
                let value = params
                    .get(3)
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_params("event expects a value"))?;
                self.event(interface_id, address, key, value);
                Ok(json!(true))
            }
            "newDevices" => {
                let interface_id = str_param(&params, 0)?;
                let descriptions = list_param(&params, 1)?
                    .iter()
                    .cloned()
                    .filter_map(RawDeviceDescription::from_value)
                    .collect();
                self.new_devices(interface_id, descriptions).await;
                Ok(json!(true))
            }
            "deleteDevices" => {
                let interface_id = str_param(&params, 0)?;
                let addresses = string_list(list_param(&params, 1)?);
                self.delete_devices(interface_id, addresses).await;
                Ok(json!(true))
            }
            "listDevices" => {
                let interface_id = str_param(&params, 0)?;
                let descriptions = self.list_devices(interface_id);
                Ok(RpcValue::Array(
                    descriptions.into_iter().map(RpcValue::from).collect(),
                ))
            }
            "error" => {
                let interface_id = str_param(&params, 0)?;
                let code = params.get(1).and_then(value_as_i64).unwrap_or(0);
                let message = params.get(2).and_then(value_as_str).unwrap_or_default();
                self.error(interface_id, code, message);
                Ok(json!(true))
            }
            "updateDevice" => {
                let interface_id = str_param(&params, 0)?;
                let address = str_param(&params, 1)?;
                let hint = params.get(2).and_then(value_as_i64).unwrap_or(0);
                self.update_device(interface_id, address, hint);
                Ok(json!(true))
            }
            "replaceDevice" => {
                let interface_id = str_param(&params, 0)?;
                let old_address = str_param(&params, 1)?;
                let new_address = str_param(&params, 2)?;
                self.replace_device(interface_id, old_address, new_address);
                Ok(json!(true))
            }
            "readdedDevice" => {
                let interface_id = str_param(&params, 0)?;
                let addresses = string_list(list_param(&params, 1)?);
                self.readded_device(interface_id, addresses);
                Ok(json!(true))
            }
            "system.listMethods" => Ok(json!(METHODS)),
            other => Err(RpcError::fault(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

fn str_param(params: &[RpcValue], index: usize) -> Result<&str, RpcError> {
    params
        .get(index)
        .and_then(value_as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("Expected string parameter at {index}")))
}

fn list_param(params: &[RpcValue], index: usize) -> Result<&Vec<RpcValue>, RpcError> {
    match params.get(index) {
        Some(RpcValue::Array(items)) => Ok(items),
        _ => Err(RpcError::invalid_params(format!("Expected list parameter at {index}"))),
    }
}

fn string_list(items: &[RpcValue]) -> Vec<String> {
    items
        .iter()
        .filter_map(value_as_str)
        .map(str::to_string)
        .collect()
}

/// A decoded inbound call waiting for the dispatcher.
pub struct InboundCall {
    pub method: String,
    pub params: Vec<RpcValue>,
    pub reply: oneshot::Sender<Result<RpcValue, RpcError>>,
}

/// Sending side of the dispatcher queue.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<InboundCall>,
}

impl DispatchHandle {
    /// Queue a call and wait for the dispatcher's answer.
    pub async fn call(&self, method: impl Into<String>, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let (reply, answer) = oneshot::channel();
        let call = InboundCall {
            method: method.into(),
            params,
            reply,
        };

        if self.tx.send(call).await.is_err() {
            return Err(RpcError::fault(-32000, "Dispatcher stopped"));
        }
        answer
            .await
            .unwrap_or_else(|_| Err(RpcError::fault(-32000, "Dispatcher dropped the call")))
    }
}

/// Spawn the single dispatcher task. It runs until every handle is dropped.
pub fn spawn_dispatcher(handler: Arc<CallbackHandler>) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<InboundCall>(DISPATCH_QUEUE);

    let task = tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            let result = handler.dispatch(&call.method, call.params).await;
            // The caller may have gone away (client disconnect)
            let _ = call.reply.send(result);
        }
        debug!("Dispatcher stopped");
    });

    (DispatchHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::catalog::DeviceCatalog;
    use crate::proxy::LockingProxy;
    use crate::transport::RpcTransport;

    struct NullTransport;

    #[async_trait]
    impl RpcTransport for NullTransport {
        async fn call(&self, _: &str, _: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
            Ok(RpcValue::Null)
        }

        fn endpoint(&self) -> &str {
            "null://"
        }
    }

    fn handler_with(remote: RemoteConfig, system: Option<SystemCallback>) -> CallbackHandler {
        let proxy = Arc::new(LockingProxy::new(
            &remote,
            format!("hmbridge-{}", remote.name),
            Arc::new(NullTransport),
        ));
        let handler = CallbackHandler::new(std::slice::from_ref(&remote), false)
            .with_system_callback(system);
        handler.register(Arc::new(DeviceRegistry::new(
            proxy,
            Arc::new(DeviceCatalog::with_defaults()),
        )));
        handler
    }

    fn handler() -> CallbackHandler {
        handler_with(RemoteConfig::new("rf", "127.0.0.1", 2001), None)
    }

    fn contact() -> RpcValue {
        json!([
            {"ADDRESS": "AAA", "TYPE": "HM-Sec-SC-2"},
            {"ADDRESS": "AAA:1", "TYPE": "SHUTTER_CONTACT", "PARENT": "AAA", "INDEX": 1}
        ])
    }

    #[tokio::test]
    async fn test_new_then_list_devices() {
        let handler = handler();
        let result = handler
            .dispatch("newDevices", vec![json!("hmbridge-rf"), contact()])
            .await
            .unwrap();
        assert_eq!(result, json!(true));

        let listed = handler
            .dispatch("listDevices", vec![json!("hmbridge-rf")])
            .await
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_then_list() {
        let handler = handler();
        handler.dispatch("newDevices", vec![json!("hmbridge-rf"), contact()]).await.unwrap();
        handler
            .dispatch("deleteDevices", vec![json!("hmbridge-rf"), json!(["AAA:1"])])
            .await
            .unwrap();

        let listed = handler.list_devices("hmbridge-rf");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address(), "AAA");
        assert!(handler.registry("rf").unwrap().node("AAA:1").is_none());
    }

    #[tokio::test]
    async fn test_device_cache_follows_dispatched_calls() {
        let dir = tempfile::tempdir().unwrap();
        let device_file = dir.path().join("devices_rf.json");
        let remote = RemoteConfig::new("rf", "127.0.0.1", 2001);
        let proxy = Arc::new(LockingProxy::new(&remote, "hmbridge-rf", Arc::new(NullTransport)));
        let registry = DeviceRegistry::open(
            proxy,
            Arc::new(DeviceCatalog::with_defaults()),
            Some(device_file.clone()),
            None,
        )
        .unwrap();

        let handler = Arc::new(CallbackHandler::new(std::slice::from_ref(&remote), false));
        handler.register(Arc::new(registry));
        let (dispatch, task) = spawn_dispatcher(handler);

        dispatch.call("newDevices", vec![json!("hmbridge-rf"), contact()]).await.unwrap();
        let cached: Vec<RpcValue> =
            serde_json::from_str(&tokio::fs::read_to_string(&device_file).await.unwrap()).unwrap();
        assert_eq!(cached.len(), 2);

        dispatch
            .call("deleteDevices", vec![json!("hmbridge-rf"), json!(["AAA:1"])])
            .await
            .unwrap();
        let cached: Vec<RpcValue> =
            serde_json::from_str(&tokio::fs::read_to_string(&device_file).await.unwrap()).unwrap();
        assert_eq!(cached, vec![json!({"ADDRESS": "AAA", "TYPE": "HM-Sec-SC-2"})]);

        drop(dispatch);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hmip_lists_nothing() {
        let handler = handler_with(RemoteConfig::new("ip", "127.0.0.1", 2010), None);
        handler.dispatch("newDevices", vec![json!("hmbridge-ip"), contact()]).await.unwrap();

        assert!(handler.list_devices("hmbridge-ip").is_empty());
        assert_eq!(handler.registry("ip").unwrap().node_count(), 2);
    }

    #[tokio::test]
    async fn test_event_key_uppercased_and_forwarded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler().with_event_callback(Some(Arc::new(move |e: &NodeEvent| {
            sink.lock().push(e.clone());
        })));
        handler.dispatch("newDevices", vec![json!("hmbridge-rf"), contact()]).await.unwrap();

        handler
            .dispatch("event", vec![json!("hmbridge-rf"), json!("AAA:1"), json!("unreach"), json!(true)])
            .await
            .unwrap();
        // Unknown addresses are not an error
        handler
            .dispatch("event", vec![json!("hmbridge-rf"), json!("CENTRAL"), json!("PONG"), json!("x")])
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].key, "UNREACH");
        assert!(handler.registry("rf").unwrap().device("AAA").unwrap().unreachable());
    }

    #[tokio::test]
    async fn test_system_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_with(
            RemoteConfig::new("rf", "127.0.0.1", 2001),
            Some(Arc::new(move |e: &SystemEvent| sink.lock().push(e.clone()))),
        );

        handler.dispatch("newDevices", vec![json!("hmbridge-rf"), contact()]).await.unwrap();
        handler
            .dispatch("error", vec![json!("hmbridge-rf"), json!(-1), json!("boom")])
            .await
            .unwrap();
        handler
            .dispatch("replaceDevice", vec![json!("hmbridge-rf"), json!("AAA"), json!("BBB")])
            .await
            .unwrap();

        let seen = seen.lock();
        assert!(matches!(seen[0], SystemEvent::DevicesCreated { .. }));
        assert!(matches!(seen[1], SystemEvent::NewDevices { ref descriptions, .. } if descriptions.len() == 2));
        assert!(matches!(seen[2], SystemEvent::Error { code: -1, .. }));
        assert!(matches!(seen[3], SystemEvent::ReplaceDevice { ref new_address, .. } if new_address == "BBB"));
    }

    #[tokio::test]
    async fn test_multicall() {
        let handler = handler();
        let result = handler
            .dispatch(
                "system.multicall",
                vec![json!([
                    {"methodName": "newDevices", "params": ["hmbridge-rf", contact()]},
                    {"methodName": "event", "params": ["hmbridge-rf", "AAA:1", "STATE", true]},
                    {"methodName": "bogus", "params": []}
                ])],
            )
            .await
            .unwrap();

        let results = result.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], json!([true]));
        assert_eq!(results[1], json!([true]));
        assert_eq!(results[2]["faultCode"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_malformed_params() {
        let handler = handler();
        let err = handler.dispatch("event", vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, RpcError::Fault { code: -32602, .. }));

        let err = handler.dispatch("newDevices", vec![json!("hmbridge-rf"), json!("x")]).await.unwrap_err();
        assert!(matches!(err, RpcError::Fault { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_list_methods() {
        let handler = handler();
        let methods = handler.dispatch("system.listMethods", vec![]).await.unwrap();
        assert!(methods.as_array().unwrap().contains(&json!("newDevices")));
    }

    #[tokio::test]
    async fn test_dispatcher_serializes_calls() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let (a, o) = (active.clone(), overlap.clone());
        let handler = Arc::new(handler().with_event_callback(Some(Arc::new(move |_: &NodeEvent| {
            if a.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
            a.fetch_sub(1, Ordering::SeqCst);
        }))));

        let (handle, task) = spawn_dispatcher(handler);
        let mut calls = Vec::new();
        for i in 0..10 {
            let handle = handle.clone();
            calls.push(tokio::spawn(async move {
                handle
                    .call("event", vec![json!("hmbridge-rf"), json!("AAA"), json!("N"), json!(i)])
                    .await
            }));
        }
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), json!(true));
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);

        drop(handle);
        task.await.unwrap();
    }
}
