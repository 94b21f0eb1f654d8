//! Locking proxy: one serialized outbound RPC connection per remote.

use std::net::IpAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hmbridge_common::{RpcStruct, RpcValue, value_as_bool, value_as_i64};

use crate::config::RemoteConfig;
use crate::description::RawDeviceDescription;
use crate::error::RpcError;
use crate::health::RemoteHealth;
use crate::transport::RpcTransport;

/// Outbound RPC client for a single remote.
///
/// At most one call is in flight per proxy: the mutex is held for the whole
/// request/response window. Proxies of different remotes never contend.
pub struct LockingProxy {
    remote: String,
    interface_id: String,
    host: String,
    port: u16,
    transport: Arc<dyn RpcTransport>,
    lock: Mutex<()>,
    health: Arc<RemoteHealth>,
    local_ip: Option<IpAddr>,
    callback_host: Option<String>,
    callback_port: Option<u16>,
    skip_init: bool,
    hmip: bool,
}

impl LockingProxy {
    /// Create a proxy for `remote` using the given transport.
    pub fn new(remote: &RemoteConfig, interface_id: impl Into<String>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            remote: remote.name.clone(),
            interface_id: interface_id.into(),
            host: remote.host.clone(),
            port: remote.port,
            transport,
            lock: Mutex::new(()),
            health: Arc::new(RemoteHealth::new(remote.name.clone())),
            local_ip: None,
            callback_host: remote.callback_host.clone(),
            callback_port: remote.callback_port,
            skip_init: !remote.connect,
            hmip: remote.is_hmip(),
        }
    }

    /// Set the local address the remote can reach us on.
    pub fn with_local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn interface_id(&self) -> &str {
        &self.interface_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn health(&self) -> &Arc<RemoteHealth> {
        &self.health
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    /// Whether the init handshake is skipped (`connect = false`).
    pub fn skip_init(&self) -> bool {
        self.skip_init
    }

    pub fn is_hmip(&self) -> bool {
        self.hmip
    }

    /// URL announced to the remote in `init`.
    ///
    /// A configured callback host/port wins over the discovered local address
    /// and the server's bound port. IPv6 literals are bracketed.
    pub fn callback_url(&self, server_port: u16) -> String {
        let host = match (&self.callback_host, self.local_ip) {
            (Some(host), _) => match host.parse::<IpAddr>() {
                Ok(ip) => url_host(ip),
                Err(_) => host.clone(),
            },
            (None, Some(ip)) => url_host(ip),
            (None, None) => {
                if !is_loopback_host(&self.host) {
                    warn!(
                        remote = %self.remote,
                        host = %self.host,
                        "Local address unknown, announcing a loopback callback the remote cannot reach"
                    );
                }
                "127.0.0.1".to_string()
            }
        };
        let port = self.callback_port.unwrap_or(server_port);
        format!("http://{}:{}", host, port)
    }

    /// Perform a call while holding the proxy lock.
    pub async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let _guard = self.lock.lock().await;
        debug!(remote = %self.remote, method, "RPC call");

        let result = self.transport.call(method, params).await;
        match &result {
            Ok(_) => self.health.record_success(),
            Err(err) if err.is_transport() => {
                self.health.record_failure(&err.to_string());
                warn!(remote = %self.remote, method, error = %err, "RPC call failed");
            }
            Err(err) => {
                // The remote answered, so it is reachable
                self.health.record_success();
                debug!(remote = %self.remote, method, error = %err, "RPC fault");
            }
        }
        result
    }

    /// Register `url` as the event receiver for `interface_id`.
    pub async fn init(&self, url: &str, interface_id: &str) -> Result<(), RpcError> {
        self.call("init", vec![json!(url), json!(interface_id)])
            .await
            .map(drop)
    }

    /// Unregister the receiver at `url` (`init` with no interface id).
    pub async fn de_init(&self, url: &str) -> Result<(), RpcError> {
        self.call("init", vec![json!(url)]).await.map(drop)
    }

    /// Fetch all device descriptions known to the remote.
    pub async fn list_devices(&self, interface_id: &str) -> Result<Vec<RawDeviceDescription>, RpcError> {
        let value = self.call("listDevices", vec![json!(interface_id)]).await?;
        match value {
            RpcValue::Array(items) => Ok(items
                .into_iter()
                .filter_map(RawDeviceDescription::from_value)
                .collect()),
            RpcValue::Null => Ok(Vec::new()),
            other => Err(RpcError::InvalidResponse(format!(
                "listDevices returned {other}"
            ))),
        }
    }

    pub async fn get_value(&self, address: &str, key: &str) -> Result<RpcValue, RpcError> {
        self.call("getValue", vec![json!(address), json!(key)]).await
    }

    pub async fn set_value(&self, address: &str, key: &str, value: RpcValue) -> Result<(), RpcError> {
        self.call("setValue", vec![json!(address), json!(key), value])
            .await
            .map(drop)
    }

    pub async fn get_paramset(&self, address: &str, paramset: &str) -> Result<RpcStruct, RpcError> {
        let value = self
            .call("getParamset", vec![json!(address), json!(paramset)])
            .await?;
        into_struct("getParamset", value)
    }

    /// Write a whole paramset, optionally with an explicit RX mode (e.g. `"WAKEUP"`).
    pub async fn put_paramset(
        &self,
        address: &str,
        paramset: &str,
        values: RpcStruct,
        rx_mode: Option<&str>,
    ) -> Result<(), RpcError> {
        let mut params = vec![json!(address), json!(paramset), RpcValue::Object(values)];
        if let Some(mode) = rx_mode {
            params.push(json!(mode));
        }
        self.call("putParamset", params).await.map(drop)
    }

    pub async fn get_paramset_description(
        &self,
        address: &str,
        paramset: &str,
    ) -> Result<RpcStruct, RpcError> {
        let value = self
            .call("getParamsetDescription", vec![json!(address), json!(paramset)])
            .await?;
        into_struct("getParamsetDescription", value)
    }

    pub async fn get_all_system_variables(&self) -> Result<RpcStruct, RpcError> {
        let value = self.call("getAllSystemVariables", vec![]).await?;
        into_struct("getAllSystemVariables", value)
    }

    pub async fn get_system_variable(&self, name: &str) -> Result<RpcValue, RpcError> {
        self.call("getSystemVariable", vec![json!(name)]).await
    }

    pub async fn set_system_variable(&self, name: &str, value: RpcValue) -> Result<(), RpcError> {
        self.call("setSystemVariable", vec![json!(name), value])
            .await
            .map(drop)
    }

    pub async fn delete_system_variable(&self, name: &str) -> Result<RpcValue, RpcError> {
        self.call("deleteSystemVariable", vec![json!(name)]).await
    }

    pub async fn get_service_messages(&self) -> Result<RpcValue, RpcError> {
        self.call("getServiceMessages", vec![]).await
    }

    pub async fn rssi_info(&self) -> Result<RpcValue, RpcError> {
        self.call("rssiInfo", vec![]).await
    }

    /// Switch install (pairing) mode.
    ///
    /// When switching on with a non-zero duration, the call targets either a
    /// single `address` or the given `mode`.
    pub async fn set_install_mode(
        &self,
        on: bool,
        seconds: u32,
        mode: i64,
        address: Option<&str>,
    ) -> Result<RpcValue, RpcError> {
        self.call("setInstallMode", install_mode_params(on, seconds, mode, address))
            .await
    }

    /// Remaining install mode time in seconds.
    pub async fn get_install_mode(&self) -> Result<i64, RpcError> {
        let value = self.call("getInstallMode", vec![]).await?;
        value_as_i64(&value)
            .ok_or_else(|| RpcError::InvalidResponse(format!("getInstallMode returned {value}")))
    }

    pub async fn get_metadata(&self, address: &str, key: &str) -> Result<RpcValue, RpcError> {
        self.call("getMetadata", vec![json!(address), json!(key)]).await
    }

    pub async fn get_all_metadata(&self, address: &str) -> Result<RpcValue, RpcError> {
        self.call("getAllMetadata", vec![json!(address)]).await
    }

    pub async fn set_metadata(&self, address: &str, key: &str, value: RpcValue) -> Result<RpcValue, RpcError> {
        self.call("setMetadata", vec![json!(address), json!(key), value])
            .await
    }

    pub async fn delete_metadata(&self, address: &str, key: &str) -> Result<RpcValue, RpcError> {
        self.call("deleteMetadata", vec![json!(address), json!(key)])
            .await
    }

    pub async fn list_bidcos_interfaces(&self) -> Result<RpcValue, RpcError> {
        self.call("listBidcosInterfaces", vec![]).await
    }

    /// Ask the remote to answer with a `PONG` event for `caller_id`.
    pub async fn ping(&self, caller_id: &str) -> Result<RpcValue, RpcError> {
        self.call("ping", vec![json!(caller_id)]).await
    }

    /// Homegear only: whether `interface_id` is still registered.
    pub async fn client_server_initialized(&self, interface_id: &str) -> Result<bool, RpcError> {
        let value = self
            .call("clientServerInitialized", vec![json!(interface_id)])
            .await?;
        Ok(value_as_bool(&value).unwrap_or(false))
    }

    pub async fn get_version(&self) -> Result<String, RpcError> {
        let value = self.call("getVersion", vec![]).await?;
        Ok(match value {
            RpcValue::String(s) => s,
            other => other.to_string(),
        })
    }
}

fn into_struct(method: &str, value: RpcValue) -> Result<RpcStruct, RpcError> {
    match value {
        RpcValue::Object(map) => Ok(map),
        RpcValue::Null => Ok(RpcStruct::new()),
        other => Err(RpcError::InvalidResponse(format!(
            "{method} returned {other}"
        ))),
    }
}

fn install_mode_params(on: bool, seconds: u32, mode: i64, address: Option<&str>) -> Vec<RpcValue> {
    let mut params = vec![json!(on)];
    if on && seconds > 0 {
        params.push(json!(seconds));
        match address {
            Some(address) => params.push(json!(address)),
            None => params.push(json!(mode)),
        }
    }
    params
}

fn url_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_matches(|c| c == '[' || c == ']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Best-effort discovery of the local address the remote can reach.
///
/// Connects a throwaway UDP socket towards the remote and reads back the
/// local address the OS picked. No packet is sent. The result can be wrong
/// behind NAT; `callback_host` overrides it.
pub async fn discover_local_ip(host: &str, port: u16) -> std::io::Result<IpAddr> {
    let target = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {host}")))?;

    let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Records calls and answers with a fixed value.
    struct RecordingTransport {
        calls: SyncMutex<Vec<(String, Vec<RpcValue>)>>,
        answer: Result<RpcValue, RpcError>,
    }

    impl RecordingTransport {
        fn new(answer: Result<RpcValue, RpcError>) -> Arc<Self> {
            Arc::new(Self {
                calls: SyncMutex::new(Vec::new()),
                answer,
            })
        }
    }

    #[async_trait]
    impl RpcTransport for RecordingTransport {
        async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
            self.calls.lock().push((method.to_string(), params));
            self.answer.clone()
        }

        fn endpoint(&self) -> &str {
            "test://"
        }
    }

    fn proxy(transport: Arc<RecordingTransport>) -> LockingProxy {
        let remote = RemoteConfig::new("rf", "127.0.0.1", 2001);
        LockingProxy::new(&remote, "hmbridge-rf", transport)
    }

    #[test]
    fn test_install_mode_params() {
        assert_eq!(install_mode_params(false, 60, 1, None), vec![json!(false)]);
        assert_eq!(
            install_mode_params(true, 60, 1, None),
            vec![json!(true), json!(60), json!(1)]
        );
        assert_eq!(
            install_mode_params(true, 60, 1, Some("ABC123")),
            vec![json!(true), json!(60), json!("ABC123")]
        );
        assert_eq!(install_mode_params(true, 0, 1, None), vec![json!(true)]);
    }

    #[test]
    fn test_callback_url() {
        let transport = RecordingTransport::new(Ok(RpcValue::Null));
        let proxy = proxy(transport).with_local_ip("192.168.1.50".parse().unwrap());
        assert_eq!(proxy.callback_url(8090), "http://192.168.1.50:8090");

        let mut remote = RemoteConfig::new("rf", "127.0.0.1", 2001);
        remote.callback_host = Some("bridge.local".to_string());
        remote.callback_port = Some(9000);
        let proxy = LockingProxy::new(&remote, "hmbridge-rf", RecordingTransport::new(Ok(RpcValue::Null)));
        assert_eq!(proxy.callback_url(8090), "http://bridge.local:9000");
    }

    #[test]
    fn test_callback_url_ipv6_and_fallback() {
        let remote = RemoteConfig::new("rf", "ccu.local", 2001);
        let null = || RecordingTransport::new(Ok(RpcValue::Null));

        let proxy = LockingProxy::new(&remote, "hmbridge-rf", null()).with_local_ip("fe80::1".parse().unwrap());
        assert_eq!(proxy.callback_url(8090), "http://[fe80::1]:8090");

        let mut with_host = remote.clone();
        with_host.callback_host = Some("2001:db8::5".to_string());
        let proxy = LockingProxy::new(&with_host, "hmbridge-rf", null());
        assert_eq!(proxy.callback_url(8090), "http://[2001:db8::5]:8090");

        // Nothing discovered: loopback is the only candidate left
        let proxy = LockingProxy::new(&remote, "hmbridge-rf", null());
        assert_eq!(proxy.callback_url(8090), "http://127.0.0.1:8090");
    }

    #[test]
    fn test_loopback_hosts() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("[::1]"));
        assert!(!is_loopback_host("192.168.1.10"));
        assert!(!is_loopback_host("ccu.local"));
    }

    #[tokio::test]
    async fn test_init_and_de_init_params() {
        let transport = RecordingTransport::new(Ok(json!("")));
        let proxy = proxy(transport.clone());

        proxy.init("http://10.0.0.5:8090", "hmbridge-rf").await.unwrap();
        proxy.de_init("http://10.0.0.5:8090").await.unwrap();

        let calls = transport.calls.lock();
        assert_eq!(calls[0].0, "init");
        assert_eq!(calls[0].1, vec![json!("http://10.0.0.5:8090"), json!("hmbridge-rf")]);
        assert_eq!(calls[1].1, vec![json!("http://10.0.0.5:8090")]);
    }

    #[tokio::test]
    async fn test_put_paramset_rx_mode() {
        let transport = RecordingTransport::new(Ok(RpcValue::Null));
        let proxy = proxy(transport.clone());

        let mut values = RpcStruct::new();
        values.insert("LEVEL".to_string(), json!(0.5));
        proxy
            .put_paramset("AAA:1", "VALUES", values, Some("WAKEUP"))
            .await
            .unwrap();

        let calls = transport.calls.lock();
        assert_eq!(calls[0].1.len(), 4);
        assert_eq!(calls[0].1[3], json!("WAKEUP"));
    }

    #[tokio::test]
    async fn test_transport_failure_marks_health() {
        let transport = RecordingTransport::new(Err(RpcError::Transport("refused".to_string())));
        let proxy = proxy(transport);

        for _ in 0..3 {
            assert!(proxy.ping("hmbridge-rf").await.is_err());
        }
        assert_eq!(proxy.health().status(), crate::health::RemoteStatus::Offline);
    }

    #[tokio::test]
    async fn test_fault_counts_as_reachable() {
        let transport = RecordingTransport::new(Err(RpcError::fault(-5, "Unknown parameter")));
        let proxy = proxy(transport);

        let err = proxy.get_value("AAA:1", "FOO").await.unwrap_err();
        assert_eq!(err, RpcError::fault(-5, "Unknown parameter"));
        assert_eq!(proxy.health().status(), crate::health::RemoteStatus::Online);
    }

    #[tokio::test]
    async fn test_list_devices_skips_non_objects() {
        let transport = RecordingTransport::new(Ok(json!([
            {"ADDRESS": "AAA", "TYPE": "HM-Sec-SC-2"},
            "garbage",
            {"ADDRESS": "AAA:1", "PARENT": "AAA", "INDEX": 1}
        ])));
        let proxy = proxy(transport);

        let devices = proxy.list_devices("hmbridge-rf").await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].parent(), Some("AAA"));
    }

    #[tokio::test]
    async fn test_discover_local_ip_loopback() {
        let ip = discover_local_ip("127.0.0.1", 2001).await.unwrap();
        assert!(ip.is_loopback());
    }
}
