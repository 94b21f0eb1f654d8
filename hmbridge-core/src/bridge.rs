//! Bridge coordinator: owns the callback server, one proxy and registry per
//! remote, and the init/de-init handshake.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hmbridge_common::{RpcStruct, RpcValue};

use crate::catalog::DeviceCatalog;
use crate::config::{HmBridgeConfig, RemoteConfig, ResolveNames};
use crate::dispatch::{CallbackHandler, DispatchHandle, SystemCallback, SystemEvent, spawn_dispatcher};
use crate::error::{BridgeError, Result, RpcError};
use crate::node::{DeviceNode, EventCallback, Node, NodeEvent};
use crate::proxy::{LockingProxy, discover_local_ip};
use crate::registry::DeviceRegistry;
use crate::resolver::resolve_names;
use crate::server::CallbackServer;
use crate::session::SessionClient;
use crate::status::{BridgeStatus, RemoteStatusEntry};
use crate::transport::{HttpTransportFactory, TransportFactory};

/// Install mode duration used when none is given.
pub const DEFAULT_INSTALL_SECONDS: u32 = 60;

/// Install mode used when none is given (normal pairing).
pub const DEFAULT_INSTALL_MODE: i64 = 1;

/// Lifecycle state of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Created,
    Connecting,
    Running,
    Stopping,
    Stopped,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Created => "created",
            BridgeState::Connecting => "connecting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
    config: HmBridgeConfig,
    catalog: DeviceCatalog,
    factory: Arc<dyn TransportFactory>,
    on_event: Option<EventCallback>,
    on_system: Option<SystemCallback>,
}

impl BridgeBuilder {
    /// Use a custom device catalog instead of the built-in profiles.
    pub fn catalog(mut self, catalog: DeviceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use a custom transport factory (tests, other encodings).
    pub fn transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Called for every event, after node subscriptions.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// Called for device set changes and controller errors.
    pub fn on_system<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SystemEvent) + Send + Sync + 'static,
    {
        self.on_system = Some(Arc::new(callback));
        self
    }

    /// Validate the configuration and create the bridge.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;

        let handler = CallbackHandler::new(&self.config.remotes, self.config.bridge.resolve_paramsets)
            .with_event_callback(self.on_event)
            .with_system_callback(self.on_system);

        Ok(Bridge {
            config: self.config,
            catalog: Arc::new(self.catalog),
            factory: self.factory,
            handler: Arc::new(handler),
            state: BridgeState::Created,
            server: None,
            failed_inits: HashSet::new(),
        })
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    dispatch: DispatchHandle,
    dispatcher: JoinHandle<()>,
}

/// Event bridge between an application and one or more controllers.
pub struct Bridge {
    config: HmBridgeConfig,
    catalog: Arc<DeviceCatalog>,
    factory: Arc<dyn TransportFactory>,
    handler: Arc<CallbackHandler>,
    state: BridgeState,
    server: Option<RunningServer>,
    failed_inits: HashSet<String>,
}

impl Bridge {
    /// Create a bridge with the default catalog and HTTP transports.
    pub fn new(config: HmBridgeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: HmBridgeConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            catalog: DeviceCatalog::with_defaults(),
            factory: Arc::new(HttpTransportFactory),
            on_event: None,
            on_system: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn config(&self) -> &HmBridgeConfig {
        &self.config
    }

    /// Address of the callback server while running.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    fn expect_state(&self, expected: BridgeState) -> Result<()> {
        if self.state != expected {
            return Err(BridgeError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Set up proxies and registries for every remote.
    ///
    /// A remote whose host does not resolve or whose setup fails is skipped.
    /// Fails with [`BridgeError::NoRemotes`] when none is left.
    pub async fn connect(&mut self) -> Result<()> {
        if !matches!(self.state, BridgeState::Created | BridgeState::Stopped) {
            return Err(BridgeError::InvalidState {
                expected: BridgeState::Created.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = BridgeState::Connecting;

        for remote in &self.config.remotes {
            match self.connect_remote(remote).await {
                Ok(registry) => {
                    info!(
                        remote = %remote.name,
                        endpoint = %registry.proxy().endpoint(),
                        devices = registry.device_count(),
                        "Remote connected"
                    );
                    self.handler.register(Arc::new(registry));
                }
                Err(e) => warn!(remote = %remote.name, error = %e, "Skipping remote"),
            }
        }

        if self.handler.registries().is_empty() {
            self.state = BridgeState::Created;
            return Err(BridgeError::NoRemotes);
        }
        Ok(())
    }

    async fn connect_remote(&self, remote: &RemoteConfig) -> Result<DeviceRegistry> {
        let resolved = tokio::net::lookup_host((remote.host.as_str(), remote.port))
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to resolve {}: {e}", remote.host)))?
            .next();
        if resolved.is_none() {
            return Err(RpcError::Transport(format!("No address for {}", remote.host)).into());
        }

        let transport = self.factory.create(remote)?;
        let interface_id = self.config.bridge.interface_id_for(&remote.name);
        let mut proxy = LockingProxy::new(remote, interface_id, transport);

        match discover_local_ip(&remote.host, remote.port).await {
            Ok(ip) => proxy = proxy.with_local_ip(ip),
            Err(e) => debug!(remote = %remote.name, error = %e, "Local address discovery failed"),
        }

        DeviceRegistry::open(
            Arc::new(proxy),
            self.catalog.clone(),
            self.config.bridge.device_file_for(&remote.name),
            self.config.bridge.paramset_file_for(&remote.name),
        )
    }

    /// Bind the callback server and register it with every remote.
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(BridgeState::Connecting)?;

        let bridge = &self.config.bridge;
        let server = CallbackServer::bind(&bridge.local_host, bridge.local_port).await?;
        let addr = server.local_addr();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatch, dispatcher) = spawn_dispatcher(self.handler.clone());
        let task = server.spawn(dispatch.clone(), shutdown_rx);

        self.server = Some(RunningServer {
            addr,
            shutdown,
            task,
            dispatch,
            dispatcher,
        });
        self.state = BridgeState::Running;
        info!(addr = %addr, remotes = self.handler.registries().len(), "Bridge running");

        self.init_remotes().await;
        Ok(())
    }

    /// Run the init handshake again, e.g. after a controller restart.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.expect_state(BridgeState::Running)?;
        self.init_remotes().await;
        Ok(())
    }

    async fn init_remotes(&mut self) {
        let Some((port, dispatch)) = self
            .server
            .as_ref()
            .map(|s| (s.addr.port(), s.dispatch.clone()))
        else {
            return;
        };
        self.failed_inits.clear();

        let mut registries = self.handler.registries();
        registries.sort_by(|a, b| a.remote().cmp(b.remote()));

        for registry in registries {
            let proxy = registry.proxy().clone();
            if proxy.skip_init() {
                debug!(remote = %proxy.remote(), "Skipping init");
                continue;
            }

            if proxy.is_hmip() {
                // Queued like a pushed newDevices so both never interleave
                match proxy.list_devices(proxy.interface_id()).await {
                    Ok(descriptions) => {
                        let params = vec![
                            RpcValue::from(proxy.interface_id()),
                            RpcValue::Array(descriptions.into_iter().map(RpcValue::from).collect()),
                        ];
                        if let Err(e) = dispatch.call("newDevices", params).await {
                            warn!(remote = %proxy.remote(), error = %e, "Failed to queue polled devices");
                        }
                    }
                    Err(e) => warn!(remote = %proxy.remote(), error = %e, "Failed to poll devices"),
                }
            } else if registry.node_count() > 0 {
                if let Some(remote) = self.remote_config(proxy.remote()) {
                    if remote.resolve_names != ResolveNames::None {
                        resolve_names(remote, &registry).await;
                    }
                }
            }

            let url = proxy.callback_url(port);
            match proxy.init(&url, proxy.interface_id()).await {
                Ok(()) => info!(remote = %proxy.remote(), url = %url, "Init succeeded"),
                Err(e) => {
                    warn!(remote = %proxy.remote(), url = %url, error = %e, "Init failed");
                    self.failed_inits.insert(proxy.remote().to_string());
                }
            }
        }
    }

    /// Unregister from every remote, stop the server and drop all state.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            BridgeState::Stopped | BridgeState::Stopping => return Ok(()),
            BridgeState::Created => {
                self.state = BridgeState::Stopped;
                return Ok(());
            }
            BridgeState::Connecting | BridgeState::Running => {}
        }
        self.state = BridgeState::Stopping;

        if let Some(port) = self.server_addr().map(|a| a.port()) {
            for registry in self.handler.registries() {
                let proxy = registry.proxy();
                if proxy.skip_init() || self.failed_inits.contains(proxy.remote()) {
                    continue;
                }
                let url = proxy.callback_url(port);
                match proxy.de_init(&url).await {
                    Ok(()) => debug!(remote = %proxy.remote(), "De-init succeeded"),
                    Err(e) => warn!(remote = %proxy.remote(), error = %e, "De-init failed"),
                }
            }
        }

        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(true);
            match server.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Callback server failed"),
                Err(e) => error!(error = %e, "Callback server task panicked"),
            }
            server.dispatcher.abort();
        }

        self.handler.clear();
        self.failed_inits.clear();
        self.state = BridgeState::Stopped;
        info!("Bridge stopped");
        Ok(())
    }

    /// Connect if needed, start, and wait for Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        if matches!(self.state, BridgeState::Created | BridgeState::Stopped) {
            self.connect().await?;
        }
        self.start().await?;

        info!("Bridge running. Press Ctrl+C to stop.");
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received shutdown signal");

        self.stop().await
    }

    fn remote_config(&self, name: &str) -> Option<&RemoteConfig> {
        self.config.remotes.iter().find(|r| r.name == name)
    }

    fn registry(&self, remote: &str) -> Result<Arc<DeviceRegistry>> {
        self.handler
            .registry(remote)
            .ok_or_else(|| BridgeError::UnknownRemote(remote.to_string()))
    }

    fn proxy(&self, remote: &str) -> Result<Arc<LockingProxy>> {
        Ok(self.registry(remote)?.proxy().clone())
    }

    fn session_client(&self, remote: &str) -> Result<Option<SessionClient>> {
        let config = self
            .remote_config(remote)
            .ok_or_else(|| BridgeError::UnknownRemote(remote.to_string()))?;
        Ok(SessionClient::new(config)?)
    }

    /// Names of the connected remotes.
    pub fn remotes(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .handler
            .registries()
            .iter()
            .map(|r| r.remote().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn device(&self, remote: &str, address: &str) -> Option<Arc<DeviceNode>> {
        self.handler.registry(remote)?.device(address)
    }

    pub fn node(&self, remote: &str, address: &str) -> Option<Node> {
        self.handler.registry(remote)?.node(address)
    }

    pub fn devices(&self, remote: &str) -> Vec<Arc<DeviceNode>> {
        self.handler
            .registry(remote)
            .map(|r| r.devices())
            .unwrap_or_default()
    }

    /// Status snapshot.
    pub fn status(&self) -> BridgeStatus {
        let mut registries = self.handler.registries();
        registries.sort_by(|a, b| a.remote().cmp(b.remote()));

        let running = self.state == BridgeState::Running;
        registries.iter().fold(
            BridgeStatus::new(self.state.as_str(), self.server_addr().map(|a| a.to_string())),
            |status, registry| {
                let proxy = registry.proxy();
                status.with_remote(RemoteStatusEntry {
                    name: registry.remote().to_string(),
                    interface_id: registry.interface_id().to_string(),
                    health: proxy.health().snapshot(),
                    devices: registry.device_count(),
                    nodes: registry.node_count(),
                    initialized: running
                        && !proxy.skip_init()
                        && !self.failed_inits.contains(registry.remote()),
                })
            },
        )
    }

    /// All system variables. Uses the JSON API when credentials are set.
    pub async fn get_all_system_variables(&self, remote: &str) -> Result<RpcStruct> {
        let proxy = self.proxy(remote)?;
        if let Some(client) = self.session_client(remote)? {
            let client = &client;
            let variables = client
                .with_session(|session| async move { client.get_all_sysvars(&session).await })
                .await?;
            return Ok(variables.unwrap_or_default());
        }
        Ok(proxy.get_all_system_variables().await?)
    }

    pub async fn get_system_variable(&self, remote: &str, name: &str) -> Result<RpcValue> {
        let proxy = self.proxy(remote)?;
        if let Some(client) = self.session_client(remote)? {
            let client = &client;
            let value = client
                .with_session(|session| async move { client.get_sysvar(&session, name).await })
                .await?;
            return Ok(value.unwrap_or(RpcValue::Null));
        }
        Ok(proxy.get_system_variable(name).await?)
    }

    pub async fn set_system_variable(&self, remote: &str, name: &str, value: RpcValue) -> Result<()> {
        let proxy = self.proxy(remote)?;
        if let Some(client) = self.session_client(remote)? {
            let client = &client;
            let value = &value;
            client
                .with_session(|session| async move { client.set_sysvar(&session, name, value).await })
                .await?;
            return Ok(());
        }
        Ok(proxy.set_system_variable(name, value).await?)
    }

    pub async fn delete_system_variable(&self, remote: &str, name: &str) -> Result<RpcValue> {
        let proxy = self.proxy(remote)?;
        if let Some(client) = self.session_client(remote)? {
            let client = &client;
            let value = client
                .with_session(|session| async move { client.delete_sysvar(&session, name).await })
                .await?;
            return Ok(value.unwrap_or(RpcValue::Null));
        }
        Ok(proxy.delete_system_variable(name).await?)
    }

    pub async fn get_service_messages(&self, remote: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.get_service_messages().await?)
    }

    pub async fn rssi_info(&self, remote: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.rssi_info().await?)
    }

    /// Switch install mode. See [`DEFAULT_INSTALL_SECONDS`] and
    /// [`DEFAULT_INSTALL_MODE`] for the usual arguments.
    pub async fn set_install_mode(
        &self,
        remote: &str,
        on: bool,
        seconds: u32,
        mode: i64,
        address: Option<&str>,
    ) -> Result<RpcValue> {
        Ok(self
            .proxy(remote)?
            .set_install_mode(on, seconds, mode, address)
            .await?)
    }

    pub async fn get_install_mode(&self, remote: &str) -> Result<i64> {
        Ok(self.proxy(remote)?.get_install_mode().await?)
    }

    pub async fn get_metadata(&self, remote: &str, address: &str, key: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.get_metadata(address, key).await?)
    }

    pub async fn get_all_metadata(&self, remote: &str, address: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.get_all_metadata(address).await?)
    }

    pub async fn set_metadata(&self, remote: &str, address: &str, key: &str, value: RpcValue) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.set_metadata(address, key, value).await?)
    }

    pub async fn delete_metadata(&self, remote: &str, address: &str, key: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.delete_metadata(address, key).await?)
    }

    pub async fn list_bidcos_interfaces(&self, remote: &str) -> Result<RpcValue> {
        Ok(self.proxy(remote)?.list_bidcos_interfaces().await?)
    }

    /// Ask the remote for a `PONG` event carrying our interface id.
    pub async fn ping(&self, remote: &str) -> Result<RpcValue> {
        let proxy = self.proxy(remote)?;
        Ok(proxy.ping(proxy.interface_id()).await?)
    }

    /// Homegear: whether our interface id is still registered. Errors read
    /// as not initialized.
    pub async fn homegear_check_init(&self, remote: &str) -> Result<bool> {
        let proxy = self.proxy(remote)?;
        match proxy.client_server_initialized(proxy.interface_id()).await {
            Ok(initialized) => Ok(initialized),
            Err(e) => {
                warn!(remote, error = %e, "clientServerInitialized failed");
                Ok(false)
            }
        }
    }

    pub async fn put_paramset(
        &self,
        remote: &str,
        address: &str,
        paramset: &str,
        values: RpcStruct,
        rx_mode: Option<&str>,
    ) -> Result<()> {
        Ok(self
            .proxy(remote)?
            .put_paramset(address, paramset, values, rx_mode)
            .await?)
    }
}
