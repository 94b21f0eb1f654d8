//! hmbridge core
//!
//! Event bridge and device registry for Homematic CCU and Homegear
//! controllers.
//!
//! # Overview
//!
//! - [`LockingProxy`] serializes outbound RPC calls to one remote, sent as
//!   XML-RPC by default
//! - [`CallbackServer`] receives `event`, `newDevices`, ... from the remotes
//!   and hands them to a single dispatcher task
//! - [`DeviceRegistry`] keeps the device descriptions, the paramset cache and
//!   the live device/channel nodes per remote
//! - [`resolver`] fetches display names (metadata, JSON API, XML-API)
//! - [`Bridge`] ties it together and drives the init/de-init handshake
//!
//! # Example
//!
//! ```ignore
//! use hmbridge_core::{Bridge, HmBridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HmBridgeConfig::load("hmbridge.json5")?;
//!     let mut bridge = Bridge::builder(config)
//!         .on_event(|event| println!("{} {} = {}", event.address, event.key, event.value))
//!         .build()?;
//!
//!     bridge.connect().await?;
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod description;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod jsonrpc;
pub mod node;
pub mod paramsets;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod status;
pub mod transport;
pub mod xmlrpc;

pub use bridge::{Bridge, BridgeBuilder, BridgeState};
pub use catalog::{Capability, DeviceCatalog, DeviceProfile, NodeKind};
pub use config::{BridgeSettings, HmBridgeConfig, RemoteConfig, ResolveNames, RpcEncoding};
pub use description::RawDeviceDescription;
pub use dispatch::{CallbackHandler, DispatchHandle, SystemCallback, SystemEvent, spawn_dispatcher};
pub use error::{BridgeError, Result, RpcError};
pub use health::{HealthSnapshot, RemoteHealth, RemoteStatus};
pub use node::{ChannelNode, DeviceNode, EventCallback, Node, NodeEvent};
pub use paramsets::ParamsetStore;
pub use proxy::LockingProxy;
pub use registry::{BuildReport, DeviceRegistry};
pub use server::CallbackServer;
pub use session::SessionClient;
pub use status::{BridgeStatus, RemoteStatusEntry};
pub use transport::{
    HttpTransportFactory, JsonRpcTransport, JsonRpcTransportFactory, RpcTransport, TransportFactory,
    XmlRpcTransport, XmlRpcTransportFactory,
};

// Re-export the value types used throughout the API
pub use hmbridge_common::{RpcStruct, RpcValue};
