//! Integration tests for the JSON API session client and JSON name
//! resolution, against a fake `/api/homematic.cgi`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::post;
use parking_lot::Mutex;
use serde_json::{Value, json};

use hmbridge_core::config::{BridgeSettings, JSON_API_PATH};
use hmbridge_core::resolver::resolve_names;
use hmbridge_core::{
    Bridge, DeviceCatalog, DeviceRegistry, HmBridgeConfig, LockingProxy, RawDeviceDescription,
    RemoteConfig, ResolveNames, RpcError, RpcTransport, RpcValue, SessionClient, TransportFactory,
};

#[derive(Default)]
struct FakeApi {
    refuse_login: AtomicBool,
    methods: Mutex<Vec<String>>,
}

impl FakeApi {
    fn methods(&self) -> Vec<String> {
        self.methods.lock().clone()
    }
}

async fn api_handler(State(api): State<Arc<FakeApi>>, Json(body): Json<Value>) -> Json<Value> {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    api.methods.lock().push(method.clone());

    let (result, error) = match method.as_str() {
        "Session.login" if api.refuse_login.load(Ordering::SeqCst) => {
            (Value::Null, json!({"name": "JSONRPCError", "code": 501, "message": "invalid credentials"}))
        }
        "Session.login" => (json!("s3ss10n"), Value::Null),
        "Session.logout" => (json!(true), Value::Null),
        "Interface.listInterfaces" => (
            json!([
                {"name": "BidCos-RF", "port": 2001, "info": "BidCos-RF"},
                {"name": "HmIP-RF", "port": 2010, "info": "HmIP-RF"}
            ]),
            Value::Null,
        ),
        "Device.listAllDetail" => (
            json!([
                {"id": "1001", "address": "AAA", "name": "Front door", "channels": [
                    {"id": "1002", "address": "AAA:1", "name": "Front door contact"}
                ]},
                {"id": "2001", "address": "ZZZ", "name": "Not ours", "channels": []}
            ]),
            Value::Null,
        ),
        "SysVar.getAll" => (
            json!([
                {"name": "Presence", "type": "LOGIC", "value": "true"},
                {"name": "Setpoint", "type": "NUMBER", "value": "21.5"}
            ]),
            Value::Null,
        ),
        _ => (Value::Null, json!({"code": 404, "message": "unknown method"})),
    };

    Json(json!({"version": "1.1", "result": result, "error": error}))
}

async fn spawn_api() -> (u16, Arc<FakeApi>) {
    let api = Arc::new(FakeApi::default());
    let router = Router::new()
        .route(JSON_API_PATH, post(api_handler))
        .with_state(api.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (port, api)
}

fn remote(json_port: u16) -> RemoteConfig {
    let mut remote = RemoteConfig::new("rf", "127.0.0.1", 2001);
    remote.username = Some("Admin".to_string());
    remote.password = Some("secret".to_string());
    remote.json_port = json_port;
    remote.resolve_names = ResolveNames::Json;
    remote
}

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

struct NullFactory;

impl TransportFactory for NullFactory {
    fn create(&self, _: &RemoteConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(Arc::new(NullTransport))
    }
}

fn registry(remote: &RemoteConfig) -> DeviceRegistry {
    let proxy = Arc::new(LockingProxy::new(remote, "hmbridge-rf", Arc::new(NullTransport)));
    let registry = DeviceRegistry::new(proxy, Arc::new(DeviceCatalog::with_defaults()));
    registry.add_descriptions(
        [
            json!({"ADDRESS": "AAA", "TYPE": "HM-Sec-SC-2"}),
            json!({"ADDRESS": "AAA:0", "TYPE": "MAINTENANCE", "PARENT": "AAA", "INDEX": 0}),
            json!({"ADDRESS": "AAA:1", "TYPE": "SHUTTER_CONTACT", "PARENT": "AAA", "INDEX": 1}),
        ]
        .into_iter()
        .filter_map(RawDeviceDescription::from_value)
        .collect(),
    );
    registry
}

#[tokio::test]
async fn test_json_name_resolution() {
    let (port, api) = spawn_api().await;
    let remote = remote(port);
    let registry = registry(&remote);

    let applied = resolve_names(&remote, &registry).await;
    assert_eq!(applied, 2);

    assert_eq!(registry.device("AAA").unwrap().name(), "Front door");
    // Channels without their own entry inherit the device name
    assert_eq!(registry.node("AAA:0").unwrap().name(), "Front door");
    assert_eq!(registry.node("AAA:1").unwrap().name(), "Front door contact");

    assert_eq!(
        api.methods(),
        vec![
            "Session.login",
            "Interface.listInterfaces",
            "Device.listAllDetail",
            "Session.logout"
        ]
    );
}

#[tokio::test]
async fn test_refused_login_aborts_resolution() {
    let (port, api) = spawn_api().await;
    api.refuse_login.store(true, Ordering::SeqCst);
    let remote = remote(port);
    let registry = registry(&remote);

    assert_eq!(resolve_names(&remote, &registry).await, 0);
    assert_eq!(registry.device("AAA").unwrap().name(), "AAA");
    assert_eq!(api.methods(), vec!["Session.login"]);
}

#[tokio::test]
async fn test_unmatched_interface_still_logs_out() {
    let (port, api) = spawn_api().await;
    let mut remote = remote(port);
    remote.port = 2000;
    let registry = registry(&remote);

    assert_eq!(resolve_names(&remote, &registry).await, 0);
    assert_eq!(
        api.methods(),
        vec!["Session.login", "Interface.listInterfaces", "Session.logout"]
    );
}

#[tokio::test]
async fn test_logout_after_failed_operation() {
    let (port, api) = spawn_api().await;
    let client = SessionClient::new(&remote(port)).unwrap().unwrap();

    let result = client
        .with_session(|session| {
            let client = &client;
            async move { client.post("Bogus.method", serde_json::Map::from_iter([("_session_id_".to_string(), json!(session))])).await }
        })
        .await;

    assert!(matches!(result, Err(RpcError::Fault { code: 404, .. })));
    assert_eq!(api.methods(), vec!["Session.login", "Bogus.method", "Session.logout"]);
}

#[tokio::test]
async fn test_bridge_sysvars_through_session() {
    let (port, api) = spawn_api().await;
    let bridge_settings = BridgeSettings {
        local_host: "127.0.0.1".to_string(),
        ..BridgeSettings::default()
    };
    let mut remote = remote(port);
    remote.resolve_names = ResolveNames::None;

    let mut bridge = Bridge::builder(HmBridgeConfig::new(bridge_settings, vec![remote]))
        .transport_factory(NullFactory)
        .build()
        .unwrap();
    bridge.connect().await.unwrap();

    let variables = bridge.get_all_system_variables("rf").await.unwrap();
    assert_eq!(variables["Presence"], json!(true));
    assert_eq!(variables["Setpoint"], json!(21.5));
    assert_eq!(api.methods(), vec!["Session.login", "SysVar.getAll", "Session.logout"]);
}
