//! Integration tests against a fake controller.
//!
//! The fake speaks XML-RPC over HTTP like a CCU: it answers `init` and then
//! pushes `newDevices` and an `event` to the announced callback URL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use parking_lot::Mutex;
use serde_json::json;

use hmbridge_core::config::BridgeSettings;
use hmbridge_core::xmlrpc;
use hmbridge_core::{
    Bridge, BridgeState, HmBridgeConfig, LockingProxy, NodeEvent, RemoteConfig, RemoteStatus,
    RpcError, RpcTransport, RpcValue, SystemEvent, XmlRpcTransport,
};

type CallLog = Arc<Mutex<Vec<(String, Vec<RpcValue>)>>>;

async fn fake_controller(State(log): State<CallLog>, body: Bytes) -> String {
    let (method, params) = match xmlrpc::decode_call(&String::from_utf8_lossy(&body)) {
        Ok(call) => call,
        Err(e) => return xmlrpc::encode_fault(-1, &e.to_string()),
    };
    log.lock().push((method.clone(), params.clone()));

    let result = match method.as_str() {
        "init" if params.len() == 2 => {
            let url = params[0].as_str().unwrap_or_default().to_string();
            let interface_id = params[1].as_str().unwrap_or_default().to_string();
            tokio::spawn(push_devices(url, interface_id));
            json!("")
        }
        "listDevices" => json!([]),
        _ => json!(""),
    };
    xmlrpc::encode_response(&result)
}

/// Talk back to the bridge like a controller does after `init`.
async fn push_devices(url: String, interface_id: String) {
    let port: u16 = url.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap();
    let callback = XmlRpcTransport::new(&RemoteConfig::new("cb", "127.0.0.1", port)).unwrap();

    callback
        .call(
            "newDevices",
            vec![
                json!(interface_id),
                json!([
                    {"ADDRESS": "AAA", "TYPE": "HM-Sec-SC-2", "CHILDREN": ["AAA:1"]},
                    {"ADDRESS": "AAA:1", "TYPE": "SHUTTER_CONTACT", "PARENT": "AAA", "INDEX": 1}
                ]),
            ],
        )
        .await
        .unwrap();
    callback
        .call("event", vec![json!(interface_id), json!("AAA:1"), json!("state"), json!(true)])
        .await
        .unwrap();
}

async fn spawn_controller() -> (SocketAddr, CallLog) {
    let log = CallLog::default();
    let router = Router::new()
        .route("/", post(fake_controller))
        .with_state(log.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (addr, log)
}

fn config(remotes: Vec<RemoteConfig>) -> HmBridgeConfig {
    let bridge = BridgeSettings {
        local_host: "127.0.0.1".to_string(),
        ..BridgeSettings::default()
    };
    HmBridgeConfig::new(bridge, remotes)
}

async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_bridge_against_fake_controller() {
    let (addr, log) = spawn_controller().await;
    let events: Arc<Mutex<Vec<NodeEvent>>> = Arc::default();
    let system: Arc<Mutex<Vec<SystemEvent>>> = Arc::default();

    let (event_sink, system_sink) = (events.clone(), system.clone());
    let mut bridge = Bridge::builder(config(vec![RemoteConfig::new("rf", "127.0.0.1", addr.port())]))
        .on_event(move |e| event_sink.lock().push(e.clone()))
        .on_system(move |e| system_sink.lock().push(e.clone()))
        .build()
        .unwrap();

    bridge.connect().await.unwrap();
    bridge.start().await.unwrap();
    let callback_port = bridge.server_addr().unwrap().port();

    assert!(wait_for(|| !events.lock().is_empty()).await, "no event arrived");

    let device = bridge.device("rf", "AAA").unwrap();
    assert_eq!(device.channel_indices(), vec![1]);
    let channel = bridge.node("rf", "AAA:1").unwrap();
    assert_eq!(channel.cached_value("STATE"), Some(json!(true)));
    assert_eq!(events.lock()[0].key, "STATE");
    assert!(
        system
            .lock()
            .iter()
            .any(|e| matches!(e, SystemEvent::NewDevices { descriptions, .. } if descriptions.len() == 2))
    );

    let status = bridge.status();
    let entry = status.remote("rf").unwrap();
    assert!(entry.initialized);
    assert_eq!(entry.health.status, RemoteStatus::Online);
    assert_eq!(entry.nodes, 2);

    bridge.stop().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Stopped);

    let calls = log.lock();
    let inits: Vec<_> = calls.iter().filter(|(m, _)| m == "init").collect();
    assert_eq!(inits.len(), 2);
    assert_eq!(inits[0].1[0], json!(format!("http://127.0.0.1:{callback_port}")));
    assert_eq!(inits[0].1[1], json!("hmbridge-rf"));
    assert_eq!(inits[1].1, vec![json!(format!("http://127.0.0.1:{callback_port}"))]);
}

#[tokio::test]
async fn test_failed_init_does_not_block_other_remotes() {
    let (addr, log) = spawn_controller().await;

    // Port 9 is closed, so `init` fails with a transport error
    let mut bridge = Bridge::new(config(vec![
        RemoteConfig::new("dead", "127.0.0.1", 9),
        RemoteConfig::new("rf", "127.0.0.1", addr.port()),
    ]))
    .unwrap();

    bridge.connect().await.unwrap();
    bridge.start().await.unwrap();

    let status = bridge.status();
    assert!(!status.remote("dead").unwrap().initialized);
    assert_ne!(status.remote("dead").unwrap().health.status, RemoteStatus::Online);
    assert!(status.remote("rf").unwrap().initialized);

    assert!(wait_for(|| bridge.device("rf", "AAA").is_some()).await);

    bridge.stop().await.unwrap();
    let inits = log.lock().iter().filter(|(m, _)| m == "init").count();
    assert_eq!(inits, 2);
}

#[tokio::test]
async fn test_skip_init_remote_is_not_contacted() {
    let (addr, log) = spawn_controller().await;
    let mut remote = RemoteConfig::new("rf", "127.0.0.1", addr.port());
    remote.connect = false;

    let mut bridge = Bridge::new(config(vec![remote])).unwrap();
    bridge.connect().await.unwrap();
    bridge.start().await.unwrap();
    bridge.stop().await.unwrap();

    assert!(log.lock().is_empty());
}

struct InstrumentedTransport {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl RpcTransport for InstrumentedTransport {
    async fn call(&self, _method: &str, _params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(0))
    }

    fn endpoint(&self) -> &str {
        "instrumented://"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_calls_never_overlap() {
    let transport = Arc::new(InstrumentedTransport {
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let remote = RemoteConfig::new("rf", "127.0.0.1", 2001);
    let proxy = Arc::new(LockingProxy::new(&remote, "hmbridge-rf", transport.clone()));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let proxy = proxy.clone();
        tasks.push(tokio::spawn(async move {
            proxy.get_value(&format!("AAA:{i}"), "STATE").await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(transport.calls.load(Ordering::SeqCst), 16);
    assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
}
