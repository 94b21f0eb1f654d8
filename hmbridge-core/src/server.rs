//! HTTP callback server.
//!
//! Controllers POST XML-RPC `methodCall` documents to `/` or `/RPC2`. Bodies
//! that are not XML are read as JSON-RPC requests. Requests are decoded here
//! and handed to the dispatcher queue; the answer goes back in the caller's
//! encoding. Protocol errors are faults with HTTP 200.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hmbridge_common::RpcValue;

use crate::dispatch::DispatchHandle;
use crate::error::{BridgeError, Result};
use crate::jsonrpc::{INVALID_REQUEST, JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use crate::xmlrpc;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    dispatcher: DispatchHandle,
}

/// Create the callback router.
pub fn create_router(dispatcher: DispatchHandle) -> Router {
    let state = AppState { dispatcher };

    Router::new()
        .route("/", post(rpc_handler))
        .route("/RPC2", post(rpc_handler))
        .with_state(state)
}

async fn rpc_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let is_xml = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<');

    if is_xml {
        xml_call(&state, &body).await.into_response()
    } else {
        json_call(&state, &body).await.into_response()
    }
}

async fn xml_call(state: &AppState, body: &[u8]) -> impl IntoResponse {
    let document = match xmlrpc::decode_call(&String::from_utf8_lossy(body)) {
        Ok((method, params)) => {
            debug!(method = %method, "Callback request");
            let result = state.dispatcher.call(method, params).await;
            xmlrpc::encode_result(&result)
        }
        Err(e) => {
            warn!(error = %e, "Malformed callback request");
            xmlrpc::encode_fault(PARSE_ERROR, &format!("Parse error: {e}"))
        }
    };

    ([(header::CONTENT_TYPE, xmlrpc::CONTENT_TYPE)], document)
}

async fn json_call(state: &AppState, body: &[u8]) -> Json<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed callback request");
            return Json(JsonRpcResponse::failure(
                RpcValue::Null,
                JsonRpcErrorObject {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {e}"),
                },
            ));
        }
    };

    if request.method.is_empty() {
        return Json(JsonRpcResponse::failure(
            request.id,
            JsonRpcErrorObject {
                code: INVALID_REQUEST,
                message: "Missing method".to_string(),
            },
        ));
    }

    debug!(method = %request.method, "Callback request");
    let result = state.dispatcher.call(request.method, request.params).await;
    Json(JsonRpcResponse::from_result(request.id, result))
}

/// The listening callback endpoint.
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackServer {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| BridgeError::server(format!("Failed to bind to {host}:{port}: {e}")))?;
        let addr = listener.local_addr()?;

        info!(addr = %addr, "Callback server listening");
        Ok(Self { listener, addr })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, dispatcher: DispatchHandle, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = create_router(dispatcher);
        let addr = self.addr;

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!(addr = %addr, "Callback server shutting down");
            })
            .await
            .map_err(|e| BridgeError::server(format!("Callback server error: {e}")))?;

        info!(addr = %addr, "Callback server stopped");
        Ok(())
    }

    /// Serve on a background task.
    pub fn spawn(self, dispatcher: DispatchHandle, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(dispatcher, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use parking_lot::Mutex;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::dispatch::{CallbackHandler, spawn_dispatcher};
    use crate::error::RpcError;
    use crate::node::NodeEvent;

    fn router() -> Router {
        let handler = Arc::new(CallbackHandler::new(&[], false));
        let (handle, _task) = spawn_dispatcher(handler);
        create_router(handle)
    }

    fn recording_router() -> (Router, Arc<Mutex<Vec<NodeEvent>>>) {
        let events: Arc<Mutex<Vec<NodeEvent>>> = Arc::default();
        let sink = events.clone();
        let handler = CallbackHandler::new(&[], false).with_event_callback(Some(Arc::new(
            move |e: &NodeEvent| sink.lock().push(e.clone()),
        )));
        let (handle, _task) = spawn_dispatcher(Arc::new(handler));
        (create_router(handle), events)
    }

    async fn post_xml(router: Router, path: &str, body: &str) -> (StatusCode, String, String) {
        let response = router
            .oneshot(
                Request::post(path)
                    .header("content-type", "text/xml")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn post_body(router: Router, path: &str, body: String) -> (StatusCode, RpcValue) {
        let response = router
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_list_methods_over_http() {
        let body = json!({"jsonrpc": "2.0", "method": "system.listMethods", "params": [], "id": 3});
        let (status, value) = post_body(router(), "/RPC2", body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["id"], 3);
        assert!(value["result"].as_array().unwrap().contains(&json!("event")));
    }

    #[tokio::test]
    async fn test_parse_error_is_http_ok() {
        let (status, value) = post_body(router(), "/", "{not json".to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert!(value.get("result").is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let body = json!({"jsonrpc": "2.0", "method": "reboot", "params": [], "id": 1});
        let (status, value) = post_body(router(), "/", body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["error"]["code"], crate::jsonrpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_for_unknown_remote_is_acknowledged() {
        let body = json!({"jsonrpc": "2.0", "method": "event", "params": ["x-rf", "AAA:1", "STATE", true], "id": 2});
        let (_, value) = post_body(router(), "/", body.to_string()).await;
        assert_eq!(value["result"], json!(true));
    }

    #[tokio::test]
    async fn test_xml_event_is_dispatched() {
        let (router, events) = recording_router();
        let body = r#"<?xml version="1.0"?>
<methodCall><methodName>event</methodName><params>
<param><value><string>hmbridge-rf</string></value></param>
<param><value><string>AAA:1</string></value></param>
<param><value><string>STATE</string></value></param>
<param><value><boolean>1</boolean></value></param>
</params></methodCall>"#;

        let (status, content_type, answer) = post_xml(router, "/RPC2", body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/xml");
        assert_eq!(xmlrpc::decode_response(&answer), Ok(json!(true)));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].address, "AAA:1");
        assert_eq!(events[0].key, "STATE");
        assert_eq!(events[0].value, json!(true));
    }

    #[tokio::test]
    async fn test_xml_multicall() {
        let (router, events) = recording_router();
        let calls = json!([
            {"methodName": "event", "params": ["hmbridge-rf", "AAA:1", "LEVEL", 0.5]},
            {"methodName": "reboot", "params": []}
        ]);
        let body = xmlrpc::encode_call("system.multicall", &[calls]);

        let (_, _, answer) = post_xml(router, "/", &body).await;
        let results = xmlrpc::decode_response(&answer).unwrap();

        assert_eq!(results[0], json!([true]));
        assert_eq!(results[1]["faultCode"], json!(crate::jsonrpc::METHOD_NOT_FOUND));
        assert_eq!(events.lock()[0].value, json!(0.5));
    }

    #[tokio::test]
    async fn test_xml_parse_error_is_fault() {
        let (status, _, answer) = post_xml(router(), "/", "<methodCall><methodName>").await;

        assert_eq!(status, StatusCode::OK);
        assert!(matches!(
            xmlrpc::decode_response(&answer),
            Err(RpcError::Fault { code: PARSE_ERROR, .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = CallbackServer::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }
}
