//! Outbound RPC transport.
//!
//! The proxy talks to a controller through the [`RpcTransport`] trait.
//! [`XmlRpcTransport`] speaks the controllers' native XML-RPC and is what
//! [`HttpTransportFactory`] hands out unless a remote asks for JSON-RPC.
//! Other encodings plug in by implementing the trait and handing a
//! [`TransportFactory`] to the bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::trace;

use hmbridge_common::RpcValue;

use crate::config::{RemoteConfig, RpcEncoding};
use crate::error::RpcError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::xmlrpc;

/// A single request/response exchange with a controller.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Perform one call and return the decoded result.
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError>;

    /// Endpoint description for logs (never contains credentials).
    fn endpoint(&self) -> &str;
}

/// Creates a transport for each configured remote.
pub trait TransportFactory: Send + Sync {
    fn create(&self, remote: &RemoteConfig) -> Result<Arc<dyn RpcTransport>, RpcError>;
}

/// Picks the transport from the remote's `encoding`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(&self, remote: &RemoteConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
        match remote.encoding {
            RpcEncoding::Xml => XmlRpcTransportFactory.create(remote),
            RpcEncoding::Json => JsonRpcTransportFactory.create(remote),
        }
    }
}

/// Factory for [`XmlRpcTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlRpcTransportFactory;

impl TransportFactory for XmlRpcTransportFactory {
    fn create(&self, remote: &RemoteConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(Arc::new(XmlRpcTransport::new(remote)?))
    }
}

/// Factory for [`JsonRpcTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcTransportFactory;

impl TransportFactory for JsonRpcTransportFactory {
    fn create(&self, remote: &RemoteConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(Arc::new(JsonRpcTransport::new(remote)?))
    }
}

/// Build a `reqwest::Client` with the given TLS verification and timeout.
pub fn build_http_client(
    verify_tls: bool,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, RpcError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
        "hmbridge/",
        env!("CARGO_PKG_VERSION")
    ));

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if !verify_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| RpcError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Map a reqwest error onto the RPC error taxonomy.
pub(crate) fn map_reqwest_error(err: reqwest::Error, timeout: Option<Duration>) -> RpcError {
    match timeout {
        Some(duration) if err.is_timeout() => RpcError::Timeout(duration),
        _ => RpcError::Transport(err.without_url().to_string()),
    }
}

/// HTTP endpoint of a remote's RPC interface.
struct HttpEndpoint {
    http: reqwest::Client,
    url: String,
    credentials: Option<(String, Option<String>)>,
    timeout: Option<Duration>,
}

impl HttpEndpoint {
    fn new(remote: &RemoteConfig) -> Result<Self, RpcError> {
        let timeout = remote.request_timeout_secs.map(Duration::from_secs);
        Ok(Self {
            http: build_http_client(remote.verify_tls, timeout)?,
            url: remote.rpc_url(),
            credentials: remote.rpc_credentials(),
            timeout,
        })
    }

    /// A POST to the endpoint with basic auth applied.
    fn post(&self) -> reqwest::RequestBuilder {
        let builder = self.http.post(&self.url);
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, pass.as_ref()),
            None => builder,
        }
    }

    /// Send and return the body of a successful answer.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, RpcError> {
        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("HTTP status {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))
    }
}

/// XML-RPC over HTTP(S).
pub struct XmlRpcTransport {
    endpoint: HttpEndpoint,
}

impl XmlRpcTransport {
    /// Create a transport for the remote's RPC endpoint.
    pub fn new(remote: &RemoteConfig) -> Result<Self, RpcError> {
        Ok(Self {
            endpoint: HttpEndpoint::new(remote)?,
        })
    }
}

#[async_trait]
impl RpcTransport for XmlRpcTransport {
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        trace!(url = %self.endpoint.url, method, "Sending XML-RPC request");
        let request = self
            .endpoint
            .post()
            .header(CONTENT_TYPE, xmlrpc::CONTENT_TYPE)
            .body(xmlrpc::encode_call(method, &params));

        let body = self.endpoint.send(request).await?;
        xmlrpc::decode_response(&body)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint.url
    }
}

/// JSON-RPC over HTTP(S).
pub struct JsonRpcTransport {
    endpoint: HttpEndpoint,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    /// Create a transport for the remote's RPC endpoint.
    pub fn new(remote: &RemoteConfig) -> Result<Self, RpcError> {
        Ok(Self {
            endpoint: HttpEndpoint::new(remote)?,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcTransport for JsonRpcTransport {
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, id);
        trace!(url = %self.endpoint.url, method, id, "Sending JSON-RPC request");

        let body = self
            .endpoint
            .send(self.endpoint.post().json(&request))
            .await?;

        let envelope: JsonRpcResponse =
            serde_json::from_str(&body).map_err(|e| RpcError::InvalidResponse(e.to_string()))?;
        envelope.into_result()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint.url
    }
}
