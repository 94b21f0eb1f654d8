//! Client for the CCU's session based JSON API (`/api/homematic.cgi`).
//!
//! Used for name resolution and, when credentials are configured, for
//! system variables. Every operation runs inside a login/logout pair.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use hmbridge_common::{RpcStruct, RpcValue, value_as_f64, value_as_i64, value_as_str};

use crate::config::{JSON_API_PATH, RemoteConfig};
use crate::error::RpcError;
use crate::transport::{build_http_client, map_reqwest_error};

/// An interface listed by `Interface.listInterfaces`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterfaceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub info: String,
}

/// A channel entry of `Device.listAllDetail`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelDetail {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
}

/// A device entry of `Device.listAllDetail`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDetail {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelDetail>,
}

/// JSON API client for one remote.
pub struct SessionClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    timeout: Option<Duration>,
}

impl SessionClient {
    /// Create a client for the remote's web server.
    ///
    /// Returns `None` when the remote has no credentials.
    pub fn new(remote: &RemoteConfig) -> Result<Option<Self>, RpcError> {
        if !remote.has_credentials() {
            return Ok(None);
        }
        let timeout = remote.request_timeout_secs.map(Duration::from_secs);
        Ok(Some(Self {
            http: build_http_client(remote.verify_tls, timeout)?,
            endpoint: format!("{}{}", remote.web_url(), JSON_API_PATH),
            username: remote.username.clone().unwrap_or_default(),
            password: remote.password.clone().unwrap_or_default(),
            timeout,
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post one method call and return its `result`.
    pub async fn post(&self, method: &str, params: RpcStruct) -> Result<RpcValue, RpcError> {
        debug!(endpoint = %self.endpoint, method, "JSON API call");
        let payload = json!({
            "method": method,
            "params": params,
            "protocolVersion": "1.1",
            "id": 0,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("HTTP status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        let envelope = parse_body(&body)?;
        into_result(envelope)
    }

    /// Open a session. `None` when the controller refuses.
    pub async fn login(&self) -> Result<Option<String>, RpcError> {
        let mut params = RpcStruct::new();
        params.insert("username".to_string(), json!(self.username));
        params.insert("password".to_string(), json!(self.password));

        match self.post("Session.login", params).await {
            Ok(RpcValue::String(session)) if !session.is_empty() => Ok(Some(session)),
            Ok(_) => Ok(None),
            Err(err @ RpcError::Fault { .. }) => {
                debug!(endpoint = %self.endpoint, error = %err, "Login refused");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn logout(&self, session: &str) -> Result<bool, RpcError> {
        let value = self.post("Session.logout", session_params(session)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Run `op` inside a session. Logout is attempted whatever `op` returns.
    ///
    /// Returns `Ok(None)` when no session could be opened.
    pub async fn with_session<T, F, Fut>(&self, op: F) -> Result<Option<T>, RpcError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let session = match self.login().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(endpoint = %self.endpoint, "Unable to open JSON API session");
                return Ok(None);
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Unable to open JSON API session");
                return Err(e);
            }
        };

        let result = op(session.clone()).await;
        if let Err(e) = self.logout(&session).await {
            debug!(endpoint = %self.endpoint, error = %e, "Logout failed");
        }
        result.map(Some)
    }

    pub async fn list_interfaces(&self, session: &str) -> Result<Vec<InterfaceInfo>, RpcError> {
        let value = self
            .post("Interface.listInterfaces", session_params(session))
            .await?;
        Ok(parse_list(value))
    }

    pub async fn list_all_detail(&self, session: &str) -> Result<Vec<DeviceDetail>, RpcError> {
        let value = self
            .post("Device.listAllDetail", session_params(session))
            .await?;
        Ok(parse_list(value))
    }

    /// All system variables, typed by their CCU type.
    pub async fn get_all_sysvars(&self, session: &str) -> Result<RpcStruct, RpcError> {
        let value = self.post("SysVar.getAll", session_params(session)).await?;
        let mut variables = RpcStruct::new();
        if let RpcValue::Array(items) = value {
            for item in &items {
                if let Some((name, value)) = parse_sysvar(item) {
                    variables.insert(name, value);
                }
            }
        }
        Ok(variables)
    }

    /// A single system variable: numeric text becomes a float, anything
    /// else a boolean.
    pub async fn get_sysvar(&self, session: &str, name: &str) -> Result<RpcValue, RpcError> {
        let mut params = session_params(session);
        params.insert("name".to_string(), json!(name));

        let value = self.post("SysVar.getValueByName", params).await?;
        Ok(match value_as_f64(&value) {
            Some(number) if !value.is_boolean() => json!(number),
            _ => json!(value_as_str(&value) == Some("true") || value == json!(true)),
        })
    }

    /// Set a system variable; booleans go through `SysVar.setBool`, anything
    /// else through `SysVar.setFloat`.
    pub async fn set_sysvar(&self, session: &str, name: &str, value: &RpcValue) -> Result<RpcValue, RpcError> {
        let mut params = session_params(session);
        params.insert("name".to_string(), json!(name));

        let method = match value {
            RpcValue::Bool(flag) => {
                params.insert("value".to_string(), json!(i64::from(*flag)));
                "SysVar.setBool"
            }
            other => {
                params.insert("value".to_string(), other.clone());
                "SysVar.setFloat"
            }
        };
        self.post(method, params).await
    }

    pub async fn delete_sysvar(&self, session: &str, name: &str) -> Result<RpcValue, RpcError> {
        let mut params = session_params(session);
        params.insert("name".to_string(), json!(name));
        self.post("SysVar.deleteSysVarByName", params).await
    }
}

fn session_params(session: &str) -> RpcStruct {
    let mut params = RpcStruct::new();
    params.insert("_session_id_".to_string(), json!(session));
    params
}

/// Parse a response body; the CCU sometimes emits invalid escapes, so a
/// failing body is retried with backslashes removed.
fn parse_body(body: &str) -> Result<RpcValue, RpcError> {
    serde_json::from_str(body).or_else(|_| {
        serde_json::from_str(&body.replace('\\', ""))
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))
    })
}

fn into_result(envelope: RpcValue) -> Result<RpcValue, RpcError> {
    let RpcValue::Object(mut fields) = envelope else {
        return Err(RpcError::InvalidResponse("response is not an object".to_string()));
    };

    match fields.remove("error") {
        None | Some(RpcValue::Null) => Ok(fields.remove("result").unwrap_or(RpcValue::Null)),
        Some(error) => {
            let code = error.get("code").and_then(value_as_i64).unwrap_or(-1);
            let message = match error.get("message").and_then(value_as_str) {
                Some(message) => message.to_string(),
                None => error.to_string(),
            };
            Err(RpcError::fault(code, message))
        }
    }
}

fn parse_list<T: for<'de> Deserialize<'de>>(value: RpcValue) -> Vec<T> {
    match value {
        RpcValue::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Type a CCU system variable entry: LOGIC -> bool, NUMBER -> float,
/// LIST -> integer, anything else unchanged.
pub fn parse_sysvar(data: &RpcValue) -> Option<(String, RpcValue)> {
    let name = data.get("name").and_then(value_as_str)?.to_string();
    let value = data.get("value").cloned().unwrap_or(RpcValue::Null);
    let kind = data.get("type").and_then(value_as_str).unwrap_or_default();

    let typed = match kind {
        "LOGIC" => json!(value_as_str(&value) == Some("true") || value == json!(true)),
        "NUMBER" => value_as_f64(&value).map(|f| json!(f)).unwrap_or(value),
        "LIST" => value_as_i64(&value).map(|i| json!(i)).unwrap_or(value),
        _ => value,
    };
    Some((name, typed))
}
