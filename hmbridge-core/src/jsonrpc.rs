//! JSON-RPC envelope types shared by the outbound transport and the
//! callback server.

use serde::{Deserialize, Serialize};

use hmbridge_common::RpcValue;

use crate::error::RpcError;

/// Protocol version written into every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Parse error (malformed request body).
pub const PARSE_ERROR: i64 = -32700;
/// The request is not a valid envelope.
pub const INVALID_REQUEST: i64 = -32600;
/// The method is not known.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<RpcValue>,
    #[serde(default)]
    pub id: RpcValue,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<RpcValue>, id: u64) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
            id: RpcValue::from(id),
        }
    }
}

/// Error object of a JSON-RPC response.
///
/// Homegear answers faults as `{faultCode, faultString}`, so both spellings
/// are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorObject {
    #[serde(alias = "faultCode")]
    pub code: i64,
    #[serde(alias = "faultString")]
    pub message: String,
}

impl From<&RpcError> for JsonRpcErrorObject {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Fault { code, message } => Self {
                code: *code,
                message: message.clone(),
            },
            other => Self {
                code: -32000,
                message: other.to_string(),
            },
        }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub id: RpcValue,
}

impl JsonRpcResponse {
    pub fn success(id: RpcValue, result: RpcValue) -> Self {
        Self {
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: RpcValue, error: JsonRpcErrorObject) -> Self {
        Self {
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn from_result(id: RpcValue, result: Result<RpcValue, RpcError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(id, JsonRpcErrorObject::from(&err)),
        }
    }

    /// Turn the envelope into the call outcome.
    ///
    /// A missing `result` without an error is a void answer and maps to null.
    pub fn into_result(self) -> Result<RpcValue, RpcError> {
        if let Some(err) = self.error {
            return Err(RpcError::fault(err.code, err.message));
        }
        Ok(self.result.unwrap_or(RpcValue::Null))
    }
}

/// Encode a failed call as the fault struct used inside `system.multicall`.
pub fn fault_struct(err: &RpcError) -> RpcValue {
    let obj = JsonRpcErrorObject::from(err);
    serde_json::json!({ "faultCode": obj.code, "faultString": obj.message })
}
