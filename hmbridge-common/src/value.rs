//! Loosely typed RPC values.
//!
//! Controllers answer with whatever type the parameter happens to have, and
//! the CCU's JSON API returns most scalars as strings. The accessors here
//! accept every representation seen on the wire and return `None` otherwise.

/// A value exchanged over RPC.
pub type RpcValue = serde_json::Value;

/// An RPC struct (string-keyed map), e.g. a paramset or device description.
pub type RpcStruct = serde_json::Map<String, RpcValue>;

/// Interpret a value as a boolean.
///
/// Numbers are true when non-zero; strings accept `"true"`/`"false"` and
/// numeric text.
pub fn value_as_bool(value: &RpcValue) -> Option<bool> {
    match value {
        RpcValue::Bool(b) => Some(*b),
        RpcValue::Number(n) => n.as_f64().map(|f| f != 0.0),
        RpcValue::String(s) => match s.trim() {
            "true" | "TRUE" | "True" => Some(true),
            "false" | "FALSE" | "False" => Some(false),
            other => other.parse::<f64>().ok().map(|f| f != 0.0),
        },
        _ => None,
    }
}

/// Interpret a value as a float.
pub fn value_as_f64(value: &RpcValue) -> Option<f64> {
    match value {
        RpcValue::Number(n) => n.as_f64(),
        RpcValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        RpcValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Interpret a value as an integer. Floats are truncated.
pub fn value_as_i64(value: &RpcValue) -> Option<i64> {
    match value {
        RpcValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        RpcValue::Bool(b) => Some(i64::from(*b)),
        RpcValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Borrow a value as a string slice.
pub fn value_as_str(value: &RpcValue) -> Option<&str> {
    value.as_str()
}
