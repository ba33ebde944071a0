//! Wire envelope for the line-delimited JSON-RPC protocol.
//!
//! Every input line is one self-contained request. Every output line is
//! either a response (correlated by `id`) or a notification (same shape,
//! `id` is `null`).
//!
//! ```text
//! -> {"jsonrpc":"2.0","method":"project.getPackages","params":{"project_id":"project-1"},"id":7}
//! <- {"jsonrpc":"2.0","result":{"packages":["base","linux"]},"id":7}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only protocol version this engine speaks.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes. These values are part of the public contract.
pub const PROJECT_NOT_FOUND: i64 = -32000;
pub const PLUGIN_NOT_FOUND: i64 = -32001;
pub const BUILD_IN_PROGRESS: i64 = -32002;
pub const BUILD_NOT_FOUND: i64 = -32003;

/// Structured error object carried in a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(detail.into())
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_data(detail.into())
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn project_not_found(project_id: &str) -> Self {
        Self::new(
            PROJECT_NOT_FOUND,
            format!("Project '{project_id}' not found"),
        )
    }

    pub fn plugin_not_found(distro_id: &str) -> Self {
        Self::new(
            PLUGIN_NOT_FOUND,
            format!("Distro plugin '{distro_id}' not found"),
        )
    }
}

/// A validated request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// Always an object; a missing or `null` params member becomes `{}`.
    pub params: Value,
    pub id: Value,
}

/// A line that could not be turned into a [`Request`].
///
/// `id` is the correlation id recovered from the line, or `null` when the
/// line was not parseable far enough to find one.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub id: Value,
    pub error: RpcError,
}

impl Rejected {
    pub fn into_response(self) -> Response {
        Response::failure(self.id, self.error)
    }
}

impl Request {
    /// Parse and validate one input line.
    pub fn parse(line: &str) -> Result<Request, Rejected> {
        let raw: Value = serde_json::from_str(line).map_err(|e| Rejected {
            id: Value::Null,
            error: RpcError::parse_error(e.to_string()),
        })?;

        let Value::Object(mut envelope) = raw else {
            return Err(Rejected {
                id: Value::Null,
                error: RpcError::invalid_request("request must be a JSON object"),
            });
        };

        let id = match envelope.remove("id") {
            None | Some(Value::Null) => Value::Null,
            Some(id @ (Value::String(_) | Value::Number(_))) => id,
            Some(_) => {
                return Err(Rejected {
                    id: Value::Null,
                    error: RpcError::invalid_request("id must be a string, number or null"),
                })
            }
        };
        let reject = |error: RpcError| Rejected {
            id: id.clone(),
            error,
        };

        match envelope.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => {
                return Err(reject(RpcError::invalid_request(
                    "Invalid JSON-RPC version",
                )))
            }
        }

        let method = match envelope.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(reject(RpcError::invalid_request("method must be a string"))),
            None => return Err(reject(RpcError::invalid_request("missing method"))),
        };

        let params = match envelope.remove("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params @ Value::Object(_)) => params,
            Some(_) => return Err(reject(RpcError::invalid_params("params must be an object"))),
        };

        Ok(Request { method, params, id })
    }

    /// Split the method into `(namespace, action)`.
    pub fn method_name(&self) -> Result<MethodName<'_>, RpcError> {
        MethodName::parse(&self.method)
    }
}

/// A `namespace.action` method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodName<'a> {
    pub namespace: &'a str,
    pub action: &'a str,
}

impl<'a> MethodName<'a> {
    pub fn parse(method: &'a str) -> Result<Self, RpcError> {
        match method.split_once('.') {
            Some((namespace, action)) if !namespace.is_empty() && !action.is_empty() => {
                Ok(Self { namespace, action })
            }
            _ => Err(RpcError::method_not_found(
                "Invalid method format. Expected 'namespace.method'",
            )),
        }
    }
}

/// Response or notification line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// An uncorrelated output line (log chunks, stream markers).
    pub fn notification(result: Value) -> Self {
        Self::success(Value::Null, result)
    }
}
