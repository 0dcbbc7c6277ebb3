use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// JSON-RPC request, in both directions: commands from clients and
/// platform calls sent to the bridge.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// Response envelope: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Error codes this daemon emits. Bridge replies may carry other codes,
/// so [`RpcError::code`] stays a plain string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    NotOwner,
    ProviderError,
    NotFound,
    Conflict,
    BridgeUnavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::NotOwner => "NOT_OWNER",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
        }
    }
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.as_str().to_string(),
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, ErrorCode::MethodNotFound, format!("unknown method {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InvalidParams, msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, ErrorCode::InternalError, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, ErrorCode::ParseError, "message is not valid JSON")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

// Param accessors. Errors are the message for an INVALID_PARAMS reply.

fn missing(key: &str) -> String {
    format!("missing parameter '{key}'")
}

fn malformed(key: &str) -> String {
    format!("malformed parameter '{key}'")
}

pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    optional_str(params, key).ok_or_else(|| missing(key))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key)?.as_str()
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key)?.as_i64()
}

/// Snowflakes arrive as decimal strings, or as numbers from lenient clients.
pub fn require_id<T: FromStr>(params: &serde_json::Value, key: &str) -> Result<T, String> {
    optional_id(params, key)?.ok_or_else(|| missing(key))
}

pub fn optional_id<T: FromStr>(params: &serde_json::Value, key: &str) -> Result<Option<T>, String> {
    use serde_json::Value;
    let parsed = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(text)) => text.parse(),
        Some(Value::Number(n)) => n.to_string().parse(),
        Some(_) => return Err(malformed(key)),
    };
    parsed.map(Some).map_err(|_| malformed(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragment_core::ids::RoomId;

    #[test]
    fn parse_rpc_request() {
        let json = r#"{"method":"room.rename","params":{"userId":"7","name":"x"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "room.rename");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn success_response_serializes() {
        let resp = RpcResponse::success(Some(serde_json::json!(1)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"success\":true"));
    }

    #[test]
    fn error_response_has_string_code() {
        let resp = RpcResponse::error(Some(serde_json::json!(1)), ErrorCode::NotOwner, "not yours");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "NOT_OWNER");
        assert_eq!(json["error"]["message"], "not yours");
        assert_eq!(resp.error_code(), Some("NOT_OWNER"));
    }

    #[test]
    fn response_round_trips_from_bridge() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"id":4,"success":false,"error":{"code":"forbidden","message":"missing access"}}"#,
        )
        .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error_code(), Some("forbidden"));
    }

    #[test]
    fn parse_error_has_no_id() {
        let resp = RpcResponse::parse_error();
        assert!(resp.id.is_none());
        assert_eq!(resp.error_code(), Some("PARSE_ERROR"));
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        let params = serde_json::json!({"a": "12", "b": 13, "c": true, "d": "x"});
        assert_eq!(require_id::<RoomId>(&params, "a").unwrap(), RoomId::new(12));
        assert_eq!(require_id::<RoomId>(&params, "b").unwrap(), RoomId::new(13));
        assert!(require_id::<RoomId>(&params, "c").is_err());
        assert!(require_id::<RoomId>(&params, "d").is_err());
        assert!(require_id::<RoomId>(&params, "e").is_err());
        assert_eq!(optional_id::<RoomId>(&params, "e").unwrap(), None);
    }

    #[test]
    fn str_helpers() {
        let params = serde_json::json!({"name": "test", "count": 5});
        assert_eq!(require_str(&params, "name").unwrap(), "test");
        assert!(require_str(&params, "count").is_err());
        assert_eq!(optional_str(&params, "missing"), None);
        assert_eq!(optional_i64(&params, "count"), Some(5));
    }
}
