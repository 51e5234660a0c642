//! Protocol message parsing and formatting for the `serve` stdio protocol.
//!
//! Messages are newline-delimited JSON on stdin/stdout.

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::Value;

use follow_harvest::{HarvestEvent, MemberIdentity};

pub const E_INVALID_REQUEST: &str = "E_INVALID_REQUEST";
pub const E_INVALID_PARAMS: &str = "E_INVALID_PARAMS";

const DEFAULT_LIMIT: usize = 10_000;

/// Protocol methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Ping,
    LoadFollowing,
    UnfollowUsers,
    IngestPayload,
}

impl Method {
    /// Parse a method name string into a Method enum.
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(Self::Ping),
            "load_following" => Ok(Self::LoadFollowing),
            "unfollow_users" => Ok(Self::UnfollowUsers),
            "ingest_payload" => Ok(Self::IngestPayload),
            _ => bail!("unknown method: {s}"),
        }
    }
}

/// A parsed protocol request.
#[derive(Debug)]
pub struct Request {
    pub id: String,
    pub method: Method,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub resume: bool,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnfollowParams {
    pub identities: Vec<MemberIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IngestParams {
    pub text: String,
}

/// Best-effort request id, for error replies to lines that fail to parse.
pub fn request_id(json: &str) -> String {
    serde_json::from_str::<Value>(json)
        .ok()
        .and_then(|v| v.get("id").and_then(id_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a JSON request line into (id, method, params).
pub fn parse_request(json: &str) -> Result<Request> {
    let v: Value = serde_json::from_str(json)?;

    let id = v
        .get("id")
        .and_then(id_string)
        .unwrap_or_else(|| "unknown".to_string());

    let method_str = v
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'method' field"))?;

    let method = Method::from_str(method_str)?;

    let params = v
        .get("params")
        .filter(|p| !p.is_null())
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    Ok(Request { id, method, params })
}

/// Decode a request's params.
pub fn params<T: serde::de::DeserializeOwned>(req: &Request) -> Result<T> {
    Ok(serde_json::from_value(req.params.clone())?)
}

/// Format a successful response as JSON string (newline-terminated).
pub fn format_response(id: &str, result: Value) -> String {
    let resp = serde_json::json!({
        "id": id,
        "result": result,
    });
    format!("{}\n", resp)
}

/// Format an error response as JSON string (newline-terminated).
pub fn format_error(id: &str, code: &str, message: &str) -> String {
    let resp = serde_json::json!({
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    });
    format!("{}\n", resp)
}

/// Format an unsolicited event line.
pub fn format_event(event: &HarvestEvent) -> String {
    format!("{}\n", serde_json::json!({ "event": event }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_request() {
        let json = r#"{"id": "r1", "method": "load_following", "params": {"limit": 50, "resume": true}}"#;
        let req = parse_request(json).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(req.method, Method::LoadFollowing);
        let p: LoadParams = params(&req).unwrap();
        assert_eq!(p, LoadParams { limit: 50, resume: true });
    }

    #[test]
    fn test_load_params_default() {
        let req = parse_request(r#"{"id": 7, "method": "load_following"}"#).unwrap();
        assert_eq!(req.id, "7");
        let p: LoadParams = params(&req).unwrap();
        assert_eq!(p.limit, DEFAULT_LIMIT);
        assert!(!p.resume);
    }

    #[test]
    fn test_parse_unknown_method() {
        let json = r#"{"id": "x", "method": "foobar", "params": {}}"#;
        assert!(parse_request(json).is_err());
        assert_eq!(request_id(json), "x");
        assert_eq!(request_id("not json"), "unknown");
    }

    #[test]
    fn test_unfollow_params_need_identities() {
        let req = parse_request(r#"{"id": "u", "method": "unfollow_users", "params": {}}"#).unwrap();
        assert!(params::<UnfollowParams>(&req).is_err());
    }

    #[test]
    fn test_format_error() {
        let resp = format_error("r2", E_INVALID_PARAMS, "missing field");
        let parsed: Value = serde_json::from_str(resp.trim()).unwrap();
        assert_eq!(parsed["id"], "r2");
        assert_eq!(parsed["error"]["code"], "E_INVALID_PARAMS");
    }

    #[test]
    fn test_format_event() {
        let line = format_event(&HarvestEvent::BatchDone { count: 4 });
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["event"]["kind"], "batch-done");
        assert_eq!(parsed["event"]["count"], 4);
    }
}
