//! Wire protocol definitions.
//!
//! Every message on the wire is one frame: a 4-byte big-endian length `L`
//! followed by exactly `L` bytes of UTF-8 JSON encoding a single object (an
//! *envelope*). Envelopes always carry an `action`; requests may carry a
//! `request_id` which replies echo back.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{DecodedFrame, EnvelopeCodec, FrameError};

// ── Constants ────────────────────────────────────────────────────────────────

/// Largest payload a single frame may carry.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Receive-buffer cap per connection.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;
/// Bound on the per-connection duplicate-request set.
pub const DEDUPE_MAX_ENTRIES: usize = 1_000;

// ── Action vocabulary ────────────────────────────────────────────────────────

/// The closed set of actions the core speaks.
pub mod actions {
    pub const LOGIN: &str = "login";
    pub const REGISTER: &str = "register";
    pub const SEND_VERIFICATION_CODE: &str = "send_verification_code";
    pub const CHECK_USERNAME: &str = "check_username";
    pub const CHECK_EMAIL: &str = "check_email";
    pub const LOGOUT: &str = "logout";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const DISCONNECT: &str = "disconnect";
    pub const ERROR: &str = "error";
    pub const AUTH_RESPONSE: &str = "auth_response";
    pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
    pub const CONNECTION_REJECTED: &str = "connection_rejected";

    /// Actions a client may issue before it has authenticated.
    pub const PRE_AUTH: &[&str] = &[
        HEARTBEAT,
        LOGIN,
        REGISTER,
        SEND_VERIFICATION_CODE,
        CHECK_USERNAME,
        CHECK_EMAIL,
    ];
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A decoded request envelope. Unknown fields are preserved in `body` so the
/// dispatcher can pull action-specific parameters out of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            request_id: None,
            timestamp: None,
            body: serde_json::Map::new(),
        }
    }

    /// A string field from the body, if present and non-empty.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(serde_json::Value::as_bool)
    }
}

// ── Reply builders ───────────────────────────────────────────────────────────

/// A reply envelope headed back to the client. Thin wrapper over a JSON
/// object so handlers can attach arbitrary fields.
pub fn reply_ok(action: &str, request_id: Option<&str>) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("action".into(), action.into());
    map.insert("success".into(), true.into());
    if let Some(id) = request_id {
        map.insert("request_id".into(), id.into());
    }
    map
}

/// A failure reply `{success:false, code, message}`. `message` must be safe
/// for display; never an internal error string.
pub fn reply_err(
    action: &str,
    request_id: Option<&str>,
    code: &str,
    message: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("action".into(), action.into());
    map.insert("success".into(), false.into());
    map.insert("code".into(), code.into());
    map.insert("message".into(), message.into());
    if let Some(id) = request_id {
        map.insert("request_id".into(), id.into());
    }
    map
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_extra_fields() {
        let raw = r#"{"action":"login","request_id":"r1","username":"alice","password":"pw"}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.action, "login");
        assert_eq!(env.request_id.as_deref(), Some("r1"));
        assert_eq!(env.str_field("username"), Some("alice"));
        assert_eq!(env.str_field("missing"), None);

        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["username"], "alice");
    }

    #[test]
    fn empty_string_fields_read_as_absent() {
        let env: Envelope = serde_json::from_str(r#"{"action":"login","username":""}"#).unwrap();
        assert_eq!(env.str_field("username"), None);
    }

    #[test]
    fn reply_err_shape() {
        let map = reply_err("login", Some("r9"), "InvalidInput", "missing password");
        assert_eq!(map["success"], false);
        assert_eq!(map["code"], "InvalidInput");
        assert_eq!(map["request_id"], "r9");
    }
}
