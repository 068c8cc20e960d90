//! JSON-RPC envelopes exchanged with the device.
//!
//! Outbound frames are plain serde structs. Inbound text frames are decoded
//! once into a loose [`RawFrame`] and then classified by shape into an
//! [`Inbound`] message, so the dispatch path never inspects raw JSON:
//!
//! | shape                         | classification          |
//! |-------------------------------|-------------------------|
//! | `id` + `result`               | [`Inbound::Reply`]       |
//! | `id` + `error` (code 401)     | reply, [`ReplyOutcome::Unauthorized`] |
//! | `id` + `error`                | reply, [`ReplyOutcome::Error`] |
//! | `method` without `id`         | [`Inbound::Notification`] |
//! | `method` + `id`               | [`Inbound::PeerCall`]    |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{AUTH_CHALLENGE_CODE, AuthFields};

pub const NOTIFY_STATUS: &str = "NotifyStatus";
pub const NOTIFY_FULL_STATUS: &str = "NotifyFullStatus";
pub const NOTIFY_EVENT: &str = "NotifyEvent";

/// Error code returned to the device for calls it makes to us.
pub const NOT_IMPLEMENTED_CODE: i64 = 500;

// ── Outbound ─────────────────────────────────────────────────────────

/// A request frame sent to the device.
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame {
    pub id: u64,
    pub src: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthFields>,
}

impl RequestFrame {
    pub fn to_text(&self) -> String {
        // Serializing plain strings, integers and `Value`s cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Our answer to a call the device makes to us. We expose no methods.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReplyFrame {
    pub id: Value,
    pub src: String,
    pub error: RpcErrorBody,
}

impl ErrorReplyFrame {
    pub fn not_implemented(id: Value, src: &str) -> Self {
        Self {
            id,
            src: src.to_owned(),
            error: RpcErrorBody {
                code: NOT_IMPLEMENTED_CODE,
                message: "Not Implemented".into(),
            },
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Device-reported error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Every field any inbound frame may carry.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// How a reply resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Result(Value),
    Error(RpcErrorBody),
    /// A 401 carrying the digest challenge in `message`.
    Unauthorized { message: String },
}

/// The kind of an unsolicited notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyKind {
    Status,
    FullStatus,
    Event,
    Other(String),
}

impl NotifyKind {
    fn from_method(method: &str) -> Self {
        match method {
            NOTIFY_STATUS => Self::Status,
            NOTIFY_FULL_STATUS => Self::FullStatus,
            NOTIFY_EVENT => Self::Event,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        id: u64,
        src: Option<String>,
        outcome: ReplyOutcome,
    },
    Notification {
        src: Option<String>,
        kind: NotifyKind,
        params: Value,
    },
    PeerCall {
        id: Value,
        src: Option<String>,
        method: String,
    },
}

impl Inbound {
    /// The peer identity the device stamped on the frame, if any.
    pub fn src(&self) -> Option<&str> {
        match self {
            Self::Reply { src, .. } | Self::Notification { src, .. } | Self::PeerCall { src, .. } => {
                src.as_deref()
            }
        }
    }
}

/// A text frame that could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct MalformedFrame {
    pub reason: String,
}

impl MalformedFrame {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decode and classify one inbound text frame.
pub fn classify(text: &str) -> Result<Inbound, MalformedFrame> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| MalformedFrame::new(format!("invalid JSON: {e}")))?;

    let id = raw.id.filter(|v| !v.is_null());

    if let Some(method) = raw.method {
        return Ok(match id {
            Some(id) => Inbound::PeerCall {
                id,
                src: raw.src,
                method,
            },
            None => Inbound::Notification {
                src: raw.src,
                kind: NotifyKind::from_method(&method),
                params: raw.params.unwrap_or(Value::Null),
            },
        });
    }

    let Some(id) = id else {
        return Err(MalformedFrame::new("frame has neither method nor id"));
    };
    let id = id
        .as_u64()
        .ok_or_else(|| MalformedFrame::new(format!("reply id is not an unsigned integer: {id}")))?;

    let outcome = match raw.error {
        Some(err) if err.code == AUTH_CHALLENGE_CODE => ReplyOutcome::Unauthorized {
            message: err.message,
        },
        Some(err) => ReplyOutcome::Error(err),
        None => ReplyOutcome::Result(raw.result.unwrap_or(Value::Null)),
    };

    Ok(Inbound::Reply {
        id,
        src: raw.src,
        outcome,
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_frame_omits_absent_fields() {
        let frame = RequestFrame {
            id: 7,
            src: "shelly-client".into(),
            method: "Shelly.GetStatus".into(),
            params: None,
            dst: None,
            auth: None,
        };

        insta::assert_json_snapshot!(frame, @r#"
        {
          "id": 7,
          "src": "shelly-client",
          "method": "Shelly.GetStatus"
        }
        "#);
    }

    #[test]
    fn request_frame_carries_auth() {
        let frame = RequestFrame {
            id: 2,
            src: "me".into(),
            method: "Switch.Set".into(),
            params: Some(json!({"id": 0, "on": true})),
            dst: Some("shellypro1-abc".into()),
            auth: Some(AuthFields {
                realm: "shellypro1-abc".into(),
                username: "admin".into(),
                nonce: 10,
                cnonce: 20,
                response: "ff".into(),
                algorithm: "SHA-256".into(),
            }),
        };

        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["params"]["on"], true);
        assert_eq!(value["dst"], "shellypro1-abc");
        assert_eq!(value["auth"]["nonce"], 10);
        assert_eq!(value["auth"]["algorithm"], "SHA-256");
    }

    #[test]
    fn classify_result_reply() {
        let inbound = classify(r#"{"id":3,"src":"dev","result":{"was_on":false}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply {
                id: 3,
                src: Some("dev".into()),
                outcome: ReplyOutcome::Result(json!({"was_on": false})),
            }
        );
    }

    #[test]
    fn classify_null_result_is_still_a_reply() {
        let inbound = classify(r#"{"id":4,"result":null}"#).unwrap();
        assert!(matches!(
            inbound,
            Inbound::Reply { id: 4, outcome: ReplyOutcome::Result(Value::Null), .. }
        ));
    }

    #[test]
    fn classify_error_reply() {
        let inbound =
            classify(r#"{"id":5,"error":{"code":-105,"message":"Argument 'id' not found"}}"#)
                .unwrap();
        let Inbound::Reply { outcome, .. } = inbound else {
            panic!("expected reply");
        };
        assert_eq!(
            outcome,
            ReplyOutcome::Error(RpcErrorBody {
                code: -105,
                message: "Argument 'id' not found".into(),
            })
        );
    }

    #[test]
    fn classify_auth_challenge() {
        let text = json!({
            "id": 1,
            "error": {
                "code": 401,
                "message": "{\"auth_type\":\"digest\",\"nonce\":1625038762,\"nc\":1,\"realm\":\"shellypro1-abc\",\"algorithm\":\"SHA-256\"}"
            }
        })
        .to_string();

        let Inbound::Reply { outcome, .. } = classify(&text).unwrap() else {
            panic!("expected reply");
        };
        let ReplyOutcome::Unauthorized { message } = outcome else {
            panic!("expected challenge");
        };
        let challenge = crate::auth::AuthChallenge::parse(&message).unwrap();
        assert_eq!(challenge.nonce, 1_625_038_762);
    }

    #[test]
    fn classify_notifications() {
        let status = classify(
            r#"{"src":"dev","dst":"me","method":"NotifyStatus","params":{"ts":1.5,"switch:0":{"output":true}}}"#,
        )
        .unwrap();
        let Inbound::Notification { kind, params, src } = status else {
            panic!("expected notification");
        };
        assert_eq!(kind, NotifyKind::Status);
        assert_eq!(src.as_deref(), Some("dev"));
        assert_eq!(params["switch:0"]["output"], true);

        let other = classify(r#"{"method":"NotifySomething"}"#).unwrap();
        assert!(matches!(
            other,
            Inbound::Notification { kind: NotifyKind::Other(ref m), params: Value::Null, .. } if m == "NotifySomething"
        ));
    }

    #[test]
    fn classify_peer_call() {
        let inbound = classify(r#"{"id":"abc","src":"dev","method":"Foo.Bar"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::PeerCall {
                id: json!("abc"),
                src: Some("dev".into()),
                method: "Foo.Bar".into(),
            }
        );
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(classify("not json").is_err());
        assert!(classify(r#"{"src":"dev"}"#).is_err());
        assert!(classify(r#"{"id":-1,"result":{}}"#).is_err());
        assert!(classify("[1,2,3]").is_err());
    }

    #[test]
    fn not_implemented_reply_shape() {
        let frame = ErrorReplyFrame::not_implemented(json!(9), "me");
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value, json!({"id": 9, "src": "me", "error": {"code": 500, "message": "Not Implemented"}}));
    }
}
