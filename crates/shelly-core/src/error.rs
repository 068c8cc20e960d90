// ── Core error types ──
//
// Caller-facing errors from shelly-core. Consumers never see HTTP or
// tungstenite errors directly: the `From<shelly_api::Error>` impl folds
// wire failures into the session taxonomy.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    /// Transport-level failure. Recoverable by reconnecting.
    #[error("Cannot connect to device at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Credentials missing or rejected. Terminal for the session.
    #[error("Invalid authentication: {message}")]
    InvalidAuth { message: String },

    /// The session left `Ready` (or was never there) while the call was
    /// outstanding.
    #[error("Device disconnected")]
    Disconnected,

    /// The probed device is not the one configured.
    #[error("MAC address mismatch: expected {expected}, device reports {actual}")]
    MacAddressMismatch { expected: String, actual: String },

    /// The device does not speak the RPC protocol.
    #[error("Unsupported device: {reason}")]
    UnsupportedDevice { reason: String },

    // ── Call errors ──────────────────────────────────────────────────
    /// Device-reported application error for one call.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No reply within the call's own timeout.
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` for errors that end the session rather than one call.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidAuth { .. } | Self::MacAddressMismatch { .. } | Self::UnsupportedDevice { .. }
        )
    }

    /// Returns `true` if reconnecting may resolve this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Disconnected | Self::Timeout { .. })
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<shelly_api::Error> for CoreError {
    fn from(err: shelly_api::Error) -> Self {
        match err {
            shelly_api::Error::InvalidAuth { message } => CoreError::InvalidAuth { message },
            shelly_api::Error::Http(ref e) => CoreError::Connect {
                endpoint: e
                    .url()
                    .map_or_else(|| "<unknown>".into(), |u| u.to_string()),
                reason: e.to_string(),
            },
            shelly_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            shelly_api::Error::Connect { host, reason } => CoreError::Connect {
                endpoint: host,
                reason,
            },
            shelly_api::Error::LinkClosed => CoreError::Disconnected,
            shelly_api::Error::WebSocketClosed { code, reason } => CoreError::Connect {
                endpoint: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            shelly_api::Error::MacAddressMismatch { expected, actual } => {
                CoreError::MacAddressMismatch { expected, actual }
            }
            shelly_api::Error::UnsupportedDevice { reason } => {
                CoreError::UnsupportedDevice { reason }
            }
            shelly_api::Error::Deserialization { message, body: _ } => CoreError::Connect {
                endpoint: String::new(),
                reason: format!("unreadable device response: {message}"),
            },
        }
    }
}

// ── Protocol anomalies ───────────────────────────────────────────────

/// A malformed or unexpected inbound frame.
///
/// Never returned to callers: the dispatch path logs it, broadcasts it as
/// a session event, and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("reply for unknown request id {id}")]
    UnknownReplyId { id: u64 },

    #[error("{kind} received while {state}")]
    OutOfState { kind: String, state: String },

    #[error("status delta received before the first snapshot")]
    DeltaBeforeSnapshot,

    #[error("unknown component {key} appeared in a delta")]
    UnknownComponent { key: String },

    #[error("invalid component {key}: {reason}")]
    InvalidComponent { key: String, reason: String },

    #[error("unhandled notification {method}")]
    UnhandledNotification { method: String },

    #[error("binary frame could not be decoded: {reason}")]
    UndecodableBlob { reason: String },

    #[error("peer src changed from {from} to {to}")]
    PeerChanged { from: String, to: String },
}
