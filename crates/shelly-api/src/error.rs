use thiserror::Error;

/// Top-level error type for the `shelly-api` crate.
///
/// Covers every failure mode on the wire side: the HTTP device probe,
/// the WebSocket link, envelope decoding, and digest authentication.
/// `shelly-core` maps these into the caller-facing taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credentials missing, rejected, or the challenge was unreadable.
    #[error("Invalid authentication: {message}")]
    InvalidAuth { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Opening the persistent link failed.
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    /// The link is gone; no further frames can be sent.
    #[error("Link closed")]
    LinkClosed,

    /// WebSocket closed with a close frame.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Device identity ─────────────────────────────────────────────
    /// The probed device reports a different MAC than the one configured.
    #[error("MAC address mismatch: expected {expected}, device reports {actual}")]
    MacAddressMismatch { expected: String, actual: String },

    /// The device does not speak the RPC protocol (e.g. generation 1).
    #[error("Unsupported device: {reason}")]
    UnsupportedDevice { reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates the credentials are at fault
    /// and retrying with the same secret cannot help.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::InvalidAuth { .. })
    }

    /// Returns `true` if this is a transient error worth reconnecting over.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Connect { .. } | Self::LinkClosed | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }
}
