// ── Runtime session configuration ──
//
// These types describe *how* to reach one device. They carry credential
// data and connection tuning, but never touch disk. A host application
// (or shelly-config) builds a `SessionConfig` and hands it in.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::CoreError;

/// Default HTTP / WebSocket port of RPC devices.
pub const DEFAULT_PORT: u16 = 80;

/// Default per-call timeout, also used for the probe and link open.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the device is and how to authenticate with it.
///
/// Immutable once a session starts.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Expected MAC; the session refuses a device reporting another one.
    pub device_mac: Option<String>,
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            device_mac: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    pub fn with_device_mac(mut self, mac: impl Into<String>) -> Self {
        self.device_mac = Some(mac.into());
        self
    }

    /// Username and password together, or neither.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.host.trim().is_empty() {
            return Err(CoreError::Config {
                message: "host must not be empty".into(),
            });
        }
        match (&self.username, &self.password) {
            (Some(_), None) => Err(CoreError::Config {
                message: "username supplied without a password".into(),
            }),
            (None, Some(_)) => Err(CoreError::Config {
                message: "password supplied without a username".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay, jitter included. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Everything a [`Session`](crate::Session) needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub options: ConnectionOptions,
    /// Default timeout for each RPC call.
    pub call_timeout: Duration,
    /// Reconnect automatically after the link drops while `Ready`.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
    /// Our `src` identity on every request.
    pub client_id: String,
    /// Merge virtual components into the tree after each snapshot.
    pub fetch_dynamic_components: bool,
}

impl SessionConfig {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
            client_id: format!("shelly-{}", uuid::Uuid::new_v4().simple()),
            fetch_dynamic_components: true,
        }
    }
}
