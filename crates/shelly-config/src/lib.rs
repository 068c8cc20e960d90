//! Device profiles for Shelly RPC sessions.
//!
//! TOML profiles, password resolution (env var, keyring, plaintext),
//! and translation to `shelly_core::SessionConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shelly_core::{ConnectionOptions, ReconnectConfig, SessionConfig};

/// Keyring service name; entries are keyed `<profile>/password`.
pub const KEYRING_SERVICE: &str = "shelly";

/// Prefix for environment overrides, e.g. `SHELLY_DEFAULTS__TIMEOUT=5`.
pub const ENV_PREFIX: &str = "SHELLY_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("profile '{profile}' has a username but no password")]
    NoPassword { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named device profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up a profile by name, or the default profile.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

/// Settings every profile inherits unless it overrides them.
#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Upper bound on reconnect backoff, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,

    /// Give up reconnecting after this many attempts. Unset retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            auto_reconnect: true,
            max_backoff: default_max_backoff(),
            max_retries: None,
        }
    }
}

fn default_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_backoff() -> u64 {
    30
}

/// A named device profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Hostname or IP address.
    pub host: String,

    pub port: Option<u16>,

    /// Username for digest auth. Shelly firmware always uses "admin".
    pub username: Option<String>,

    /// Password (plaintext; prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Refuse devices reporting a different MAC.
    pub device_mac: Option<String>,

    /// Override the default timeout.
    pub timeout: Option<u64>,

    /// Override the default reconnect behavior.
    pub auto_reconnect: Option<bool>,

    /// Merge virtual components into the state tree (default true).
    pub virtual_components: Option<bool>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "shelly-rpc", "shelly-rpc").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("shelly-rpc");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from a specific file, then apply `SHELLY_*` overrides.
///
/// Nested keys are separated by a double underscore, since field names
/// themselves contain single ones.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(
        KEYRING_SERVICE,
        &format!("{profile_name}/password"),
    )?)
}

/// Store a profile's password in the system keyring.
pub fn store_password(profile_name: &str, password: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(password)?;
    Ok(())
}

/// Resolve the device password: env var named by the profile, then the
/// system keyring, then plaintext in the config.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    // 1. Profile's password_env → env var lookup
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(pw) = entry.get_password() {
            return Some(SecretString::from(pw));
        }
    }

    // 3. Plaintext in config
    profile.password.clone().map(SecretString::from)
}

/// Build a `SessionConfig` from a profile and the global defaults.
///
/// A profile without a username connects unauthenticated; one with a
/// username must resolve a password.
pub fn profile_to_session_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<SessionConfig, ConfigError> {
    if profile.host.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "host".into(),
            reason: "must not be empty".into(),
        });
    }

    let mut options = ConnectionOptions::new(profile.host.trim());
    if let Some(port) = profile.port {
        options = options.with_port(port);
    }
    if let Some(ref username) = profile.username {
        let password =
            resolve_password(profile, profile_name).ok_or_else(|| ConfigError::NoPassword {
                profile: profile_name.into(),
            })?;
        options = options.with_credentials(username.clone(), password);
    }
    if let Some(ref mac) = profile.device_mac {
        options = options.with_device_mac(mac.clone());
    }

    let mut config = SessionConfig::new(options);
    config.call_timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    config.auto_reconnect = profile.auto_reconnect.unwrap_or(defaults.auto_reconnect);
    config.reconnect = ReconnectConfig {
        max_delay: Duration::from_secs(defaults.max_backoff),
        max_retries: defaults.max_retries,
        ..ReconnectConfig::default()
    };
    config.fetch_dynamic_components = profile.virtual_components.unwrap_or(true);
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"
default_profile = "porch"

[defaults]
timeout = 5
max_retries = 8

[profiles.porch]
host = "192.168.1.50"
username = "admin"
password = "plain-secret"
device_mac = "AA:BB:CC:DD:EE:FF"

[profiles.garage]
host = "garage.local"
port = 8080
auto_reconnect = false
virtual_components = false
"#;

    fn sample() -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        load_config_from(&path).unwrap()
    }

    #[test]
    fn loads_profiles_and_defaults() {
        let config = sample();
        assert_eq!(config.defaults.timeout, 5);
        assert_eq!(config.defaults.max_retries, Some(8));
        assert!(config.defaults.auto_reconnect);
        assert_eq!(config.profiles.len(), 2);

        let (name, porch) = config.profile(None).unwrap();
        assert_eq!(name, "porch");
        assert_eq!(porch.host, "192.168.1.50");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("default"));
        assert_eq!(config.defaults.timeout, 10);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let config = sample();
        assert!(matches!(
            config.profile(Some("attic")),
            Err(ConfigError::UnknownProfile { ref profile }) if profile == "attic"
        ));
    }

    #[test]
    fn plaintext_password_is_the_last_resort() {
        let profile = Profile {
            host: "10.0.0.2".into(),
            password: Some("from-file".into()),
            password_env: Some("SHELLY_CONFIG_TEST_UNSET_VARIABLE".into()),
            ..Profile::default()
        };
        // No env var is set and the test profile name has no keyring entry.
        let password = resolve_password(&profile, "shelly-config-test-no-such-profile").unwrap();
        assert_eq!(password.expose_secret(), "from-file");
    }

    #[test]
    fn profile_maps_to_session_config() {
        let config = sample();
        let (name, garage) = config.profile(Some("garage")).unwrap();
        let session = profile_to_session_config(garage, name, &config.defaults).unwrap();

        assert_eq!(session.options.host, "garage.local");
        assert_eq!(session.options.port, 8080);
        assert!(session.options.username.is_none());
        assert_eq!(session.call_timeout, Duration::from_secs(5));
        assert!(!session.auto_reconnect);
        assert!(!session.fetch_dynamic_components);
        assert_eq!(session.reconnect.max_retries, Some(8));
        assert_eq!(session.reconnect.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn credentials_and_mac_carry_over() {
        let profile = Profile {
            host: " 192.168.1.50 ".into(),
            username: Some("admin".into()),
            password: Some("plain-secret".into()),
            device_mac: Some("AA:BB:CC:DD:EE:FF".into()),
            ..Profile::default()
        };
        let session =
            profile_to_session_config(&profile, "shelly-config-test-creds", &Defaults::default())
                .unwrap();

        assert_eq!(session.options.host, "192.168.1.50");
        assert_eq!(session.options.username.as_deref(), Some("admin"));
        assert!(session.options.password.is_some());
        assert_eq!(session.options.device_mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(session.options.validate().is_ok());
    }

    #[test]
    fn empty_host_is_rejected() {
        let profile = Profile::default();
        assert!(matches!(
            profile_to_session_config(&profile, "x", &Defaults::default()),
            Err(ConfigError::Validation { ref field, .. }) if field == "host"
        ));
    }

    #[test]
    fn save_then_load_keeps_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.profiles.insert(
            "default".into(),
            Profile {
                host: "shellyplus1-abc.local".into(),
                port: Some(80),
                ..Profile::default()
            },
        );
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        let (_, profile) = loaded.profile(None).unwrap();
        assert_eq!(profile.host, "shellyplus1-abc.local");
        assert_eq!(profile.port, Some(80));
    }
}
