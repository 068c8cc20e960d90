// ── Component keys ──
//
// Every entry of the config and status trees is keyed by a component key
// such as `"switch:0"` or `"sys"`. Keys are parsed once at the boundary so
// the rest of the crate never splits strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use strum::EnumString;

/// The type half of a component key.
///
/// Unrecognized names parse to [`ComponentKind::Other`]; new firmware
/// regularly introduces component types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ComponentKind {
    Sys,
    Wifi,
    Eth,
    Ble,
    Cloud,
    Mqtt,
    Ws,
    Script,
    Input,
    Switch,
    Cover,
    Light,
    Rgb,
    Rgbw,
    Pm1,
    Em,
    Em1,
    EmData,
    Em1Data,
    Temperature,
    Humidity,
    Illuminance,
    Voltmeter,
    DevicePower,
    Smoke,
    // Virtual components
    Boolean,
    Button,
    Enum,
    Number,
    Text,
    Group,
    #[strum(default)]
    Other(String),
}

impl ComponentKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sys => "sys",
            Self::Wifi => "wifi",
            Self::Eth => "eth",
            Self::Ble => "ble",
            Self::Cloud => "cloud",
            Self::Mqtt => "mqtt",
            Self::Ws => "ws",
            Self::Script => "script",
            Self::Input => "input",
            Self::Switch => "switch",
            Self::Cover => "cover",
            Self::Light => "light",
            Self::Rgb => "rgb",
            Self::Rgbw => "rgbw",
            Self::Pm1 => "pm1",
            Self::Em => "em",
            Self::Em1 => "em1",
            Self::EmData => "emdata",
            Self::Em1Data => "em1data",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Illuminance => "illuminance",
            Self::Voltmeter => "voltmeter",
            Self::DevicePower => "devicepower",
            Self::Smoke => "smoke",
            Self::Boolean => "boolean",
            Self::Button => "button",
            Self::Enum => "enum",
            Self::Number => "number",
            Self::Text => "text",
            Self::Group => "group",
            Self::Other(name) => name,
        }
    }

    /// User-defined virtual components, fetched separately from the
    /// regular config and status.
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            Self::Boolean | Self::Button | Self::Enum | Self::Number | Self::Text | Self::Group
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated component key: `kind` or `kind:index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub kind: ComponentKind,
    pub index: Option<u32>,
}

/// Why a component key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid component key {key:?}: {reason}")]
pub struct InvalidComponentKey {
    pub key: String,
    pub reason: &'static str,
}

impl ComponentKey {
    pub fn new(kind: ComponentKind, index: Option<u32>) -> Self {
        Self { kind, index }
    }

    /// `kind:index` shorthand.
    pub fn indexed(kind: ComponentKind, index: u32) -> Self {
        Self::new(kind, Some(index))
    }
}

impl FromStr for ComponentKey {
    type Err = InvalidComponentKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidComponentKey {
            key: s.to_owned(),
            reason,
        };

        let (name, index) = match s.split_once(':') {
            Some((name, idx)) => {
                let idx = idx
                    .parse::<u32>()
                    .map_err(|_| invalid("index is not an unsigned integer"))?;
                (name, Some(idx))
            }
            None => (s, None),
        };

        if name.is_empty() {
            return Err(invalid("empty component type"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid("component type must be lowercase alphanumeric"));
        }

        // `EnumString` with a default variant never fails.
        let kind = ComponentKind::from_str(name).unwrap_or_else(|_| ComponentKind::Other(name.to_owned()));
        Ok(Self { kind, index })
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(idx) => write!(f, "{}:{idx}", self.kind),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl Ord for ComponentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for ComponentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ComponentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_indexed_and_singleton_keys() {
        let key: ComponentKey = "switch:0".parse().unwrap();
        assert_eq!(key, ComponentKey::indexed(ComponentKind::Switch, 0));

        let key: ComponentKey = "sys".parse().unwrap();
        assert_eq!(key.kind, ComponentKind::Sys);
        assert_eq!(key.index, None);
    }

    #[test]
    fn unknown_kinds_are_kept() {
        let key: ComponentKey = "bthomesensor:200".parse().unwrap();
        assert_eq!(key.kind, ComponentKind::Other("bthomesensor".into()));
        assert_eq!(key.to_string(), "bthomesensor:200");
    }

    #[test]
    fn display_round_trips_known_kinds() {
        for raw in ["em1data:0", "devicepower:0", "boolean:200", "wifi", "enum:201"] {
            let key: ComponentKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
            assert!(!matches!(key.kind, ComponentKind::Other(_)), "{raw}");
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        for raw in ["", ":0", "switch:", "switch:-1", "switch:a", "Switch:0", "sw itch"] {
            assert!(raw.parse::<ComponentKey>().is_err(), "{raw:?} should not parse");
        }
    }

    #[test]
    fn virtual_kinds() {
        assert!(ComponentKind::Boolean.is_virtual());
        assert!(ComponentKind::Group.is_virtual());
        assert!(!ComponentKind::Switch.is_virtual());
    }

    #[test]
    fn orders_by_kind_then_index() {
        let mut keys: Vec<ComponentKey> = ["switch:1", "input:0", "switch:0", "sys"]
            .iter()
            .map(|k| k.parse().unwrap())
            .collect();
        keys.sort();
        let printed: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(printed, ["input:0", "switch:0", "switch:1", "sys"]);
    }
}
