// ── Device state tree ──

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::component::ComponentKey;
use crate::collab::{ComponentCatalog, ComponentMeta};

/// Fields of one component, arbitrarily nested.
pub type Fields = Map<String, Value>;

/// One sub-tree (config or status), keyed by component.
///
/// Values are shared so publishing a new snapshot only copies the
/// components that actually changed.
pub type ComponentTree = BTreeMap<ComponentKey, Arc<Fields>>;

/// Which sub-tree a change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tree {
    Config,
    Status,
}

/// Immutable view of everything known about the device.
///
/// Published as `Arc<DeviceState>`; readers never observe a half-applied
/// update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    pub config: ComponentTree,
    pub status: ComponentTree,
    /// Device timestamp carried by the last status notification.
    pub ts: Option<f64>,
    /// Wall-clock time of the last applied update.
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) config_loaded: bool,
    #[serde(skip)]
    pub(crate) status_loaded: bool,
}

impl DeviceState {
    pub fn tree(&self, tree: Tree) -> &ComponentTree {
        match tree {
            Tree::Config => &self.config,
            Tree::Status => &self.status,
        }
    }

    pub(crate) fn tree_mut(&mut self, tree: Tree) -> &mut ComponentTree {
        match tree {
            Tree::Config => &mut self.config,
            Tree::Status => &mut self.status,
        }
    }

    /// `true` once a full config snapshot has been applied.
    pub fn has_config(&self) -> bool {
        self.config_loaded
    }

    /// `true` once a full status snapshot has been applied.
    pub fn has_status(&self) -> bool {
        self.status_loaded
    }

    pub fn config_of(&self, key: &ComponentKey) -> Option<&Arc<Fields>> {
        self.config.get(key)
    }

    pub fn status_of(&self, key: &ComponentKey) -> Option<&Arc<Fields>> {
        self.status.get(key)
    }

    /// Config and status for a key given as text, e.g. `"switch:0"`.
    pub fn component(&self, key: &str) -> Option<ComponentView<'_>> {
        let key: ComponentKey = key.parse().ok()?;
        let config = self.config.get(&key);
        let status = self.status.get(&key);
        if config.is_none() && status.is_none() {
            return None;
        }
        Some(ComponentView {
            key,
            config,
            status,
        })
    }

    /// One status field, e.g. `status_field("switch:0", "output")`.
    pub fn status_field(&self, key: &str, field: &str) -> Option<&Value> {
        let key: ComponentKey = key.parse().ok()?;
        self.status.get(&key)?.get(field)
    }

    /// Every component key present in either tree.
    pub fn keys(&self) -> impl Iterator<Item = &ComponentKey> {
        let mut keys: Vec<&ComponentKey> = self.config.keys().chain(self.status.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
    }

    /// Unit and range metadata from an external catalog, for components
    /// this device actually has.
    pub fn describe(
        &self,
        key: &ComponentKey,
        catalog: &dyn ComponentCatalog,
    ) -> Option<ComponentMeta> {
        if !self.config.contains_key(key) && !self.status.contains_key(key) {
            return None;
        }
        catalog.describe(key)
    }

    /// Both trees as plain JSON, keys rendered as strings.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Borrowed config + status of a single component.
#[derive(Debug, Clone)]
pub struct ComponentView<'a> {
    pub key: ComponentKey,
    pub config: Option<&'a Arc<Fields>>,
    pub status: Option<&'a Arc<Fields>>,
}

/// One component changed by one applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub tree: Tree,
    pub key: ComponentKey,
    /// Top-level fields whose value differs from before.
    pub changed_fields: Vec<String>,
}
