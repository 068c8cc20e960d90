// ── Snapshot & delta application ──
//
// Turns inbound JSON (RPC results and notification params) into new
// published states. Problems with individual components are recorded as
// anomalies and the component is skipped; the rest of the update still
// applies.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::DeviceStore;
use super::merge::deep_merge;
use crate::error::ProtocolAnomaly;
use crate::model::{ComponentKey, ComponentTree, DeviceState, Fields, StateChange, Tree};

/// Top-level field of status notifications carrying the device clock.
const TS_FIELD: &str = "ts";

/// Anomalies recorded while an update was still applied.
pub type Recorded = Vec<ProtocolAnomaly>;

impl DeviceStore {
    /// Replace the whole config or status tree with a full snapshot.
    pub fn apply_snapshot(&self, tree: Tree, payload: &Value) -> Result<Recorded, ProtocolAnomaly> {
        let components = as_object(payload, "snapshot")?;
        let mut recorded = Vec::new();
        let mut next = self.working_copy();

        let mut fresh = ComponentTree::new();
        let mut changes = Vec::with_capacity(components.len());
        for (raw_key, value) in components {
            if tree == Tree::Status && raw_key == TS_FIELD {
                record_ts(&mut next, value);
                continue;
            }
            let Some((key, fields)) = validate(raw_key, value, &mut recorded) else {
                continue;
            };
            changes.push(StateChange {
                tree,
                key: key.clone(),
                changed_fields: fields.keys().cloned().collect(),
            });
            fresh.insert(key, Arc::new(fields.clone()));
        }

        *next.tree_mut(tree) = fresh;
        match tree {
            Tree::Config => next.config_loaded = true,
            Tree::Status => next.status_loaded = true,
        }

        debug!(?tree, components = changes.len(), "snapshot applied");
        self.publish(next, &changes);
        Ok(recorded)
    }

    /// Merge a partial status update into the current tree.
    ///
    /// Rejected as a whole before the first status snapshot. Components not
    /// seen before are merged in and recorded.
    pub fn apply_delta(&self, params: &Value) -> Result<Recorded, ProtocolAnomaly> {
        let components = as_object(params, "status delta")?;
        let mut next = self.working_copy();
        if !next.status_loaded {
            return Err(ProtocolAnomaly::DeltaBeforeSnapshot);
        }

        let mut recorded = Vec::new();
        let mut changes = Vec::with_capacity(components.len());
        for (raw_key, value) in components {
            if raw_key == TS_FIELD {
                record_ts(&mut next, value);
                continue;
            }
            let Some((key, patch)) = validate(raw_key, value, &mut recorded) else {
                continue;
            };

            let changed_fields = if let Some(existing) = next.status.get_mut(&key) {
                deep_merge(Arc::make_mut(existing), patch)
            } else {
                warn!(key = %key, "component appeared in a status delta");
                recorded.push(ProtocolAnomaly::UnknownComponent {
                    key: key.to_string(),
                });
                next.status.insert(key.clone(), Arc::new(patch.clone()));
                patch.keys().cloned().collect()
            };

            changes.push(StateChange {
                tree: Tree::Status,
                key,
                changed_fields,
            });
        }

        self.publish(next, &changes);
        Ok(recorded)
    }

    /// Merge user-defined virtual components from a `Shelly.GetComponents`
    /// result into both trees.
    ///
    /// Each kept item contributes its `config` object to the config tree and
    /// `{"value": status.value}` to the status tree. Non-virtual components
    /// some devices also list are ignored.
    pub fn apply_dynamic_components(&self, result: &Value) -> Result<Recorded, ProtocolAnomaly> {
        let items: &[Value] = match result.get("components") {
            Some(Value::Array(items)) => items.as_slice(),
            None | Some(Value::Null) => &[],
            Some(_) => {
                return Err(ProtocolAnomaly::Malformed {
                    reason: "components is not an array".into(),
                });
            }
        };

        let mut recorded = Vec::new();
        let mut next = self.working_copy();
        let mut changes = Vec::new();

        for item in items {
            let Some(raw_key) = item.get("key").and_then(Value::as_str) else {
                recorded.push(ProtocolAnomaly::Malformed {
                    reason: "dynamic component without a key".into(),
                });
                continue;
            };
            let key: ComponentKey = match raw_key.parse() {
                Ok(key) => key,
                Err(e) => {
                    recorded.push(ProtocolAnomaly::InvalidComponent {
                        key: raw_key.to_owned(),
                        reason: e.reason.to_owned(),
                    });
                    continue;
                }
            };
            if !key.kind.is_virtual() {
                debug!(key = %key, "skipping non-virtual dynamic component");
                continue;
            }

            let config = match item.get("config") {
                Some(Value::Object(config)) => config.clone(),
                _ => Map::new(),
            };
            let value = item
                .get("status")
                .and_then(|s| s.get("value"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut status = Map::new();
            status.insert("value".to_owned(), value);

            changes.push(StateChange {
                tree: Tree::Config,
                key: key.clone(),
                changed_fields: config.keys().cloned().collect(),
            });
            changes.push(StateChange {
                tree: Tree::Status,
                key: key.clone(),
                changed_fields: vec!["value".to_owned()],
            });
            next.config.insert(key.clone(), Arc::new(config));
            next.status.insert(key, Arc::new(status));
        }

        debug!(components = changes.len() / 2, "dynamic components applied");
        self.publish(next, &changes);
        Ok(recorded)
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ProtocolAnomaly> {
    value.as_object().ok_or_else(|| ProtocolAnomaly::Malformed {
        reason: format!("{what} is not an object"),
    })
}

fn record_ts(state: &mut DeviceState, value: &Value) {
    if let Some(ts) = value.as_f64() {
        state.ts = Some(ts);
    }
}

/// Parse a component key and check its payload is an object.
fn validate<'a>(
    raw_key: &str,
    value: &'a Value,
    recorded: &mut Recorded,
) -> Option<(ComponentKey, &'a Fields)> {
    let key: ComponentKey = match raw_key.parse() {
        Ok(key) => key,
        Err(e) => {
            warn!(key = raw_key, reason = e.reason, "skipping invalid component key");
            recorded.push(ProtocolAnomaly::InvalidComponent {
                key: raw_key.to_owned(),
                reason: e.reason.to_owned(),
            });
            return None;
        }
    };
    let Value::Object(fields) = value else {
        warn!(key = raw_key, "skipping component whose payload is not an object");
        recorded.push(ProtocolAnomaly::InvalidComponent {
            key: raw_key.to_owned(),
            reason: "payload is not an object".into(),
        });
        return None;
    };
    Some((key, fields))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn loaded(status: Value) -> DeviceStore {
        let store = DeviceStore::new();
        store.apply_snapshot(Tree::Status, &status).unwrap();
        store
    }

    fn key(raw: &str) -> ComponentKey {
        raw.parse().unwrap()
    }

    #[test]
    fn delta_merges_into_component() {
        let store = loaded(json!({"switch:0": {"output": false, "apower": 0}}));
        let recorded = store
            .apply_delta(&json!({"ts": 1.5, "switch:0": {"output": true}}))
            .unwrap();

        assert!(recorded.is_empty());
        let state = store.snapshot();
        assert_eq!(
            Value::Object((**state.status_of(&key("switch:0")).unwrap()).clone()),
            json!({"output": true, "apower": 0})
        );
        assert_eq!(state.ts, Some(1.5));
    }

    #[test]
    fn delta_before_snapshot_is_rejected() {
        let store = DeviceStore::new();
        let err = store
            .apply_delta(&json!({"switch:0": {"output": true}}))
            .unwrap_err();
        assert_eq!(err, ProtocolAnomaly::DeltaBeforeSnapshot);
        assert!(store.snapshot().status.is_empty());
    }

    #[test]
    fn delta_is_idempotent() {
        let store = loaded(json!({"switch:0": {"output": false, "temperature": {"tC": 30.0}}}));
        let delta = json!({"switch:0": {"output": true, "temperature": {"tC": 31.0}}});

        store.apply_delta(&delta).unwrap();
        let once = store.snapshot().to_json();
        store.apply_delta(&delta).unwrap();
        assert_eq!(store.snapshot().to_json(), once);
    }

    #[test]
    fn earlier_snapshots_are_untouched_by_later_deltas() {
        let store = loaded(json!({"switch:0": {"output": false}}));
        let before = store.snapshot();
        store.apply_delta(&json!({"switch:0": {"output": true}})).unwrap();

        assert_eq!(before.status_field("switch:0", "output"), Some(&json!(false)));
        assert_eq!(
            store.snapshot().status_field("switch:0", "output"),
            Some(&json!(true))
        );
    }

    #[test]
    fn unknown_component_is_merged_and_recorded() {
        let store = loaded(json!({"switch:0": {"output": false}}));
        let recorded = store
            .apply_delta(&json!({"input:3": {"state": true}}))
            .unwrap();

        assert_eq!(
            recorded,
            vec![ProtocolAnomaly::UnknownComponent {
                key: "input:3".into()
            }]
        );
        assert_eq!(
            store.snapshot().status_field("input:3", "state"),
            Some(&json!(true))
        );
    }

    #[test]
    fn invalid_components_are_skipped() {
        let store = loaded(json!({"switch:0": {"output": false}, "sys": {"uptime": 1}}));
        let recorded = store
            .apply_delta(&json!({"Bad Key": {"x": 1}, "switch:0": 5, "sys": {"uptime": 9}}))
            .unwrap();

        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|a| matches!(a, ProtocolAnomaly::InvalidComponent { .. })));
        let state = store.snapshot();
        assert_eq!(state.status_field("switch:0", "output"), Some(&json!(false)));
        assert_eq!(state.status_field("sys", "uptime"), Some(&json!(9)));
    }

    #[test]
    fn full_status_replaces_tree() {
        let store = loaded(json!({"switch:0": {"output": false}, "input:0": {"state": false}}));
        store
            .apply_snapshot(Tree::Status, &json!({"ts": 9.0, "switch:0": {"output": true}}))
            .unwrap();

        let state = store.snapshot();
        assert_eq!(state.status.len(), 1);
        assert_eq!(state.ts, Some(9.0));
        assert!(state.status_of(&key("input:0")).is_none());
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let store = DeviceStore::new();
        assert!(matches!(
            store.apply_snapshot(Tree::Config, &json!([1, 2])),
            Err(ProtocolAnomaly::Malformed { .. })
        ));
        assert!(!store.snapshot().has_config());
    }

    #[tokio::test]
    async fn subscribers_get_one_event_per_component_in_order() {
        let store = loaded(json!({"switch:0": {"output": false}, "switch:1": {"output": false}}));
        let mut changes = store.subscribe();

        store
            .apply_delta(&json!({"switch:0": {"output": true}, "switch:1": {"output": false}}))
            .unwrap();
        store.apply_delta(&json!({"switch:1": {"output": true}})).unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.key, key("switch:0"));
        assert_eq!(first.changed_fields, ["output"]);

        let second = changes.recv().await.unwrap();
        assert_eq!(second.key, key("switch:1"));
        assert!(second.changed_fields.is_empty());

        let third = changes.recv().await.unwrap();
        assert_eq!(third.key, key("switch:1"));
        assert_eq!(third.changed_fields, ["output"]);
        assert!(changes.try_recv().is_none());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let store = loaded(json!({"switch:0": {"output": false}}));
        let keep = store.subscribe();
        drop(store.subscribe());
        assert_eq!(store.subscriber_count(), 2);

        store.apply_delta(&json!({"switch:0": {"output": true}})).unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn dynamic_components_extend_both_trees() {
        let store = loaded(json!({"switch:0": {"output": false}}));
        store
            .apply_snapshot(Tree::Config, &json!({"switch:0": {"name": null}}))
            .unwrap();

        let result = json!({
            "components": [
                {"key": "boolean:200", "status": {"value": true}, "config": {"id": 200, "name": "Away"}},
                {"key": "number:201", "status": {"value": 21.5}, "config": {"id": 201, "min": 0, "max": 40}},
                {"key": "script:1", "status": {"running": true}, "config": {"id": 1}}
            ],
            "offset": 0,
            "total": 3
        });
        let recorded = store.apply_dynamic_components(&result).unwrap();
        assert!(recorded.is_empty());

        let state = store.snapshot();
        assert_eq!(state.status_field("boolean:200", "value"), Some(&json!(true)));
        assert_eq!(state.status_field("number:201", "value"), Some(&json!(21.5)));
        assert_eq!(state.config_of(&key("boolean:200")).unwrap()["name"], "Away");
        assert!(state.component("script:1").is_none());
        assert_eq!(state.status_field("switch:0", "output"), Some(&json!(false)));
    }

    #[test]
    fn empty_dynamic_component_list_is_fine() {
        let store = DeviceStore::new();
        assert!(store.apply_dynamic_components(&json!({})).unwrap().is_empty());
    }
}
