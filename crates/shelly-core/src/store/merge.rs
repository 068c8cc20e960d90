// ── Deep merge of partial component state ──

use serde_json::{Map, Value};

/// Merge `patch` into `target`, returning the top-level fields whose value
/// actually changed.
///
/// Objects merge key by key, recursively. Anything else (arrays, scalars,
/// `null`) replaces the old value wholesale, so accumulator arrays such as
/// per-minute energy counters are never spliced. Merging the same patch
/// twice leaves `target` as merging it once did.
pub fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) -> Vec<String> {
    let mut changed = Vec::new();
    for (field, incoming) in patch {
        if merge_value(target, field, incoming) {
            changed.push(field.clone());
        }
    }
    changed
}

fn merge_value(target: &mut Map<String, Value>, field: &str, incoming: &Value) -> bool {
    match (target.get_mut(field), incoming) {
        (Some(Value::Object(existing)), Value::Object(nested)) => {
            !deep_merge(existing, nested).is_empty()
        }
        (Some(existing), _) if existing == incoming => false,
        _ => {
            target.insert(field.to_owned(), incoming.clone());
            true
        }
    }
}
