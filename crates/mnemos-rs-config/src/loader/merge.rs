//! JSON merge for layered configuration.

use serde_json::Value;

/// Merge `overlay` into `base`, recursing through objects.
///
/// `constraints` is the requirements document at the same depth: a leaf
/// present there is locked and the overlay value is dropped.
pub(super) fn merge_layer(base: &mut Value, overlay: &Value, constraints: Option<&Value>) {
    if !(base.is_object() && overlay.is_object()) {
        if constraints.is_none() {
            *base = overlay.clone();
        }
        return;
    }
    let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) else {
        return;
    };
    let constraint_map = match constraints {
        Some(Value::Object(map)) => Some(map),
        Some(_) => return,
        None => None,
    };

    for (key, value) in overlay_map {
        let constraint = constraint_map.and_then(|map| map.get(key));
        if matches!(constraint, Some(locked) if !locked.is_object()) {
            continue;
        }
        match base_map.get_mut(key) {
            Some(existing) => merge_layer(existing, value, constraint),
            None if constraint.is_some() => {
                let slot = base_map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                merge_layer(slot, value, constraint);
            }
            None => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}
