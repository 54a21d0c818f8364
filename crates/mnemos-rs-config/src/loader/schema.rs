//! Schema validation for Mnemos JSON5 configuration layers.
//!
//! Every layer is checked before merging so errors point at the file that
//! introduced them. Unknown keys are rejected.

use crate::ConfigError;
use mnemos_rs_protocol::{MemoryCategory, TierKind};
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
pub(super) fn validate_layer_schema(value: &Value, layer: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    ensure_allowed_keys(
        map,
        &["$schema", "store", "backends", "routing", "lifecycle", "health"],
        layer,
        "",
    )?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("store") {
        validate_store(value, layer, "store")?;
    }
    if let Some(value) = map.get("backends") {
        validate_backends(value, layer, "backends")?;
    }
    if let Some(value) = map.get("routing") {
        validate_routing(value, layer, "routing")?;
    }
    if let Some(value) = map.get("lifecycle") {
        validate_lifecycle(value, layer, "lifecycle")?;
    }
    if let Some(value) = map.get("health") {
        let map = expect_object(value, layer, "health")?;
        ensure_allowed_keys(map, &["enabled", "check_interval_secs"], layer, "health")?;
        if let Some(value) = map.get("enabled") {
            expect_bool(value, layer, "health.enabled")?;
        }
        if let Some(value) = map.get("check_interval_secs") {
            expect_u64(value, layer, "health.check_interval_secs")?;
        }
    }

    Ok(())
}

/// Validate the "store" block.
fn validate_store(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let keys = [
        "embedding_dimension",
        "operation_timeout_ms",
        "background_queue_capacity",
    ];
    ensure_allowed_keys(map, &keys, layer, path)?;
    for key in keys {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

/// Validate the "backends" block and its per-tier sections.
fn validate_backends(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["cache", "vector", "durable"], layer, path)?;

    if let Some(value) = map.get("cache") {
        let path = join_path(path, "cache");
        let cache = expect_object(value, layer, &path)?;
        ensure_allowed_keys(cache, &["enabled", "capacity"], layer, &path)?;
        if let Some(value) = cache.get("enabled") {
            expect_bool(value, layer, &join_path(&path, "enabled"))?;
        }
        if let Some(value) = cache.get("capacity") {
            expect_u64(value, layer, &join_path(&path, "capacity"))?;
        }
    }
    if let Some(value) = map.get("vector") {
        let path = join_path(path, "vector");
        let vector = expect_object(value, layer, &path)?;
        ensure_allowed_keys(vector, &["enabled"], layer, &path)?;
        if let Some(value) = vector.get("enabled") {
            expect_bool(value, layer, &join_path(&path, "enabled"))?;
        }
    }
    if let Some(value) = map.get("durable") {
        let path = join_path(path, "durable");
        let durable = expect_object(value, layer, &path)?;
        ensure_allowed_keys(durable, &["path", "busy_timeout_ms"], layer, &path)?;
        if let Some(value) = durable.get("path") {
            expect_string(value, layer, &join_path(&path, "path"))?;
        }
        if let Some(value) = durable.get("busy_timeout_ms") {
            expect_u64(value, layer, &join_path(&path, "busy_timeout_ms"))?;
        }
    }
    Ok(())
}

/// Validate the "routing" table: one route object per category.
fn validate_routing(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let categories: Vec<&str> = MemoryCategory::ALL
        .iter()
        .map(|category| category.as_str())
        .collect();
    ensure_allowed_keys(map, &categories, layer, path)?;

    for (category, route) in map {
        let path = join_path(path, category);
        let route = expect_object(route, layer, &path)?;
        ensure_allowed_keys(route, &["primary", "write", "cache_ttl_secs"], layer, &path)?;
        if let Some(value) = route.get("primary") {
            validate_tier(value, layer, &join_path(&path, "primary"))?;
        }
        if let Some(value) = route.get("write") {
            let write_path = join_path(&path, "write");
            let tiers = expect_array(value, layer, &write_path)?;
            if tiers.is_empty() {
                return Err(invalid_field(layer, &write_path, "expected at least one tier"));
            }
            for (idx, tier) in tiers.iter().enumerate() {
                validate_tier(tier, layer, &format!("{write_path}[{idx}]"))?;
            }
        }
        if let Some(value) = route.get("cache_ttl_secs") {
            if !value.is_null() {
                expect_u64(value, layer, &join_path(&path, "cache_ttl_secs"))?;
            }
        }
    }
    Ok(())
}

/// Validate the "lifecycle" block.
fn validate_lifecycle(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "enabled",
            "sweep_interval_secs",
            "consolidation_threshold",
            "consolidation_target",
            "consolidated_min_importance",
            "eviction_floor",
            "lease_ttl_secs",
        ],
        layer,
        path,
    )?;

    if let Some(value) = map.get("enabled") {
        expect_bool(value, layer, &join_path(path, "enabled"))?;
    }
    for key in [
        "sweep_interval_secs",
        "consolidation_threshold",
        "lease_ttl_secs",
    ] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    for key in ["consolidated_min_importance", "eviction_floor"] {
        if let Some(value) = map.get(key) {
            expect_f64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("consolidation_target") {
        let target_path = join_path(path, "consolidation_target");
        let name = value
            .as_str()
            .ok_or_else(|| invalid_field(layer, &target_path, "expected string"))?;
        if name.parse::<MemoryCategory>().is_err() {
            return Err(invalid_field(
                layer,
                &target_path,
                "expected working, episodic, semantic, or procedural",
            ));
        }
    }
    Ok(())
}

/// Validate a tier name.
fn validate_tier(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let name = value
        .as_str()
        .ok_or_else(|| invalid_field(layer, path, "expected string"))?;
    if name.parse::<TierKind>().is_err() {
        return Err(invalid_field(
            layer,
            path,
            "expected cache, vector, or durable",
        ));
    }
    Ok(())
}

/// Expect a JSON object or return a typed error.
fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| invalid_field(layer, path, "expected object"))
}

/// Expect a JSON array or return a typed error.
fn expect_array<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Vec<Value>, ConfigError> {
    value
        .as_array()
        .ok_or_else(|| invalid_field(layer, path, "expected array"))
}

fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::String(_) => Ok(()),
        _ => Err(invalid_field(layer, path, "expected string")),
    }
}

fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::Bool(_) => Ok(()),
        _ => Err(invalid_field(layer, path, "expected bool")),
    }
}

/// Non-negative integers only.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

fn expect_f64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_number() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected number"))
    }
}

/// Ensure an object contains only allowed keys.
fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid_field(layer, &join_path(path, key), "unknown key")),
        None => Ok(()),
    }
}

/// Join nested paths for error messages.
fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Build a structured invalid-field error.
fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let normalized_path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{normalized_path}"),
        message: message.to_string(),
    }
}
