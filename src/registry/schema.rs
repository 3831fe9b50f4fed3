//! Tool argument validation against declared input schemas.
//!
//! Covers the JSON Schema subset tool definitions actually use:
//! `type` (including type arrays), `required`, `properties`, nested
//! objects, `items`, `enum`, `additionalProperties: false`, numeric
//! `minimum`/`maximum`, and string `minLength`/`maxLength`. Violations
//! are collected (not fail-fast) and surface in the `data` field of the
//! resulting -32602 response.

use serde_json::Value;

/// Validate `instance` against `schema`.
///
/// Returns the list of violations; empty means valid. An empty or
/// non-object schema accepts everything.
pub fn validate(instance: &Value, schema: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    validate_at(instance, schema, "$", &mut violations);
    violations
}

fn validate_at(instance: &Value, schema: &Value, path: &str, violations: &mut Vec<String>) {
    let schema = match schema.as_object() {
        Some(s) => s,
        None => return,
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(instance, expected) {
            violations.push(format!(
                "{}: expected {}, got {}",
                path,
                type_label(expected),
                value_type_name(instance)
            ));
            // Further checks assume the right shape.
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(instance) {
            violations.push(format!("{}: value not in enum", path));
        }
    }

    match instance {
        Value::Object(fields) => {
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for name in required.iter().filter_map(Value::as_str) {
                    if !fields.contains_key(name) {
                        violations.push(format!("{}: missing required property '{}'", path, name));
                    }
                }
            }
            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (name, sub_schema) in properties {
                    if let Some(value) = fields.get(name) {
                        validate_at(value, sub_schema, &format!("{}.{}", path, name), violations);
                    }
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for name in fields.keys() {
                    let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                    if !declared {
                        violations.push(format!("{}: unknown property '{}'", path, name));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    validate_at(
                        item,
                        item_schema,
                        &format!("{}[{}]", path, index),
                        violations,
                    );
                }
            }
        }
        Value::Number(n) => {
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n.as_f64().is_some_and(|v| v < min) {
                    violations.push(format!("{}: below minimum {}", path, min));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n.as_f64().is_some_and(|v| v > max) {
                    violations.push(format!("{}: above maximum {}", path, max));
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min {
                    violations.push(format!("{}: shorter than minLength {}", path, min));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) > max {
                    violations.push(format!("{}: longer than maxLength {}", path, max));
                }
            }
        }
        _ => {}
    }
}

/// Whether `instance` matches a `type` keyword (string or array form).
fn type_matches(instance: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(instance, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(instance, name)),
        _ => true,
    }
}

fn single_type_matches(instance: &Value, name: &str) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        // Accepts 2.0 the way every mainstream validator does: an
        // integer-valued float is an integer.
        "integer" => instance
            .as_f64()
            .is_some_and(|v| v.fract() == 0.0 && v.is_finite()),
        _ => true,
    }
}

fn type_label(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("|"),
        _ => "any".to_string(),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
