//! Deterministic cache keys.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Copy of `value` with every object's keys in sorted order.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_object(map)),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// [`normalize`] for a request object.
pub fn normalize_object(args: &Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<_> = args.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(k, v)| (k.clone(), normalize(v)))
        .collect()
}

/// Hex SHA-256 of `{"callable": .., "args": ..}` with normalized arguments.
pub fn cache_key(callable: &str, args: &Map<String, Value>) -> String {
    let canonical = json!({
        "callable": callable,
        "args": normalize_object(args),
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a: Value =
            serde_json::from_str(r#"{"year": 2024, "area": {"north": 90, "south": -90}, "variable": ["2t"]}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"variable": ["2t"], "area": {"south": -90, "north": 90}, "year": 2024}"#)
                .unwrap();
        assert_eq!(
            cache_key("echo", &object(a)),
            cache_key("echo", &object(b))
        );
    }

    #[test]
    fn test_callable_and_values_matter() {
        let args = object(json!({"variable": ["2t", "msl"]}));
        let reordered = object(json!({"variable": ["msl", "2t"]}));
        assert_ne!(cache_key("echo", &args), cache_key("file-copy", &args));
        assert_ne!(cache_key("echo", &args), cache_key("echo", &reordered));

        let key = cache_key("echo", &args);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
