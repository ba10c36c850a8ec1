//! JSON-schema validation and output sanitation for the tool surface.
//!
//! Only base constructs are supported (type, properties, required, enum,
//! items, additionalProperties:false); union combinators are avoided for
//! client interop. Validation failures carry the offending field path and
//! the expected kind.

use crate::error::{Error, Result};
use serde_json::Value;

/// Validate a value against a schema, reporting the first failure with its
/// field path.
pub fn validate(schema: &Value, value: &Value) -> Result<()> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<()> {
    let schema = match schema.as_object() {
        Some(object) => object,
        None => return Ok(()),
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(Error::invalid_input(path, expected));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let expected = allowed
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("|");
            return Err(Error::invalid_input(path, expected));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(Error::invalid_input(
                        format!("{}.{}", path, name),
                        "a required field",
                    ));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, field) in object {
                match properties.get(name) {
                    Some(field_schema) => {
                        validate_at(field_schema, field, &format!("{}.{}", path, name))?
                    }
                    None => {
                        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                            return Err(Error::invalid_input(
                                format!("{}.{}", path, name),
                                "no such field",
                            ));
                        }
                    }
                }
            }
        }
    }

    if let Some(array) = value.as_array() {
        if let Some(items) = schema.get("items") {
            for (i, item) in array.iter().enumerate() {
                validate_at(items, item, &format!("{}[{}]", path, i))?;
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Filter a response down to the fields its output schema declares,
/// recursively. Undeclared fields are stripped, preventing internal graph
/// representation from leaking.
pub fn sanitize(schema: &Value, value: Value) -> Value {
    let schema_object = match schema.as_object() {
        Some(object) => object,
        None => return value,
    };

    match value {
        Value::Object(map) => {
            let properties = match schema_object.get("properties").and_then(Value::as_object) {
                Some(properties) => properties,
                // No property list declared: pass through as-is.
                None => return Value::Object(map),
            };
            let filtered = map
                .into_iter()
                .filter_map(|(key, field)| {
                    properties
                        .get(&key)
                        .map(|field_schema| (key, sanitize(field_schema, field)))
                })
                .collect();
            Value::Object(filtered)
        }
        Value::Array(items) => match schema_object.get("items") {
            Some(item_schema) => Value::Array(
                items
                    .into_iter()
                    .map(|item| sanitize(item_schema, item))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_type_validation() {
        let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        assert!(validate(&schema, &json!({"n": 3})).is_ok());

        let err = validate(&schema, &json!({"n": "three"})).unwrap_err();
        match err {
            Error::InvalidInput { path, expected } => {
                assert_eq!(path, "$.n");
                assert_eq!(expected, "integer");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_required_fields() {
        let schema = json!({
            "type": "object",
            "properties": {"task_id": {"type": "string"}},
            "required": ["task_id"]
        });
        assert!(validate(&schema, &json!({"task_id": "t"})).is_ok());
        let err = validate(&schema, &json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { path, .. } if path == "$.task_id"));
    }

    #[test]
    fn test_additional_properties_false() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        });
        assert!(validate(&schema, &json!({"a": "x"})).is_ok());
        assert!(validate(&schema, &json!({"a": "x", "b": 1})).is_err());
    }

    #[test]
    fn test_enum_and_items() {
        let schema = json!({
            "type": "array",
            "items": {"type": "string", "enum": ["query", "url", "doi"]}
        });
        assert!(validate(&schema, &json!(["query", "doi"])).is_ok());
        let err = validate(&schema, &json!(["query", "isbn"])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { path, .. } if path == "$[1]"));
    }

    #[test]
    fn test_nested_object_paths() {
        let schema = json!({
            "type": "object",
            "properties": {
                "options": {
                    "type": "object",
                    "properties": {"resume": {"type": "boolean"}}
                }
            }
        });
        let err = validate(&schema, &json!({"options": {"resume": "yes"}})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { path, .. } if path == "$.options.resume"));
    }

    #[test]
    fn test_sanitize_strips_undeclared() {
        let schema = json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "string"},
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"url": {"type": "string"}}
                    }
                }
            }
        });
        let sanitized = sanitize(
            &schema,
            json!({
                "task_id": "t",
                "internal_pointer": "leak",
                "items": [{"url": "https://a", "raw_edge_struct": {"x": 1}}]
            }),
        );
        assert_eq!(
            sanitized,
            json!({"task_id": "t", "items": [{"url": "https://a"}]})
        );
    }

    #[test]
    fn test_sanitize_passthrough_without_properties() {
        let schema = json!({"type": "object"});
        let value = json!({"anything": 1});
        assert_eq!(sanitize(&schema, value.clone()), value);
    }
}
