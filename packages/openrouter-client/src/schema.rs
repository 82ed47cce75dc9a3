//! Type-safe schema generation for structured outputs.
//!
//! Uses the `schemars` crate to automatically generate JSON schemas from Rust
//! types, in the shape OpenRouter's strict structured-output mode expects.

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

/// Trait for types that can be used as structured LLM output.
///
/// Automatically implemented for any type that implements
/// `JsonSchema + DeserializeOwned`.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    /// Generate a strict-mode-compatible JSON schema for this type.
    ///
    /// Strict mode requires `additionalProperties: false` on every object,
    /// which this method ensures is set.
    fn output_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();
        ensure_no_additional_properties(&mut value);
        value
    }

    /// Get the schema name for this type.
    fn type_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

// Blanket implementation for all types that satisfy the bounds
impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Recursively set `additionalProperties: false` on all object schemas.
fn ensure_no_additional_properties(value: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = value {
        if map.get("type") == Some(&serde_json::Value::String("object".to_string())) {
            map.insert(
                "additionalProperties".to_string(),
                serde_json::Value::Bool(false),
            );
        }

        for (_, v) in map.iter_mut() {
            ensure_no_additional_properties(v);
        }
    } else if let serde_json::Value::Array(arr) = value {
        for item in arr.iter_mut() {
            ensure_no_additional_properties(item);
        }
    }
}
