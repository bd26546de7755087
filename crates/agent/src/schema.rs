//! JSON-schema validation for structured answers.
//!
//! Schemas are compiled with `jsonschema` on each call; the first error is
//! reported with a JSON-path-like location (`$.items[1].name`).

use serde_json::Value;
use std::fmt;

/// The first violation found, with a JSON-path-like location.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: {}", self.path, self.message)
    }
}

impl std::error::Error for SchemaViolation {}

/// Validate `value` against `schema`.
///
/// A schema that does not compile is itself reported as a violation at `$`.
pub fn validate(value: &Value, schema: &Value) -> Result<(), SchemaViolation> {
    let validator = jsonschema::validator_for(schema).map_err(|e| SchemaViolation {
        path: "$".into(),
        message: format!("invalid schema: {e}"),
    })?;

    match validator.iter_errors(value).next() {
        None => Ok(()),
        Some(error) => Err(SchemaViolation {
            path: json_path(&error.instance_path.to_string()),
            message: error.to_string(),
        }),
    }
}

/// Turn a JSON pointer (`/items/1/name`) into `$.items[1].name`.
fn json_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{segment}]"));
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}
