//! Template reference resolution.
//!
//! Node parameters may reference upstream outputs as `{{node.field.path}}`.
//! Resolution walks the parameter tree to its string leaves:
//!
//! - a string that is exactly one reference is replaced by the referenced
//!   value, preserving its type;
//! - a string with embedded references gets each interpolated as text;
//! - missing references resolve to the empty string. That is contract, not
//!   accident: authors rely on it for optional upstream fields.

use crate::condition;
use crate::model::NodeId;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Pattern for `{{node.field.path}}` references.
// Allow expect here as the regex is compile-time verified to be valid
#[allow(clippy::expect_used)]
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("constant regex pattern is valid")
});

/// Resolves every template reference in a parameter map.
#[must_use]
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    outputs: &HashMap<NodeId, Value>,
) -> Map<String, Value> {
    parameters
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, outputs)))
        .collect()
}

/// Resolves template references in one value tree.
#[must_use]
pub fn resolve_value(value: &Value, outputs: &HashMap<NodeId, Value>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, outputs))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_value(item, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, outputs: &HashMap<NodeId, Value>) -> Value {
    // A whole-string reference substitutes the referenced value itself,
    // keeping numbers as numbers and objects as objects.
    if let Some(caps) = REFERENCE_PATTERN.captures(s)
        && caps
            .get(0)
            .is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        let path = &caps[1];
        return reference(path, outputs)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
    }

    let interpolated = REFERENCE_PATTERN.replace_all(s, |caps: &regex::Captures| {
        reference(&caps[1], outputs).map_or_else(String::new, value_to_string)
    });
    Value::String(interpolated.into_owned())
}

/// Looks up `node.field.path` against the collected outputs.
fn reference<'a>(path: &str, outputs: &'a HashMap<NodeId, Value>) -> Option<&'a Value> {
    match path.split_once('.') {
        Some((node, rest)) => condition::lookup(outputs.get(node)?, rest),
        None => outputs.get(path),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
