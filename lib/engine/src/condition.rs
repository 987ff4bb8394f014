//! Edge condition evaluation.
//!
//! Conditions are author-supplied predicates over an upstream node's output.
//! A comparison names a dot-path field (`result.status`, `data.items[0].name`),
//! an operator, and an optional literal; `all`/`any` group sub-conditions.
//!
//! A missing field resolves to a sentinel that satisfies only `not_exists`
//! (and fails `exists`); every other operator evaluates to false on it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An edge predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// True when every sub-condition is true. Empty groups are true.
    All {
        /// The grouped sub-conditions.
        all: Vec<Condition>,
    },
    /// True when at least one sub-condition is true.
    Any {
        /// The grouped sub-conditions.
        any: Vec<Condition>,
    },
    /// A single field comparison.
    Compare(Comparison),
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Dot-path into the source node's output.
    pub field: String,
    /// The operator.
    pub op: ConditionOp,
    /// The literal to compare against; unused by unary operators.
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    Exists,
    NotExists,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
    IsTrue,
    IsFalse,
}

impl Condition {
    /// Builds a comparison condition.
    #[must_use]
    pub fn compare(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self::Compare(Comparison {
            field: field.into(),
            op,
            value,
        })
    }
}

/// Evaluates a condition against an upstream node's output.
#[must_use]
pub fn evaluate(condition: &Condition, output: &Value) -> bool {
    match condition {
        Condition::All { all } => all.iter().all(|c| evaluate(c, output)),
        Condition::Any { any } => any.iter().any(|c| evaluate(c, output)),
        Condition::Compare(cmp) => evaluate_comparison(cmp, output),
    }
}

fn evaluate_comparison(cmp: &Comparison, output: &Value) -> bool {
    let field = lookup(output, &cmp.field);

    match cmp.op {
        ConditionOp::Exists => return field.is_some(),
        ConditionOp::NotExists => return field.is_none(),
        _ => {}
    }

    // Missing fields fail every remaining operator.
    let Some(actual) = field else {
        return false;
    };

    match cmp.op {
        ConditionOp::Eq => values_equal(actual, &cmp.value),
        ConditionOp::Neq => !values_equal(actual, &cmp.value),
        ConditionOp::Gt => compare_order(actual, &cmp.value).is_some_and(|o| o.is_gt()),
        ConditionOp::Lt => compare_order(actual, &cmp.value).is_some_and(|o| o.is_lt()),
        ConditionOp::Gte => compare_order(actual, &cmp.value).is_some_and(|o| o.is_ge()),
        ConditionOp::Lte => compare_order(actual, &cmp.value).is_some_and(|o| o.is_le()),
        ConditionOp::Contains => contains(actual, &cmp.value),
        ConditionOp::NotContains => !contains(actual, &cmp.value),
        ConditionOp::StartsWith => both_strings(actual, &cmp.value)
            .is_some_and(|(actual, prefix)| actual.starts_with(prefix)),
        ConditionOp::EndsWith => both_strings(actual, &cmp.value)
            .is_some_and(|(actual, suffix)| actual.ends_with(suffix)),
        ConditionOp::Matches => matches_regex(actual, &cmp.value),
        ConditionOp::In => cmp
            .value
            .as_array()
            .is_some_and(|haystack| haystack.iter().any(|v| values_equal(actual, v))),
        ConditionOp::NotIn => cmp
            .value
            .as_array()
            .is_some_and(|haystack| !haystack.iter().any(|v| values_equal(actual, v))),
        ConditionOp::IsEmpty => is_empty(actual),
        ConditionOp::IsNotEmpty => !is_empty(actual),
        ConditionOp::IsTrue => actual == &Value::Bool(true),
        ConditionOp::IsFalse => actual == &Value::Bool(false),
        // Handled before the sentinel check.
        ConditionOp::Exists | ConditionOp::NotExists => false,
    }
}

/// Walks a dot-path with optional `[index]` suffixes into a value tree.
pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        let (name, indices) = parse_segment(segment)?;
        if !name.is_empty() {
            current = current.as_object()?.get(name)?;
        }
        for index in indices {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// Splits `items[0][1]` into `("items", [0, 1])`.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };

    let (name, rest) = segment.split_at(bracket);
    let mut indices = Vec::new();
    for part in rest.split('[').skip(1) {
        let digits = part.strip_suffix(']')?;
        indices.push(digits.parse().ok()?);
    }
    Some((name, indices))
}

/// Equality that treats all JSON numbers uniformly (1 == 1.0).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn compare_order(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn contains(actual: &Value, value: &Value) -> bool {
    if let (Some(haystack), Some(needle)) = (actual.as_str(), value.as_str()) {
        return haystack.contains(needle);
    }
    if let Some(items) = actual.as_array() {
        return items.iter().any(|item| values_equal(item, value));
    }
    false
}

fn both_strings<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}

fn matches_regex(actual: &Value, pattern: &Value) -> bool {
    let (Some(actual), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return false;
    };
    Regex::new(pattern).is_ok_and(|re| re.is_match(actual))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
