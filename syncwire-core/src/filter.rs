//! Predicate evaluation against JSON records.
//!
//! Shared by subscription matching and the in-memory store so that a record
//! returned by a filtered read is exactly one a subscription with the same
//! filters would be notified about.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use syncwire_protocol::{FilterOperator, FilterOption};

/// Returns true if every filter holds for `record`.
///
/// An empty filter set matches everything. A filter on a column the record
/// does not carry is a non-match.
pub fn matches_all(filters: &[FilterOption], record: &Value) -> bool {
    let Some(fields) = record.as_object() else {
        return filters.is_empty();
    };
    filters.iter().all(|f| matches_filter(f, fields))
}

/// Evaluates a single filter against a record's fields.
pub fn matches_filter(filter: &FilterOption, fields: &Map<String, Value>) -> bool {
    let Some(actual) = fields.get(&filter.column) else {
        return false;
    };
    let expected = &filter.value;

    match filter.operator {
        FilterOperator::Eq => values_equal(actual, expected),
        FilterOperator::Neq => !values_equal(actual, expected),
        FilterOperator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::Lt => compare(actual, expected) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::Like => contains(actual, expected, false),
        FilterOperator::Ilike => contains(actual, expected, true),
        FilterOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| values_equal(actual, item)),
            single => values_equal(actual, single),
        },
    }
}

/// Equality after normalizing numbers and their string forms.
///
/// `5`, `5.0` and `"5"` are equal; `true` equals `"true"`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            a == b
        }
        _ => match numeric_cmp(a, b) {
            Some(ordering) => ordering == Ordering::Equal,
            None => scalar_text(a) == scalar_text(b),
        },
    }
}

/// Ordered comparison, numeric when both sides parse as numbers.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match numeric_cmp(a, b) {
        Some(ordering) => Some(ordering),
        None => Some(scalar_text(a)?.cmp(&scalar_text(b)?)),
    }
}

/// Compares two values as numbers. Integers on both sides are compared
/// exactly; `f64` is only used when either side is fractional.
fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_integer(a), as_integer(b)) {
        return Some(x.cmp(&y));
    }
    as_f64(a)?.partial_cmp(&as_f64(b)?)
}

fn contains(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let (Some(haystack), Some(needle)) = (scalar_text(actual), scalar_text(pattern)) else {
        return false;
    };
    let needle = needle.trim_matches('%');
    if case_insensitive {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    } else {
        haystack.contains(needle)
    }
}

fn as_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
