//! Dotted-path field extraction over `serde_json::Value`.
//!
//! Paths look like `choices.0.delta.content`: segments that parse as
//! integers index into arrays, everything else looks up object keys. A
//! numeric segment applied to a non-array yields nothing.

use serde_json::Value;

pub fn read_by_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.trim().is_empty() {
        return None;
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match segment.parse::<usize>() {
            Ok(index) => match current {
                Value::Array(items) => items.get(index)?,
                _ => return None,
            },
            Err(_) => match current {
                Value::Object(map) => map.get(segment)?,
                _ => return None,
            },
        };
    }
    Some(current)
}

/// Reads a string at `path`; numbers and booleans stringify, containers and
/// null yield `None`.
pub fn read_text_by_path(root: &Value, path: &str) -> Option<String> {
    match read_by_path(root, path)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Reads an integer at `path`; strings that parse as integers count.
pub fn read_int_by_path(root: &Value, path: &str) -> Option<i64> {
    match read_by_path(root, path)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
