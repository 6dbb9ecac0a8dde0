//! Conversions between backend cells and `serde_json` values shared by the
//! dialect adapters.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

use super::ident::iso_format;
use crate::db::{CellValue, SqlValue};

/// Recursively rebuild objects with their keys in ascending order, so the
/// serialized form is stable regardless of insertion order.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonical_json(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by kind first, then by natural value.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a)
            .cmp(&type_rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

/// Sort ascending; duplicates are kept.
pub fn sorted_values(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by(compare_values);
    values
}

/// Native array parameter when every element shares a primitive kind.
pub fn native_array(values: &[Value]) -> Option<SqlValue> {
    if values.iter().all(Value::is_string) {
        return Some(SqlValue::TextArray(
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ));
    }
    if values.iter().all(Value::is_i64) {
        return Some(SqlValue::IntArray(values.iter().filter_map(Value::as_i64).collect()));
    }
    None
}

pub fn cell_to_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Int16(i) => Value::from(*i),
        CellValue::Int32(i) => Value::from(*i),
        CellValue::Int64(i) => Value::from(*i),
        CellValue::Float32(f) => Number::from_f64(*f as f64).map_or(Value::Null, Value::Number),
        CellValue::Float64(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        CellValue::Text(s) | CellValue::Unknown(s) => Value::String(s.clone()),
        CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        CellValue::DateTime(ts) => Value::String(iso_format(ts)),
        CellValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        CellValue::Json(j) => j.clone(),
        CellValue::Array(items) => Value::Array(items.iter().map(cell_to_value).collect()),
        other => Value::String(other.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "c": [{"y": 1, "x": 2}]}});
        assert_eq!(
            canonical_json(&value).to_string(),
            r#"{"a":{"c":[{"x":2,"y":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_sorted_values_keeps_duplicates() {
        let sorted = sorted_values(vec![json!("b"), json!("a"), json!("b")]);
        assert_eq!(sorted, vec![json!("a"), json!("b"), json!("b")]);

        let sorted = sorted_values(vec![json!(10), json!(2.5), json!(-1)]);
        assert_eq!(sorted, vec![json!(-1), json!(2.5), json!(10)]);
    }

    #[test]
    fn test_native_array_kinds() {
        assert_eq!(
            native_array(&[json!("a"), json!("b")]),
            Some(SqlValue::TextArray(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            native_array(&[json!(1), json!(2)]),
            Some(SqlValue::IntArray(vec![1, 2]))
        );
        assert_eq!(native_array(&[json!({"a": 1})]), None);
    }

    #[test]
    fn test_cell_to_value() {
        let ts = chrono::NaiveDate::from_ymd_opt(2020, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(cell_to_value(&CellValue::DateTime(ts)), json!("2020-06-01T00:00:00"));
        assert_eq!(
            cell_to_value(&CellValue::Array(vec![CellValue::Int32(1), CellValue::Null])),
            json!([1, null])
        );
    }
}
