//! Removal of unset optional fields from outbound payloads.
//!
//! Typed requests use `Option` with `skip_serializing_if`, so most unset
//! fields never reach the wire. Payloads assembled from sentinel conventions
//! (an unset number as its type's minimum, an unset string as `""`, NaN,
//! which `serde_json` writes as `null`) go through [`prune_unset`] so the
//! host sees the field as truly absent.

use serde::Serialize;
use serde_json::{Number, Value};

/// Serialize a payload and prune unset fields from it.
///
/// # Errors
/// Returns error if the payload cannot be represented as JSON.
pub fn to_wire_data<T: Serialize>(payload: &T) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(payload)?;
    prune_unset(&mut value);
    Ok(value)
}

/// Recursively remove object keys whose value is an unset sentinel.
///
/// Array elements are never removed; objects inside arrays are pruned.
pub fn prune_unset(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !is_unset(v));
            for v in map.values_mut() {
                prune_unset(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                prune_unset(item);
            }
        }
        _ => {}
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => is_min_sentinel(n),
        _ => false,
    }
}

#[allow(clippy::float_cmp)]
fn is_min_sentinel(n: &Number) -> bool {
    if let Some(i) = n.as_i64() {
        return i == i64::MIN || i == i64::from(i32::MIN);
    }
    if n.is_f64() {
        return n
            .as_f64()
            .is_some_and(|f| f == f64::MIN || f == f64::from(f32::MIN));
    }
    false
}
