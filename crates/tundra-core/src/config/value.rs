//! Conversions between the HCL value space and JSON.
//!
//! Evaluated configuration is carried as `serde_json::Value` everywhere past
//! the evaluator so that inputs, outputs and reports share one representation.

use hcl::Value as HclValue;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

pub fn hcl_to_json(value: &HclValue) -> JsonValue {
    match value {
        HclValue::Null => JsonValue::Null,
        HclValue::Bool(b) => JsonValue::Bool(*b),
        HclValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                JsonValue::Number(u.into())
            } else if let Some(f) = n.as_f64() {
                JsonNumber::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        HclValue::String(s) => JsonValue::String(s.clone()),
        HclValue::Array(items) => JsonValue::Array(items.iter().map(hcl_to_json).collect()),
        HclValue::Object(map) => {
            let mut out = JsonMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), hcl_to_json(v));
            }
            JsonValue::Object(out)
        }
    }
}

pub fn json_to_hcl(value: &JsonValue) -> HclValue {
    match value {
        JsonValue::Null => HclValue::Null,
        JsonValue::Bool(b) => HclValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                HclValue::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                HclValue::Number(u.into())
            } else {
                n.as_f64()
                    .and_then(hcl::Number::from_f64)
                    .map(HclValue::Number)
                    .unwrap_or(HclValue::Null)
            }
        }
        JsonValue::String(s) => HclValue::String(s.clone()),
        JsonValue::Array(items) => HclValue::Array(items.iter().map(json_to_hcl).collect()),
        JsonValue::Object(map) => {
            let mut out = hcl::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_hcl(v));
            }
            HclValue::Object(out)
        }
    }
}
