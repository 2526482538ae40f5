//! Canonical JSON text used as signing input.
//!
//! Object keys are sorted at every depth, arrays keep their order, and
//! the output is compact (no insignificant whitespace). Two payloads that
//! differ only in key order always produce the same bytes.

use serde_json::Value;

/// Canonicalizes an optional payload. A missing payload is an empty map.
pub fn canonicalize_payload(payload: Option<&Value>) -> String {
    match payload {
        None | Some(Value::Null) => "{}".to_string(),
        Some(value) => canonicalize(value),
    }
}

/// Serializes `value` with recursively sorted object keys.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json's string escaping never fails for a &str
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("\"\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[3,1],"x":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":null,"y":[3,1]},"b":1}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), r#"{"a":{"x":null,"y":[3,1]},"b":1}"#);
    }

    #[test]
    fn test_arrays_keep_order() {
        let v = json!({"list": [{"z": 1, "a": 2}, 3, "x"]});
        assert_eq!(canonicalize(&v), r#"{"list":[{"a":2,"z":1},3,"x"]}"#);
        let reversed = json!({"list": ["x", 3, {"a": 2, "z": 1}]});
        assert_ne!(canonicalize(&v), canonicalize(&reversed));
    }

    #[test]
    fn test_missing_payload_is_empty_map() {
        assert_eq!(canonicalize_payload(None), "{}");
        assert_eq!(canonicalize_payload(Some(&Value::Null)), "{}");
        assert_eq!(canonicalize_payload(Some(&json!({}))), "{}");
    }

    #[test]
    fn test_strings_are_escaped() {
        let v = json!({"msg": "line\n\"quoted\""});
        assert_eq!(canonicalize(&v), r#"{"msg":"line\n\"quoted\""}"#);
    }

    #[test]
    fn test_scalars() {
        assert_eq!(canonicalize(&json!(true)), "true");
        assert_eq!(canonicalize(&json!(-12)), "-12");
        assert_eq!(canonicalize(&json!("a")), "\"a\"");
    }
}
