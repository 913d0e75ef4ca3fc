use serde_json::{Map, Value};
use speckle_types::wire;

/// Render `value` as canonical JSON: object keys sorted, no whitespace.
///
/// Key order is enforced here rather than relying on the map type backing
/// `serde_json::Map`, which changes when the `preserve_order` feature is
/// unified into the build.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

/// Append the canonical rendering of `value` to `out`.
pub fn write_canonical(value: &Value, out: &mut String) {
    write_value(value, Mode::Full, out);
}

/// Canonical rendering of an object.
pub fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    write_object(map, Mode::Full, false, out);
}

/// The string a fragment body is hashed over.
///
/// Same as the canonical rendering except that the top-level `id` is left
/// out, and so is `applicationId` on every serialized object (anything
/// carrying a `speckle_type`), at any depth.
pub fn to_hash_string(map: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(128);
    write_object(map, Mode::Hash, true, &mut out);
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    Hash,
}

fn write_value(value: &Value, mode: Mode, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, mode, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, mode, false, out),
    }
}

fn write_object(map: &Map<String, Value>, mode: Mode, top_level: bool, out: &mut String) {
    let is_speckle_object = map.contains_key(wire::SPECKLE_TYPE);
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|key| match mode {
            Mode::Full => true,
            Mode::Hash => {
                !(top_level && key.as_str() == wire::ID)
                    && !(is_speckle_object && key.as_str() == wire::APPLICATION_ID)
            }
        })
        .collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(&map[key], mode, out);
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
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
    fn keys_are_sorted() {
        let v = json!({"b": 1, "a": {"d": true, "c": null}});
        assert_eq!(to_canonical_string(&v), r#"{"a":{"c":null,"d":true},"b":1}"#);
    }

    #[test]
    fn arrays_keep_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(to_canonical_string(&v), "[3,1,2]");
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"q": "a\"b\n"});
        assert_eq!(to_canonical_string(&v), r#"{"q":"a\"b\n"}"#);
    }

    #[test]
    fn floats_keep_fraction() {
        let v = json!({"x": 1.0, "y": 0.5, "z": -3});
        assert_eq!(to_canonical_string(&v), r#"{"x":1.0,"y":0.5,"z":-3}"#);
    }

    #[test]
    fn matches_serde_for_sorted_input() {
        let v = json!({"a": [1, {"b": "c"}], "d": false});
        let reparsed: Value = serde_json::from_str(&to_canonical_string(&v)).unwrap();
        assert_eq!(reparsed, v);
    }

    #[test]
    fn hash_string_drops_id_and_application_ids() {
        let v = json!({
            "id": "x",
            "applicationId": "root-app",
            "speckle_type": "Base",
            "inner": {"speckle_type": "Base", "applicationId": "child-app", "id": "y", "v": 1},
            "plain": {"applicationId": "kept"}
        });
        let s = to_hash_string(v.as_object().unwrap());
        assert_eq!(
            s,
            r#"{"inner":{"id":"y","speckle_type":"Base","v":1},"plain":{"applicationId":"kept"},"speckle_type":"Base"}"#
        );
    }

    #[test]
    fn canonical_object_matches_value_rendering() {
        let v = json!({"b": [1], "a": "z"});
        let mut out = String::new();
        write_canonical_object(v.as_object().unwrap(), &mut out);
        assert_eq!(out, to_canonical_string(&v));
    }
}
