//! The structured-data property tree.
//!
//! Message properties beyond the fixed scalar fields live in a nested
//! object addressed by `!`-rooted dotted paths (`!user!id`). Lookup walks
//! the object graph; set creates missing intermediate objects on demand and
//! merges objects key-by-key; delete fails on missing paths.

use serde_json::{Map, Value};
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum JsonError {
    #[snafu(display("json path not found: {path}"))]
    NotFound { path: String },
    #[snafu(display("invalid json path name: {path}"))]
    NameInvalid { path: String },
    #[snafu(display("invalid set operation at {path}"))]
    InvalidSetOp { path: String },
}

/// Splits a `!k1!k2` path into components. The leading `!` denotes the
/// root; the bare root path `!` yields no components. Empty components
/// (consecutive `!`) are invalid.
pub fn split_path(path: &str) -> Result<Vec<&str>, JsonError> {
    let Some(rest) = path.strip_prefix('!') else {
        return Err(JsonError::NameInvalid {
            path: path.to_string(),
        });
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = rest.split('!').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(JsonError::NameInvalid {
            path: path.to_string(),
        });
    }
    Ok(parts)
}

/// Walks the tree, returning the value at `path` if every intermediate key
/// exists and is an object.
pub fn get<'a>(root: &'a Value, path: &str) -> Result<&'a Value, JsonError> {
    let parts = split_path(path)?;
    let mut cur = root;
    for part in parts {
        cur = cur
            .as_object()
            .and_then(|m| m.get(part))
            .ok_or_else(|| JsonError::NotFound {
                path: path.to_string(),
            })?;
    }
    Ok(cur)
}

/// Recursively merges `val` into `dst`: object-into-object unions the keys
/// (right side wins on conflicts), anything else overwrites.
fn merge(dst: &mut Value, val: Value) {
    match (dst, val) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst, val) => *dst = val,
    }
}

/// Sets `path` to `val`, creating intermediate objects on demand. Setting
/// the root requires `val` to be an object. An intermediate key holding a
/// scalar is overwritten with a fresh object, matching the "last writer
/// shapes the tree" behavior of the original.
pub fn set(root: &mut Value, path: &str, val: Value) -> Result<(), JsonError> {
    let parts = split_path(path)?;
    if root.is_null() {
        *root = Value::Object(Map::new());
    }
    if parts.is_empty() {
        if !val.is_object() {
            return Err(JsonError::InvalidSetOp {
                path: path.to_string(),
            });
        }
        merge(root, val);
        return Ok(());
    }

    let mut cur = root;
    for part in &parts[..parts.len() - 1] {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let map = cur.as_object_mut().expect("object ensured above");
        cur = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cur.is_object() {
        *cur = Value::Object(Map::new());
    }
    let leaf = parts[parts.len() - 1];
    let map = cur.as_object_mut().expect("object ensured above");
    match map.get_mut(leaf) {
        Some(existing) => merge(existing, val),
        None => {
            map.insert(leaf.to_string(), val);
        }
    }
    Ok(())
}

/// Removes the value at `path`. Deleting the root empties the tree.
pub fn del(root: &mut Value, path: &str) -> Result<(), JsonError> {
    let parts = split_path(path)?;
    if parts.is_empty() {
        if root.is_null() {
            return Err(JsonError::NotFound {
                path: path.to_string(),
            });
        }
        *root = Value::Null;
        return Ok(());
    }
    let mut cur = &mut *root;
    for part in &parts[..parts.len() - 1] {
        cur = cur
            .as_object_mut()
            .and_then(|m| m.get_mut(*part))
            .ok_or_else(|| JsonError::NotFound {
                path: path.to_string(),
            })?;
    }
    let leaf = parts[parts.len() - 1];
    cur.as_object_mut()
        .and_then(|m| m.remove(leaf))
        .ok_or_else(|| JsonError::NotFound {
            path: path.to_string(),
        })?;
    Ok(())
}

/// Escapes one string per RFC 4627 plus `\/` for the forward slash and
/// `\uXXXX` for remaining control bytes.
pub fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

fn render_into(out: &mut String, val: &Value) {
    match val {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            escape_into(out, s);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_into(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                escape_into(out, k);
                out.push_str("\":");
                render_into(out, v);
            }
            out.push('}');
        }
    }
}

/// Renders the tree to JSON text with this module's escape rules.
pub fn to_text(val: &Value) -> String {
    let mut out = String::new();
    render_into(&mut out, val);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_after_set_returns_value() {
        let mut root = Value::Null;
        set(&mut root, "!user!id", json!(42)).unwrap();
        assert_eq!(get(&root, "!user!id").unwrap(), &json!(42));
    }

    #[test]
    fn del_after_set_leaves_not_found() {
        let mut root = Value::Null;
        set(&mut root, "!a!b!c", json!("x")).unwrap();
        del(&mut root, "!a!b!c").unwrap();
        assert!(matches!(
            get(&root, "!a!b!c"),
            Err(JsonError::NotFound { .. })
        ));
        // Intermediates survive the delete.
        assert!(get(&root, "!a!b").is_ok());
    }

    #[test]
    fn del_missing_path_fails() {
        let mut root = Value::Null;
        set(&mut root, "!a", json!(1)).unwrap();
        assert!(matches!(
            del(&mut root, "!nope"),
            Err(JsonError::NotFound { .. })
        ));
    }

    #[test]
    fn object_merge_unions_keys() {
        let mut root = Value::Null;
        set(&mut root, "!m", json!({"a": 1, "b": 2})).unwrap();
        set(&mut root, "!m", json!({"b": 3, "c": 4})).unwrap();
        assert_eq!(get(&root, "!m").unwrap(), &json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn scalar_leaf_is_replaced() {
        let mut root = Value::Null;
        set(&mut root, "!k", json!(1)).unwrap();
        set(&mut root, "!k", json!({"x": true})).unwrap();
        assert_eq!(get(&root, "!k").unwrap(), &json!({"x": true}));
    }

    #[test]
    fn consecutive_bangs_are_invalid() {
        let mut root = Value::Null;
        assert!(matches!(
            set(&mut root, "!a!!b", json!(1)),
            Err(JsonError::NameInvalid { .. })
        ));
        assert!(matches!(
            get(&root, "no-bang"),
            Err(JsonError::NameInvalid { .. })
        ));
    }

    #[test]
    fn escaping_follows_the_rules() {
        let v = json!({"k": "a/b\t\"c\"\u{01}"});
        assert_eq!(to_text(&v), "{\"k\":\"a\\/b\\t\\\"c\\\"\\u0001\"}");
    }

    #[test]
    fn round_trips_through_serde() {
        let v = json!({"path": "/var/log", "n": 3, "arr": [1, "two", null]});
        let text = to_text(&v);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // get(set(p, v)) == v, and del(set(p, v)); get(p) -> NotFound,
            // for arbitrary non-degenerate paths.
            #[test]
            fn set_get_del_laws(
                keys in prop::collection::vec("[a-z][a-z0-9]{0,7}", 1..4),
                val in any::<i64>(),
            ) {
                let path = format!("!{}", keys.join("!"));
                let mut root = Value::Null;
                set(&mut root, &path, json!(val)).unwrap();
                prop_assert_eq!(get(&root, &path).unwrap(), &json!(val));
                del(&mut root, &path).unwrap();
                let is_not_found = matches!(get(&root, &path), Err(JsonError::NotFound { .. }));
                prop_assert!(is_not_found);
            }

            // Merging two objects with disjoint keys yields the key union.
            #[test]
            fn disjoint_merge_is_union(a in any::<i32>(), b in any::<i32>()) {
                let mut root = Value::Null;
                set(&mut root, "!m", json!({ "a": a })).unwrap();
                set(&mut root, "!m", json!({ "b": b })).unwrap();
                prop_assert_eq!(get(&root, "!m").unwrap(), &json!({ "a": a, "b": b }));
            }

            // Escaped text always parses back to the same string.
            #[test]
            fn escaping_round_trips(s in "\\PC{0,64}") {
                let text = to_text(&Value::String(s.clone()));
                let back: Value = serde_json::from_str(&text).unwrap();
                prop_assert_eq!(back, Value::String(s));
            }
        }
    }
}
