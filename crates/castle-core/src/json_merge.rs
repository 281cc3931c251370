//! Structural merge and delta over JSON values.
//!
//! `delta(a, b)` produces the patch that turns `a` into `b`, and
//! `merge(a, patch)` applies it, so `merge(a, delta(a, b)) == b` for object
//! values. Inside a patch, `null` erases the key it is attached to. A
//! consequence is that object members whose value is an explicit `null` are
//! treated as absent.

use serde_json::{Map, Value};

/// Apply `delta` to `input`, returning a fresh value. Neither input is modified.
pub fn merge(input: Option<&Value>, delta: Option<&Value>) -> Option<Value> {
    let (input, delta) = match (input, delta) {
        (None, None) => return None,
        (None, Some(d)) => return Some(d.clone()),
        (Some(i), None) => return Some(i.clone()),
        (Some(i), Some(d)) => (i, d),
    };
    let (Value::Object(input), Value::Object(delta)) = (input, delta) else {
        // Arrays and scalars are replaced wholesale.
        return Some(delta.clone());
    };
    let mut merged = Map::new();
    for (key, value) in input {
        match delta.get(key) {
            Some(Value::Null) => {}
            patch => {
                if let Some(v) = merge(Some(value), patch) {
                    merged.insert(key.clone(), v);
                }
            }
        }
    }
    for (key, value) in delta {
        if !input.contains_key(key) && !value.is_null() {
            merged.insert(key.clone(), value.clone());
        }
    }
    Some(Value::Object(merged))
}

/// Compute the patch which transforms `a` into `b`.
///
/// Returns `None` when there is nothing to change, `Some(Value::Null)` when
/// `a` should be erased, and the patch otherwise.
pub fn delta(a: Option<&Value>, b: Option<&Value>) -> Option<Value> {
    let (a, b) = match (a, b) {
        (None, None) => return None,
        (Some(_), None) => return Some(Value::Null),
        (None, Some(b)) => return Some(b.clone()),
        (Some(a), Some(b)) => (a, b),
    };
    let (Value::Object(a_map), Value::Object(b_map)) = (a, b) else {
        return if a == b { None } else { Some(b.clone()) };
    };
    let mut patch = Map::new();
    for (key, a_value) in a_map {
        if let Some(d) = delta(Some(a_value), b_map.get(key)) {
            patch.insert(key.clone(), d);
        }
    }
    for (key, b_value) in b_map {
        if !a_map.contains_key(key) {
            patch.insert(key.clone(), b_value.clone());
        }
    }
    if patch.is_empty() {
        None
    } else {
        Some(Value::Object(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_merges() {
        assert_eq!(merge(None, Some(&json!("abc"))), Some(json!("abc")));
        assert_eq!(merge(Some(&json!("abc")), None), Some(json!("abc")));
        assert_eq!(merge(None, None), None);
    }

    #[test]
    fn object_merges() {
        let a = json!({"foo": "abcdef"});
        let b = json!({"bar": "ghijkl", "baz": {}});
        let c = merge(Some(&a), Some(&b)).unwrap();
        assert_eq!(c["foo"], json!("abcdef"));
        assert_eq!(c["bar"], json!("ghijkl"));
        assert_eq!(c["baz"], json!({}));
    }

    #[test]
    fn nested_merge_overrides_leaves_only() {
        let a = json!({"conf": {"x": 1, "y": 2}, "name": "a"});
        let patch = json!({"conf": {"y": 3}});
        let merged = merge(Some(&a), Some(&patch)).unwrap();
        assert_eq!(merged, json!({"conf": {"x": 1, "y": 3}, "name": "a"}));
    }

    #[test]
    fn arrays_are_replaced() {
        let a = json!({"list": [1, 2, 3]});
        let patch = json!({"list": [4]});
        assert_eq!(merge(Some(&a), Some(&patch)).unwrap(), json!({"list": [4]}));
    }

    #[test]
    fn null_deltas() {
        assert_eq!(delta(None, None), None);
        assert_eq!(delta(Some(&json!("abc")), None), Some(Value::Null));
        assert_eq!(delta(None, Some(&json!("abc"))), Some(json!("abc")));
    }

    #[test]
    fn object_deltas() {
        let a = json!({"foo": "abcdef"});
        let b = json!({"foo": "abcdef", "bar": "ghijkl"});
        assert_eq!(delta(Some(&a), Some(&b)), Some(json!({"bar": "ghijkl"})));
        assert_eq!(delta(Some(&b), Some(&a)), Some(json!({"bar": null})));
    }

    #[test]
    fn identical_values_have_no_delta() {
        for v in [
            json!({"foo": "abcdef"}),
            json!({"a": {"b": {"c": [1, 2]}}}),
            json!(17),
            json!({}),
        ] {
            assert_eq!(delta(Some(&v), Some(&v)), None);
        }
    }

    #[test]
    fn merge_of_delta_reconstructs_target() {
        let pairs = [
            (json!({"a": 1}), json!({"b": 2})),
            (
                json!({"containerName": "", "sshPort": 0, "imageId": "x"}),
                json!({"containerName": "ducker00", "sshPort": 32768, "imageId": "x"}),
            ),
            (json!({"n": {"x": 1, "y": {"z": 2}}}), json!({"n": {"y": {}}})),
            (json!({"k": 1}), json!({"k": {"nested": true}})),
            (json!({"k": {"nested": true}}), json!({"k": [1, 2]})),
            (json!({}), json!({})),
        ];
        for (a, b) in pairs {
            let d = delta(Some(&a), Some(&b));
            assert_eq!(merge(Some(&a), d.as_ref()), Some(b.clone()), "a={a} b={b}");
        }
    }

    #[test]
    fn explicit_null_members_read_as_absent() {
        for a in [json!({}), json!({"k": 1})] {
            let b = json!({"k": null});
            let d = delta(Some(&a), Some(&b));
            assert_eq!(d, Some(json!({"k": null})));
            assert_eq!(merge(Some(&a), d.as_ref()), Some(json!({})));
        }
    }
}
