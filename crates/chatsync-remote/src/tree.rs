//! Operations on the JSON tree held by the in-process store.

use serde_json::{Map, Value};

use chatsync_shared::constants::SERVER_VALUE_KEY;
use chatsync_shared::paths::segments;
use chatsync_shared::ServerTime;

use crate::adapter::{sort_key, Query};

/// Value at `path`, if any.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Store `value` at `path`. `None` or `Null` removes the entry and prunes
/// parents left empty.
pub fn set(root: &mut Value, path: &str, value: Option<Value>) {
    let segs = segments(path);
    let value = value.filter(|v| !v.is_null() && !is_empty_object(v));

    if segs.is_empty() {
        *root = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    }

    match value {
        Some(v) => {
            let mut node = root;
            for seg in &segs[..segs.len() - 1] {
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                let Value::Object(map) = node else {
                    return;
                };
                node = map
                    .entry(seg.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                map.insert(segs[segs.len() - 1].to_string(), v);
            }
        }
        None => remove(root, &segs),
    }
}

fn remove(node: &mut Value, segs: &[&str]) {
    let Some(map) = node.as_object_mut() else {
        return;
    };
    if segs.len() == 1 {
        map.remove(segs[0]);
        return;
    }
    if let Some(child) = map.get_mut(segs[0]) {
        remove(child, &segs[1..]);
        if is_empty_object(child) {
            map.remove(segs[0]);
        }
    }
}

fn is_empty_object(v: &Value) -> bool {
    v.as_object().is_some_and(Map::is_empty)
}

/// Replace server-value placeholders in `value`, which is about to be
/// written at `path`, using `now` and the current contents of `root`.
pub fn resolve(root: &Value, path: &str, value: &Value, now: ServerTime) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(sv) = map.get(SERVER_VALUE_KEY) {
                if sv.as_str() == Some("timestamp") {
                    return Value::from(now.millis());
                }
                if let Some(delta) = sv.get("increment").and_then(Value::as_i64) {
                    let current = get(root, path).and_then(Value::as_i64).unwrap_or(0);
                    return Value::from(current.saturating_add(delta));
                }
            }
            let resolved = map
                .iter()
                .map(|(k, v)| {
                    let child_path = format!("{path}/{k}");
                    (k.clone(), resolve(root, &child_path, v, now))
                })
                .collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Apply `query` to the value found at a path.
pub fn apply_query(value: Option<&Value>, query: &Query) -> Option<Value> {
    let value = value?;
    let Some(order_by) = &query.order_by else {
        return Some(value.clone());
    };
    let map = value.as_object()?;

    let mut children: Vec<(&String, &Value)> = map
        .iter()
        .filter(|(_, v)| {
            let key = sort_key(v, order_by);
            query.start_at.map_or(true, |s| key >= s) && query.end_at.map_or(true, |e| key <= e)
        })
        .collect();
    children.sort_by(|(ka, va), (kb, vb)| {
        sort_key(va, order_by)
            .cmp(&sort_key(vb, order_by))
            .then_with(|| ka.cmp(kb))
    });
    if let Some(limit) = query.limit_to_last {
        let skip = children.len().saturating_sub(limit);
        children.drain(..skip);
    }
    if children.is_empty() {
        return None;
    }
    Some(Value::Object(
        children
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_nested() {
        let mut root = json!({});
        set(&mut root, "a/b/c", Some(json!(1)));
        assert_eq!(get(&root, "a/b/c"), Some(&json!(1)));
        assert_eq!(get(&root, "a/b"), Some(&json!({ "c": 1 })));
        assert_eq!(get(&root, "a/x"), None);
    }

    #[test]
    fn removing_prunes_empty_parents() {
        let mut root = json!({});
        set(&mut root, "a/b/c", Some(json!(1)));
        set(&mut root, "a/d", Some(json!(2)));
        set(&mut root, "a/b/c", None);
        assert_eq!(root, json!({ "a": { "d": 2 } }));
        set(&mut root, "a/d", Some(Value::Null));
        assert_eq!(root, json!({}));
    }

    #[test]
    fn resolves_timestamp_and_increment() {
        let root = json!({ "unread": { "u": { "c": 4 } } });
        let value = json!({
            "c": { ".sv": { "increment": 1 } },
            "d": { ".sv": { "increment": 2 } }
        });
        let resolved = resolve(&root, "unread/u", &value, ServerTime(9));
        assert_eq!(resolved, json!({ "c": 5, "d": 2 }));

        let stamped = resolve(&root, "x", &json!({ "at": { ".sv": "timestamp" } }), ServerTime(9));
        assert_eq!(stamped, json!({ "at": 9 }));
    }

    #[test]
    fn query_range_and_limit() {
        let value = json!({
            "m1": { "t": 1 }, "m2": { "t": 2 }, "m3": { "t": 3 }, "m4": { "t": 4 }
        });
        let q = Query::order_by("t").end_at(3).limit_to_last(2);
        let out = apply_query(Some(&value), &q).unwrap();
        assert_eq!(out, json!({ "m2": { "t": 2 }, "m3": { "t": 3 } }));

        let q = Query::order_by("t").start_at(4);
        assert_eq!(apply_query(Some(&value), &q), Some(json!({ "m4": { "t": 4 } })));

        let q = Query::order_by("t").start_at(10);
        assert_eq!(apply_query(Some(&value), &q), None);
    }
}
