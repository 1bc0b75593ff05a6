//! Document tree helpers for the service cache.
//!
//! Cached service documents are persisted as flat JSON objects whose keys
//! are dotted paths ("ds.ifInOctets.ds_oid"). These helpers convert
//! between the nested and flattened forms and deep-merge partial updates
//! onto previously stored documents.

use serde_json::{Map, Value};

use super::CacheError;

/// Maximum nesting depth accepted before a tree is considered malformed.
pub const MAX_DOCUMENT_DEPTH: usize = 64;

/// Convert a nested document into a flat map keyed by dotted paths.
///
/// Returns `None` if the input is not a JSON object. Scalar and array
/// values are copied as-is; nested objects are re-keyed as
/// `"parent.child"`. Trees deeper than [`MAX_DOCUMENT_DEPTH`] are
/// rejected instead of recursing forever.
pub fn flatten(tree: &Value) -> Result<Option<Map<String, Value>>, CacheError> {
    match tree {
        Value::Object(map) => Ok(Some(flatten_map(map, 0)?)),
        _ => Ok(None),
    }
}

fn flatten_map(map: &Map<String, Value>, depth: usize) -> Result<Map<String, Value>, CacheError> {
    if depth >= MAX_DOCUMENT_DEPTH {
        return Err(CacheError::DepthExceeded(MAX_DOCUMENT_DEPTH));
    }

    let mut flat = Map::new();
    for (key, value) in map {
        match value {
            Value::Object(inner) => {
                for (f_key, f_value) in flatten_map(inner, depth + 1)? {
                    flat.insert(format!("{}.{}", key, f_key), f_value);
                }
            }
            other => {
                flat.insert(key.clone(), other.clone());
            }
        }
    }

    Ok(flat)
}

/// Rebuild a nested document from a flat dotted-path map.
///
/// Inverse of [`flatten`] for documents whose keys contain no literal
/// dots. A scalar found where a branch is needed is replaced by the
/// branch; later keys win.
pub fn unflatten(flat: &Map<String, Value>) -> Value {
    let mut root = Map::new();
    for (key, value) in flat {
        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut root, &path, value);
    }
    Value::Object(root)
}

fn insert_path(map: &mut Map<String, Value>, path: &[&str], value: &Value) {
    match path {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value.clone());
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            } else {
                let mut inner = Map::new();
                insert_path(&mut inner, rest, value);
                *entry = Value::Object(inner);
            }
        }
    }
}

/// Deep-merge a new partial document onto an old one.
///
/// New values win at leaf level; branches present only in `old` are
/// preserved untouched. If `new` is absent or not an object, `old` is
/// returned unchanged, and vice versa; both absent is an error. A branch
/// present in `new` must already exist in `old` (scalars there are
/// overwritten by the new subtree).
pub fn merge(old: Option<&Value>, new: Option<&Value>) -> Result<Value, CacheError> {
    let old_map = old.and_then(Value::as_object);
    let new_map = new.and_then(Value::as_object);

    match (old_map, new_map) {
        (None, None) => Err(CacheError::MergeArguments),
        (Some(o), None) => Ok(Value::Object(o.clone())),
        (None, Some(n)) => Ok(Value::Object(n.clone())),
        (Some(o), Some(n)) => Ok(Value::Object(merge_maps(o, n, 0)?)),
    }
}

fn merge_maps(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    depth: usize,
) -> Result<Map<String, Value>, CacheError> {
    if depth >= MAX_DOCUMENT_DEPTH {
        return Err(CacheError::DepthExceeded(MAX_DOCUMENT_DEPTH));
    }

    let mut merged = old.clone();
    for (key, value) in new {
        match value {
            Value::Object(new_inner) => {
                let old_entry = merged
                    .get(key)
                    .ok_or_else(|| CacheError::MissingBranch(key.clone()))?;
                let replacement = match old_entry.as_object() {
                    Some(old_inner) => Value::Object(merge_maps(old_inner, new_inner, depth + 1)?),
                    None => Value::Object(new_inner.clone()),
                };
                merged.insert(key.clone(), replacement);
            }
            other => {
                merged.insert(key.clone(), other.clone());
            }
        }
    }

    Ok(merged)
}
