//! Resource-template patches and JSON drift detection
//!
//! Templates are applied after every generated default so a user patch always
//! wins. The merge is strategic in the Kubernetes sense: objects merge key by
//! key, lists of named objects merge by `name`, anything else is replaced and
//! `null` removes a key.
//!
//! Every field a template changed is recorded on the object together with
//! its value before the template ran, so dropping a template restores the
//! generated value on the next pass.

use crate::client::ResourceKind;
use crate::crds::ResourceTemplate;
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Annotation mapping each template-owned JSON pointer to its prior value
pub const TEMPLATE_RECORD_ANNOTATION: &str = "broker.kestrel.io/template-record";

/// Kind matches exactly (or is absent), name matches exactly (or is absent)
pub fn matches(template: &ResourceTemplate, kind: ResourceKind, name: &str) -> bool {
    let kind_ok = template
        .selector
        .kind
        .as_deref()
        .map_or(true, |k| k.is_empty() || k == kind.as_str());
    let name_ok = template
        .selector
        .name
        .as_deref()
        .map_or(true, |n| n.is_empty() || n == name);
    kind_ok && name_ok
}

/// Apply every matching template, in order, to a generated object
pub fn apply_templates(
    templates: &[ResourceTemplate],
    kind: ResourceKind,
    name: &str,
    object: &mut Value,
) -> Result<bool> {
    let before = object.clone();
    for (index, template) in templates.iter().enumerate() {
        if !matches(template, kind, name) {
            continue;
        }
        merge_string_map(object, "labels", &template.labels);
        merge_string_map(object, "annotations", &template.annotations);

        if let Some(patch) = &template.patch {
            if !patch.is_object() {
                return Err(Error::invalid_template(format!(
                    "Templates[{index}].patch must be an object"
                )));
            }
            strategic_merge(object, patch);
        }
    }
    Ok(*object != before)
}

/// Like [`apply_templates`], and also record what the templates changed
pub fn apply_recorded(
    templates: &[ResourceTemplate],
    kind: ResourceKind,
    name: &str,
    object: &mut Value,
) -> Result<bool> {
    let before = object.clone();
    let changed = apply_templates(templates, kind, name, object)?;
    let mut delta = Map::new();
    diff_into(&before, object, &mut String::new(), &mut delta);
    if !delta.is_empty() {
        let record = serde_json::to_string(&delta)?;
        merge_string_map(
            object,
            "annotations",
            &std::collections::BTreeMap::from([(TEMPLATE_RECORD_ANNOTATION.to_string(), record)]),
        );
    }
    Ok(changed)
}

/// Raw record annotation of an object, if any
pub fn record_of(object: &Value) -> Option<&str> {
    object
        .pointer(&format!("/metadata/annotations/{}", escape(TEMPLATE_RECORD_ANNOTATION)))
        .and_then(Value::as_str)
}

/// Put back every value a recorded template replaced and drop the record
pub fn revert_recorded(object: &mut Value) -> Result<bool> {
    let Some(raw) = record_of(object) else {
        return Ok(false);
    };
    let record: Map<String, Value> = serde_json::from_str(raw)?;
    if let Some(annotations) = object
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.remove(TEMPLATE_RECORD_ANNOTATION);
    }
    // deepest first so a restored parent is not overwritten by its children
    let mut entries: Vec<(String, Value)> = record.into_iter().collect();
    entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    for (pointer, previous) in entries {
        restore(object, &pointer, previous);
    }
    prune_empty_map(object, "/metadata", "annotations");
    prune_empty_map(object, "/metadata", "labels");
    Ok(true)
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Leaf differences from `before` to `after`, keyed by pointer, valued by
/// what `before` held there (`null` when absent)
fn diff_into(before: &Value, after: &Value, path: &mut String, out: &mut Map<String, Value>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let keys: std::collections::BTreeSet<&String> = b.keys().chain(a.keys()).collect();
            for key in keys {
                let len = path.len();
                path.push('/');
                path.push_str(&escape(key));
                match (b.get(key), a.get(key)) {
                    (Some(bv), Some(av)) => diff_into(bv, av, path, out),
                    (Some(bv), None) => {
                        out.insert(path.clone(), bv.clone());
                    }
                    (None, Some(_)) => {
                        out.insert(path.clone(), Value::Null);
                    }
                    (None, None) => {}
                }
                path.truncate(len);
            }
        }
        (Value::Array(b), Value::Array(a)) if b.len() == a.len() => {
            for (index, (bv, av)) in b.iter().zip(a).enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&index.to_string());
                diff_into(bv, av, path, out);
                path.truncate(len);
            }
        }
        (b, a) if b != a => {
            out.insert(path.clone(), b.clone());
        }
        _ => {}
    }
}

fn restore(object: &mut Value, pointer: &str, previous: Value) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let key = unescape(last);
    match object.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            if previous.is_null() {
                map.remove(&key);
            } else {
                map.insert(key, previous);
            }
        }
        Some(Value::Array(items)) => {
            if let Some(item) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = previous;
            }
        }
        _ => {}
    }
}

fn prune_empty_map(object: &mut Value, parent: &str, field: &str) {
    if let Some(map) = object.pointer_mut(parent).and_then(Value::as_object_mut) {
        if map.get(field).and_then(Value::as_object).is_some_and(Map::is_empty) {
            map.remove(field);
        }
    }
}

fn merge_string_map(object: &mut Value, field: &str, entries: &std::collections::BTreeMap<String, String>) {
    if entries.is_empty() {
        return;
    }
    let Some(root) = object.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let target = metadata
        .entry(field)
        .or_insert_with(|| Value::Object(Map::new()));
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target) = target.as_object_mut() {
        for (k, v) in entries {
            target.insert(k.clone(), Value::String(v.clone()));
        }
    }
}

/// Merge `patch` into `target`
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, patch_value) in patch {
                if patch_value.is_null() {
                    target.remove(key);
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) => strategic_merge(existing, patch_value),
                    None => {
                        target.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) if is_named_list(target) && is_named_list(patch) => {
            for patch_item in patch {
                let name = patch_item.get("name");
                match target.iter_mut().find(|item| item.get("name") == name) {
                    Some(existing) => strategic_merge(existing, patch_item),
                    None => target.push(patch_item.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|item| item.get("name").is_some_and(Value::is_string))
}

/// True when every field of `desired` is present with the same value in
/// `observed`. Lists must match element for element so removals are seen.
/// Server-populated fields missing from `desired` are ignored.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(key, dv)| match o.get(key) {
            Some(ov) => is_subset(dv, ov),
            None => is_empty(dv),
        }),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o.iter()).all(|(dv, ov)| is_subset(dv, ov))
        }
        (d, o) => d == o,
    }
}

/// The API server drops empty maps, lists and nulls on the way back
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Remove server-owned fields before comparing two copies of an object
pub fn strip_server_fields(mut value: Value) -> Value {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in ["managedFields", "creationTimestamp", "generation", "uid", "selfLink"] {
            metadata.remove(field);
        }
    }
    if let Some(root) = value.as_object_mut() {
        root.remove("status");
    }
    value
}
