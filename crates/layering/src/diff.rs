//! Structural diff and merge of nested JSON configs.
//!
//! Both functions walk objects key by key and treat everything else
//! (strings, numbers, arrays, ...) as a leaf. Field paths are dot-joined
//! object keys, and every output list is sorted by path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverriddenField {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: Value,
}

/// Three-way classification of every leaf field of base ∪ overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    /// In both, with different values.
    pub overridden: Vec<OverriddenField>,
    /// Only in the overlay.
    pub added: Vec<FieldValue>,
    /// Only in the base, or identical in both; the overlay sees the base value.
    pub inherited_unchanged: Vec<FieldValue>,
}

impl FieldDiff {
    /// Every classified field path, in output order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.overridden
            .iter()
            .map(|f| f.field.as_str())
            .chain(self.added.iter().map(|f| f.field.as_str()))
            .chain(self.inherited_unchanged.iter().map(|f| f.field.as_str()))
    }
}

/// Diff two object configs. Neither input is modified.
pub fn diff_objects(base: &Map<String, Value>, overlay: &Map<String, Value>) -> FieldDiff {
    let mut diff = FieldDiff::default();
    walk(base, overlay, "", &mut diff);
    diff.overridden.sort_by(|a, b| a.field.cmp(&b.field));
    diff.added.sort_by(|a, b| a.field.cmp(&b.field));
    diff.inherited_unchanged.sort_by(|a, b| a.field.cmp(&b.field));
    diff
}

fn walk(base: &Map<String, Value>, overlay: &Map<String, Value>, prefix: &str, out: &mut FieldDiff) {
    let keys: BTreeSet<&String> = base.keys().chain(overlay.keys()).collect();
    for key in keys {
        let field = join(prefix, key);
        match (base.get(key), overlay.get(key)) {
            (Some(Value::Object(b)), Some(Value::Object(o))) if !(b.is_empty() && o.is_empty()) => {
                walk(b, o, &field, out);
            }
            // A null overlay value falls back to the base, as in `deep_merge`.
            (Some(Value::Object(b)), Some(Value::Null)) if !b.is_empty() => {
                walk(b, &Map::new(), &field, out);
            }
            (Some(b), Some(Value::Null)) => out.inherited_unchanged.push(FieldValue {
                field,
                value: b.clone(),
            }),
            (Some(b), Some(o)) if b == o => out.inherited_unchanged.push(FieldValue {
                field,
                value: b.clone(),
            }),
            (Some(b), Some(o)) => out.overridden.push(OverriddenField {
                field,
                old: b.clone(),
                new: o.clone(),
            }),
            (None, Some(o)) => out.added.push(FieldValue {
                field,
                value: o.clone(),
            }),
            (Some(b), None) => out.inherited_unchanged.push(FieldValue {
                field,
                value: b.clone(),
            }),
            (None, None) => {}
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// `overlay[key] ?? base[key]`, applied recursively through nested objects.
/// Non-object overlay values (arrays included) replace the base value whole.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            for (key, value) in o {
                let next = match b.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => overlay.clone(),
    }
}
