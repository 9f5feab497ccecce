//! Field ownership as recorded by server-side apply in `metadata.managedFields`.
//!
//! A [`FieldSet`] is the trie encoded by `FieldsV1`: object fields (`f:name`),
//! list elements by key (`k:{"type":"Ready"}`), by value (`v:"x"`) or by index
//! (`i:0`), and `.` marking the node itself as owned.
//!
//! Only the read side is needed at runtime, the write side backs the
//! in-memory cluster of the unit tests.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::errors::OperatorError;

pub(crate) const APPLY: &'static str = "Apply";
pub(crate) const FIELDS_V1: &'static str = "FieldsV1";
pub(crate) const STATUS_SUBRESOURCE: &'static str = "status";

/// Metadata populated by the API server, never part of an applied configuration.
const SERVER_METADATA: &[&str] = &[
    "name",
    "namespace",
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PathElement {
    Field(String),
    /// Canonical JSON object of the key fields.
    Key(String),
    /// Canonical JSON of a set member.
    Value(String),
    Index(usize),
}

impl PathElement {
    fn parse(s: &str) -> Result<Self, OperatorError> {
        let invalid = |reason: String| {
            OperatorError::Extraction(format!("invalid path element {:?}: {}", s, reason))
        };
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing prefix".to_string()))?;
        match prefix {
            "f" => Ok(PathElement::Field(rest.to_string())),
            "k" => {
                let key: Value = serde_json::from_str(rest).map_err(|e| invalid(e.to_string()))?;
                if key.is_object() {
                    Ok(PathElement::Key(canonical(&key)))
                } else {
                    Err(invalid("key is not an object".to_string()))
                }
            }
            "v" => {
                let value: Value =
                    serde_json::from_str(rest).map_err(|e| invalid(e.to_string()))?;
                Ok(PathElement::Value(canonical(&value)))
            }
            "i" => rest
                .parse::<usize>()
                .map(PathElement::Index)
                .map_err(|e| invalid(e.to_string())),
            other => Err(invalid(format!("unknown prefix {}", other))),
        }
    }

    fn to_key(&self) -> String {
        match self {
            PathElement::Field(name) => format!("f:{}", name),
            PathElement::Key(key) => format!("k:{}", key),
            PathElement::Value(value) => format!("v:{}", value),
            PathElement::Index(index) => format!("i:{}", index),
        }
    }

    /// Whether this (list) element addresses `item` at position `index`.
    fn matches(&self, index: usize, item: &Value) -> bool {
        match self {
            PathElement::Key(key) => {
                match (
                    serde_json::from_str::<Map<String, Value>>(key),
                    item.as_object(),
                ) {
                    (Ok(key), Some(item)) => key.iter().all(|(n, v)| item.get(n) == Some(v)),
                    _ => false,
                }
            }
            PathElement::Value(value) => &canonical(item) == value,
            PathElement::Index(i) => *i == index,
            PathElement::Field(_) => false,
        }
    }
}

/// JSON serialization with object keys in sorted order.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let entries: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical(v)))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Associative list keys of one kind by dotted field path (list elements add
/// no path segment). Lists without an entry are atomic.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct ListKeys(BTreeMap<String, Vec<String>>);

#[cfg(test)]
impl ListKeys {
    pub fn with(mut self, path: &str, names: &[&str]) -> Self {
        self.0
            .insert(path.to_string(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// The `x-kubernetes-list-type: map` lists of an OpenAPI v3 schema.
    pub fn from_schema(schema: &Value) -> Self {
        let mut keys = ListKeys::default();
        keys.collect(schema, "");
        keys
    }

    fn collect(&mut self, schema: &Value, path: &str) {
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, property) in properties {
                self.collect(property, &join(path, name));
            }
        }
        if let Some(items) = schema.get("items") {
            let names = schema
                .get("x-kubernetes-list-map-keys")
                .and_then(Value::as_array)
                .filter(|_| {
                    schema.get("x-kubernetes-list-type").and_then(Value::as_str) == Some("map")
                });
            if let Some(names) = names {
                self.0.insert(
                    path.to_string(),
                    names.iter().filter_map(Value::as_str).map(str::to_string).collect(),
                );
            }
            self.collect(items, path);
        }
    }

    pub fn get(&self, path: &str) -> Option<&[String]> {
        self.0.get(path).map(Vec::as_slice)
    }
}

#[cfg(test)]
fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

#[cfg(test)]
fn key_of(item: &Value, names: &[String]) -> String {
    let mut key = Map::new();
    for name in names {
        if let Some(v) = item.get(name.as_str()) {
            key.insert(name.clone(), v.clone());
        }
    }
    canonical(&Value::Object(key))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct FieldSet {
    member: bool,
    children: BTreeMap<PathElement, FieldSet>,
}

impl FieldSet {
    pub fn is_empty(&self) -> bool {
        !self.member && self.children.is_empty()
    }

    pub fn from_fields_v1(value: &Value) -> Result<Self, OperatorError> {
        let map = value.as_object().ok_or_else(|| {
            OperatorError::Extraction(format!("FieldsV1 node is not an object: {}", value))
        })?;
        let mut set = FieldSet::default();
        for (k, v) in map {
            if k == "." {
                set.member = true;
                continue;
            }
            let element = PathElement::parse(k)?;
            let mut child = Self::from_fields_v1(v)?;
            if child.children.is_empty() {
                child.member = true;
            }
            set.children.insert(element, child);
        }
        Ok(set)
    }

    #[cfg(test)]
    pub fn to_fields_v1(&self) -> Value {
        let mut map = Map::new();
        if self.member && !self.children.is_empty() {
            map.insert(".".to_string(), Value::Object(Map::new()));
        }
        for (element, child) in &self.children {
            if !child.is_empty() {
                map.insert(element.to_key(), child.to_fields_v1());
            }
        }
        Value::Object(map)
    }

    /// The fields set by an applied configuration.
    #[cfg(test)]
    pub fn from_value(value: &Value, lists: &ListKeys) -> Self {
        Self::from_value_at(value, lists, "")
    }

    #[cfg(test)]
    fn from_value_at(value: &Value, lists: &ListKeys, path: &str) -> Self {
        match value {
            Value::Object(map) if !map.is_empty() => {
                let mut set = FieldSet::default();
                for (name, v) in map {
                    if !v.is_null() {
                        set.children.insert(
                            PathElement::Field(name.clone()),
                            Self::from_value_at(v, lists, &join(path, name)),
                        );
                    }
                }
                set
            }
            Value::Array(items) if !items.is_empty() => match lists.get(path) {
                Some(names) => {
                    let mut set = FieldSet::default();
                    for item in items {
                        let mut child = Self::from_value_at(item, lists, path);
                        child.member = true;
                        set.children.insert(PathElement::Key(key_of(item, names)), child);
                    }
                    set
                }
                None => FieldSet {
                    member: true,
                    children: Default::default(),
                },
            },
            _ => FieldSet {
                member: true,
                children: Default::default(),
            },
        }
    }

    pub fn union(&mut self, other: &FieldSet) {
        self.member |= other.member;
        for (element, child) in &other.children {
            self.children
                .entry(element.clone())
                .or_default()
                .union(child);
        }
    }

    #[cfg(test)]
    pub fn intersection(&self, other: &FieldSet) -> FieldSet {
        let mut out = FieldSet {
            member: self.member && other.member,
            children: Default::default(),
        };
        for (element, child) in &self.children {
            if let Some(o) = other.children.get(element) {
                let common = child.intersection(o);
                if !common.is_empty() {
                    out.children.insert(element.clone(), common);
                }
            }
        }
        out
    }

    #[cfg(test)]
    pub fn difference(&self, other: &FieldSet) -> FieldSet {
        let mut out = FieldSet {
            member: self.member && !other.member,
            children: Default::default(),
        };
        for (element, child) in &self.children {
            let rest = match other.children.get(element) {
                Some(o) => child.difference(o),
                None => child.clone(),
            };
            if !rest.is_empty() {
                out.children.insert(element.clone(), rest);
            }
        }
        out
    }

    /// The part of `value` covered by this set, `None` if nothing is covered.
    pub fn project(&self, value: &Value) -> Result<Option<Value>, OperatorError> {
        if self.children.is_empty() {
            return Ok(if self.member { Some(value.clone()) } else { None });
        }
        match value {
            Value::Null => Ok(None),
            Value::Object(map) => {
                let mut out = Map::new();
                for (element, child) in &self.children {
                    match element {
                        PathElement::Field(name) => {
                            if let Some(v) = map.get(name) {
                                if let Some(p) = child.project(v)? {
                                    out.insert(name.clone(), p);
                                }
                            }
                        }
                        other => {
                            return Err(OperatorError::Extraction(format!(
                                "owned list element {} found where an object is stored",
                                other.to_key()
                            )));
                        }
                    }
                }
                Ok(if out.is_empty() && !self.member {
                    None
                } else {
                    Some(Value::Object(out))
                })
            }
            Value::Array(items) => {
                if let Some(PathElement::Field(name)) = self
                    .children
                    .keys()
                    .find(|e| matches!(e, PathElement::Field(_)))
                {
                    return Err(OperatorError::Extraction(format!(
                        "owned field {} found where a list is stored",
                        name
                    )));
                }
                let mut out = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    let owned = self
                        .children
                        .iter()
                        .find(|(element, _)| element.matches(index, item));
                    if let Some((_, child)) = owned {
                        if let Some(p) = child.project(item)? {
                            out.push(p);
                        }
                    }
                }
                Ok(if out.is_empty() && !self.member {
                    None
                } else {
                    Some(Value::Array(out))
                })
            }
            other => Err(OperatorError::Extraction(format!(
                "owned fields expect an object or a list, found {}",
                other
            ))),
        }
    }

    /// Remove every owned leaf (and every owned list element) from `value`.
    #[cfg(test)]
    pub fn remove_from(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (element, child) in &self.children {
                    if let PathElement::Field(name) = element {
                        if child.children.is_empty() {
                            if child.member {
                                map.remove(name);
                            }
                        } else if let Some(v) = map.get_mut(name) {
                            child.remove_from(v);
                        }
                    }
                }
            }
            Value::Array(items) => {
                let mut index = 0usize;
                items.retain_mut(|item| {
                    let i = index;
                    index += 1;
                    match self.children.iter().find(|(e, _)| e.matches(i, item)) {
                        Some((_, child)) if child.member => false,
                        Some((_, child)) => {
                            child.remove_from(item);
                            true
                        }
                        None => true,
                    }
                });
            }
            _ => (),
        }
    }
}

/// Union of the fields `manager` owns through server-side apply on the main
/// resource (`subresource == None`) or on the given subresource.
pub(crate) fn owned_fields(
    obj: &DynamicObject,
    manager: &str,
    subresource: Option<&str>,
) -> Result<Option<FieldSet>, OperatorError> {
    let mut owned: Option<FieldSet> = None;
    for entry in obj.metadata.managed_fields.iter().flatten() {
        if entry.manager.as_deref() != Some(manager)
            || entry.operation.as_deref() != Some(APPLY)
            || entry.subresource.as_deref().filter(|s| !s.is_empty()) != subresource
        {
            continue;
        }
        if entry
            .fields_type
            .as_deref()
            .map_or(false, |t| t != FIELDS_V1)
        {
            return Err(OperatorError::Extraction(format!(
                "unsupported managed fields type {:?} of {}",
                entry.fields_type, manager
            )));
        }
        if let Some(fields) = &entry.fields_v1 {
            let set = FieldSet::from_fields_v1(&fields.0).map_err(|e| {
                OperatorError::Extraction(format!("invalid managed fields of {}: {}", manager, e))
            })?;
            owned.get_or_insert_with(Default::default).union(&set);
        }
    }
    Ok(owned.filter(|s| !s.is_empty()))
}

/// JSON of an object without type information and server populated metadata,
/// i.e. the shape of an applied configuration.
pub(crate) fn apply_content(obj: &DynamicObject) -> Result<Value, OperatorError> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("apiVersion");
        map.remove("kind");
        let empty_metadata = match map.get_mut("metadata") {
            Some(Value::Object(meta)) => {
                for field in SERVER_METADATA {
                    meta.remove(*field);
                }
                meta.is_empty()
            }
            _ => false,
        };
        if empty_metadata {
            map.remove("metadata");
        }
    }
    Ok(value)
}

/// What `manager` last applied to the main resource of `live`, as far as it is still present.
pub(crate) fn last_applied(
    live: &DynamicObject,
    manager: &str,
) -> Result<Option<Value>, OperatorError> {
    match owned_fields(live, manager, None)? {
        Some(owned) => {
            let mut content = apply_content(live)?;
            if let Some(map) = content.as_object_mut() {
                map.remove("status");
            }
            owned.project(&content)
        }
        None => Ok(None),
    }
}

/// Copy every field set in `patch` onto `base`. Keyed lists are merged
/// element by element, atomic lists and scalars are replaced.
#[cfg(test)]
pub(crate) fn merge_values(base: &mut Value, patch: &Value, lists: &ListKeys) {
    merge_at(base, patch, lists, "")
}

#[cfg(test)]
fn merge_at(base: &mut Value, patch: &Value, lists: &ListKeys, path: &str) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    continue;
                }
                match base.get_mut(k) {
                    Some(existing) => merge_at(existing, v, lists, &join(path, k)),
                    None => {
                        base.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(patch_items)) => match lists.get(path) {
            Some(names) => {
                for item in patch_items {
                    let key = key_of(item, names);
                    match base_items.iter_mut().find(|b| key_of(b, names) == key) {
                        Some(existing) => merge_at(existing, item, lists, path),
                        None => base_items.push(item.clone()),
                    }
                }
            }
            None => *base_items = patch_items.clone(),
        },
        (base, patch) => *base = patch.clone(),
    }
}
