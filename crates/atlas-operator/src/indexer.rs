//! Reference indexer
//!
//! Every managed kind declares the spec fields that name other resources
//! (a credentials `Secret`, a parent `Group`, ...). [`ReferenceField::keys`]
//! walks one declared path through the serialized spec and yields a
//! `namespace/name` key per referenced object; [`ReferenceIndex`] keeps those
//! keys for every cached object so the watch router can find dependents of a
//! changed object without listing anything.
//!
//! The index is fed from the watcher event stream of each dependent kind, so
//! writes are serialized by that stream and reads are lock-protected.

use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Kind a reference field points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

impl TargetKind {
    pub const SECRET: TargetKind = TargetKind {
        group: "",
        version: "v1",
        kind: "Secret",
    };

    pub const GROUP: TargetKind = TargetKind {
        group: crate::crd::API_GROUP,
        version: crate::crd::API_VERSION,
        kind: "Group",
    };

    /// Target kind of a concrete resource type
    pub fn matches<K: Resource<DynamicType = ()>>(&self) -> bool {
        K::group(&()) == self.group && K::version(&()) == self.version && K::kind(&()) == self.kind
    }
}

/// One step of a reference path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Descend into a named field. A missing required field is a malformed
    /// object and is logged; a missing optional field just yields no key.
    Field {
        name: &'static str,
        required: bool,
    },
    /// Iterate over every element of an array
    Each,
}

/// Optional field segment
pub const fn opt(name: &'static str) -> Segment {
    Segment::Field {
        name,
        required: false,
    }
}

/// Required field segment
pub const fn req(name: &'static str) -> Segment {
    Segment::Field {
        name,
        required: true,
    }
}

/// A declared reference from a spec field to another resource.
///
/// `path` is rooted at `spec` and ends at an object carrying `name` and,
/// optionally, `namespace`. References without a namespace resolve in the
/// namespace of the referencing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    pub index: &'static str,
    pub path: &'static [Segment],
    pub target: TargetKind,
}

impl ReferenceField {
    /// Keys referenced through this field by a serialized spec
    pub fn keys(&self, namespace: &str, spec: &Value) -> Vec<String> {
        let mut keys = Vec::new();
        self.walk(spec, self.path, namespace, &mut keys);
        keys
    }

    fn walk(&self, value: &Value, path: &[Segment], namespace: &str, out: &mut Vec<String>) {
        let Some((segment, rest)) = path.split_first() else {
            if let Some(key) = reference_key(value, namespace) {
                out.push(key);
            }
            return;
        };

        match segment {
            Segment::Field { name, required } => match value.get(*name) {
                Some(next) if !next.is_null() => self.walk(next, rest, namespace, out),
                _ => {
                    if *required {
                        debug!(
                            index = self.index,
                            field = *name,
                            "Required segment missing while resolving reference"
                        );
                    }
                }
            },
            Segment::Each => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        self.walk(item, rest, namespace, out);
                    }
                }
            }
        }
    }
}

fn reference_key(value: &Value, namespace: &str) -> Option<String> {
    let name = value.get("name").and_then(Value::as_str)?;
    if name.is_empty() {
        return None;
    }
    let ns = value
        .get("namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(namespace);
    Some(format!("{}/{}", ns, name))
}

/// A kind whose spec references other resources
pub trait Referrer: Resource<DynamicType = ()> + Serialize {
    fn reference_fields() -> &'static [ReferenceField];
}

/// `namespace/name` of an object
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Every `(index, key)` pair an object contributes
pub fn index_keys<K: Referrer>(obj: &K) -> Vec<(&'static str, String)> {
    let namespace = obj.namespace().unwrap_or_default();
    let spec = match serde_json::to_value(obj) {
        Ok(mut value) => value.get_mut("spec").map(Value::take).unwrap_or(Value::Null),
        Err(e) => {
            debug!(error = %e, "Unable to serialize object for indexing");
            return Vec::new();
        }
    };

    K::reference_fields()
        .iter()
        .flat_map(|field| {
            field
                .keys(&namespace, &spec)
                .into_iter()
                .map(move |key| (field.index, key))
        })
        .collect()
}

#[derive(Default)]
struct IndexState {
    /// index name -> referenced key -> referencing object keys
    entries: HashMap<&'static str, HashMap<String, BTreeSet<String>>>,
    /// (index name, object key) -> keys it currently contributes
    contributed: HashMap<(&'static str, String), Vec<String>>,
    /// kind -> objects seen since the current relist started
    relisting: HashMap<String, HashSet<String>>,
}

impl IndexState {
    fn unlink(&mut self, index: &'static str, object: &str) {
        let Some(keys) = self.contributed.remove(&(index, object.to_string())) else {
            return;
        };
        if let Some(by_key) = self.entries.get_mut(index) {
            for key in keys {
                if let Some(objects) = by_key.get_mut(&key) {
                    objects.remove(object);
                    if objects.is_empty() {
                        by_key.remove(&key);
                    }
                }
            }
        }
    }
}

/// Process-wide field index shared by all controllers
#[derive(Default)]
pub struct ReferenceIndex {
    state: RwLock<IndexState>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh the keys of an object
    pub fn upsert<K: Referrer>(&self, obj: &K) {
        let object = object_key(obj);
        let mut grouped: HashMap<&'static str, Vec<String>> = K::reference_fields()
            .iter()
            .map(|f| (f.index, Vec::new()))
            .collect();
        for (index, key) in index_keys(obj) {
            grouped.entry(index).or_default().push(key);
        }

        let mut state = self.state.write();
        for (index, mut keys) in grouped {
            keys.sort();
            keys.dedup();
            state.unlink(index, &object);
            if keys.is_empty() {
                continue;
            }
            let by_key = state.entries.entry(index).or_default();
            for key in &keys {
                by_key.entry(key.clone()).or_default().insert(object.clone());
            }
            trace!(index, object = %object, ?keys, "Indexed references");
            state.contributed.insert((index, object.clone()), keys);
        }
    }

    /// Drop every key of an object
    pub fn remove<K: Referrer>(&self, obj: &K) {
        let object = object_key(obj);
        let mut state = self.state.write();
        for field in K::reference_fields() {
            state.unlink(field.index, &object);
        }
    }

    /// Apply one watcher event of a dependent kind.
    ///
    /// A relist (`Init` .. `InitDone`) prunes objects that disappeared while
    /// the watch was down.
    pub fn apply_event<K: Referrer>(&self, event: &watcher::Event<K>) {
        let kind = K::kind(&()).to_string();
        match event {
            watcher::Event::Apply(obj) => self.upsert(obj),
            watcher::Event::Delete(obj) => self.remove(obj),
            watcher::Event::Init => {
                self.state.write().relisting.insert(kind, HashSet::new());
            }
            watcher::Event::InitApply(obj) => {
                self.upsert(obj);
                if let Some(seen) = self.state.write().relisting.get_mut(&kind) {
                    seen.insert(object_key(obj));
                }
            }
            watcher::Event::InitDone => {
                let mut state = self.state.write();
                let Some(seen) = state.relisting.remove(&kind) else {
                    return;
                };
                let indexes: HashSet<&'static str> =
                    K::reference_fields().iter().map(|f| f.index).collect();
                let stale: Vec<(&'static str, String)> = state
                    .contributed
                    .keys()
                    .filter(|(index, object)| indexes.contains(index) && !seen.contains(object))
                    .cloned()
                    .collect();
                for (index, object) in stale {
                    state.unlink(index, &object);
                }
            }
        }
    }

    /// Objects whose `index` contains `key`
    pub fn lookup(&self, index: &str, key: &str) -> Vec<String> {
        self.state
            .read()
            .entries
            .get(index)
            .and_then(|by_key| by_key.get(key))
            .map(|objects| objects.iter().cloned().collect())
            .unwrap_or_default()
    }
}
