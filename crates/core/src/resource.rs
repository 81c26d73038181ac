//! Typed accessors over dynamically-typed cluster objects.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::{json_type_name, ModelError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`v1` or `apps/v1`) into group and version.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Renders as `apps/v1, Kind=Deployment` (core group: `/v1, Kind=ConfigMap`).
impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

/// Full identity of an object within one input set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?}, {:?}", self.gvk, self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

impl OwnerRef {
    fn from_json(v: &Json) -> Option<Self> {
        let s = |k: &str| v.get(k).and_then(|x| x.as_str()).unwrap_or("").to_string();
        v.as_object()?;
        Some(Self {
            api_version: s("apiVersion"),
            kind: s("kind"),
            name: s("name"),
            uid: s("uid"),
            controller: v.get("controller").and_then(|c| c.as_bool()).unwrap_or(false),
        })
    }
}

/// A single cluster object: a JSON map guaranteed to carry `apiVersion`, `kind`
/// and `metadata.name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub struct Resource {
    obj: Map<String, Json>,
}

impl TryFrom<Json> for Resource {
    type Error = ModelError;
    fn try_from(v: Json) -> Result<Self, Self::Error> { Self::from_json(v) }
}

impl From<Resource> for Json {
    fn from(r: Resource) -> Self { Json::Object(r.obj) }
}

impl Resource {
    pub fn from_json(v: Json) -> Result<Self, ModelError> {
        let obj = match v {
            Json::Object(m) => m,
            other => return Err(ModelError::NotAnObject { found: json_type_name(&other) }),
        };
        let non_empty = |k: &str| obj.get(k).and_then(|x| x.as_str()).map(|s| !s.is_empty()).unwrap_or(false);
        if !non_empty("apiVersion") { return Err(ModelError::MissingApiVersion); }
        if !non_empty("kind") { return Err(ModelError::MissingKind); }
        let has_name = obj
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .map(|n| !n.is_empty())
            .unwrap_or(false);
        if !has_name {
            let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
            return Err(ModelError::MissingName { kind });
        }
        Ok(Self { obj })
    }

    pub fn as_map(&self) -> &Map<String, Json> { &self.obj }

    pub fn to_json(&self) -> Json { Json::Object(self.obj.clone()) }

    pub fn into_json(self) -> Json { Json::Object(self.obj) }

    fn str_field(&self, k: &str) -> &str { self.obj.get(k).and_then(|v| v.as_str()).unwrap_or("") }

    fn meta(&self) -> Option<&Map<String, Json>> { self.obj.get("metadata").and_then(|m| m.as_object()) }

    fn meta_str(&self, k: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get(k)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    fn meta_mut(&mut self) -> &mut Map<String, Json> { object_slot(&mut self.obj, "metadata") }

    fn string_map_mut(&mut self, field: &str) -> &mut Map<String, Json> { object_slot(self.meta_mut(), field) }

    pub fn api_version(&self) -> &str { self.str_field("apiVersion") }

    pub fn kind(&self) -> &str { self.str_field("kind") }

    pub fn gvk(&self) -> Gvk { Gvk::from_api_version(self.api_version(), self.kind()) }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or("") }

    /// `None` for cluster-scoped objects and for namespaced objects relying on the default namespace.
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace") }

    pub fn set_namespace(&mut self, ns: &str) {
        self.meta_mut().insert("namespace".into(), Json::String(ns.to_string()));
    }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }

    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().and_then(|m| m.get("labels")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.string_map_mut("annotations").insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.string_map_mut("labels").insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let annotations = self.meta_mut().get_mut("annotations")?.as_object_mut()?;
        let removed = annotations.remove(key).and_then(|v| v.as_str().map(str::to_string));
        if annotations.is_empty() {
            self.meta_mut().remove("annotations");
        }
        removed
    }

    pub fn owner_references(&self) -> SmallVec<[OwnerRef; 2]> {
        self.meta()
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|o| o.as_array())
            .map(|refs| refs.iter().filter_map(OwnerRef::from_json).collect())
            .unwrap_or_default()
    }

    /// True when some owner reference is flagged `controller: true`.
    pub fn has_controller_owner(&self) -> bool { self.owner_references().iter().any(|r| r.controller) }

    /// `namespace.name`, or just `name` when no namespace is set.
    pub fn fq_name(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}.{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    pub fn identity(&self) -> ObjectIdentity {
        ObjectIdentity { gvk: self.gvk(), namespace: self.namespace().map(str::to_string), name: self.name().to_string() }
    }
}

/// Map stored under `key`, replacing any non-map value.
fn object_slot<'a>(parent: &'a mut Map<String, Json>, key: &str) -> &'a mut Map<String, Json> {
    let slot = parent.entry(key).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    match slot {
        Json::Object(m) => m,
        _ => unreachable!("{} normalized to an object above", key),
    }
}

/// Reject input sets in which two objects share group/version/kind/namespace/name.
pub fn check_duplicates(objs: &[Resource]) -> Result<(), ModelError> {
    let mut seen = std::collections::HashSet::with_capacity(objs.len());
    for o in objs {
        let id = o.identity();
        if seen.contains(&id) {
            return Err(ModelError::Duplicate(id));
        }
        seen.insert(id);
    }
    Ok(())
}
