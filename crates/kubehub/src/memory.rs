//! In-memory cluster implementing both collaborators, for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use kcfg_core::{ApiError, Gvk, Resource, Scope};
use rustc_hash::FxHashSet;
use serde_json::{json, Value as Json};

use crate::{DeleteOptions, Discovery, KindInfo, ServerVersion, Transport, VERBS_ALL};

type Key = (Gvk, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Resource>,
    next_rv: u64,
    forbidden: FxHashSet<(String, Option<String>)>,
    calls: Vec<String>,
}

pub struct MemoryCluster {
    kinds: Vec<KindInfo>,
    version: ServerVersion,
    state: Mutex<State>,
    discovery_calls: AtomicUsize,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    /// A cluster serving a handful of core kinds.
    pub fn new() -> Self {
        let k = |g: &str, v: &str, kind: &str, plural: &str, scope| KindInfo::new(Gvk::new(g, v, kind), plural, scope, VERBS_ALL);
        let kinds = vec![
            k("", "v1", "Namespace", "namespaces", Scope::Cluster),
            k("", "v1", "ConfigMap", "configmaps", Scope::Namespaced),
            k("", "v1", "Secret", "secrets", Scope::Namespaced),
            k("", "v1", "Service", "services", Scope::Namespaced),
            k("", "v1", "Pod", "pods", Scope::Namespaced),
            k("", "v1", "ReplicationController", "replicationcontrollers", Scope::Namespaced),
            k("apps", "v1", "Deployment", "deployments", Scope::Namespaced),
            k("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Scope::Cluster),
            k("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", Scope::Cluster),
            KindInfo::new(Gvk::new("", "v1", "Binding"), "bindings", Scope::Namespaced, &["create"]),
        ];
        Self { kinds, version: ServerVersion::new(1, 28), state: Mutex::new(State::default()), discovery_calls: AtomicUsize::new(0) }
    }

    pub fn with_kind(mut self, kind: KindInfo) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_version(mut self, v: ServerVersion) -> Self {
        self.version = v;
        self
    }

    /// Make `list` of `kind` (in `ns`, or cluster-wide for `None`) fail with 403.
    pub fn forbid_list(&self, kind: &str, ns: Option<&str>) {
        self.lock().forbidden.insert((kind.to_string(), ns.map(str::to_string)));
    }

    /// Seed an object directly, as if some other client had created it.
    pub fn insert(&self, obj: Resource) -> Resource {
        let mut st = self.lock();
        let stored = stamp_server_fields(&mut st, obj, None);
        st.objects.insert(key_of(&stored), stored.clone());
        stored
    }

    pub fn lookup(&self, gvk: &Gvk, ns: Option<&str>, name: &str) -> Option<Resource> {
        self.lock().objects.get(&(gvk.clone(), ns.map(str::to_string), name.to_string())).cloned()
    }

    pub fn objects(&self) -> Vec<Resource> { self.lock().objects.values().cloned().collect() }

    /// Mutating calls in the order they were served, e.g. `create configmaps myns.foo`.
    pub fn calls(&self) -> Vec<String> { self.lock().calls.clone() }

    pub fn discovery_calls(&self) -> usize { self.discovery_calls.load(Ordering::SeqCst) }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key(kind: &KindInfo, ns: Option<&str>, name: &str) -> Key {
        let ns = if kind.namespaced() { ns.map(str::to_string) } else { None };
        (kind.gvk.clone(), ns, name.to_string())
    }
}

fn key_of(o: &Resource) -> Key { (o.gvk(), o.namespace().map(str::to_string), o.name().to_string()) }

fn fq(ns: Option<&str>, name: &str) -> String {
    match ns {
        Some(ns) => format!("{}.{}", ns, name),
        None => name.to_string(),
    }
}

/// Assign uid/resourceVersion the way an API server would; `uid` is kept across updates.
fn stamp_server_fields(st: &mut State, obj: Resource, uid: Option<String>) -> Resource {
    st.next_rv += 1;
    let mut v = obj.into_json();
    let uid = uid
        .or_else(|| v["metadata"]["uid"].as_str().map(str::to_string))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    v["metadata"]["uid"] = json!(uid);
    v["metadata"]["resourceVersion"] = json!(st.next_rv.to_string());
    if v["metadata"].get("creationTimestamp").is_none() {
        v["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
    }
    match Resource::from_json(v) {
        Ok(r) => r,
        Err(_) => unreachable!("identity fields are preserved"),
    }
}

/// `a=b,c!=d,e` selectors; enough for namespace filtering.
fn matches_selector(o: &Resource, selector: Option<&str>) -> bool {
    let Some(sel) = selector else { return true };
    sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            o.label(k.trim()) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once('=') {
            o.label(k.trim().trim_end_matches('=')) == Some(v.trim())
        } else if let Some(k) = term.strip_prefix('!') {
            o.label(k).is_none()
        } else {
            o.label(term).is_some()
        }
    })
}

#[async_trait::async_trait]
impl Discovery for MemoryCluster {
    async fn server_version(&self) -> Result<ServerVersion, ApiError> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.version)
    }

    async fn server_resources(&self) -> Result<Vec<KindInfo>, ApiError> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.kinds.clone())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryCluster {
    async fn get(&self, kind: &KindInfo, ns: Option<&str>, name: &str) -> Result<Resource, ApiError> {
        self.lock()
            .objects
            .get(&Self::key(kind, ns, name))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{} {:?} not found", kind.plural, name)))
    }

    async fn create(&self, kind: &KindInfo, ns: Option<&str>, obj: &Resource) -> Result<Resource, ApiError> {
        let key = Self::key(kind, ns, obj.name());
        let mut st = self.lock();
        if st.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists(format!("{} {:?} already exists", kind.plural, obj.name())));
        }
        let mut obj = obj.clone();
        if let Some(ns) = &key.1 {
            obj.set_namespace(ns);
        }
        let stored = stamp_server_fields(&mut st, obj, None);
        st.calls.push(format!("create {} {}", kind.plural, fq(key.1.as_deref(), &key.2)));
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, kind: &KindInfo, ns: Option<&str>, name: &str, patch: &Json) -> Result<Resource, ApiError> {
        let key = Self::key(kind, ns, name);
        let mut st = self.lock();
        let current = st
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{} {:?} not found", kind.plural, name)))?;
        let uid = current.uid().map(str::to_string);
        let mut doc = current.into_json();
        json_patch::merge(&mut doc, patch);
        let patched = Resource::from_json(doc).map_err(|e| ApiError::Other(e.into()))?;
        let stored = stamp_server_fields(&mut st, patched, uid);
        st.calls.push(format!("patch {} {}", kind.plural, fq(key.1.as_deref(), &key.2)));
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: &KindInfo, ns: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<(), ApiError> {
        let key = Self::key(kind, ns, name);
        let mut st = self.lock();
        let current = st
            .objects
            .get(&key)
            .ok_or_else(|| ApiError::NotFound(format!("{} {:?} not found", kind.plural, name)))?;
        if let Some(want) = &opts.uid {
            if current.uid() != Some(want.as_str()) {
                return Err(ApiError::Conflict(format!("precondition failed: uid {} does not match", want)));
            }
        }
        st.calls.push(format!("delete {} {} ({:?})", kind.plural, fq(key.1.as_deref(), &key.2), opts.propagation));
        st.objects.remove(&key);
        Ok(())
    }

    async fn list(&self, kind: &KindInfo, ns: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Resource>, ApiError> {
        let st = self.lock();
        if st.forbidden.contains(&(kind.gvk.kind.clone(), ns.map(str::to_string))) {
            return Err(ApiError::Forbidden(format!("cannot list {} in {:?}", kind.plural, ns)));
        }
        Ok(st
            .objects
            .iter()
            .filter(|((gvk, ons, _), _)| gvk == &kind.gvk && (ns.is_none() || ons.as_deref() == ns))
            .map(|(_, o)| o.clone())
            .filter(|o| matches_selector(o, label_selector))
            .collect())
    }
}
