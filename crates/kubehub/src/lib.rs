//! kcfg kubehub – discovery and transport against the cluster API

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use kcfg_core::{ApiError, Gvk, Resource, Scope};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

mod kube_cluster;
pub mod memory;

pub use kube_cluster::KubeCluster;
pub use memory::MemoryCluster;

/// What discovery knows about one served kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindInfo {
    pub gvk: Gvk,
    pub plural: String,
    pub scope: Scope,
    pub verbs: Vec<String>,
}

impl KindInfo {
    pub fn new(gvk: Gvk, plural: &str, scope: Scope, verbs: &[&str]) -> Self {
        Self { gvk, plural: plural.to_string(), scope, verbs: verbs.iter().map(|v| v.to_string()).collect() }
    }

    pub fn supports(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb) }

    pub fn namespaced(&self) -> bool { self.scope == Scope::Namespaced }
}

pub const VERBS_ALL: &[&str] = &["create", "delete", "get", "list", "patch", "update", "watch"];

/// API server version, reduced to what delete-option dialects depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self { Self { major, minor } }

    /// Parse the version info reported by the server. `major`/`minor` win when both are
    /// present (`minor` may carry a `+` suffix); otherwise `git_version` (`v1.8.0`) is used.
    pub fn parse(major: &str, minor: &str, git_version: &str) -> Result<Self> {
        if !major.is_empty() && !minor.is_empty() {
            let ma = major.parse::<u32>().map_err(|_| anyhow!("unable to parse major version {:?}", major))?;
            let mi = minor
                .trim_end_matches('+')
                .parse::<u32>()
                .map_err(|_| anyhow!("unable to parse minor version {:?}", minor))?;
            return Ok(Self::new(ma, mi));
        }
        let bad = || anyhow!("unable to parse server version {:?}", git_version);
        let mut parts = git_version.strip_prefix('v').ok_or_else(bad)?.split('.');
        let ma = parts.next().and_then(|s| s.parse::<u32>().ok()).ok_or_else(bad)?;
        let mi = parts.next().and_then(|s| s.parse::<u32>().ok()).ok_or_else(bad)?;
        Ok(Self::new(ma, mi))
    }

    /// `self` relative to `major.minor`.
    pub fn compare(&self, major: u32, minor: u32) -> Ordering { (self.major, self.minor).cmp(&(major, minor)) }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}.{}", self.major, self.minor) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Refuse the delete unless the live object still has this UID.
    pub uid: Option<String>,
    pub propagation: Propagation,
    pub grace_period: Option<u32>,
}

impl DeleteOptions {
    /// Servers before 1.6 only understand the legacy orphan flag; background is the closest fit.
    pub fn for_version(v: ServerVersion) -> Self {
        let propagation = if v.compare(1, 6) == Ordering::Less { Propagation::Background } else { Propagation::Foreground };
        Self { uid: None, propagation, grace_period: None }
    }

    pub fn with_uid(mut self, uid: Option<&str>) -> Self {
        self.uid = uid.map(str::to_string);
        self
    }
}

#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    async fn server_version(&self) -> Result<ServerVersion, ApiError>;
    async fn server_resources(&self) -> Result<Vec<KindInfo>, ApiError>;
}

/// Object-level calls against one kind. `ns` is `None` for cluster-scoped kinds
/// (and, for `list`, to span all namespaces).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, kind: &KindInfo, ns: Option<&str>, name: &str) -> Result<Resource, ApiError>;
    async fn create(&self, kind: &KindInfo, ns: Option<&str>, obj: &Resource) -> Result<Resource, ApiError>;
    /// JSON merge patch.
    async fn patch(&self, kind: &KindInfo, ns: Option<&str>, name: &str, patch: &serde_json::Value) -> Result<Resource, ApiError>;
    async fn delete(&self, kind: &KindInfo, ns: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<(), ApiError>;
    /// Returned items always carry `apiVersion` and `kind`.
    async fn list(&self, kind: &KindInfo, ns: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Resource>, ApiError>;
}

/// Discovery results memoized for one invocation.
pub struct CachedDiscovery<'a> {
    inner: &'a dyn Discovery,
    version: OnceCell<ServerVersion>,
    kinds: OnceCell<Vec<KindInfo>>,
}

impl<'a> CachedDiscovery<'a> {
    pub fn new(inner: &'a dyn Discovery) -> Self { Self { inner, version: OnceCell::new(), kinds: OnceCell::new() } }

    pub async fn server_version(&self) -> Result<ServerVersion, ApiError> {
        self.version.get_or_try_init(|| self.inner.server_version()).await.copied()
    }

    pub async fn server_resources(&self) -> Result<&[KindInfo], ApiError> {
        let kinds = self
            .kinds
            .get_or_try_init(|| async {
                let kinds = self.inner.server_resources().await?;
                debug!(kinds = kinds.len(), "discovery complete");
                Ok::<_, ApiError>(kinds)
            })
            .await?;
        Ok(kinds.as_slice())
    }

    pub async fn kind_info(&self, gvk: &Gvk) -> Result<Option<KindInfo>, ApiError> {
        Ok(self.server_resources().await?.iter().find(|k| &k.gvk == gvk).cloned())
    }
}

/// Per-invocation context threaded through every command.
pub struct Session<'a> {
    pub discovery: CachedDiscovery<'a>,
    pub transport: &'a dyn Transport,
    pub default_namespace: String,
}

impl<'a> Session<'a> {
    pub fn new(discovery: &'a dyn Discovery, transport: &'a dyn Transport, default_namespace: impl Into<String>) -> Self {
        Self { discovery: CachedDiscovery::new(discovery), transport, default_namespace: default_namespace.into() }
    }

    /// Session over a single object implementing both collaborators.
    pub fn over<C: Discovery + Transport>(cluster: &'a C, default_namespace: impl Into<String>) -> Self {
        Self::new(cluster, cluster, default_namespace)
    }

    /// Kind metadata for `gvk`; unknown kinds are an error.
    pub async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo> {
        self.discovery
            .kind_info(gvk)
            .await?
            .ok_or_else(|| anyhow!("unable to find resource kind {} on the server", gvk))
    }

    /// Namespace the object lives in: its own, the session default for namespaced
    /// kinds, or `None` for cluster-scoped kinds.
    pub fn target_namespace(&self, kind: &KindInfo, obj: &Resource) -> Option<String> {
        match kind.scope {
            Scope::Cluster => None,
            Scope::Namespaced => Some(obj.namespace().unwrap_or(&self.default_namespace).to_string()),
        }
    }

    /// Scope lookup table for ordering.
    pub async fn scopes(&self) -> Result<FxHashMap<Gvk, Scope>> {
        Ok(self.discovery.server_resources().await?.iter().map(|k| (k.gvk.clone(), k.scope)).collect())
    }

    /// `configmaps myns.foo` style description used in every log line and error.
    pub async fn describe(&self, obj: &Resource) -> String {
        let plural = match self.discovery.kind_info(&obj.gvk()).await {
            Ok(Some(k)) => k.plural,
            _ => obj.kind().to_lowercase(),
        };
        format!("{} {}", plural, obj.fq_name())
    }
}
