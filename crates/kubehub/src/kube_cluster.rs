use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use kcfg_core::{ApiError, Gvk, Resource, Scope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{self, Discovery as KubeDiscovery},
    Client, Config,
};
use metrics::histogram;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::{DeleteOptions, Discovery, KindInfo, Propagation, ServerVersion, Transport};

/// Live cluster reached through kube-rs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Build a client from an explicit kubeconfig and/or context, else the inferred default.
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")?
            }
            None if context.is_some() => Config::from_kubeconfig(&opts).await.context("loading kubeconfig")?,
            None => Config::infer().await.context("inferring cluster config")?,
        };
        info!(cluster_url = %config.cluster_url, ns = %config.default_namespace, "connecting");
        let client = Client::try_from(config).context("building client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client { &self.client }

    /// Namespace configured for the current kubeconfig context.
    pub fn default_namespace(&self) -> &str { self.client.default_namespace() }

    fn api(&self, kind: &KindInfo, ns: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match (kind.scope, ns) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(kind: &KindInfo) -> ApiResource {
    ApiResource {
        group: kind.gvk.group.clone(),
        version: kind.gvk.version.clone(),
        api_version: kind.gvk.api_version(),
        kind: kind.gvk.kind.clone(),
        plural: kind.plural.clone(),
    }
}

fn classify(e: kube::Error) -> ApiError {
    match e {
        kube::Error::Api(ae) => ApiError::from_status(ae.code, &ae.reason, ae.message),
        other => ApiError::Other(other.into()),
    }
}

fn other<E: Into<anyhow::Error>>(e: E) -> ApiError { ApiError::Other(e.into()) }

/// Lists omit per-item type metadata, so it is stamped back from the kind.
fn to_resource(kind: &KindInfo, o: &DynamicObject) -> Result<Resource, ApiError> {
    let mut v = serde_json::to_value(o).map_err(other)?;
    if let Some(m) = v.as_object_mut() {
        m.insert("apiVersion".into(), Json::String(kind.gvk.api_version()));
        m.insert("kind".into(), Json::String(kind.gvk.kind.clone()));
    }
    Resource::from_json(v).map_err(other)
}

fn to_dynamic(obj: &Resource) -> Result<DynamicObject, ApiError> { serde_json::from_value(obj.to_json()).map_err(other) }

#[async_trait::async_trait]
impl Discovery for KubeCluster {
    async fn server_version(&self) -> Result<ServerVersion, ApiError> {
        let info = self.client.apiserver_version().await.map_err(classify)?;
        let v = ServerVersion::parse(&info.major, &info.minor, &info.git_version)?;
        debug!(version = %v, git = %info.git_version, "server version");
        Ok(v)
    }

    async fn server_resources(&self) -> Result<Vec<KindInfo>, ApiError> {
        let t0 = Instant::now();
        let disco = KubeDiscovery::new(self.client.clone()).run().await.map_err(classify)?;
        let mut out = Vec::new();
        for group in disco.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let scope = match caps.scope {
                        discovery::Scope::Namespaced => Scope::Namespaced,
                        discovery::Scope::Cluster => Scope::Cluster,
                    };
                    out.push(KindInfo {
                        gvk: Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()),
                        plural: ar.plural.clone(),
                        scope,
                        verbs: caps.operations.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.gvk.cmp(&b.gvk));
        histogram!("discovery_latency_ms", t0.elapsed().as_millis() as f64);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Transport for KubeCluster {
    async fn get(&self, kind: &KindInfo, ns: Option<&str>, name: &str) -> Result<Resource, ApiError> {
        let o = self.api(kind, ns).get(name).await.map_err(classify)?;
        to_resource(kind, &o)
    }

    async fn create(&self, kind: &KindInfo, ns: Option<&str>, obj: &Resource) -> Result<Resource, ApiError> {
        let o = self.api(kind, ns).create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(classify)?;
        to_resource(kind, &o)
    }

    async fn patch(&self, kind: &KindInfo, ns: Option<&str>, name: &str, patch: &Json) -> Result<Resource, ApiError> {
        let o = self
            .api(kind, ns)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(classify)?;
        to_resource(kind, &o)
    }

    async fn delete(&self, kind: &KindInfo, ns: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<(), ApiError> {
        let dp = DeleteParams {
            grace_period_seconds: opts.grace_period,
            propagation_policy: Some(match opts.propagation {
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Background => PropagationPolicy::Background,
            }),
            preconditions: opts.uid.as_ref().map(|uid| Preconditions { uid: Some(uid.clone()), resource_version: None }),
            ..Default::default()
        };
        self.api(kind, ns).delete(name, &dp).await.map_err(classify)?;
        Ok(())
    }

    async fn list(&self, kind: &KindInfo, ns: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Resource>, ApiError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self.api(kind, ns).list(&lp).await.map_err(classify)?;
        list.items.iter().map(|o| to_resource(kind, o)).collect()
    }
}
