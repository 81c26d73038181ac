//! kcfg schema: structural validation of rendered objects against the OpenAPI v3
//! documents the server publishes per group/version.
//!
//! Schemas are closed before compiling (undeclared fields are rejected unless the
//! schema preserves unknown fields), so typos surface as "unknown field" problems.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use jsonschema::{error::ValidationErrorKind, Draft, JSONSchema, ValidationError};
use kcfg_core::{Gvk, ObjectIdentity, Resource};
use kcfg_kubehub::{KubeCluster, Session};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, warn};

/// Where OpenAPI v3 documents come from.
#[async_trait::async_trait]
pub trait SchemaSource: Send + Sync {
    /// Document for `api_version` (`v1`, `apps/v1`), `None` when the server publishes none.
    async fn openapi_v3(&self, api_version: &str) -> Result<Option<Json>>;
}

fn openapi_path(api_version: &str) -> String {
    if api_version.contains('/') {
        format!("/openapi/v3/apis/{}", api_version)
    } else {
        format!("/openapi/v3/api/{}", api_version)
    }
}

#[async_trait::async_trait]
impl SchemaSource for KubeCluster {
    async fn openapi_v3(&self, api_version: &str) -> Result<Option<Json>> {
        let path = openapi_path(api_version);
        debug!(%path, "fetching schema");
        let req = http::Request::get(path.as_str()).body(Vec::new()).context("building schema request")?;
        match self.client().request::<Json>(req).await {
            Ok(doc) => Ok(Some(doc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e).with_context(|| format!("fetching {}", path)),
        }
    }
}

/// Close every object schema that declares `properties` without saying anything
/// about additional ones. Walks schema positions only, so defaults and examples
/// are left untouched.
pub fn tighten(schema: &mut Json) {
    let Some(m) = schema.as_object_mut() else { return };
    let preserves = m.get("x-kubernetes-preserve-unknown-fields").and_then(Json::as_bool).unwrap_or(false);
    if m.contains_key("properties") && !m.contains_key("additionalProperties") && !preserves {
        m.insert("additionalProperties".into(), Json::Bool(false));
    }
    for (k, v) in m.iter_mut() {
        match k.as_str() {
            "properties" | "patternProperties" | "definitions" => {
                if let Some(children) = v.as_object_mut() {
                    children.values_mut().for_each(tighten);
                }
            }
            "allOf" | "anyOf" | "oneOf" => {
                if let Some(branches) = v.as_array_mut() {
                    branches.iter_mut().for_each(tighten);
                }
            }
            "items" | "additionalProperties" | "not" => match v {
                Json::Array(a) => a.iter_mut().for_each(tighten),
                other => tighten(other),
            },
            _ => {}
        }
    }
}

/// Server-side tooling renders unset fields as `null`; schemas never allow it.
pub fn prune_nulls(v: &mut Json) {
    match v {
        Json::Object(m) => {
            m.retain(|_, x| !x.is_null());
            m.values_mut().for_each(prune_nulls);
        }
        Json::Array(a) => a.iter_mut().for_each(prune_nulls),
        _ => {}
    }
}

/// Key under `components.schemas` describing `gvk`.
fn definition_for(doc: &Json, gvk: &Gvk) -> Option<String> {
    let schemas = doc.get("components")?.get("schemas")?.as_object()?;
    let field = |g: &Json, k: &str| g.get(k).and_then(Json::as_str).unwrap_or("").to_string();
    schemas
        .iter()
        .find(|(_, s)| {
            s.get("x-kubernetes-group-version-kind").and_then(Json::as_array).map_or(false, |gvks| {
                gvks.iter().any(|g| field(g, "group") == gvk.group && field(g, "version") == gvk.version && field(g, "kind") == gvk.kind)
            })
        })
        .map(|(k, _)| k.clone())
}

fn describe_error(e: ValidationError<'_>) -> Vec<String> {
    let at = match e.instance_path.to_string() {
        p if p.is_empty() => "/".to_string(),
        p => p,
    };
    match &e.kind {
        ValidationErrorKind::AdditionalProperties { unexpected } => {
            unexpected.iter().map(|f| format!("unknown field {:?} at {}", f, at)).collect()
        }
        ValidationErrorKind::Type { .. } => vec![format!("wrong type at {}: {}", at, e)],
        _ => vec![format!("{}: {}", at, e)],
    }
}

/// Compiles and caches one schema per kind, fetching each group/version document once.
pub struct Validator<'a> {
    source: &'a dyn SchemaSource,
    documents: FxHashMap<String, Option<Json>>,
    compiled: FxHashMap<Gvk, Option<JSONSchema>>,
}

impl<'a> Validator<'a> {
    pub fn new(source: &'a dyn SchemaSource) -> Self {
        Self { source, documents: FxHashMap::default(), compiled: FxHashMap::default() }
    }

    async fn compile(&mut self, gvk: &Gvk) -> Result<Option<JSONSchema>> {
        let api_version = gvk.api_version();
        if !self.documents.contains_key(&api_version) {
            let doc = self.source.openapi_v3(&api_version).await?.map(|mut d| {
                if let Some(schemas) = d.pointer_mut("/components/schemas").and_then(Json::as_object_mut) {
                    schemas.values_mut().for_each(tighten);
                }
                d
            });
            self.documents.insert(api_version.clone(), doc);
        }
        let Some(doc) = self.documents.get(&api_version).and_then(Option::as_ref) else { return Ok(None) };
        let Some(key) = definition_for(doc, gvk) else {
            debug!(%gvk, "no definition in schema document");
            return Ok(None);
        };
        let root = json!({
            "$ref": format!("#/components/schemas/{}", key),
            "components": doc["components"].clone(),
        });
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&root)
            .map_err(|e| anyhow!("compiling schema {}: {}", key, e))?;
        Ok(Some(compiled))
    }

    /// Every problem found in `obj`; `None` when no schema is published for its kind.
    pub async fn problems(&mut self, obj: &Resource) -> Result<Option<Vec<String>>> {
        let gvk = obj.gvk();
        if !self.compiled.contains_key(&gvk) {
            let schema = self.compile(&gvk).await?;
            self.compiled.insert(gvk.clone(), schema);
        }
        let Some(schema) = self.compiled.get(&gvk).and_then(Option::as_ref) else { return Ok(None) };
        let mut instance = obj.to_json();
        prune_nulls(&mut instance);
        let found = match schema.validate(&instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.flat_map(describe_error).collect(),
        };
        Ok(Some(found))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Objects checked against a schema.
    pub checked: usize,
    /// Known kinds whose group/version publishes no schema.
    pub skipped: Vec<ObjectIdentity>,
}

/// Validate every object, logging each problem; fails once all objects were seen.
pub async fn run_validate(session: &Session<'_>, source: &dyn SchemaSource, objs: &[Resource]) -> Result<ValidationReport> {
    let mut validator = Validator::new(source);
    let mut report = ValidationReport::default();
    let mut failed = 0usize;
    for obj in objs {
        let desc = session.describe(obj).await;
        info!("Validating {}", desc);
        let known = session.discovery.kind_info(&obj.gvk()).await?.is_some();
        let problems = match validator.problems(obj).await {
            Ok(Some(p)) => p,
            Ok(None) if known => {
                warn!("Skipping validation of known resource {} {} that lacks a registered schema", obj.api_version(), desc);
                report.skipped.push(obj.identity());
                continue;
            }
            Ok(None) => vec![format!("unable to fetch schema: nothing published for {}", obj.gvk())],
            Err(e) => vec![format!("unable to fetch schema: {:#}", e)],
        };
        report.checked += 1;
        for p in &problems {
            error!("Error in {}: {}", desc, p);
        }
        if !problems.is_empty() {
            failed += 1;
        }
    }
    if failed > 0 {
        debug!(failed, checked = report.checked, "validation summary");
        bail!("validation failed");
    }
    Ok(report)
}
