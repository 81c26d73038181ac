#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use kcfg_core::Resource;
use kcfg_kubehub::{MemoryCluster, Session};
use kcfg_schema::{run_validate, SchemaSource, Validator};
use serde_json::{json, Value as Json};

/// Core group document trimmed to ConfigMap and the metadata it references.
struct CoreOnly;

#[async_trait::async_trait]
impl SchemaSource for CoreOnly {
    async fn openapi_v3(&self, api_version: &str) -> Result<Option<Json>> {
        match api_version {
            "v1" => Ok(Some(core_v1())),
            "broken/v1" => bail!("connection reset"),
            _ => Ok(None),
        }
    }
}

fn core_v1() -> Json {
    json!({"components": {"schemas": {
        "io.k8s.api.core.v1.ConfigMap": {
            "type": "object",
            "properties": {
                "apiVersion": {"type": "string"},
                "kind": {"type": "string"},
                "metadata": {"allOf": [{"$ref": "#/components/schemas/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"}], "default": {}},
                "data": {"type": "object", "additionalProperties": {"type": "string", "default": ""}},
                "immutable": {"type": "boolean"},
            },
            "x-kubernetes-group-version-kind": [{"group": "", "kind": "ConfigMap", "version": "v1"}],
        },
        "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta": {
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "namespace": {"type": "string"},
                "labels": {"type": "object", "additionalProperties": {"type": "string"}},
                "annotations": {"type": "object", "additionalProperties": {"type": "string"}},
            },
        },
    }}})
}

fn res(v: Json) -> Resource { Resource::from_json(v).unwrap() }

fn cm(extra: Json) -> Resource {
    let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "default"}});
    if let (Some(m), Some(e)) = (v.as_object_mut(), extra.as_object()) {
        m.extend(e.clone());
    }
    res(v)
}

#[tokio::test]
async fn well_formed_object_passes_even_with_null_fields() {
    let source = CoreOnly;
    let mut validator = Validator::new(&source);
    let mut obj = cm(json!({"data": {"a": "1"}})).into_json();
    obj["metadata"]["creationTimestamp"] = Json::Null;
    assert_eq!(validator.problems(&res(obj)).await.unwrap(), Some(vec![]));
}

#[tokio::test]
async fn unknown_fields_and_wrong_types_are_all_reported() {
    let source = CoreOnly;
    let mut validator = Validator::new(&source);
    let obj = cm(json!({"dta": {"a": "1"}, "data": {"n": 5}, "immutable": "yes"}));
    let problems = validator.problems(&obj).await.unwrap().unwrap();
    assert_eq!(problems.len(), 3, "{:?}", problems);
    assert!(problems.contains(&r#"unknown field "dta" at /"#.to_string()), "{:?}", problems);
    assert!(problems.iter().any(|p| p.starts_with("wrong type at /data/n:")), "{:?}", problems);
    assert!(problems.iter().any(|p| p.starts_with("wrong type at /immutable:")), "{:?}", problems);

    let mut typo = cm(json!({})).into_json();
    typo["metadata"]["lables"] = json!({"a": "b"});
    let problems = validator.problems(&res(typo)).await.unwrap().unwrap();
    assert_eq!(problems, vec![r#"unknown field "lables" at /metadata"#.to_string()]);
}

#[tokio::test]
async fn run_validate_skips_known_kinds_without_schema() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let secret = res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}}));
    let deploy = res(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}}));

    let report = run_validate(&session, &CoreOnly, &[cm(json!({"data": {}})), secret, deploy]).await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.skipped.len(), 2);
}

#[tokio::test]
async fn run_validate_checks_every_object_before_failing() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let objs = vec![
        cm(json!({"bogus": true})),
        res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}})),
        res(json!({"apiVersion": "broken/v1", "kind": "Thing", "metadata": {"name": "t"}})),
    ];
    let err = run_validate(&session, &CoreOnly, &objs).await.unwrap_err();
    assert_eq!(err.to_string(), "validation failed");
}
