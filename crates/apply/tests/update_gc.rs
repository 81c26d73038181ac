#![forbid(unsafe_code)]

use kcfg_apply::{update, GcListMode, Outcome, UpdateOptions};
use kcfg_core::{
    ApiError, Gvk, RankTable, Resource, ANNOTATION_GC_STRATEGY, ANNOTATION_GC_TAG, ANNOTATION_LAST_APPLIED, LABEL_GC_TAG,
};
use kcfg_diff::{run_diff, DiffStrategy};
use kcfg_kubehub::{DeleteOptions, Discovery, KindInfo, MemoryCluster, ServerVersion, Session, Transport};
use serde_json::{json, Value};

fn res(v: Value) -> Resource { Resource::from_json(v).unwrap() }

fn cm(ns: &str, name: &str) -> Resource {
    res(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": ns},
        "data": {"key": name},
    }))
}

fn tagged(tag: &str) -> UpdateOptions { UpdateOptions { gc_tag: Some(tag.to_string()), ..Default::default() } }

fn configmap_gvk() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

#[tokio::test]
async fn applied_objects_carry_tag_and_snapshot() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let report = update(&session, vec![cm("myns", "new")], &tagged("T"), &RankTable::default()).await.unwrap();
    assert_eq!(report.applied[0].1, Outcome::Created);

    let live = cluster.lookup(&configmap_gvk(), Some("myns"), "new").unwrap();
    assert_eq!(live.annotation(ANNOTATION_GC_TAG), Some("T"));
    assert_eq!(live.label(LABEL_GC_TAG), Some("T"));
    assert!(live.annotation(ANNOTATION_LAST_APPLIED).unwrap().starts_with("H4sI"));
    assert_eq!(report.gc.unwrap().deleted.len(), 0);
}

#[tokio::test]
async fn objects_dropped_from_input_are_collected() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let table = RankTable::default();
    update(&session, vec![cm("myns", "new"), cm("myns", "keep")], &tagged("T"), &table).await.unwrap();

    let report = update(&session, vec![cm("myns", "keep")], &tagged("T"), &table).await.unwrap();
    assert_eq!(report.applied, vec![(cm("myns", "keep").identity(), Outcome::Unchanged)]);
    let gc = report.gc.unwrap();
    assert_eq!(gc.deleted, vec![cm("myns", "new").identity()]);
    assert!(cluster.lookup(&configmap_gvk(), Some("myns"), "new").is_none());
    assert!(cluster.lookup(&configmap_gvk(), Some("myns"), "keep").is_some());
    assert!(cluster.calls().last().unwrap().starts_with("delete configmaps myns.new (Foreground)"));
}

#[tokio::test]
async fn skip_gc_and_dry_run_preserve_objects() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let table = RankTable::default();
    update(&session, vec![cm("myns", "new")], &tagged("T"), &table).await.unwrap();

    let skip = UpdateOptions { skip_gc: true, ..tagged("T") };
    let report = update(&session, vec![], &skip, &table).await.unwrap();
    assert!(report.gc.is_none());
    assert!(cluster.lookup(&configmap_gvk(), Some("myns"), "new").is_some());

    let calls_before = cluster.calls().len();
    let dry = UpdateOptions { dry_run: true, ..tagged("T") };
    let report = update(&session, vec![cm("myns", "other")], &dry, &table).await.unwrap();
    assert_eq!(report.applied[0].1, Outcome::Created);
    assert_eq!(report.gc.unwrap().would_delete, vec![cm("myns", "new").identity()]);
    assert!(cluster.lookup(&configmap_gvk(), Some("myns"), "new").is_some());
    assert!(cluster.lookup(&configmap_gvk(), Some("myns"), "other").is_none());
    assert_eq!(cluster.calls().len(), calls_before);
}

#[tokio::test]
async fn duplicates_are_rejected_before_any_mutation() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let err = update(&session, vec![cm("myns", "foo"), cm("myns", "foo")], &tagged("T"), &RankTable::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), r#"duplicate resource /v1, Kind=ConfigMap, "myns", "foo""#);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn invalid_tag_is_rejected() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let err = update(&session, vec![cm("myns", "foo")], &tagged("not a label!"), &RankTable::default())
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("invalid --gc-tag"));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn ignored_owned_and_foreign_objects_survive_gc() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");

    let mut ignored = cm("myns", "ignored");
    ignored.set_annotation(ANNOTATION_GC_TAG, "T");
    ignored.set_annotation(ANNOTATION_GC_STRATEGY, "ignore");
    cluster.insert(ignored);

    let mut owned = cm("myns", "owned").into_json();
    owned["metadata"]["annotations"] = json!({ANNOTATION_GC_TAG: "T"});
    owned["metadata"]["ownerReferences"] =
        json!([{"apiVersion": "apps/v1", "kind": "Deployment", "name": "d", "uid": "x", "controller": true}]);
    cluster.insert(res(owned));

    let mut foreign = cm("myns", "foreign");
    foreign.set_annotation(ANNOTATION_GC_TAG, "U");
    cluster.insert(foreign);

    let mut legacy = cm("myns", "legacy");
    legacy.set_label(LABEL_GC_TAG, "T");
    cluster.insert(legacy);

    let report = update(&session, vec![], &tagged("T"), &RankTable::default()).await.unwrap();
    let gc = report.gc.unwrap();
    assert_eq!(gc.deleted, vec![cm("myns", "legacy").identity()]);
    assert_eq!(gc.considered, 4);
    for name in ["ignored", "owned", "foreign"] {
        assert!(cluster.lookup(&configmap_gvk(), Some("myns"), name).is_some(), "{}", name);
    }
}

#[tokio::test]
async fn per_namespace_listing_skips_forbidden_namespaces() {
    let cluster = MemoryCluster::new();
    for (ns, team) in [("a", "x"), ("b", "x"), ("c", "y")] {
        let mut n = res(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": ns}}));
        n.set_label("team", team);
        cluster.insert(n);
        let mut stale = cm(ns, "stale");
        stale.set_annotation(ANNOTATION_GC_TAG, "T");
        cluster.insert(stale);
    }
    cluster.forbid_list("ConfigMap", Some("a"));
    cluster.forbid_list("ConfigMap", None);
    let session = Session::over(&cluster, "default");

    let opts = UpdateOptions { gc_list_mode: GcListMode::PerNamespace, gc_ns_selector: Some("team=x".into()), ..tagged("T") };
    let report = update(&session, vec![], &opts, &RankTable::default()).await.unwrap();
    let gc = report.gc.unwrap();
    assert_eq!(gc.forbidden_lists, 1);
    assert_eq!(gc.deleted, vec![cm("b", "stale").identity()]);
    assert!(cluster.lookup(&configmap_gvk(), Some("a"), "stale").is_some());
    // outside the selector
    assert!(cluster.lookup(&configmap_gvk(), Some("c"), "stale").is_some());
}

#[tokio::test]
async fn forbidden_cluster_wide_list_is_not_fatal() {
    let cluster = MemoryCluster::new();
    let mut stale = cm("a", "stale");
    stale.set_annotation(ANNOTATION_GC_TAG, "T");
    cluster.insert(stale);
    cluster.forbid_list("ConfigMap", None);
    let session = Session::over(&cluster, "default");

    let report = update(&session, vec![], &tagged("T"), &RankTable::default()).await.unwrap();
    let gc = report.gc.unwrap();
    assert_eq!(gc.forbidden_lists, 1);
    assert!(gc.deleted.is_empty());
}

#[tokio::test]
async fn patch_keeps_foreign_fields_and_drops_removed_ones() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let table = RankTable::default();
    let first = res(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "cfg", "namespace": "ns"},
        "data": {"a": "1", "b": "2"},
    }));
    update(&session, vec![first], &UpdateOptions::default(), &table).await.unwrap();

    let stored = cluster.lookup(&configmap_gvk(), Some("ns"), "cfg").unwrap();
    let mut foreign = stored.into_json();
    foreign["data"]["c"] = json!("3");
    cluster.insert(res(foreign));

    let second = res(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "cfg", "namespace": "ns"},
        "data": {"a": "10"},
    }));
    let report = update(&session, vec![second], &UpdateOptions::default(), &table).await.unwrap();
    assert_eq!(report.applied[0].1, Outcome::Patched);
    assert!(report.gc.is_none());
    let live = cluster.lookup(&configmap_gvk(), Some("ns"), "cfg").unwrap();
    assert_eq!(live.to_json()["data"], json!({"a": "10", "c": "3"}));
}

#[tokio::test]
async fn create_disabled_and_unknown_kinds() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let table = RankTable::default();

    let no_create = UpdateOptions { create: false, ..Default::default() };
    let err = update(&session, vec![cm("ns", "x")], &no_create, &table).await.unwrap_err();
    assert!(format!("{:#}", err).contains("error updating configmaps ns.x"));

    let widget = res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));
    assert!(update(&session, vec![widget.clone()], &UpdateOptions::default(), &table).await.is_err());
    let lenient = UpdateOptions { ignore_unknown: true, ..Default::default() };
    let report = update(&session, vec![widget, cm("ns", "y")], &lenient, &table).await.unwrap();
    assert_eq!(report.skipped_unknown, 1);
    assert_eq!(report.applied.len(), 1);
}

#[tokio::test]
async fn default_namespace_is_filled_in_and_old_servers_get_background_deletes() {
    let cluster = MemoryCluster::new().with_version(ServerVersion::new(1, 5));
    let session = Session::over(&cluster, "team");
    let table = RankTable::default();
    let bare = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}}));
    update(&session, vec![bare], &tagged("T"), &table).await.unwrap();
    assert!(cluster.lookup(&configmap_gvk(), Some("team"), "x").is_some());

    update(&session, vec![], &tagged("T"), &table).await.unwrap();
    assert_eq!(cluster.calls().last().map(String::as_str), Some("delete configmaps team.x (Background)"));
}

#[tokio::test]
async fn objects_are_applied_in_dependency_order() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    let objs = vec![
        res(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "app"}})),
        cm("app", "conf"),
        res(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "app"}})),
    ];
    update(&session, objs, &UpdateOptions::default(), &RankTable::default()).await.unwrap();
    assert_eq!(
        cluster.calls(),
        vec!["create namespaces app", "create configmaps app.conf", "create deployments app.web"]
    );
}

#[tokio::test]
async fn tagged_update_has_no_last_applied_differences() {
    let cluster = MemoryCluster::new();
    let session = Session::over(&cluster, "default");
    update(&session, vec![cm("ns", "a")], &tagged("T"), &RankTable::default()).await.unwrap();

    let mut out = Vec::new();
    run_diff(&session, vec![cm("ns", "a")], DiffStrategy::LastApplied, &mut out).await.unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "*** configmaps ns.a has no differences\n");
}

fn stale(v: Value) -> Resource {
    let mut o = res(v);
    o.set_annotation(ANNOTATION_GC_TAG, "T");
    o
}

#[tokio::test]
async fn garbage_is_deleted_dependents_first() {
    let cluster = MemoryCluster::new();
    cluster.insert(stale(json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": "w"}})));
    cluster.insert(stale(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "app"}})));
    cluster.insert(stale(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d", "namespace": "app"}})));
    cluster.insert(stale(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "app"}})));
    let session = Session::over(&cluster, "default");

    let report = update(&session, vec![], &tagged("T"), &RankTable::default()).await.unwrap();
    assert_eq!(report.gc.unwrap().deleted.len(), 4);
    assert_eq!(
        cluster.calls(),
        vec![
            "delete deployments app.d (Foreground)",
            "delete configmaps app.c (Foreground)",
            "delete namespaces app (Foreground)",
            "delete customresourcedefinitions w (Foreground)",
        ]
    );
}

/// Another client recreates `replaced` and removes `vanished` while we collect.
struct Racing(MemoryCluster);

#[async_trait::async_trait]
impl Discovery for Racing {
    async fn server_version(&self) -> Result<ServerVersion, ApiError> { self.0.server_version().await }

    async fn server_resources(&self) -> Result<Vec<KindInfo>, ApiError> { self.0.server_resources().await }
}

#[async_trait::async_trait]
impl Transport for Racing {
    async fn get(&self, kind: &KindInfo, ns: Option<&str>, name: &str) -> Result<Resource, ApiError> {
        self.0.get(kind, ns, name).await
    }

    async fn create(&self, kind: &KindInfo, ns: Option<&str>, obj: &Resource) -> Result<Resource, ApiError> {
        self.0.create(kind, ns, obj).await
    }

    async fn patch(&self, kind: &KindInfo, ns: Option<&str>, name: &str, patch: &Value) -> Result<Resource, ApiError> {
        self.0.patch(kind, ns, name, patch).await
    }

    async fn delete(&self, kind: &KindInfo, ns: Option<&str>, name: &str, opts: &DeleteOptions) -> Result<(), ApiError> {
        match name {
            "replaced" => {
                let mut fresh = self.0.get(kind, ns, name).await?.into_json();
                fresh["metadata"]["uid"] = Value::Null;
                fresh["metadata"]["labels"] = json!({"generation": "second"});
                self.0.delete(kind, ns, name, &DeleteOptions { uid: None, ..opts.clone() }).await?;
                self.0.insert(res(fresh));
            }
            "vanished" => self.0.delete(kind, ns, name, &DeleteOptions { uid: None, ..opts.clone() }).await?,
            _ => {}
        }
        self.0.delete(kind, ns, name, opts).await
    }

    async fn list(&self, kind: &KindInfo, ns: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Resource>, ApiError> {
        self.0.list(kind, ns, label_selector).await
    }
}

#[tokio::test]
async fn objects_changed_under_gc_count_as_raced() {
    let racing = Racing(MemoryCluster::new());
    for name in ["replaced", "vanished", "gone"] {
        let mut o = cm("myns", name);
        o.set_annotation(ANNOTATION_GC_TAG, "T");
        racing.0.insert(o);
    }
    let session = Session::over(&racing, "default");

    let report = update(&session, vec![], &tagged("T"), &RankTable::default()).await.unwrap();
    let gc = report.gc.unwrap();
    assert_eq!(gc.raced, 2);
    assert_eq!(gc.deleted, vec![cm("myns", "gone").identity()]);

    let survivor = racing.0.lookup(&configmap_gvk(), Some("myns"), "replaced").unwrap();
    assert_eq!(survivor.label("generation"), Some("second"));
    assert!(racing.0.lookup(&configmap_gvk(), Some("myns"), "vanished").is_none());
}
