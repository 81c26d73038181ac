//! kcfg apply: create-or-patch reconciliation, garbage collection and delete.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use kcfg_core::{
    check_duplicates, creation_order, deletion_order, validate_label_value, ApiError, ObjectIdentity, RankTable, Resource,
    ANNOTATION_GC_TAG, LABEL_GC_TAG,
};
use kcfg_diff::{is_noop, original_of, snapshot, three_way_merge_patch};
use kcfg_kubehub::{DeleteOptions, KindInfo, Session};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

pub mod gc;

pub use gc::{collect, GcListMode, GcOptions, GcReport};

/// Objects reconciled during one run.
///
/// Tracked by server UID, which stays stable when an object is served under several
/// kinds or versions and changes when an object is recreated under the same name.
/// Objects without a UID (dry-run creates) are tracked by identity instead.
#[derive(Debug, Default, Clone)]
pub struct Seen {
    uids: FxHashSet<String>,
    unsaved: FxHashSet<ObjectIdentity>,
}

impl Seen {
    pub fn insert(&mut self, obj: &Resource) {
        match obj.uid() {
            Some(uid) => {
                self.uids.insert(uid.to_string());
            }
            None => {
                self.unsaved.insert(obj.identity());
            }
        }
    }

    pub fn contains(&self, obj: &Resource) -> bool {
        obj.uid().map_or(false, |u| self.uids.contains(u)) || self.unsaved.contains(&obj.identity())
    }

    pub fn len(&self) -> usize { self.uids.len() + self.unsaved.len() }

    pub fn is_empty(&self) -> bool { self.uids.is_empty() && self.unsaved.is_empty() }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub create: bool,
    pub gc_tag: Option<String>,
    pub skip_gc: bool,
    pub gc_list_mode: GcListMode,
    pub gc_ns_selector: Option<String>,
    pub dry_run: bool,
    pub ignore_unknown: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            create: true,
            gc_tag: None,
            skip_gc: false,
            gc_list_mode: GcListMode::ClusterScope,
            gc_ns_selector: None,
            dry_run: false,
            ignore_unknown: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Patched,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub applied: Vec<(ObjectIdentity, Outcome)>,
    pub skipped_unknown: usize,
    pub seen: Seen,
    pub gc: Option<GcReport>,
}

fn dry(dry_run: bool) -> &'static str { if dry_run { " (dry-run)" } else { "" } }

/// Kind metadata, or `None` for an unknown kind the caller chose to skip.
async fn kind_for(session: &Session<'_>, obj: &Resource, ignore_unknown: bool) -> Result<Option<KindInfo>> {
    match session.discovery.kind_info(&obj.gvk()).await? {
        Some(k) => Ok(Some(k)),
        None if ignore_unknown => {
            warn!(gvk = %obj.gvk(), name = %obj.fq_name(), "skipping object of unknown kind");
            Ok(None)
        }
        None => Err(anyhow!("unable to find resource kind {} on the server", obj.gvk())).with_context(|| obj.identity().to_string()),
    }
}

/// Apply `objs` in dependency order, then collect garbage for the GC tag.
pub async fn update(session: &Session<'_>, mut objs: Vec<Resource>, opts: &UpdateOptions, table: &RankTable) -> Result<UpdateReport> {
    check_duplicates(&objs)?;
    if let Some(tag) = &opts.gc_tag {
        validate_label_value(tag).map_err(|e| anyhow!("invalid --gc-tag: {}", e))?;
    }
    let scopes = session.scopes().await?;
    creation_order(&mut objs, table, |g| scopes.get(g).copied());
    info!(objects = objs.len(), dry_run = opts.dry_run, "updating");

    let mut report = UpdateReport::default();
    for obj in objs {
        let Some(kind) = kind_for(session, &obj, opts.ignore_unknown).await? else {
            report.skipped_unknown += 1;
            continue;
        };
        let (applied, outcome) = apply_one(session, &kind, obj, opts).await?;
        report.seen.insert(&applied);
        report.applied.push((applied.identity(), outcome));
    }

    if let (Some(tag), false) = (&opts.gc_tag, opts.skip_gc) {
        let gc_opts = GcOptions {
            tag: tag.clone(),
            list_mode: opts.gc_list_mode,
            ns_selector: opts.gc_ns_selector.clone(),
            dry_run: opts.dry_run,
        };
        report.gc = Some(collect(session, &gc_opts, &report.seen, table).await?);
    }
    Ok(report)
}

/// Create-or-patch one object; returns the object as the server now holds it.
async fn apply_one(session: &Session<'_>, kind: &KindInfo, mut obj: Resource, opts: &UpdateOptions) -> Result<(Resource, Outcome)> {
    let t0 = Instant::now();
    let ns = session.target_namespace(kind, &obj);
    if let Some(ns) = ns.as_deref() {
        if obj.namespace().is_none() {
            obj.set_namespace(ns);
        }
    }
    if let Some(tag) = &opts.gc_tag {
        obj.set_annotation(ANNOTATION_GC_TAG, tag);
        obj.set_label(LABEL_GC_TAG, tag);
    }
    snapshot::stamp(&mut obj)?;

    let desc = session.describe(&obj).await;
    info!("Updating {}{}", desc, dry(opts.dry_run));
    counter!("apply_attempts", 1u64);

    let result = match session.transport.get(kind, ns.as_deref(), obj.name()).await {
        Ok(live) => patch_existing(session, kind, &obj, &live, opts, &desc).await,
        Err(e) if e.is_not_found() => create_missing(session, kind, &obj, opts, &desc).await,
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(r) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
            Ok(r)
        }
        Err(e) => {
            counter!("apply_err", 1u64);
            Err(e).with_context(|| format!("error updating {}", desc))
        }
    }
}

async fn patch_existing(
    session: &Session<'_>,
    kind: &KindInfo,
    obj: &Resource,
    live: &Resource,
    opts: &UpdateOptions,
    desc: &str,
) -> Result<(Resource, Outcome)> {
    let patch = three_way_merge_patch(&original_of(live), &obj.to_json(), &live.to_json());
    if is_noop(&patch) {
        debug!("{} unchanged", desc);
        return Ok((live.clone(), Outcome::Unchanged));
    }
    debug!(patch = %patch, "patching {}", desc);
    if opts.dry_run {
        return Ok((live.clone(), Outcome::Patched));
    }
    match session.transport.patch(kind, obj.namespace(), obj.name(), &patch).await {
        Ok(o) => Ok((o, Outcome::Patched)),
        // Deleted between our get and patch.
        Err(ApiError::NotFound(_)) => create_missing(session, kind, obj, opts, desc).await,
        Err(e) => Err(e.into()),
    }
}

async fn create_missing(
    session: &Session<'_>,
    kind: &KindInfo,
    obj: &Resource,
    opts: &UpdateOptions,
    desc: &str,
) -> Result<(Resource, Outcome)> {
    if !opts.create {
        bail!("{} not found and --create=false", desc);
    }
    info!("Creating non-existent {}{}", desc, dry(opts.dry_run));
    if opts.dry_run {
        return Ok((obj.clone(), Outcome::Created));
    }
    let created = session.transport.create(kind, obj.namespace(), obj).await?;
    counter!("apply_created", 1u64);
    Ok((created, Outcome::Created))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<ObjectIdentity>,
    pub missing: usize,
    pub skipped_unknown: usize,
}

/// Delete every object in `objs`, dependents first. Objects already gone are fine.
pub async fn delete(
    session: &Session<'_>,
    mut objs: Vec<Resource>,
    grace_period: Option<u32>,
    ignore_unknown: bool,
    table: &RankTable,
) -> Result<DeleteReport> {
    check_duplicates(&objs)?;
    let version = session.discovery.server_version().await?;
    let scopes = session.scopes().await?;
    deletion_order(&mut objs, table, |g| scopes.get(g).copied());
    let opts = DeleteOptions { grace_period, ..DeleteOptions::for_version(version) };

    let mut report = DeleteReport::default();
    for mut obj in objs {
        let Some(kind) = kind_for(session, &obj, ignore_unknown).await? else {
            report.skipped_unknown += 1;
            continue;
        };
        let ns = session.target_namespace(&kind, &obj);
        if let Some(ns) = ns.as_deref() {
            if obj.namespace().is_none() {
                obj.set_namespace(ns);
            }
        }
        let desc = session.describe(&obj).await;
        info!("Deleting {}", desc);
        match session.transport.delete(&kind, ns.as_deref(), obj.name(), &opts).await {
            Ok(()) => {
                counter!("delete_ok", 1u64);
                report.deleted.push(obj.identity());
            }
            Err(e) if e.is_not_found() => {
                debug!("{} already gone", desc);
                report.missing += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("error deleting {}", desc)),
        }
    }
    Ok(report)
}
