//! Garbage collection of tagged objects that fell out of the rendered set.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use kcfg_core::{deletion_order, eligible_for_gc, Gvk, ObjectIdentity, RankTable, Resource, Scope};
use kcfg_kubehub::{DeleteOptions, KindInfo, Session};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Seen;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcListMode {
    /// One list call per kind across all namespaces.
    #[default]
    ClusterScope,
    /// One list call per kind and namespace; works with namespace-scoped permissions.
    PerNamespace,
}

impl FromStr for GcListMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cluster-scope" => Ok(Self::ClusterScope),
            "per-namespace" => Ok(Self::PerNamespace),
            other => Err(anyhow!("unknown list mode {:?} (expected cluster-scope or per-namespace)", other)),
        }
    }
}

impl fmt::Display for GcListMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClusterScope => "cluster-scope",
            Self::PerNamespace => "per-namespace",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    pub tag: String,
    pub list_mode: GcListMode,
    /// Label selector for namespaces; setting it implies per-namespace listing.
    pub ns_selector: Option<String>,
    pub dry_run: bool,
}

impl GcOptions {
    pub fn effective_mode(&self) -> GcListMode {
        if self.ns_selector.is_some() { GcListMode::PerNamespace } else { self.list_mode }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Distinct objects inspected.
    pub considered: usize,
    pub deleted: Vec<ObjectIdentity>,
    /// Eligible objects left alone because of dry-run.
    pub would_delete: Vec<ObjectIdentity>,
    /// Already gone or replaced by the time we tried.
    pub raced: usize,
    /// Kind/namespace pairs we were not allowed to list.
    pub forbidden_lists: usize,
}

async fn namespaces_for(session: &Session<'_>, opts: &GcOptions, kinds: &[KindInfo]) -> Result<Vec<Option<String>>> {
    match opts.effective_mode() {
        GcListMode::ClusterScope => Ok(vec![None]),
        GcListMode::PerNamespace => {
            let ns_kind = kinds
                .iter()
                .find(|k| k.gvk == Gvk::new("", "v1", "Namespace"))
                .ok_or_else(|| anyhow!("server does not serve v1 Namespace"))?;
            let list = session
                .transport
                .list(ns_kind, None, opts.ns_selector.as_deref())
                .await
                .context("listing namespaces")?;
            debug!(count = list.len(), selector = ?opts.ns_selector, "namespaces for gc");
            Ok(list.iter().map(|n| Some(n.name().to_string())).collect())
        }
    }
}

/// Delete every live object tagged `opts.tag` that is absent from `seen`, in reverse
/// dependency order. Forbidden lists are skipped; not-found and precondition
/// conflicts on delete count as done.
pub async fn collect(session: &Session<'_>, opts: &GcOptions, seen: &Seen, table: &RankTable) -> Result<GcReport> {
    let version = session.discovery.server_version().await?;
    let kinds = session.discovery.server_resources().await?.to_vec();
    let namespaces = namespaces_for(session, opts, &kinds).await?;
    let mut report = GcReport::default();
    let mut walked: FxHashSet<String> = FxHashSet::default();
    let mut doomed: Vec<Resource> = Vec::new();

    for kind in &kinds {
        if !kind.supports("list") {
            debug!(gvk = %kind.gvk, "don't know how to list, skipping");
            continue;
        }
        let targets: Vec<Option<&str>> =
            if kind.namespaced() { namespaces.iter().map(|n| n.as_deref()).collect() } else { vec![None] };
        for ns in targets {
            let items = match session.transport.list(kind, ns, None).await {
                Ok(items) => items,
                Err(e) if e.is_forbidden() => {
                    warn!(gvk = %kind.gvk, ns = ns.unwrap_or(""), "cannot list objects, skipping");
                    debug!(error = %e, "permission error");
                    counter!("gc_list_forbidden_total", 1u64);
                    report.forbidden_lists += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("listing {} in namespace {:?}", kind.gvk, ns.unwrap_or("")))
                }
            };
            for o in items {
                // Same object served under several versions.
                if let Some(uid) = o.uid() {
                    if !walked.insert(uid.to_string()) {
                        continue;
                    }
                }
                report.considered += 1;
                if eligible_for_gc(&o, &opts.tag) && !seen.contains(&o) {
                    doomed.push(o);
                } else {
                    debug!(gvk = %kind.gvk, name = %o.fq_name(), "keeping");
                }
            }
        }
    }

    let scopes: FxHashMap<Gvk, Scope> = kinds.iter().map(|k| (k.gvk.clone(), k.scope)).collect();
    deletion_order(&mut doomed, table, |g| scopes.get(g).copied());
    let base = DeleteOptions::for_version(version);

    for o in doomed {
        let desc = format!("{} ({})", session.describe(&o).await, o.api_version());
        if opts.dry_run {
            info!(dry_run = true, "Garbage collecting {}", desc);
            report.would_delete.push(o.identity());
            continue;
        }
        info!("Garbage collecting {}", desc);
        let kind = session.resolve(&o.gvk()).await?;
        let del = base.clone().with_uid(o.uid());
        match session.transport.delete(&kind, o.namespace(), o.name(), &del).await {
            Ok(()) => {
                counter!("gc_deleted_total", 1u64);
                report.deleted.push(o.identity());
            }
            // Lost a race with something else changing the object.
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(error = %e, "ignoring error while deleting {}", desc);
                report.raced += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("error deleting {}", desc)),
        }
    }
    Ok(report)
}
