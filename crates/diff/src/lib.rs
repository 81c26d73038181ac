//! kcfg diff: live-vs-config comparison, last-applied snapshots and merge patches.

#![forbid(unsafe_code)]

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use kcfg_core::{
    alphabetical_order, check_duplicates, Resource, ANNOTATION_GC_TAG, ANNOTATION_KUBECTL_LAST_APPLIED, ANNOTATION_LAST_APPLIED,
    LABEL_GC_TAG,
};
use kcfg_kubehub::Session;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use similar::TextDiff;
use tracing::{debug, warn};

pub mod fields;
pub mod patch;
pub mod snapshot;

pub use fields::{remove_fields, values_equal};
pub use patch::{is_noop, three_way_merge_patch};

/// Which view of the live object a config is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffStrategy {
    /// The whole live object, minus server bookkeeping.
    #[default]
    All,
    /// Only the fields the config mentions.
    Subset,
    /// The stored last-applied snapshot.
    LastApplied,
}

impl FromStr for DiffStrategy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "subset" => Ok(Self::Subset),
            "last-applied" => Ok(Self::LastApplied),
            other => Err(anyhow!("unknown diff strategy {:?} (expected all, subset or last-applied)", other)),
        }
    }
}

impl fmt::Display for DiffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Subset => "subset",
            Self::LastApplied => "last-applied",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Outcome of comparing one config object against its live counterpart.
#[derive(Debug, Clone)]
pub struct Comparison {
    /// Live object as seen through the chosen strategy.
    pub cleaned_live: Json,
    /// Config object the live view was compared with.
    pub config: Json,
    /// Merge patch that would move live towards config.
    pub patch: Json,
    pub summary: DiffSummary,
}

impl Comparison {
    pub fn has_differences(&self) -> bool { !values_equal(&self.config, &self.cleaned_live) }

    /// Unified diff of the YAML renderings, live on the left.
    pub fn unified(&self, desc: &str) -> Result<String> {
        let live = serde_yaml::to_string(&self.cleaned_live)?;
        let config = serde_yaml::to_string(&self.config)?;
        Ok(TextDiff::from_lines(&live, &config)
            .unified_diff()
            .context_radius(3)
            .header(&format!("{} (live)", desc), &format!("{} (config)", desc))
            .to_string())
    }
}

/// Drop metadata the server maintains and our own snapshot annotations.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
        let drop_annotations = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(a) => {
                a.remove(ANNOTATION_LAST_APPLIED);
                a.remove(ANNOTATION_KUBECTL_LAST_APPLIED);
                a.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            meta.remove("annotations");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Remove `key` from `metadata.<map>`, dropping the map once it is empty.
fn remove_meta_entry(v: &mut Json, map: &str, key: &str) {
    let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) else { return };
    let emptied = match meta.get_mut(map).and_then(Json::as_object_mut) {
        Some(m) => {
            m.remove(key);
            m.is_empty()
        }
        None => false,
    };
    if emptied {
        meta.remove(map);
    }
}

/// Drop the GC tag stamped at apply time; rendered configs never carry it.
pub fn strip_gc_tag(mut v: Json) -> Json {
    remove_meta_entry(&mut v, "annotations", ANNOTATION_GC_TAG);
    remove_meta_entry(&mut v, "labels", LABEL_GC_TAG);
    v
}

/// Decoded last-applied snapshot, or `{}` when absent or undecodable.
pub fn original_of(live: &Resource) -> Json {
    match snapshot::last_applied(live) {
        Ok(Some(v)) => v,
        Ok(None) => json!({}),
        Err(e) => {
            warn!(name = %live.fq_name(), kind = %live.kind(), error = %format!("{:#}", e), "ignoring undecodable last-applied snapshot");
            json!({})
        }
    }
}

/// Compare `config` against `live`.
pub fn compare(config: &Resource, live: &Resource, strategy: DiffStrategy) -> Comparison {
    let original = original_of(live);
    let config_json = config.to_json();
    let live_json = live.to_json();
    let patch = three_way_merge_patch(&original, &config_json, &live_json);
    let (cleaned_live, shown) = match strategy {
        DiffStrategy::All => (strip_server_fields(live_json), config_json),
        DiffStrategy::Subset => (remove_fields(&config_json, &live_json), config_json),
        // Both sides, so a tag written into the config by hand still compares equal.
        DiffStrategy::LastApplied => (strip_gc_tag(original), strip_gc_tag(config_json)),
    };
    let summary = diff_summary(&shown, &cleaned_live);
    debug!(name = %config.fq_name(), %strategy, adds = summary.adds, updates = summary.updates, removes = summary.removes, "compared");
    Comparison { cleaned_live, config: shown, patch, summary }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if values_equal(av, bv) => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| !values_equal(x, y)).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if !values_equal(av, bv) => s.updates += 1,
            _ => {}
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Print a diff for every object and fail if any differs or is missing.
pub async fn run_diff<W: Write>(session: &Session<'_>, mut objs: Vec<Resource>, strategy: DiffStrategy, out: &mut W) -> Result<()> {
    check_duplicates(&objs)?;
    alphabetical_order(&mut objs);
    let mut differs = false;
    for mut obj in objs {
        let kind = session.resolve(&obj.gvk()).await.with_context(|| obj.identity().to_string())?;
        let ns = session.target_namespace(&kind, &obj);
        match &ns {
            Some(ns) if obj.namespace().is_none() => obj.set_namespace(ns),
            _ => {}
        }
        let desc = session.describe(&obj).await;
        match session.transport.get(&kind, ns.as_deref(), obj.name()).await {
            Ok(live) => {
                let cmp = compare(&obj, &live, strategy);
                if cmp.has_differences() {
                    differs = true;
                    write!(out, "{}", cmp.unified(&desc)?)?;
                } else {
                    writeln!(out, "*** {} has no differences", desc)?;
                }
            }
            Err(e) if e.is_not_found() => {
                differs = true;
                writeln!(out, "---- {} doesn't exist on server", desc)?;
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("getting {}", desc))),
        }
    }
    if differs {
        bail!("diff found differences");
    }
    Ok(())
}
