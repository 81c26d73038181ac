//! Dependency ordering of resource sets.
//!
//! Ranking is a heuristic keyed on kind only: payload cross-references are never
//! inspected. Ties are broken by namespace, kind, name and apiVersion, so the
//! result depends on the set of objects and never on input order.

use serde::{Deserialize, Serialize};

use crate::resource::{Gvk, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// One kind → rank mapping. `group: None` matches the kind in any group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRule {
    #[serde(default)]
    pub group: Option<String>,
    pub kind: String,
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankTable {
    pub rules: Vec<RankRule>,
    /// Rank for cluster-scoped kinds without an explicit rule.
    pub cluster_scoped: i32,
    /// Rank for everything else, including kinds discovery does not know.
    pub default: i32,
}

const POD_CREATING: &[(&str, &str)] = &[
    ("", "Pod"),
    ("", "ReplicationController"),
    ("apps", "ReplicaSet"),
    ("extensions", "ReplicaSet"),
    ("apps", "Deployment"),
    ("extensions", "Deployment"),
    ("apps", "StatefulSet"),
    ("apps", "DaemonSet"),
    ("extensions", "DaemonSet"),
    ("batch", "Job"),
    ("batch", "CronJob"),
];

impl Default for RankTable {
    fn default() -> Self {
        let rule = |g: &str, k: &str, rank: i32| RankRule { group: Some(g.to_string()), kind: k.to_string(), rank };
        let mut rules = vec![
            rule("apiextensions.k8s.io", "CustomResourceDefinition", 10),
            rule("extensions", "ThirdPartyResource", 10),
            rule("", "Namespace", 20),
        ];
        rules.extend(POD_CREATING.iter().map(|(g, k)| rule(g, k, 100)));
        rules.push(rule("admissionregistration.k8s.io", "MutatingWebhookConfiguration", 200));
        rules.push(rule("admissionregistration.k8s.io", "ValidatingWebhookConfiguration", 200));
        Self { rules, cluster_scoped: 20, default: 50 }
    }
}

impl RankTable {
    pub fn from_yaml(s: &str) -> anyhow::Result<Self> { Ok(serde_yaml::from_str(s)?) }

    pub fn rank(&self, gvk: &Gvk, scope: Option<Scope>) -> i32 {
        let explicit = self
            .rules
            .iter()
            .find(|r| r.kind == gvk.kind && r.group.as_deref().map_or(true, |g| g == gvk.group));
        match (explicit, scope) {
            (Some(r), _) => r.rank,
            (None, Some(Scope::Cluster)) => self.cluster_scoped,
            (None, _) => self.default,
        }
    }
}

type SortKey = (i32, String, String, String, String);

fn sort_key(o: &Resource, rank: i32) -> SortKey {
    (
        rank,
        o.namespace().unwrap_or_default().to_string(),
        o.kind().to_string(),
        o.name().to_string(),
        o.api_version().to_string(),
    )
}

/// Sort `objs` into apply order. `scope_of` reports discovery scope; `None` means unknown.
pub fn creation_order<F>(objs: &mut [Resource], table: &RankTable, scope_of: F)
where
    F: Fn(&Gvk) -> Option<Scope>,
{
    objs.sort_by_cached_key(|o| {
        let gvk = o.gvk();
        sort_key(o, table.rank(&gvk, scope_of(&gvk)))
    });
}

/// Exact reverse of [`creation_order`].
pub fn deletion_order<F>(objs: &mut [Resource], table: &RankTable, scope_of: F)
where
    F: Fn(&Gvk) -> Option<Scope>,
{
    creation_order(objs, table, scope_of);
    objs.reverse();
}

/// Rank-free ordering used for human-facing listings (diff output).
pub fn alphabetical_order(objs: &mut [Resource]) {
    objs.sort_by_cached_key(|o| sort_key(o, 0));
}
