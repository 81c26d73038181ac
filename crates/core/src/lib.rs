//! kcfg core types: resource model, identity, dependency ordering and input expansion.

#![forbid(unsafe_code)]

pub mod expand;
pub mod order;
pub mod resource;

pub use expand::{Expander, FileExpander};
pub use order::{alphabetical_order, creation_order, deletion_order, RankRule, RankTable, Scope};
pub use resource::{check_duplicates, Gvk, ObjectIdentity, OwnerRef, Resource};

/// Annotation carrying the garbage-collection tag of the run that last applied an object.
pub const ANNOTATION_GC_TAG: &str = "kcfg.io/garbage-collect-tag";
/// Label mirror of [`ANNOTATION_GC_TAG`], so tagged objects can be selected server-side.
pub const LABEL_GC_TAG: &str = "kcfg.io/garbage-collect-tag";
/// Per-object GC override: `auto` (default when absent) or `ignore`.
pub const ANNOTATION_GC_STRATEGY: &str = "kcfg.io/garbage-collect-strategy";
pub const GC_STRATEGY_AUTO: &str = "auto";
pub const GC_STRATEGY_IGNORE: &str = "ignore";
/// Compact (gzip + base64) snapshot of the object as last submitted by kcfg.
pub const ANNOTATION_LAST_APPLIED: &str = "kcfg.io/last-applied-configuration";
/// Plain JSON snapshot written by `kubectl apply`; read-only for us.
pub const ANNOTATION_KUBECTL_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Malformed or ambiguous input documents.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("expected an object, found {found}")]
    NotAnObject { found: &'static str },
    #[error("object missing apiVersion")]
    MissingApiVersion,
    #[error("object missing kind")]
    MissingKind,
    #[error("{kind} object missing metadata.name")]
    MissingName { kind: String },
    #[error("duplicate resource {0}")]
    Duplicate(ObjectIdentity),
    #[error("looking for kubernetes object at {path}, but instead found {found}")]
    UnexpectedValue { path: String, found: &'static str },
}

/// Classified outcome of a failed remote call.
///
/// Callers branch on the first four variants (not-found → create, forbidden while
/// listing → skip); `Other` is always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// Classify an HTTP status (plus the API `reason`, which disambiguates 409s).
    pub fn from_status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => Self::NotFound(message),
            403 => Self::Forbidden(message),
            409 if reason == "AlreadyExists" => Self::AlreadyExists(message),
            409 => Self::Conflict(message),
            _ => Self::Other(anyhow::anyhow!("{} ({}): {}", reason, code, message)),
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
    pub fn is_forbidden(&self) -> bool { matches!(self, Self::Forbidden(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists(_)) }
}

/// Whether a live object belongs to the run tagged `tag` and may be collected.
///
/// Objects owned by a controller are left to that controller. The tag is read from
/// the annotation, falling back to the label for objects stamped by older runs.
pub fn eligible_for_gc(obj: &Resource, tag: &str) -> bool {
    if obj.has_controller_owner() {
        return false;
    }
    let stamped = obj.annotation(ANNOTATION_GC_TAG).or_else(|| obj.label(LABEL_GC_TAG));
    if stamped != Some(tag) {
        return false;
    }
    obj.annotation(ANNOTATION_GC_STRATEGY).unwrap_or(GC_STRATEGY_AUTO) == GC_STRATEGY_AUTO
}

/// Validate a string for use as a label value (the GC tag is stamped as one).
pub fn validate_label_value(v: &str) -> Result<(), String> {
    if v.len() > 63 {
        return Err(format!("{:?}: must be no more than 63 characters", v));
    }
    let ok_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    let edges_ok = v.chars().next().map_or(true, |c| c.is_ascii_alphanumeric())
        && v.chars().last().map_or(true, |c| c.is_ascii_alphanumeric());
    if !v.chars().all(ok_char) || !edges_ok {
        return Err(format!(
            "{:?}: a valid label value must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
            v
        ));
    }
    Ok(())
}

pub fn json_type_name(v: &serde_json::Value) -> &'static str {
    use serde_json::Value as V;
    match v {
        V::Null => "null",
        V::Bool(_) => "bool",
        V::Number(_) => "number",
        V::String(_) => "string",
        V::Array(_) => "array",
        V::Object(_) => "object",
    }
}
