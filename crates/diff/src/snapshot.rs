//! Last-applied snapshot codec: base64(gzip(JSON)), with plain JSON accepted on read.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use kcfg_core::{Resource, ANNOTATION_KUBECTL_LAST_APPLIED, ANNOTATION_LAST_APPLIED};
use serde_json::Value as Json;

pub fn encode(obj: &Json) -> Result<String> {
    let raw = serde_json::to_vec(obj)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&raw)?;
    Ok(STANDARD.encode(gz.finish()?))
}

pub fn decode(s: &str) -> Result<Json> {
    let s = s.trim();
    if s.starts_with('{') {
        return serde_json::from_str(s).context("parsing last-applied JSON");
    }
    let bytes = STANDARD.decode(s).context("decoding last-applied base64")?;
    let mut raw = Vec::new();
    GzDecoder::new(bytes.as_slice()).read_to_end(&mut raw).context("decompressing last-applied snapshot")?;
    serde_json::from_slice(&raw).context("parsing last-applied snapshot")
}

/// Snapshot of `obj` as submitted, excluding any previous snapshot annotation.
pub fn snapshot_of(obj: &Resource) -> Result<String> {
    let mut bare = obj.clone();
    bare.remove_annotation(ANNOTATION_LAST_APPLIED);
    encode(&bare.into_json())
}

/// Attach a fresh snapshot annotation to `obj`.
pub fn stamp(obj: &mut Resource) -> Result<()> {
    let snap = snapshot_of(obj)?;
    obj.set_annotation(ANNOTATION_LAST_APPLIED, &snap);
    Ok(())
}

/// The stored snapshot on a live object: ours first, then kubectl's.
/// `Ok(None)` when neither annotation is present.
pub fn last_applied(live: &Resource) -> Result<Option<Json>> {
    match live.annotation(ANNOTATION_LAST_APPLIED).or_else(|| live.annotation(ANNOTATION_KUBECTL_LAST_APPLIED)) {
        Some(s) => decode(s).map(Some),
        None => Ok(None),
    }
}
