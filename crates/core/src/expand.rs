//! Input expansion: turns file paths into resource objects.
//!
//! Templating is not done here; inputs are already-rendered YAML or JSON.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::{json_type_name, ModelError, Resource};

pub trait Expander {
    fn expand(&self, paths: &[PathBuf]) -> Result<Vec<Resource>>;
}

#[derive(Debug, Clone)]
pub struct FileExpander {
    pub max_bytes: u64,
}

impl Default for FileExpander {
    fn default() -> Self {
        let max_bytes = std::env::var("KCFG_MAX_INPUT_BYTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(8 * 1024 * 1024);
        Self { max_bytes }
    }
}

impl Expander for FileExpander {
    fn expand(&self, paths: &[PathBuf]) -> Result<Vec<Resource>> {
        let mut out = Vec::new();
        for p in paths {
            for file in self.files_for(p)? {
                let docs = self.read_documents(&file).with_context(|| format!("reading {}", file.display()))?;
                for (i, doc) in docs.into_iter().enumerate() {
                    let before = out.len();
                    walk(doc, "$", &mut out).with_context(|| format!("{} (document {})", file.display(), i))?;
                    debug!(file = %file.display(), doc = i, objects = out.len() - before, "expanded");
                }
            }
        }
        Ok(out)
    }
}

impl FileExpander {
    fn files_for(&self, p: &Path) -> Result<Vec<PathBuf>> {
        if p.as_os_str() == "-" || p.is_file() {
            return Ok(vec![p.to_path_buf()]);
        }
        if p.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(p)
                .with_context(|| format!("listing {}", p.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|e| e.is_file() && matches!(extension(e), Some("yaml" | "yml" | "json")))
                .collect();
            entries.sort();
            return Ok(entries);
        }
        Err(anyhow!("{}: no such file or directory", p.display()))
    }

    fn read_documents(&self, file: &Path) -> Result<Vec<Json>> {
        let mut buf = String::new();
        let is_stdin = file.as_os_str() == "-";
        if is_stdin {
            std::io::stdin().take(self.max_bytes + 1).read_to_string(&mut buf)?;
        } else {
            std::fs::File::open(file)?.take(self.max_bytes + 1).read_to_string(&mut buf)?;
        }
        if buf.len() as u64 > self.max_bytes {
            return Err(anyhow!("input exceeds {} bytes (KCFG_MAX_INPUT_BYTES)", self.max_bytes));
        }
        match (is_stdin, extension(file)) {
            (true, _) | (false, Some("yaml" | "yml")) => parse_yaml_stream(&buf),
            (false, Some("json")) => Ok(vec![serde_json::from_str(&buf)?]),
            _ => Err(anyhow!("unknown file extension: {}", file.display())),
        }
    }
}

fn extension(p: &Path) -> Option<&str> { p.extension().and_then(|e| e.to_str()) }

/// Parse a multi-document YAML stream (JSON is a YAML subset, so stdin takes this path too).
pub fn parse_yaml_stream(s: &str) -> Result<Vec<Json>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(s) {
        docs.push(Json::deserialize(de)?);
    }
    Ok(docs)
}

/// Collect every object reachable from `v`. `List` kinds are flattened.
pub fn walk(v: Json, path: &str, out: &mut Vec<Resource>) -> Result<(), ModelError> {
    match v {
        Json::Null => Ok(()),
        Json::Object(m) if m.contains_key("kind") && m.contains_key("apiVersion") => {
            let is_list = m.get("kind").and_then(|k| k.as_str()).map_or(false, |k| k.ends_with("List"))
                && m.get("items").map_or(false, |i| i.is_array());
            if is_list {
                let items = m.get("items").cloned().unwrap_or(Json::Null);
                return walk(items, &format!("{}.items", path), out);
            }
            out.push(Resource::from_json(Json::Object(m))?);
            Ok(())
        }
        Json::Object(m) => {
            for (k, child) in m {
                walk(child, &format!("{}.{}", path, k), out)?;
            }
            Ok(())
        }
        Json::Array(items) => {
            for (i, child) in items.into_iter().enumerate() {
                walk(child, &format!("{}[{}]", path, i), out)?;
            }
            Ok(())
        }
        other => Err(ModelError::UnexpectedValue { path: path.to_string(), found: json_type_name(&other) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walk_descends_and_flattens_lists() {
        let v = json!({
            "a": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            "b": [
                {"apiVersion": "v1", "kind": "List", "items": [
                    {"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}},
                ]},
                null,
            ],
        });
        let mut out = Vec::new();
        walk(v, "$", &mut out).unwrap();
        let kinds: Vec<_> = out.iter().map(|o| o.kind().to_string()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Secret"]);
    }

    #[test]
    fn walk_reports_path_of_stray_scalar() {
        let mut out = Vec::new();
        let err = walk(json!({"x": [{"y": 3}]}), "$", &mut out).unwrap_err();
        assert_eq!(err.to_string(), "looking for kubernetes object at $.x[0].y, but instead found number");
    }

    #[test]
    fn yaml_stream_yields_every_document() {
        let docs = parse_yaml_stream("apiVersion: v1\nkind: ConfigMap\nmetadata: {name: a}\n---\nnull\n---\nfoo: []\n").unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs[1].is_null());
    }

    #[test]
    fn directories_are_read_sorted_and_unknown_extensions_rejected() {
        let dir = std::env::temp_dir().join(format!("kcfg-expand-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"b"}}"#).unwrap();
        std::fs::write(dir.join("a.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n").unwrap();
        std::fs::write(dir.join("c.jsonnet"), "{}").unwrap();
        let ex = FileExpander { max_bytes: 1024 };
        let objs = ex.expand(&[dir.clone()]).unwrap();
        let got: Vec<_> = objs.iter().map(|o| o.name().to_string()).collect();
        assert_eq!(got, vec!["a", "b"]);
        let err = ex.expand(&[dir.join("c.jsonnet")]).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown file extension"));
        let tiny = FileExpander { max_bytes: 4 };
        assert!(tiny.expand(&[dir.join("a.yaml")]).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
