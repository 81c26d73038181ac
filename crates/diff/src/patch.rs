use serde_json::{Map, Value as Json};

use crate::fields::values_equal;

/// Three-way JSON merge patch turning `current` into `modified`.
///
/// Fields present in `original` (what we applied last time) but gone from `modified`
/// are deleted with `null`, provided they still exist on `current`. Fields nobody
/// owned (absent from both `original` and `modified`) are left alone, so additions
/// by other writers survive. Lists are replaced wholesale. With an empty `original`
/// this degrades to a two-way patch that only adds and changes.
pub fn three_way_merge_patch(original: &Json, modified: &Json, current: &Json) -> Json {
    let empty = Map::new();
    match (modified.as_object(), current.as_object()) {
        (Some(m), Some(c)) => Json::Object(map_patch(original.as_object().unwrap_or(&empty), m, c)),
        _ if values_equal(modified, current) => Json::Object(Map::new()),
        _ => modified.clone(),
    }
}

fn map_patch(original: &Map<String, Json>, modified: &Map<String, Json>, current: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for (k, mv) in modified {
        match current.get(k) {
            None => {
                out.insert(k.clone(), mv.clone());
            }
            Some(cv) => match (mv, cv) {
                (Json::Object(mm), Json::Object(cm)) => {
                    let empty = Map::new();
                    let om = original.get(k).and_then(|o| o.as_object()).unwrap_or(&empty);
                    let sub = map_patch(om, mm, cm);
                    if !sub.is_empty() {
                        out.insert(k.clone(), Json::Object(sub));
                    }
                }
                _ if values_equal(mv, cv) => {}
                _ => {
                    out.insert(k.clone(), mv.clone());
                }
            },
        }
    }
    for k in original.keys() {
        if !modified.contains_key(k) && current.contains_key(k) {
            out.insert(k.clone(), Json::Null);
        }
    }
    out
}

/// True when applying `patch` would change nothing.
pub fn is_noop(patch: &Json) -> bool { patch.as_object().map_or(false, |m| m.is_empty()) }
