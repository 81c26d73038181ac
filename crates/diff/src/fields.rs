//! Trim a live object down to the fields the config cares about.

use serde_json::{Map, Value as Json};

/// Strip from `live` everything the server added that `config` never asked for.
///
/// Map keys absent from `config` are dropped. Extra list entries on the live side are
/// kept, since list identity cannot be inferred generically. A config value the API
/// would never echo back (`{}`, `[]`, `false`, `0`, `""`, `null`) is copied in when
/// live lacks it. Shape mismatches return `live` untouched. An empty config map passes
/// the live subtree through unfiltered.
pub fn remove_fields(config: &Json, live: &Json) -> Json {
    match (config, live) {
        (Json::Object(c), Json::Object(l)) => Json::Object(remove_map_fields(c, l)),
        (Json::Array(c), Json::Array(l)) => Json::Array(remove_list_fields(c, l)),
        (Json::Number(_), Json::Number(_)) if numbers_equal(config, live) => config.clone(),
        _ => live.clone(),
    }
}

pub fn remove_map_fields(config: &Map<String, Json>, live: &Map<String, Json>) -> Map<String, Json> {
    if config.is_empty() {
        return live.clone();
    }
    let mut out = Map::new();
    for (k, cv) in config {
        match live.get(k) {
            Some(lv) => {
                out.insert(k.clone(), remove_fields(cv, lv));
            }
            None if is_empty_value(cv) => {
                out.insert(k.clone(), cv.clone());
            }
            None => {}
        }
    }
    out
}

pub fn remove_list_fields(config: &[Json], live: &[Json]) -> Vec<Json> {
    live.iter()
        .enumerate()
        .map(|(i, lv)| match config.get(i) {
            Some(cv) => remove_fields(cv, lv),
            None => lv.clone(),
        })
        .collect()
}

fn is_empty_value(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Bool(b) => !b,
        Json::Number(n) => n.as_f64() == Some(0.0),
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.is_empty(),
    }
}

fn numbers_equal(a: &Json, b: &Json) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    // Integers on both sides that reach here have different signs.
    if (a.is_i64() || a.is_u64()) && (b.is_i64() || b.is_u64()) {
        return false;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Structural equality that treats `8080` and `8080.0` as the same value.
pub fn values_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => numbers_equal(a, b),
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q)),
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}
