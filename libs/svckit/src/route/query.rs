use std::collections::HashSet;

use serde_json::{Map, Value};

/// Decode a raw query string into scalar `key → value` pairs.
///
/// Keys and values are percent-decoded. List-valued parameters are dropped:
/// a key that repeats, or one using bracket notation (`tags[]=a`,
/// `filter[name]=b`), never reaches the filter.
pub fn decode_scalar_query(raw: Option<&str>) -> Map<String, Value> {
    let Some(raw) = raw else {
        return Map::new();
    };

    let mut out = Map::new();
    let mut repeated = HashSet::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        if key.contains('[') {
            continue;
        }
        let key = key.into_owned();
        if out.contains_key(&key) {
            repeated.insert(key);
            continue;
        }
        out.insert(key, Value::String(value.into_owned()));
    }
    for key in repeated {
        out.remove(&key);
    }
    out
}
