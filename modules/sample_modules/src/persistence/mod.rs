pub mod accounts;
pub mod roles;

use serde_json::{Map, Value};
use svckit::Filter;

pub use accounts::Accounts;
pub use roles::Roles;

/// Numeric id from a JSON number or a decoded query string.
pub(crate) fn id_of(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Query strings carry every value as text, so compare textual forms.
pub(crate) fn matches(filter: &Filter, doc: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(k, want)| doc.get(k).is_some_and(|have| text_of(have) == text_of(want)))
}
