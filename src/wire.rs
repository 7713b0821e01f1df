//! Untyped payload values with opportunistic UUID recognition.
//!
//! Typed payload fields use `Uuid` directly. Fields a payload schema does not
//! name are kept as [`Field`]s so they survive a hop unchanged; any string
//! in canonical hyphenated UUID shape decodes as a UUID.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// A payload value that is either a recognized UUID or plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Uuid(Uuid),
    Value(serde_json::Value),
}

impl Field {
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Field::Uuid(id) => Some(*id),
            Field::Value(_) => None,
        }
    }
}

impl From<Uuid> for Field {
    fn from(id: Uuid) -> Self {
        Field::Uuid(id)
    }
}

impl From<serde_json::Value> for Field {
    fn from(value: serde_json::Value) -> Self {
        recognize(value)
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Uuid(id) => serializer.collect_str(&id.hyphenated()),
            Field::Value(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(recognize)
    }
}

fn recognize(value: serde_json::Value) -> Field {
    match value {
        serde_json::Value::String(ref s) if is_canonical_uuid(s) => match Uuid::parse_str(s) {
            Ok(id) => Field::Uuid(id),
            Err(_) => Field::Value(value),
        },
        other => Field::Value(other),
    }
}

/// `8-4-4-4-12` hex digits separated by hyphens.
pub fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_strings_become_uuids() {
        let id = Uuid::new_v4();
        let field: Field = serde_json::from_value(json!(id.to_string())).unwrap();
        assert_eq!(field.as_uuid(), Some(id));
        assert_eq!(serde_json::to_value(&field).unwrap(), json!(id.to_string()));
    }

    #[test]
    fn near_misses_stay_strings() {
        for s in [
            "67e5504410b1426f9247bb680e5fe0c8",
            "{67e55044-10b1-426f-9247-bb680e5fe0c8}",
            "67e55044-10b1-426f-9247-bb680e5fe0cZ",
            "Hello World #1",
        ] {
            let field: Field = serde_json::from_value(json!(s)).unwrap();
            assert_eq!(field, Field::Value(json!(s)), "{s}");
        }
    }

    #[test]
    fn non_strings_pass_through() {
        let field: Field = serde_json::from_value(json!({"n": 3})).unwrap();
        assert_eq!(field, Field::Value(json!({"n": 3})));
    }
}
