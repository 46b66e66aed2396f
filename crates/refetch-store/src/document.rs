use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single document in a collection: a unique `_id` plus arbitrary
/// JSON-serializable fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The unique key of this document within its collection.
    #[serde(rename = "_id")]
    pub id: String,
    /// All remaining fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Creates an empty document with the given `_id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field assignment.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a field value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Returns a copy of this document restricted to the given fields.
    ///
    /// The `_id` is always retained, matching the projection semantics of
    /// document databases.
    pub fn project(&self, fields: &[&str]) -> Document {
        let mut projected = Document::new(self.id.clone());
        for &name in fields {
            if let Some(value) = self.fields.get(name) {
                projected.fields.insert(name.to_owned(), value.clone());
            }
        }
        projected
    }
}

/// An equality filter: an `_id` match plus optional additional field
/// equality conditions.
///
/// This is deliberately not a query language. Every operation the services
/// perform is keyed by `_id`; the extra conditions express delete-if-match
/// and compare-and-swap semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// The `_id` the document must have.
    pub id: String,
    /// Additional fields that must be equal.
    pub conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Creates a filter matching only on `_id`.
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conditions: Vec::new(),
        }
    }

    /// Adds a field equality condition.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((name.into(), value.into()));
        self
    }

    /// Whether the document satisfies this filter.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.id == self.id
            && self
                .conditions
                .iter()
                .all(|(name, value)| doc.get(name) == Some(value))
    }
}

/// A `$set`-style partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    sets: Vec<(String, Value)>,
}

impl Update {
    /// Creates an update setting a single field.
    pub fn set(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Update::default().and_set(name, value)
    }

    /// Adds another field assignment.
    pub fn and_set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((name.into(), value.into()));
        self
    }

    /// Applies the assignments to a document in place.
    pub fn apply_to(&self, doc: &mut Document) {
        for (name, value) in &self.sets {
            doc.set(name.clone(), value.clone());
        }
    }
}

/// Specification for a collection index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// The indexed fields, in order.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// TTL expiry applied to the first field, which must hold a timestamp
    /// written via [`datetime_value`]. The store discards documents once the
    /// timestamp is older than this duration.
    pub expire_after: Option<Duration>,
}

impl IndexSpec {
    /// A plain (covering) index over the given fields.
    pub fn on(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            unique: false,
            expire_after: None,
        }
    }

    /// A TTL index expiring documents `expire_after` past the timestamp in
    /// `field`.
    pub fn ttl(field: &str, expire_after: Duration) -> Self {
        Self {
            fields: vec![field.to_owned()],
            unique: false,
            expire_after: Some(expire_after),
        }
    }
}

/// Encodes a timestamp as a document field value.
///
/// The encoding is a fixed-precision RFC 3339 string, so that two encodings
/// of the same instant are byte-identical. Compare-and-swap filters rely on
/// this: the raw stored value can be matched by equality.
pub fn datetime_value(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Decodes a timestamp field value written by [`datetime_value`].
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_id_and_conditions() {
        let doc = Document::new("job1")
            .with_field("lockId", "abc")
            .with_field("n", 1);

        assert!(Filter::id("job1").matches(&doc));
        assert!(Filter::id("job1").field("lockId", "abc").matches(&doc));
        assert!(!Filter::id("job1").field("lockId", "xyz").matches(&doc));
        assert!(!Filter::id("job2").matches(&doc));
    }

    #[test]
    fn projection_keeps_id() {
        let doc = Document::new("cfg")
            .with_field("etag", "\"v1\"")
            .with_field("content", json!({"a": 1}));

        let projected = doc.project(&["etag"]);
        assert_eq!(projected.id, "cfg");
        assert_eq!(projected.get("etag"), Some(&json!("\"v1\"")));
        assert_eq!(projected.get("content"), None);
    }

    #[test]
    fn datetime_round_trip_is_stable() {
        let now = Utc::now();
        let value = datetime_value(now);
        let parsed = parse_datetime(&value).unwrap();
        // Re-encoding the parsed timestamp must yield the identical value,
        // otherwise CAS filters on stored timestamps would never match.
        assert_eq!(datetime_value(parsed), value);
    }
}
