//! Result normalizer
//!
//! Converts native document results into the uniform [`TabularResult`]
//! shape: keys in first-seen order across rows, rows lacking exactly the
//! fields their document lacked.

use std::collections::HashSet;

use mongodb::bson::{Bson, Document};

use crate::engine::document::dispatcher::NativeOutcome;
use crate::engine::types::{Row, TabularResult, Value};

pub fn normalize(outcome: NativeOutcome) -> TabularResult {
    match outcome {
        NativeOutcome::Single(Some(document)) => documents_to_table(&[document]),
        NativeOutcome::Single(None) => TabularResult::empty(),
        NativeOutcome::Documents(documents) => documents_to_table(&documents),
        NativeOutcome::Inserted(id) => TabularResult::scalars([("insertedId", bson_to_value(&id))]),
        NativeOutcome::InsertedMany(ids) => TabularResult::scalars([(
            "insertedIDs",
            Value::Array(ids.iter().map(bson_to_value).collect()),
        )]),
        NativeOutcome::Deleted(count) => {
            TabularResult::scalars([("deletedCount", Value::Int(count as i64))])
        }
        NativeOutcome::Updated(outcome) => TabularResult::scalars([
            ("updatedCount", Value::Int(outcome.modified as i64)),
            ("upsertedCount", Value::Int(outcome.upserted as i64)),
        ]),
        NativeOutcome::Count(count) => TabularResult::scalars([("count", Value::Int(count as i64))]),
        NativeOutcome::CollectionNames(names) => {
            let rows = names
                .into_iter()
                .map(|name| Row::from([("collectionName".to_string(), Value::Text(name))]))
                .collect();
            TabularResult {
                keys: vec!["collectionName".to_string()],
                rows,
                count: None,
                execution_time_ms: 0.0,
            }
        }
    }
}

/// Union of keys in first-seen order; each row holds only its own fields.
pub fn documents_to_table(documents: &[Document]) -> TabularResult {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(documents.len());

    for document in documents {
        let mut row = Row::with_capacity(document.len());
        for (key, value) in document {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
            row.insert(key.clone(), bson_to_value(value));
        }
        rows.push(row);
    }

    TabularResult {
        keys,
        rows,
        count: None,
        execution_time_ms: 0.0,
    }
}

/// Converts a BSON value to the universal value type.
///
/// ObjectIds become their hex string, dates RFC 3339 text; nested documents
/// and exotic types are kept as relaxed extended JSON.
pub fn bson_to_value(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Int(i64::from(*i)),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(f) => Value::Float(*f),
        Bson::String(s) => Value::Text(s.clone()),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Int(dt.timestamp_millis()),
        },
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_value).collect()),
        Bson::Binary(binary) => Value::Bytes(binary.bytes.clone()),
        other => Value::Json(other.clone().into_relaxed_extjson()),
    }
}

/// Type tag used by the introspector.
pub fn type_name(bson: &Bson) -> &'static str {
    match bson {
        Bson::Null | Bson::Undefined => "null",
        Bson::Boolean(_) => "boolean",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::String(_) => "string",
        Bson::ObjectId(_) => "ObjectId",
        Bson::DateTime(_) => "datetime",
        Bson::Timestamp(_) => "timestamp",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::Binary(_) => "binary",
        Bson::RegularExpression(_) => "regex",
        _ => "mixed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::document::dispatcher::UpdateOutcome;
    use mongodb::bson::{doc, oid::ObjectId, DateTime};

    #[test]
    fn union_of_keys_in_first_seen_order() {
        let documents = vec![
            doc! { "a": 1 },
            doc! { "a": 1, "b": "x" },
            doc! { "b": 2, "c": true },
        ];
        let table = documents_to_table(&documents);

        assert_eq!(table.keys, vec!["a", "b", "c"]);
        assert_eq!(table.rows.len(), 3);
        assert!(!table.rows[0].contains_key("b"));
        assert!(!table.rows[2].contains_key("a"));
        assert_eq!(table.rows[1]["b"], Value::Text("x".into()));
    }

    #[test]
    fn key_order_follows_document_order() {
        let table = documents_to_table(&[doc! { "z": 1, "_id": 2, "m": 3 }]);
        assert_eq!(table.keys, vec!["z", "_id", "m"]);
    }

    #[test]
    fn scalar_outcomes() {
        let updated = normalize(NativeOutcome::Updated(UpdateOutcome {
            matched: 3,
            modified: 2,
            upserted: 0,
        }));
        assert_eq!(updated.keys, vec!["updatedCount", "upsertedCount"]);
        assert_eq!(updated.first_value("updatedCount"), Some(&Value::Int(2)));

        let inserted = normalize(NativeOutcome::InsertedMany(vec![Bson::Int32(1), Bson::Int32(2)]));
        assert_eq!(
            inserted.first_value("insertedIDs"),
            Some(&Value::Array(vec![Value::Int(1), Value::Int(2)]))
        );

        assert!(normalize(NativeOutcome::Single(None)).is_empty());
    }

    #[test]
    fn converts_special_types() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(
            bson_to_value(&Bson::ObjectId(oid)),
            Value::Text("507f1f77bcf86cd799439011".into())
        );
        assert_eq!(
            bson_to_value(&Bson::DateTime(DateTime::from_millis(0))),
            Value::Text("1970-01-01T00:00:00Z".into())
        );
        assert_eq!(
            bson_to_value(&Bson::Document(doc! { "x": 1 })),
            Value::Json(serde_json::json!({ "x": 1 }))
        );
    }
}
