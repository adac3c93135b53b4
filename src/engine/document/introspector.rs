//! Data model introspection for schema-less collections
//!
//! Fields are inferred from a random sample; indexes come from the server.

use std::collections::HashMap;

use mongodb::bson::{doc, Bson, Document};

use crate::engine::document::dispatcher::{perform, DocumentStore, NativeOutcome};
use crate::engine::document::normalizer::type_name;
use crate::engine::document::operation::{Operation, StructuredOperation};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{DataModelField, DataModelIndex, QueryConfig};

pub const DEFAULT_SAMPLE_SIZE: u32 = 1000;

/// Samples up to `sample_size` documents and merges their shapes.
///
/// Sampling goes through the dispatcher but is never audited.
pub async fn fields<S>(
    store: &S,
    collection: &str,
    sample_size: u32,
    config: &QueryConfig,
) -> EngineResult<Vec<DataModelField>>
where
    S: DocumentStore + ?Sized,
{
    let sample = StructuredOperation {
        collection: Some(collection.to_string()),
        operation: Operation::Aggregate {
            pipeline: vec![doc! { "$sample": { "size": i64::from(sample_size.max(1)) } }],
        },
    };

    match perform(store, &sample, &config.unaudited()).await? {
        NativeOutcome::Documents(documents) => Ok(merge_shapes(&documents)),
        other => Err(EngineError::internal(format!(
            "Unexpected sampling outcome: {:?}",
            other
        ))),
    }
}

/// Lists index names with their key specification as JSON.
pub async fn indexes<S>(
    store: &S,
    collection: &str,
    config: &QueryConfig,
) -> EngineResult<Vec<DataModelIndex>>
where
    S: DocumentStore + ?Sized,
{
    let list = StructuredOperation {
        collection: Some(collection.to_string()),
        operation: Operation::ListIndexes,
    };

    match perform(store, &list, &config.unaudited()).await? {
        NativeOutcome::Documents(documents) => Ok(documents.iter().map(index_from_spec).collect()),
        other => Err(EngineError::internal(format!(
            "Unexpected index listing outcome: {:?}",
            other
        ))),
    }
}

fn index_from_spec(spec: &Document) -> DataModelIndex {
    let name = spec.get_str("name").unwrap_or_default().to_string();
    let definition = match spec.get("key") {
        Some(key) => key.clone().into_relaxed_extjson().to_string(),
        None => Bson::Document(spec.clone()).into_relaxed_extjson().to_string(),
    };
    DataModelIndex { name, definition }
}

struct FieldShape {
    data_type: &'static str,
    non_null: usize,
}

/// Merges document shapes: every field seen anywhere, in discovery order.
///
/// A field is nullable unless it holds a non-null value in every document;
/// its type is the kind of its first observed value, `null` included.
pub fn merge_shapes(documents: &[Document]) -> Vec<DataModelField> {
    let mut order: Vec<String> = Vec::new();
    let mut shapes: HashMap<String, FieldShape> = HashMap::new();

    for document in documents {
        for (key, value) in document {
            let shape = shapes.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                FieldShape {
                    data_type: type_name(value),
                    non_null: 0,
                }
            });
            if !matches!(value, Bson::Null | Bson::Undefined) {
                shape.non_null += 1;
            }
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let shape = shapes.remove(&name)?;
            let is_primary = name == "_id";
            Some(DataModelField {
                is_nullable: shape.non_null < documents.len(),
                data_type: shape.data_type.to_string(),
                tags: if is_primary {
                    vec!["Primary Key".to_string()]
                } else {
                    Vec::new()
                },
                is_primary,
                name,
            })
        })
        .collect()
}
