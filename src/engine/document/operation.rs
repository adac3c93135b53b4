//! Structured document operations
//!
//! A closed set of operation kinds, each with a fixed payload. The translator
//! decodes shell text into these once; the dispatcher only ever matches on
//! them.

use std::fmt;

use mongodb::bson::{Bson, Document};

use crate::engine::types::QueryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    FindOne,
    Find,
    InsertOne,
    InsertMany,
    DeleteOne,
    DeleteMany,
    UpdateOne,
    UpdateMany,
    RunCommand,
    ListIndexes,
    ListCollections,
    Count,
    Aggregate,
}

/// How many arguments a shell method takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    Optional,
    Exactly(usize),
}

impl OperationKind {
    pub const ALL: [OperationKind; 13] = [
        Self::FindOne,
        Self::Find,
        Self::InsertOne,
        Self::InsertMany,
        Self::DeleteOne,
        Self::DeleteMany,
        Self::UpdateOne,
        Self::UpdateMany,
        Self::RunCommand,
        Self::ListIndexes,
        Self::ListCollections,
        Self::Count,
        Self::Aggregate,
    ];

    /// Shell method name.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::FindOne => "findOne",
            Self::Find => "find",
            Self::InsertOne => "insertOne",
            Self::InsertMany => "insertMany",
            Self::DeleteOne => "deleteOne",
            Self::DeleteMany => "deleteMany",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::RunCommand => "runCommand",
            Self::ListIndexes => "getIndexes",
            Self::ListCollections => "getCollectionNames",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
        }
    }

    pub fn from_method(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.method_name() == name)
    }

    pub fn is_read(&self) -> bool {
        !matches!(
            self,
            Self::InsertOne
                | Self::InsertMany
                | Self::DeleteOne
                | Self::DeleteMany
                | Self::UpdateOne
                | Self::UpdateMany
        )
    }

    /// Reads are audited, except single-document lookups.
    pub fn is_audited(&self) -> bool {
        self.is_read() && *self != Self::FindOne
    }

    pub fn arity(&self) -> Arity {
        match self {
            Self::FindOne | Self::Find | Self::Count | Self::ListCollections | Self::Aggregate => {
                Arity::Optional
            }
            Self::InsertOne
            | Self::InsertMany
            | Self::DeleteOne
            | Self::DeleteMany
            | Self::RunCommand => Arity::Exactly(1),
            Self::UpdateOne | Self::UpdateMany => Arity::Exactly(2),
            Self::ListIndexes => Arity::None,
        }
    }

    /// Whether the method is addressed to a collection rather than the
    /// database.
    pub fn targets_collection(&self) -> bool {
        !matches!(self, Self::RunCommand | Self::ListCollections)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

/// `.limit()`, `.skip()` and `.sort()` captured from a `find` chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorModifiers {
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub sort: Option<Document>,
}

/// Second argument of `updateOne`/`updateMany`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateSpec {
    Document(Document),
    Pipeline(Vec<Document>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FindOne { filter: Document },
    Find { filter: Document, modifiers: CursorModifiers },
    InsertOne { document: Document },
    InsertMany { documents: Vec<Document> },
    DeleteOne { filter: Document },
    DeleteMany { filter: Document },
    UpdateOne { filter: Document, update: UpdateSpec },
    UpdateMany { filter: Document, update: UpdateSpec },
    RunCommand { command: Document },
    ListIndexes,
    ListCollections { filter: Document },
    Count { filter: Document },
    Aggregate { pipeline: Vec<Document> },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::FindOne { .. } => OperationKind::FindOne,
            Self::Find { .. } => OperationKind::Find,
            Self::InsertOne { .. } => OperationKind::InsertOne,
            Self::InsertMany { .. } => OperationKind::InsertMany,
            Self::DeleteOne { .. } => OperationKind::DeleteOne,
            Self::DeleteMany { .. } => OperationKind::DeleteMany,
            Self::UpdateOne { .. } => OperationKind::UpdateOne,
            Self::UpdateMany { .. } => OperationKind::UpdateMany,
            Self::RunCommand { .. } => OperationKind::RunCommand,
            Self::ListIndexes => OperationKind::ListIndexes,
            Self::ListCollections { .. } => OperationKind::ListCollections,
            Self::Count { .. } => OperationKind::Count,
            Self::Aggregate { .. } => OperationKind::Aggregate,
        }
    }

    /// Ordered argument documents, as they appeared in the call.
    pub fn arguments(&self) -> Vec<Bson> {
        let docs = |items: &[Document]| Bson::Array(items.iter().cloned().map(Bson::Document).collect());
        match self {
            Self::FindOne { filter }
            | Self::Find { filter, .. }
            | Self::DeleteOne { filter }
            | Self::DeleteMany { filter }
            | Self::ListCollections { filter }
            | Self::Count { filter } => vec![Bson::Document(filter.clone())],
            Self::InsertOne { document } => vec![Bson::Document(document.clone())],
            Self::InsertMany { documents } => vec![docs(documents)],
            Self::UpdateOne { filter, update } | Self::UpdateMany { filter, update } => {
                let update = match update {
                    UpdateSpec::Document(document) => Bson::Document(document.clone()),
                    UpdateSpec::Pipeline(stages) => docs(stages),
                };
                vec![Bson::Document(filter.clone()), update]
            }
            Self::RunCommand { command } => vec![Bson::Document(command.clone())],
            Self::ListIndexes => Vec::new(),
            Self::Aggregate { pipeline } => vec![docs(pipeline)],
        }
    }

    /// Read/write classification under `config`.
    ///
    /// `runCommand` is a read unless its command name is listed in
    /// `config.mutating_commands`.
    pub fn is_write(&self, config: &QueryConfig) -> bool {
        match self {
            Self::RunCommand { command } => command
                .keys()
                .next()
                .is_some_and(|name| config.is_mutating_command(name)),
            other => !other.kind().is_read(),
        }
    }
}

/// A decoded shell query: operation plus target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOperation {
    /// `None` for database-level operations.
    pub collection: Option<String>,
    pub operation: Operation,
}

impl StructuredOperation {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Target collection; operations that need one always carry it.
    pub fn collection_name(&self) -> &str {
        self.collection.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;
    use std::sync::Arc;

    #[test]
    fn method_names_round_trip() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_method(kind.method_name()), Some(kind));
        }
        assert_eq!(OperationKind::from_method("drop"), None);
    }

    #[test]
    fn audit_policy_covers_reads_except_find_one() {
        let audited: Vec<OperationKind> = OperationKind::ALL
            .into_iter()
            .filter(OperationKind::is_audited)
            .collect();
        assert_eq!(
            audited,
            vec![
                OperationKind::Find,
                OperationKind::RunCommand,
                OperationKind::ListIndexes,
                OperationKind::ListCollections,
                OperationKind::Count,
                OperationKind::Aggregate,
            ]
        );
    }

    #[test]
    fn run_command_override_marks_writes() {
        let drop = Operation::RunCommand {
            command: doc! { "dropDatabase": 1 },
        };
        assert!(!drop.is_write(&QueryConfig::default()));

        let config = QueryConfig::default()
            .with_mutating_commands(Arc::from(vec!["dropDatabase".to_string()]));
        assert!(drop.is_write(&config));
        assert!(Operation::DeleteOne { filter: doc! {} }.is_write(&QueryConfig::default()));
    }

    #[test]
    fn update_arguments_keep_order() {
        let op = Operation::UpdateOne {
            filter: doc! { "a": 1 },
            update: UpdateSpec::Document(doc! { "$set": { "b": 2 } }),
        };
        assert_eq!(
            op.arguments(),
            vec![
                Bson::Document(doc! { "a": 1 }),
                Bson::Document(doc! { "$set": { "b": 2 } })
            ]
        );
    }
}
