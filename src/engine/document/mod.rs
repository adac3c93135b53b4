//! Document backend core: shell translation, dispatch, normalization and
//! sampling introspection over a [`DocumentStore`](dispatcher::DocumentStore).

pub mod dispatcher;
pub mod engine;
pub mod introspector;
pub mod literal;
pub mod normalizer;
pub mod operation;
pub mod translator;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{DocumentStore, DocumentStream, NativeOutcome, UpdateOutcome};
pub use engine::DocumentEngine;
pub use operation::{Operation, OperationKind, StructuredOperation};
pub use translator::translate;
