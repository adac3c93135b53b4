//! Shell query translator
//!
//! Turns `db.<collection>.<method>(<args>)[.limit(n)][.skip(n)][.sort(doc)]`
//! into a [`StructuredOperation`]. Pure: no I/O, and malformed input never
//! yields a partial operation.

use mongodb::bson::{Bson, Document};

use crate::engine::document::literal::Scanner;
use crate::engine::document::operation::{
    Arity, CursorModifiers, Operation, OperationKind, StructuredOperation, UpdateSpec,
};
use crate::engine::error::{EngineError, EngineResult};

/// Parses one shell expression.
pub fn translate(text: &str) -> EngineResult<StructuredOperation> {
    let mut scanner = Scanner::new(text);

    if scanner.word(false) != Some("db") {
        return Err(scanner.error("Query must start with 'db'"));
    }

    let (collection, method) = target_and_method(&mut scanner)?;
    let kind = OperationKind::from_method(method)
        .ok_or_else(|| EngineError::syntax_error(format!("Unsupported method '{}'", method)))?;

    match (&collection, kind.targets_collection()) {
        (Some(name), false) => {
            return Err(EngineError::syntax_error(format!(
                "'{}' is a database method, not a method of collection '{}'",
                method, name
            )))
        }
        (None, true) => {
            return Err(EngineError::syntax_error(format!(
                "'{}' needs a collection: db.<collection>.{}(...)",
                method, method
            )))
        }
        _ => {}
    }

    let arguments = call_arguments(&mut scanner)?;
    let mut operation = build_operation(kind, arguments)?;

    while scanner.eat('.') {
        let modifier = scanner
            .word(false)
            .ok_or_else(|| scanner.error("Expected a cursor method"))?;
        let mut arguments = call_arguments(&mut scanner)?;
        let Operation::Find { modifiers, .. } = &mut operation else {
            return Err(EngineError::syntax_error(format!(
                "'.{}()' can only follow find()",
                modifier
            )));
        };
        apply_modifier(modifiers, modifier, &mut arguments)?;
    }

    scanner.eat(';');
    scanner.skip_ws();
    if !scanner.is_eof() {
        return Err(scanner.error("Unexpected trailing input"));
    }

    Ok(StructuredOperation {
        collection,
        operation,
    })
}

/// Reads everything between `db` and the method's `(`.
fn target_and_method<'a>(scanner: &mut Scanner<'a>) -> EngineResult<(Option<String>, &'a str)> {
    // db["name"].method(...)
    if scanner.eat('[') {
        let name = scanner.string()?;
        scanner.expect(']')?;
        scanner.expect('.')?;
        let method = method_name(scanner)?;
        return Ok((Some(collection_name(name)?), method));
    }

    scanner.expect('.')?;
    let mut segments: Vec<&'a str> = Vec::new();
    loop {
        let segment = scanner
            .word(false)
            .ok_or_else(|| scanner.error("Expected a collection or method name"))?;
        scanner.skip_ws();
        if scanner.peek() == Some('(') {
            if segments.is_empty() && segment == "getCollection" {
                let name = single_string_argument(scanner)?;
                scanner.expect('.')?;
                let method = method_name(scanner)?;
                return Ok((Some(collection_name(name)?), method));
            }
            let collection = if segments.is_empty() {
                None
            } else {
                Some(segments.join("."))
            };
            return Ok((collection, segment));
        }
        segments.push(segment);
        scanner.expect('.')?;
    }
}

fn method_name<'a>(scanner: &mut Scanner<'a>) -> EngineResult<&'a str> {
    let method = scanner
        .word(false)
        .ok_or_else(|| scanner.error("Expected a method name"))?;
    scanner.skip_ws();
    if scanner.peek() != Some('(') {
        return Err(scanner.error("Expected '('"));
    }
    Ok(method)
}

fn collection_name(name: String) -> EngineResult<String> {
    if name.is_empty() {
        Err(EngineError::syntax_error("Collection name is empty"))
    } else {
        Ok(name)
    }
}

fn single_string_argument(scanner: &mut Scanner<'_>) -> EngineResult<String> {
    scanner.expect('(')?;
    let value = scanner.string()?;
    scanner.expect(')')?;
    Ok(value)
}

/// `( value, value, ... )`
fn call_arguments(scanner: &mut Scanner<'_>) -> EngineResult<Vec<Bson>> {
    scanner.expect('(')?;
    let mut arguments = Vec::new();
    if scanner.eat(')') {
        return Ok(arguments);
    }
    loop {
        arguments.push(scanner.value()?);
        if scanner.eat(',') {
            continue;
        }
        scanner.expect(')')?;
        return Ok(arguments);
    }
}

fn build_operation(kind: OperationKind, arguments: Vec<Bson>) -> EngineResult<Operation> {
    let count = arguments.len();
    let arity_ok = match kind.arity() {
        Arity::None => count == 0,
        Arity::Optional => count <= 1,
        Arity::Exactly(n) => count == n,
    };
    if !arity_ok {
        let expected = match kind.arity() {
            Arity::None => "no arguments".to_string(),
            Arity::Optional => "at most 1 argument".to_string(),
            Arity::Exactly(1) => "exactly 1 argument".to_string(),
            Arity::Exactly(n) => format!("exactly {} arguments", n),
        };
        return Err(EngineError::syntax_error(format!(
            "{}() takes {}, got {}",
            kind, expected, count
        )));
    }

    let mut arguments = arguments.into_iter();
    let mut next = || arguments.next();

    let operation = match kind {
        OperationKind::FindOne => Operation::FindOne {
            filter: optional_document(kind, next())?,
        },
        OperationKind::Find => Operation::Find {
            filter: optional_document(kind, next())?,
            modifiers: CursorModifiers::default(),
        },
        OperationKind::InsertOne => Operation::InsertOne {
            document: document(kind, next())?,
        },
        OperationKind::InsertMany => {
            let documents = document_array(kind, next())?;
            if documents.is_empty() {
                return Err(EngineError::syntax_error(
                    "insertMany() needs at least one document",
                ));
            }
            Operation::InsertMany { documents }
        }
        OperationKind::DeleteOne => Operation::DeleteOne {
            filter: document(kind, next())?,
        },
        OperationKind::DeleteMany => Operation::DeleteMany {
            filter: document(kind, next())?,
        },
        OperationKind::UpdateOne | OperationKind::UpdateMany => {
            let filter = document(kind, next())?;
            let update = match next() {
                Some(Bson::Document(update)) => UpdateSpec::Document(update),
                Some(pipeline @ Bson::Array(_)) => {
                    UpdateSpec::Pipeline(document_array(kind, Some(pipeline))?)
                }
                _ => {
                    return Err(EngineError::syntax_error(format!(
                        "{}() update must be a document or a pipeline",
                        kind
                    )))
                }
            };
            if kind == OperationKind::UpdateOne {
                Operation::UpdateOne { filter, update }
            } else {
                Operation::UpdateMany { filter, update }
            }
        }
        OperationKind::RunCommand => {
            let command = document(kind, next())?;
            if command.is_empty() {
                return Err(EngineError::syntax_error("runCommand() needs a command name"));
            }
            Operation::RunCommand { command }
        }
        OperationKind::ListIndexes => Operation::ListIndexes,
        OperationKind::ListCollections => Operation::ListCollections {
            filter: optional_document(kind, next())?,
        },
        OperationKind::Count => Operation::Count {
            filter: optional_document(kind, next())?,
        },
        OperationKind::Aggregate => Operation::Aggregate {
            pipeline: match next() {
                None => Vec::new(),
                some => document_array(kind, some)?,
            },
        },
    };
    Ok(operation)
}

fn document(kind: OperationKind, argument: Option<Bson>) -> EngineResult<Document> {
    match argument {
        Some(Bson::Document(document)) => Ok(document),
        _ => Err(EngineError::syntax_error(format!(
            "{}() expects a document argument",
            kind
        ))),
    }
}

fn optional_document(kind: OperationKind, argument: Option<Bson>) -> EngineResult<Document> {
    match argument {
        None => Ok(Document::new()),
        some => document(kind, some),
    }
}

fn document_array(kind: OperationKind, argument: Option<Bson>) -> EngineResult<Vec<Document>> {
    let Some(Bson::Array(items)) = argument else {
        return Err(EngineError::syntax_error(format!(
            "{}() expects an array of documents",
            kind
        )));
    };
    items
        .into_iter()
        .map(|item| match item {
            Bson::Document(document) => Ok(document),
            _ => Err(EngineError::syntax_error(format!(
                "{}() expects an array of documents",
                kind
            ))),
        })
        .collect()
}

fn apply_modifier(
    modifiers: &mut CursorModifiers,
    name: &str,
    arguments: &mut Vec<Bson>,
) -> EngineResult<()> {
    let single = |arguments: &mut Vec<Bson>| -> EngineResult<Bson> {
        if arguments.len() != 1 {
            return Err(EngineError::syntax_error(format!(
                "{}() takes exactly 1 argument",
                name
            )));
        }
        Ok(arguments.remove(0))
    };

    match name {
        "limit" => modifiers.limit = Some(integer(name, single(arguments)?)?),
        "skip" => {
            let skip = integer(name, single(arguments)?)?;
            modifiers.skip = Some(u64::try_from(skip).map_err(|_| {
                EngineError::syntax_error(format!("skip() must not be negative, got {}", skip))
            })?);
        }
        "sort" => match single(arguments)? {
            Bson::Document(sort) => modifiers.sort = Some(sort),
            _ => return Err(EngineError::syntax_error("sort() expects a document")),
        },
        "pretty" | "toArray" if arguments.is_empty() => {}
        other => {
            return Err(EngineError::syntax_error(format!(
                "Unsupported cursor method '{}'",
                other
            )))
        }
    }
    Ok(())
}

fn integer(name: &str, value: Bson) -> EngineResult<i64> {
    match value {
        Bson::Int32(v) => Ok(i64::from(v)),
        Bson::Int64(v) => Ok(v),
        Bson::Double(v) if v.fract() == 0.0 => Ok(v as i64),
        _ => Err(EngineError::syntax_error(format!(
            "{}() expects an integer",
            name
        ))),
    }
}
