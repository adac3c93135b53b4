//! SQL statement classification for read-only enforcement.

use sqlparser::{
    ast::{Query, Select, SetExpr, Statement},
    dialect::{Dialect, GenericDialect, PostgreSqlDialect},
    parser::Parser,
};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlClassification {
    /// At least one statement may write data or schema.
    pub is_mutation: bool,
    pub statement_count: usize,
}

/// Parses `sql` in the backend's dialect and classifies it.
///
/// Unparseable text is a syntax error; callers decide whether that blocks
/// execution.
pub fn classify_sql(backend: BackendKind, sql: &str) -> EngineResult<SqlClassification> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EngineError::syntax_error("Empty SQL"));
    }

    let dialect = dialect_for(backend);
    let statements = Parser::parse_sql(&*dialect, trimmed)
        .map_err(|err| EngineError::syntax_error(err.to_string()))?;

    Ok(SqlClassification {
        is_mutation: statements.iter().any(is_mutation_statement),
        statement_count: statements.len(),
    })
}

fn dialect_for(backend: BackendKind) -> Box<dyn Dialect> {
    match backend {
        BackendKind::Postgres => Box::new(PostgreSqlDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

fn is_mutation_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_is_mutation(query),
        Statement::Explain {
            analyze,
            statement,
            ..
        } => {
            if *analyze {
                is_mutation_statement(statement)
            } else {
                false
            }
        }
        Statement::ExplainTable { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCharset(_)
        | Statement::ShowObjects(_)
        | Statement::ShowTables { .. }
        | Statement::ShowViews { .. }
        | Statement::ShowCollation { .. }
        | Statement::Set(_)
        | Statement::Use(_)
        | Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => false,
        _ => true,
    }
}

fn query_is_mutation(query: &Query) -> bool {
    set_expr_is_mutation(&query.body)
}

fn set_expr_is_mutation(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select_has_into(select),
        SetExpr::Query(query) => query_is_mutation(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_mutation(left) || set_expr_is_mutation(right)
        }
        SetExpr::Insert(_)
        | SetExpr::Update(_)
        | SetExpr::Delete(_)
        | SetExpr::Merge(_) => true,
        SetExpr::Values(_) | SetExpr::Table(_) => false,
    }
}

fn select_has_into(select: &Select) -> bool {
    select.into.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> SqlClassification {
        classify_sql(BackendKind::Postgres, sql).expect("should parse")
    }

    #[test]
    fn cte_select_is_read_only() {
        let analysis = classify("WITH cte AS (SELECT * FROM users) SELECT * FROM cte");
        assert!(!analysis.is_mutation);
        assert_eq!(analysis.statement_count, 1);
    }

    #[test]
    fn multi_statement_flags_mutation() {
        let analysis = classify("SELECT 1; UPDATE users SET name = 'x' WHERE id = 1;");
        assert!(analysis.is_mutation);
        assert_eq!(analysis.statement_count, 2);
    }

    #[test]
    fn select_into_is_mutation() {
        assert!(classify("SELECT * INTO new_table FROM old_table").is_mutation);
    }

    #[test]
    fn ddl_is_mutation() {
        assert!(classify("ALTER TABLE users ADD COLUMN age INT").is_mutation);
        assert!(classify("DROP TABLE users").is_mutation);
    }

    #[test]
    fn explain_without_analyze_is_read_only() {
        assert!(!classify("EXPLAIN DELETE FROM users").is_mutation);
        assert!(classify("EXPLAIN ANALYZE DELETE FROM users").is_mutation);
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        let err = classify_sql(BackendKind::Postgres, "SELEC FROM").unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError { .. }));
        let err = classify_sql(BackendKind::Postgres, "   ").unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError { .. }));
    }
}
