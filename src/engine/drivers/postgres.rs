//! PostgreSQL Driver
//!
//! Implements the relational `DataEngine` over a SQLx pool. Raw queries go
//! through the simple query protocol so multi-statement scripts work; rows
//! are addressed by `ctid` for the semantic row edits.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Either, Row as SqlxRow, ValueRef};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::sql_safety::classify_sql;
use crate::engine::traits::{ClientHandle, DataEngine, Driver};
use crate::engine::types::{
    BackendKind, DataModel, DataModelField, DataModelIndex, DataRequest, DialTarget, QueryConfig,
    Row, TabularResult, Value,
};

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_DATABASE: &str = "postgres";

/// Filter operators accepted by [`build_select`]; the unary ones take no value.
const BINARY_OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "ILIKE", "NOT ILIKE",
];
const UNARY_OPERATORS: &[&str] = &["IS NULL", "IS NOT NULL"];

/// PostgreSQL driver: dials a pool per connection.
pub struct PostgresDriver {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    fn connect_options(target: &DialTarget) -> PgConnectOptions {
        let database = if target.database.is_empty() {
            DEFAULT_DATABASE
        } else {
            target.database.as_str()
        };
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.username)
            .database(database)
            .ssl_mode(if target.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Disable
            });
        if let Some(password) = &target.password {
            options = options.password(password.expose());
        }
        options
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    #[instrument(skip(self, target), fields(connection_id = %target.connection_id, host = %target.host, port = target.port))]
    async fn connect(&self, target: &DialTarget) -> EngineResult<ClientHandle> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(target))
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("password authentication failed") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        Ok(std::sync::Arc::new(PostgresEngine::new(pool)))
    }
}

/// Live PostgreSQL session.
pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs `sql` (one or more statements); returns every row plus the
    /// summed affected-row count.
    async fn fetch(&self, sql: &str, config: &QueryConfig) -> EngineResult<(Vec<PgRow>, u64)> {
        let pool = &self.pool;
        let results = config
            .guard(async {
                sqlx::raw_sql(sql)
                    .fetch_many(pool)
                    .try_collect::<Vec<_>>()
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;

        let mut rows = Vec::new();
        let mut rows_affected = 0u64;
        for item in results {
            match item {
                Either::Left(done) => rows_affected += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
        Ok((rows, rows_affected))
    }

    /// Like [`fetch`](Self::fetch), but statements without rows are reported
    /// as a single `rowsAffected` row.
    async fn fetch_table(&self, sql: &str, config: &QueryConfig) -> EngineResult<TabularResult> {
        let started = Instant::now();
        let (rows, rows_affected) = self.fetch(sql, config).await?;
        let mut result = if rows.is_empty() {
            TabularResult::scalars([("rowsAffected", Value::Int(rows_affected as i64))])
        } else {
            rows_to_table(&rows)
        };
        result.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    fn deny_writes(config: &QueryConfig, operation: &str) -> EngineResult<()> {
        if config.read_only {
            Err(EngineError::read_only_violation(operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataEngine for PostgresEngine {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn test_connection(&self, config: &QueryConfig) -> EngineResult<()> {
        let pool = &self.pool;
        config
            .guard(async {
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, query, config), fields(query_len = query.len()))]
    async fn run_query(&self, query: &str, config: &QueryConfig) -> EngineResult<TabularResult> {
        let sql = query.trim();
        if sql.is_empty() {
            return Err(EngineError::syntax_error("Empty SQL"));
        }

        if config.read_only {
            match classify_sql(BackendKind::Postgres, sql) {
                Ok(classification) if classification.is_mutation => {
                    return Err(EngineError::read_only_violation("SQL mutation"));
                }
                Ok(_) => {}
                Err(_) => return Err(EngineError::read_only_violation("unclassifiable SQL")),
            }
        }

        let result = self.fetch_table(sql, config).await?;
        config.audit(sql);
        Ok(result)
    }

    async fn get_data_models(&self, config: &QueryConfig) -> EngineResult<Vec<DataModel>> {
        let pool = &self.pool;
        let rows: Vec<(String, String)> = config
            .guard(async {
                sqlx::query_as(
                    r#"
                    SELECT table_schema::text, table_name::text
                    FROM information_schema.tables
                    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
                      AND table_schema NOT LIKE 'pg_toast%'
                    ORDER BY table_schema, table_name
                    "#,
                )
                .fetch_all(pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(schema_name, name)| DataModel {
                name,
                schema_name,
                ..DataModel::default()
            })
            .collect())
    }

    async fn get_single_data_model(
        &self,
        schema: &str,
        name: &str,
        config: &QueryConfig,
    ) -> EngineResult<DataModel> {
        let schema = schema_or_default(schema);
        let pool = &self.pool;

        let columns: Vec<(String, String, bool, Vec<String>)> = config
            .guard(async {
                sqlx::query_as(
                    r#"
                    SELECT a.attname::text,
                           format_type(a.atttypid, a.atttypmod),
                           NOT a.attnotnull,
                           COALESCE(
                               array_agg(DISTINCT c.contype::text) FILTER (WHERE c.contype IS NOT NULL),
                               '{}'
                           )
                    FROM pg_attribute a
                    JOIN pg_class t ON t.oid = a.attrelid
                    JOIN pg_namespace n ON n.oid = t.relnamespace
                    LEFT JOIN pg_constraint c
                           ON c.conrelid = t.oid AND a.attnum = ANY (c.conkey)
                    WHERE n.nspname = $1 AND t.relname = $2
                      AND a.attnum > 0 AND NOT a.attisdropped
                    GROUP BY a.attnum, a.attname, a.atttypid, a.atttypmod, a.attnotnull
                    ORDER BY a.attnum
                    "#,
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;

        if columns.is_empty() {
            return Err(EngineError::execution_error(format!(
                "Table {}.{} not found",
                schema, name
            )));
        }

        let indexes: Vec<(String, String)> = config
            .guard(async {
                sqlx::query_as(
                    r#"
                    SELECT indexname::text, indexdef::text
                    FROM pg_indexes
                    WHERE schemaname = $1 AND tablename = $2
                    ORDER BY indexname
                    "#,
                )
                .bind(schema)
                .bind(name)
                .fetch_all(pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;

        Ok(DataModel {
            name: name.to_string(),
            schema_name: schema.to_string(),
            fields: columns
                .into_iter()
                .map(|(name, data_type, is_nullable, constraints)| {
                    field_from_catalog(name, data_type, is_nullable, &constraints)
                })
                .collect(),
            indexes: indexes
                .into_iter()
                .map(|(name, definition)| DataModelIndex { name, definition })
                .collect(),
        })
    }

    async fn get_data(
        &self,
        request: &DataRequest,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        let started = Instant::now();
        let (select, count) = build_select(request)?;
        let (rows, _) = self.fetch(&select, config).await?;
        let mut result = rows_to_table(&rows);
        if request.fetch_count {
            let (counted, _) = self.fetch(&count, config).await?;
            result.count = counted
                .first()
                .and_then(|row| row.try_get::<i64, _>("count").ok())
                .map(|count| count.max(0) as u64);
        }
        result.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    async fn add_row(
        &self,
        schema: &str,
        name: &str,
        row: &JsonMap<String, JsonValue>,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        Self::deny_writes(config, "INSERT")?;
        self.fetch_table(&build_insert(schema, name, row), config).await
    }

    async fn delete_rows(
        &self,
        schema: &str,
        name: &str,
        ids: &[String],
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        Self::deny_writes(config, "DELETE")?;
        if ids.is_empty() {
            return Ok(TabularResult::scalars([("deletedCount", Value::Int(0))]));
        }
        let sql = build_delete(schema, name, ids)?;
        let outcome = self.fetch_table(&sql, config).await?;
        let deleted = outcome.first_value("rowsAffected").cloned().unwrap_or(Value::Int(0));
        Ok(TabularResult::scalars([("deletedCount", deleted)]))
    }

    async fn update_single_cell(
        &self,
        schema: &str,
        name: &str,
        id: &str,
        column: &str,
        value: &str,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        Self::deny_writes(config, "UPDATE")?;
        let sql = build_update(schema, name, id, column, value)?;
        self.fetch_table(&sql, config).await
    }

    async fn add_field(
        &self,
        schema: &str,
        name: &str,
        field: &DataModelField,
        config: &QueryConfig,
    ) -> EngineResult<()> {
        Self::deny_writes(config, "ALTER TABLE")?;
        let sql = build_add_column(schema, name, field)?;
        self.fetch_table(&sql, config).await?;
        Ok(())
    }

    async fn delete_field(
        &self,
        schema: &str,
        name: &str,
        field_name: &str,
        config: &QueryConfig,
    ) -> EngineResult<()> {
        Self::deny_writes(config, "ALTER TABLE")?;
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified(schema, name),
            quote_ident(field_name)
        );
        self.fetch_table(&sql, config).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Server-side failures, syntax errors included, are driver errors.
fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    EngineError::execution_error(err.to_string())
}

fn schema_or_default(schema: &str) -> &str {
    if schema.trim().is_empty() {
        DEFAULT_SCHEMA
    } else {
        schema
    }
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema_or_default(schema)), quote_ident(name))
}

/// `(block,offset)` as rendered by `ctid::text`.
fn ctid_literal(ctid: &str) -> EngineResult<String> {
    let inner = ctid
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| EngineError::syntax_error(format!("Invalid row id '{}'", ctid)))?;
    let valid = inner
        .split_once(',')
        .map(|(block, offset)| {
            block.trim().parse::<u32>().is_ok() && offset.trim().parse::<u16>().is_ok()
        })
        .unwrap_or(false);
    if !valid {
        return Err(EngineError::syntax_error(format!("Invalid row id '{}'", ctid)));
    }
    Ok(format!("'({})'::tid", inner.replace(' ', "")))
}

fn json_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

/// Builds the page query and its matching count query.
pub(crate) fn build_select(request: &DataRequest) -> EngineResult<(String, String)> {
    if request.name.trim().is_empty() {
        return Err(EngineError::syntax_error("Table name is empty"));
    }
    let table = qualified(&request.schema, &request.name);

    let mut predicate = String::new();
    if let [column, operator, rest @ ..] = request.filter.as_slice() {
        let operator = operator.trim().to_uppercase();
        if UNARY_OPERATORS.contains(&operator.as_str()) {
            predicate = format!(" WHERE {} {}", quote_ident(column), operator);
        } else if BINARY_OPERATORS.contains(&operator.as_str()) {
            let value = rest
                .first()
                .ok_or_else(|| EngineError::syntax_error(format!("Operator {} needs a value", operator)))?;
            predicate = format!(" WHERE {} {} {}", quote_ident(column), operator, quote_literal(value));
        } else {
            return Err(EngineError::syntax_error(format!("Unsupported filter operator '{}'", operator)));
        }
    }

    let mut order = String::new();
    if let [column, rest @ ..] = request.sort.as_slice() {
        let direction = match rest.first().map(|d| d.trim().to_uppercase()) {
            None => "ASC".to_string(),
            Some(d) if d == "ASC" || d == "DESC" => d,
            Some(d) => return Err(EngineError::syntax_error(format!("Invalid sort direction '{}'", d))),
        };
        order = format!(" ORDER BY {} {}", quote_ident(column), direction);
    }

    let mut select = format!("SELECT ctid::text AS ctid, * FROM {}{}{}", table, predicate, order);
    if request.limit > 0 {
        select.push_str(&format!(" LIMIT {}", request.limit));
    }
    select.push_str(&format!(" OFFSET {}", request.offset));

    let count = format!("SELECT count(*) AS count FROM {}{}", table, predicate);
    Ok((select, count))
}

pub(crate) fn build_insert(schema: &str, name: &str, row: &JsonMap<String, JsonValue>) -> String {
    let table = qualified(schema, name);
    if row.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES RETURNING ctid::text AS ctid", table);
    }
    let columns: Vec<String> = row.keys().map(|column| quote_ident(column)).collect();
    let values: Vec<String> = row.values().map(json_literal).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING ctid::text AS ctid",
        table,
        columns.join(", "),
        values.join(", ")
    )
}

pub(crate) fn build_delete(schema: &str, name: &str, ids: &[String]) -> EngineResult<String> {
    let ctids = ids
        .iter()
        .map(|id| ctid_literal(id))
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(format!(
        "DELETE FROM {} WHERE ctid IN ({})",
        qualified(schema, name),
        ctids.join(", ")
    ))
}

pub(crate) fn build_update(
    schema: &str,
    name: &str,
    id: &str,
    column: &str,
    value: &str,
) -> EngineResult<String> {
    if column.is_empty() {
        return Err(EngineError::syntax_error("Column name is empty"));
    }
    Ok(format!(
        "UPDATE {} SET {} = {} WHERE ctid = {} RETURNING ctid::text AS ctid",
        qualified(schema, name),
        quote_ident(column),
        quote_literal(value),
        ctid_literal(id)?
    ))
}

/// Accepts type names such as `integer`, `character varying(255)`,
/// `numeric(10, 2)` or `text[]`.
fn is_valid_type(data_type: &str) -> bool {
    let data_type = data_type.trim();
    let base = data_type.strip_suffix("[]").unwrap_or(data_type);
    let (name, modifier) = match base.split_once('(') {
        Some((name, rest)) => (name, Some(rest)),
        None => (base, None),
    };
    let name_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ');
    let modifier_ok = match modifier {
        None => true,
        Some(rest) => rest.strip_suffix(')').is_some_and(|args| {
            !args.is_empty()
                && args
                    .split(',')
                    .all(|arg| !arg.trim().is_empty() && arg.trim().chars().all(|c| c.is_ascii_digit()))
        }),
    };
    name_ok && modifier_ok
}

pub(crate) fn build_add_column(schema: &str, name: &str, field: &DataModelField) -> EngineResult<String> {
    if field.name.trim().is_empty() {
        return Err(EngineError::syntax_error("Field name is empty"));
    }
    if !is_valid_type(&field.data_type) {
        return Err(EngineError::syntax_error(format!(
            "Invalid data type '{}'",
            field.data_type
        )));
    }
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        qualified(schema, name),
        quote_ident(&field.name),
        field.data_type.trim()
    );
    if field.is_primary {
        sql.push_str(" PRIMARY KEY");
    } else if !field.is_nullable {
        sql.push_str(" NOT NULL");
    }
    Ok(sql)
}

fn field_from_catalog(
    name: String,
    data_type: String,
    is_nullable: bool,
    constraints: &[String],
) -> DataModelField {
    let tags: Vec<String> = constraints
        .iter()
        .filter_map(|contype| match contype.as_str() {
            "p" => Some("Primary Key"),
            "f" => Some("Foreign Key"),
            "u" => Some("Unique"),
            "c" => Some("Check"),
            _ => None,
        })
        .map(str::to_string)
        .collect();
    DataModelField {
        is_primary: constraints.iter().any(|c| c == "p"),
        name,
        data_type,
        is_nullable,
        tags,
    }
}

/// Column names in order; repeated names get a `_2`, `_3`... suffix.
fn unique_keys(row: &PgRow) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(row.columns().len());
    for column in row.columns() {
        let mut key = column.name().to_string();
        let mut n = 2;
        while keys.contains(&key) {
            key = format!("{}_{}", column.name(), n);
            n += 1;
        }
        keys.push(key);
    }
    keys
}

fn rows_to_table(rows: &[PgRow]) -> TabularResult {
    let mut keys: Vec<String> = Vec::new();
    let mut table_rows = Vec::with_capacity(rows.len());
    for pg_row in rows {
        let row_keys = unique_keys(pg_row);
        let mut row = Row::with_capacity(row_keys.len());
        for (idx, key) in row_keys.into_iter().enumerate() {
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
            row.insert(key, extract_value(pg_row, idx));
        }
        table_rows.push(row);
    }
    TabularResult {
        keys,
        rows: table_rows,
        count: None,
        execution_time_ms: 0.0,
    }
}

/// Extracts a value from a PgRow at the given index
fn extract_value(row: &PgRow, idx: usize) -> Value {
    // Integers before bool so small ints are not misread
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f64::from(f))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
        return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }

    // Types without a decoder (tid, inet, uuid, ...) arrive as text
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => raw
            .as_str()
            .map(|text| Value::Text(text.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
