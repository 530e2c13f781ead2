use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "expenses",
    "organization_members",
    "organizations",
    "payments",
    "properties",
    "tenants",
    "units",
];

const MAX_PAGE_SIZE: i64 = 1000;

pub async fn list_rows(
    pool: &PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = allowed_table(table)?;
    let order_column = if order_by.trim().is_empty() {
        "created_at"
    } else {
        identifier(order_by)?
    };

    let mut query = filtered_select(table_name, filters)?;
    query
        .push(" ORDER BY t.")
        .push(order_column)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, MAX_PAGE_SIZE))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(json_rows(rows))
}

pub async fn get_row(
    pool: &PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = allowed_table(table)?;
    let id_column = identifier(id_field)?;

    let mut query = select_rows(table_name);
    query.push(" AND ");
    push_comparison(
        &mut query,
        id_column,
        Comparison::Eq,
        &Bound::infer(id_column, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    row.and_then(json_row)
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn count_rows(
    pool: &PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = allowed_table(table)?;
    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    push_filters(&mut query, filters)?;

    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Inserts through `jsonb_populate_record` so Postgres coerces each column
/// (uuid, enum, date, bigint) from the table definition.
pub async fn create_row(
    pool: &PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = allowed_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    query.push(columns.join(", "));
    query.push(") SELECT ");
    query.push(
        columns
            .iter()
            .map(|column| format!("r.{column}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    push_populated_record(&mut query, table_name, payload);
    query
        .push(" RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    row.and_then(json_row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

/// Applies `payload` only while the row still matches `expected`. `None`
/// means the row is gone or another writer changed it first.
pub async fn update_row_matching(
    pool: &PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
    payload: &Map<String, Value>,
    expected: &Map<String, Value>,
) -> Result<Option<Value>, AppError> {
    let mut query = update_query(table, row_id, id_field, payload, expected)?;
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;
    Ok(row.and_then(json_row))
}

pub async fn delete_row(
    pool: &PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = allowed_table(table)?;
    let id_column = identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_comparison(
        &mut query,
        id_column,
        Comparison::Eq,
        &Bound::infer(id_column, &Value::String(row_id.to_string())),
    );
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

fn select_rows(table_name: &str) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    query
}

pub(crate) fn filtered_select(
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<QueryBuilder<'static, Postgres>, AppError> {
    let mut query = select_rows(allowed_table(table)?);
    push_filters(&mut query, filters)?;
    Ok(query)
}

fn update_query(
    table: &str,
    row_id: &str,
    id_field: &str,
    payload: &Map<String, Value>,
    expected: &Map<String, Value>,
) -> Result<QueryBuilder<'static, Postgres>, AppError> {
    let table_name = allowed_table(table)?;
    let id_column = identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    query.push(
        columns
            .iter()
            .map(|column| format!("{column} = r.{column}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    push_populated_record(&mut query, table_name, payload);
    query.push(" WHERE ");
    push_comparison(
        &mut query,
        id_column,
        Comparison::Eq,
        &Bound::infer(id_column, &Value::String(row_id.to_string())),
    );
    push_filters(&mut query, Some(expected))?;
    query.push(" RETURNING row_to_json(t) AS row");
    Ok(query)
}

fn push_populated_record(
    query: &mut QueryBuilder<'_, Postgres>,
    table_name: &str,
    payload: &Map<String, Value>,
) {
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r");
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<&str>, AppError> {
    let mut columns = payload
        .keys()
        .map(|key| identifier(key))
        .collect::<Result<Vec<_>, _>>()?;
    columns.sort_unstable();
    Ok(columns)
}

fn json_row(row: PgRow) -> Option<Value> {
    row.try_get::<Option<Value>, _>("row").ok().flatten()
}

fn json_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter().filter_map(json_row).collect()
}

fn allowed_table(table: &str) -> Result<&str, AppError> {
    let name = identifier(table)?;
    if ALLOWED_TABLES.contains(&name) {
        return Ok(name);
    }
    Err(AppError::Forbidden(format!("Table '{name}' is not allowed.")))
}

fn identifier(raw: &str) -> Result<&str, AppError> {
    let trimmed = raw.trim();
    let mut chars = trimmed.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_');
    let valid_rest = chars.all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    });
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !valid_start || !valid_rest {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    ILike,
    IsNull,
}

impl Comparison {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::ILike => " ILIKE ",
            Self::IsNull => " IS NULL",
        }
    }
}

/// Splits `due_date__gte` into the column and its comparison. Unknown
/// suffixes are treated as part of the column name.
fn parse_filter_key(filter_key: &str) -> Result<(&str, Comparison), AppError> {
    let (column, comparison) = match filter_key.rsplit_once("__") {
        Some((column, "gt")) => (column, Comparison::Gt),
        Some((column, "gte")) => (column, Comparison::Gte),
        Some((column, "lt")) => (column, Comparison::Lt),
        Some((column, "lte")) => (column, Comparison::Lte),
        Some((column, "ilike")) => (column, Comparison::ILike),
        Some((column, "is_null")) => (column, Comparison::IsNull),
        Some((column, "in")) => (column, Comparison::Eq),
        _ => (filter_key, Comparison::Eq),
    };
    Ok((identifier(column)?, comparison))
}

#[derive(Debug, Clone, PartialEq)]
enum Bound {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

impl Bound {
    fn infer(column: &str, value: &Value) -> Self {
        match value {
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float))
                .unwrap_or_else(|| Self::Text(number.to_string())),
            Value::String(text) => {
                let trimmed = text.trim();
                if is_uuid_column(column) {
                    if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                        return Self::Uuid(parsed);
                    }
                }
                if column.ends_with("_at") {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                        return Self::Timestamp(parsed);
                    }
                }
                if is_date_column(column) {
                    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                        return Self::Date(parsed);
                    }
                }
                Self::Text(text.clone())
            }
            Value::Null => Self::Text(String::new()),
            Value::Array(_) | Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Uuid(id) => id.to_string(),
            Self::Bool(flag) => flag.to_string(),
            Self::Int(number) => number.to_string(),
            Self::Float(number) => number.to_string(),
            Self::Date(value) => value.to_string(),
            Self::Timestamp(value) => value.to_rfc3339(),
        }
    }
}

fn push_filters(
    query: &mut QueryBuilder<'_, Postgres>,
    filters: Option<&Map<String, Value>>,
) -> Result<(), AppError> {
    let Some(filters) = filters else {
        return Ok(());
    };
    for (key, value) in filters {
        push_filter(query, key, value)?;
    }
    Ok(())
}

fn push_filter(
    query: &mut QueryBuilder<'_, Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, comparison) = parse_filter_key(filter_key)?;

    if comparison == Comparison::IsNull {
        let wants_null = !matches!(value, Value::Bool(false))
            && !matches!(value.as_str().map(str::trim), Some("false" | "0"));
        query.push(" AND t.").push(column);
        query.push(if wants_null { " IS NULL" } else { " IS NOT NULL" });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if comparison != Comparison::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND ");
            push_membership(query, column, items);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            push_comparison(query, column, comparison, &Bound::infer(column, value));
            Ok(())
        }
    }
}

fn push_comparison(
    query: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    comparison: Comparison,
    bound: &Bound,
) {
    query.push("t.").push(column);
    if comparison == Comparison::ILike {
        query.push("::text").push(comparison.sql()).push_bind(bound.as_text());
        return;
    }

    let operator = comparison.sql();
    match bound {
        Bound::Text(text) => {
            query.push("::text").push(operator).push_bind(text.clone());
        }
        Bound::Uuid(id) => {
            query.push(operator).push_bind(*id);
        }
        Bound::Bool(flag) => {
            query.push(operator).push_bind(*flag);
        }
        Bound::Int(number) => {
            query.push(operator).push_bind(*number);
        }
        Bound::Float(number) => {
            query.push(operator).push_bind(*number);
        }
        Bound::Date(date) => {
            query.push(operator).push_bind(*date);
        }
        Bound::Timestamp(timestamp) => {
            query.push(operator).push_bind(*timestamp);
        }
    }
}

fn push_membership(query: &mut QueryBuilder<'_, Postgres>, column: &str, items: &[Value]) {
    query.push("t.").push(column);

    if is_uuid_column(column) {
        let parsed = items
            .iter()
            .map(|item| item.as_str().and_then(|text| uuid::Uuid::parse_str(text.trim()).ok()))
            .collect::<Option<Vec<_>>>();
        if let Some(ids) = parsed {
            query.push(" = ANY(").push_bind(ids).push(")");
            return;
        }
    }
    if items.iter().all(|item| item.as_i64().is_some()) {
        let numbers = items.iter().filter_map(Value::as_i64).collect::<Vec<_>>();
        query.push(" = ANY(").push_bind(numbers).push(")");
        return;
    }

    let texts = items
        .iter()
        .map(|item| match item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    query.push("::text = ANY(").push_bind(texts).push(")");
}

fn is_uuid_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id")
}

fn is_date_column(column: &str) -> bool {
    column.ends_with("_date") || column.ends_with("_on")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    let unique_violation = error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .is_some_and(|code| code == "23505");
    if unique_violation {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::{json, Map, Value};

    use super::{
        allowed_table, identifier, parse_filter_key, push_filters, select_rows, update_query,
        Bound, Comparison,
    };

    #[test]
    fn parses_operator_suffixes() {
        assert_eq!(
            parse_filter_key("due_date__gte").expect("valid"),
            ("due_date", Comparison::Gte)
        );
        assert_eq!(
            parse_filter_key("id__in").expect("valid"),
            ("id", Comparison::Eq)
        );
        assert_eq!(
            parse_filter_key("payment_date__is_null").expect("valid"),
            ("payment_date", Comparison::IsNull)
        );
        assert_eq!(
            parse_filter_key("status").expect("valid"),
            ("status", Comparison::Eq)
        );
        assert!(parse_filter_key("status; drop table x").is_err());
    }

    #[test]
    fn validates_identifiers_and_tables() {
        assert!(identifier("amount_cents").is_ok());
        assert!(identifier("_hidden").is_ok());
        assert!(identifier("9lives").is_err());
        assert!(identifier("Amount").is_err());
        assert!(identifier("  ").is_err());
        assert!(allowed_table("payments").is_ok());
        assert!(allowed_table("pg_shadow").is_err());
    }

    #[test]
    fn infers_bound_types_from_column_names() {
        assert_eq!(
            Bound::infer("expense_date", &json!("2024-02-01")),
            Bound::Date(NaiveDate::from_ymd_opt(2024, 2, 1).expect("date"))
        );
        assert!(matches!(
            Bound::infer("tenant_id", &json!("550e8400-e29b-41d4-a716-446655440000")),
            Bound::Uuid(_)
        ));
        assert_eq!(
            Bound::infer("tenant_id", &json!("not-a-uuid")),
            Bound::Text("not-a-uuid".to_string())
        );
        assert_eq!(Bound::infer("amount_cents", &json!(1500)), Bound::Int(1500));
        assert!(matches!(
            Bound::infer("created_at", &json!("2024-02-01T10:00:00+00:00")),
            Bound::Timestamp(_)
        ));
    }

    #[test]
    fn builds_scoped_report_query() {
        let mut filters = Map::new();
        filters.insert(
            "organization_id".to_string(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()),
        );
        filters.insert(
            "due_date__gte".to_string(),
            Value::String("2023-12-15".to_string()),
        );
        filters.insert("payment_date__is_null".to_string(), Value::Bool(false));
        filters.insert(
            "status".to_string(),
            json!(["paid", "late"]),
        );

        let mut query = select_rows("payments");
        push_filters(&mut query, Some(&filters)).expect("filters");
        let sql = query.sql();

        assert!(sql.starts_with("SELECT row_to_json(t) AS row FROM payments t WHERE 1=1"));
        assert!(sql.contains("t.due_date >= $"), "unexpected sql: {sql}");
        assert!(sql.contains("t.organization_id = $"), "unexpected sql: {sql}");
        assert!(sql.contains("t.payment_date IS NOT NULL"), "unexpected sql: {sql}");
        assert!(sql.contains("t.status::text = ANY($"), "unexpected sql: {sql}");
    }

    #[test]
    fn rejects_array_values_for_range_filters() {
        let mut filters = Map::new();
        filters.insert("due_date__gte".to_string(), json!(["2024-01-01"]));
        let mut query = select_rows("payments");
        assert!(push_filters(&mut query, Some(&filters)).is_err());
    }

    #[test]
    fn guarded_update_requires_expected_values() {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("refunded"));
        let mut expected = Map::new();
        expected.insert("status".to_string(), json!("paid"));

        let query = update_query(
            "payments",
            "550e8400-e29b-41d4-a716-446655440000",
            "id",
            &payload,
            &expected,
        )
        .expect("query");
        let sql = query.sql();

        assert!(sql.starts_with("UPDATE payments t SET status = r.status FROM jsonb_populate_record(NULL::payments, $1) r"));
        assert!(sql.contains(" WHERE t.id = $2 AND t.status::text = $3"), "unexpected sql: {sql}");
        assert!(sql.ends_with(" RETURNING row_to_json(t) AS row"));
    }
}
