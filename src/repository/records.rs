use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::{
    error::AppResult,
    repository::table_service::list_rows,
    services::owner_report::{ExpenseRecord, PaymentRecord, PaymentStatus, ReportError},
    tenancy::ReportScope,
};

const PAGE_SIZE: i64 = 1000;
const MAX_PAGES: i64 = 50;

pub async fn fetch_payment_records(
    pool: &PgPool,
    scope: &ReportScope,
    cutoff: NaiveDate,
) -> AppResult<Vec<PaymentRecord>> {
    let filters = payment_window_filters(scope, cutoff);
    let rows = list_all_rows(pool, "payments", &filters, "payment_date").await?;
    let records = rows
        .iter()
        .map(payment_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub async fn fetch_expense_records(
    pool: &PgPool,
    scope: &ReportScope,
    cutoff: NaiveDate,
) -> AppResult<Vec<ExpenseRecord>> {
    let mut filters = scope_filters(scope);
    filters.insert(
        "expense_date__gte".to_string(),
        Value::String(cutoff.to_string()),
    );
    let rows = list_all_rows(pool, "expenses", &filters, "expense_date").await?;
    let records = rows
        .iter()
        .map(expense_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub async fn fetch_tenant_names(
    pool: &PgPool,
    scope: &ReportScope,
    tenant_ids: &BTreeSet<String>,
) -> AppResult<HashMap<String, String>> {
    let rows = fetch_by_ids(pool, scope, "tenants", tenant_ids).await?;
    Ok(rows
        .iter()
        .filter_map(|row| Some((non_empty(row, "id")?, tenant_display_name(row)?)))
        .collect())
}

pub async fn fetch_unit_labels(
    pool: &PgPool,
    scope: &ReportScope,
    unit_ids: &BTreeSet<String>,
) -> AppResult<HashMap<String, String>> {
    let rows = fetch_by_ids(pool, scope, "units", unit_ids).await?;
    Ok(rows
        .iter()
        .filter_map(|row| Some((non_empty(row, "id")?, unit_display_label(row)?)))
        .collect())
}

pub fn payment_from_row(row: &Value) -> Result<PaymentRecord, ReportError> {
    let id = record_id(row)?;
    let status = non_empty(row, "status")
        .ok_or_else(|| ReportError::invalid(&id, "status is missing"))?
        .parse::<PaymentStatus>()
        .map_err(|reason| ReportError::invalid(&id, reason))?;

    Ok(PaymentRecord {
        amount_minor: amount_minor(&id, row)?,
        due_date: required_date(&id, row, "due_date")?,
        payment_date: optional_date(&id, row, "payment_date")?,
        status,
        tenant_id: non_empty(row, "tenant_id"),
        unit_id: non_empty(row, "unit_id"),
        id,
    })
}

pub fn expense_from_row(row: &Value) -> Result<ExpenseRecord, ReportError> {
    let id = record_id(row)?;
    Ok(ExpenseRecord {
        amount_minor: amount_minor(&id, row)?,
        expense_date: required_date(&id, row, "expense_date")?,
        category: non_empty(row, "category").unwrap_or_default(),
        id,
    })
}

pub fn tenant_display_name(row: &Value) -> Option<String> {
    if let Some(full_name) = non_empty(row, "full_name") {
        return Some(full_name);
    }
    let parts = ["first_name", "last_name"]
        .iter()
        .filter_map(|key| non_empty(row, key))
        .collect::<Vec<_>>();
    (!parts.is_empty()).then(|| parts.join(" "))
}

pub fn unit_display_label(row: &Value) -> Option<String> {
    non_empty(row, "name").or_else(|| non_empty(row, "code"))
}

async fn list_all_rows(
    pool: &PgPool,
    table: &str,
    filters: &Map<String, Value>,
    order_by: &str,
) -> AppResult<Vec<Value>> {
    let mut rows = Vec::new();
    for page in 0..MAX_PAGES {
        let batch = list_rows(
            pool,
            table,
            Some(filters),
            PAGE_SIZE,
            page * PAGE_SIZE,
            order_by,
            true,
        )
        .await?;
        let exhausted = (batch.len() as i64) < PAGE_SIZE;
        rows.extend(batch);
        if exhausted {
            return Ok(rows);
        }
    }
    tracing::warn!(table, rows = rows.len(), "Report fetch hit the page cap");
    Ok(rows)
}

async fn fetch_by_ids(
    pool: &PgPool,
    scope: &ReportScope,
    table: &str,
    ids: &BTreeSet<String>,
) -> AppResult<Vec<Value>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(scope.organization_id.clone()),
    );
    filters.insert(
        "id".to_string(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
    list_rows(
        pool,
        table,
        Some(&filters),
        ids.len() as i64,
        0,
        "created_at",
        false,
    )
    .await
}

/// Income is bucketed by the day money arrived, so the window applies to
/// `payment_date`. Rows that were never paid have none and are skipped.
fn payment_window_filters(scope: &ReportScope, cutoff: NaiveDate) -> Map<String, Value> {
    let mut filters = scope_filters(scope);
    filters.insert(
        "payment_date__gte".to_string(),
        Value::String(cutoff.to_string()),
    );
    filters
}

fn scope_filters(scope: &ReportScope) -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(scope.organization_id.clone()),
    );
    if let Some(property_id) = &scope.property_id {
        filters.insert(
            "property_id".to_string(),
            Value::String(property_id.clone()),
        );
    }
    filters
}

fn record_id(row: &Value) -> Result<String, ReportError> {
    non_empty(row, "id").ok_or_else(|| ReportError::invalid("<missing id>", "id is missing"))
}

fn amount_minor(id: &str, row: &Value) -> Result<i64, ReportError> {
    let parsed = match row.get("amount_cents") {
        Some(Value::Number(number)) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0 && value.abs() < i64::MAX as f64)
                .map(|value| value as i64)
        }),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    let amount = parsed.ok_or_else(|| {
        ReportError::invalid(id, "amount_cents must be an integer number of cents")
    })?;
    if amount < 0 {
        return Err(ReportError::invalid(
            id,
            format!("amount must not be negative (got {amount})"),
        ));
    }
    Ok(amount)
}

fn required_date(id: &str, row: &Value, key: &str) -> Result<NaiveDate, ReportError> {
    optional_date(id, row, key)?.ok_or_else(|| ReportError::invalid(id, format!("{key} is missing")))
}

fn optional_date(id: &str, row: &Value, key: &str) -> Result<Option<NaiveDate>, ReportError> {
    let Some(raw) = non_empty(row, key) else {
        return Ok(None);
    };
    parse_date_like(&raw)
        .map(Some)
        .ok_or_else(|| ReportError::invalid(id, format!("{key} '{raw}' is not a date")))
}

fn parse_date_like(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|value| value.date_naive()))
        .or_else(|| {
            // Timestamps without an offset.
            raw.get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

fn non_empty(row: &Value, key: &str) -> Option<String> {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{
        expense_from_row, payment_from_row, payment_window_filters, tenant_display_name,
        unit_display_label,
    };
    use crate::{
        repository::table_service::filtered_select,
        services::owner_report::{PaymentStatus, ReportError},
        tenancy::ReportScope,
    };

    #[test]
    fn payment_window_follows_payment_date() {
        let scope = ReportScope::new("550e8400-e29b-41d4-a716-446655440000", None).expect("scope");
        let cutoff = NaiveDate::from_ymd_opt(2023, 12, 15).expect("date");
        let filters = payment_window_filters(&scope, cutoff);

        let query = filtered_select("payments", Some(&filters)).expect("query");
        let sql = query.sql();
        assert!(sql.contains("t.payment_date >= $"), "unexpected sql: {sql}");
        assert!(!sql.contains("due_date"), "unexpected sql: {sql}");
        assert!(sql.contains("t.organization_id = $"), "unexpected sql: {sql}");

        // Due before the cutoff, paid inside the window.
        let row = json!({
            "id": "pay-late-rent",
            "amount_cents": 100000,
            "due_date": "2023-11-01",
            "payment_date": "2024-01-05",
            "status": "paid"
        });
        let record = payment_from_row(&row).expect("valid payment");
        assert!(record.due_date < cutoff);
        assert!(record.payment_date.is_some_and(|paid_on| paid_on >= cutoff));
    }

    #[test]
    fn parses_payment_rows() {
        let row = json!({
            "id": "pay-1",
            "amount_cents": 150000,
            "due_date": "2024-02-01",
            "payment_date": "2024-02-10T14:03:00+00:00",
            "status": "paid",
            "tenant_id": "tenant-1",
            "unit_id": null
        });
        let record = payment_from_row(&row).expect("valid payment");
        assert_eq!(record.amount_minor, 150_000);
        assert_eq!(record.status, PaymentStatus::Paid);
        assert_eq!(record.payment_date, NaiveDate::from_ymd_opt(2024, 2, 10));
        assert_eq!(record.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(record.unit_id, None);
    }

    #[test]
    fn accepts_integer_strings_and_whole_floats() {
        let row = json!({
            "id": "pay-2",
            "amount_cents": "2500",
            "due_date": "2024-02-01",
            "status": "pending"
        });
        assert_eq!(payment_from_row(&row).expect("valid").amount_minor, 2500);

        let row = json!({
            "id": "exp-1",
            "amount_cents": 4200.0,
            "expense_date": "2024-02-01 09:00:00",
            "category": "cleaning"
        });
        let record = expense_from_row(&row).expect("valid expense");
        assert_eq!(record.amount_minor, 4200);
        assert_eq!(record.expense_date, NaiveDate::from_ymd_opt(2024, 2, 1).expect("date"));
    }

    #[test]
    fn rejects_malformed_amounts_naming_the_record() {
        for amount in [json!("12.50"), json!(12.5), json!(null), json!(-300)] {
            let row = json!({
                "id": "exp-9",
                "amount_cents": amount,
                "expense_date": "2024-02-01"
            });
            let error = expense_from_row(&row).expect_err("malformed amount");
            let ReportError::InvalidRecord { record_id, .. } = error;
            assert_eq!(record_id, "exp-9");
        }
    }

    #[test]
    fn rejects_unknown_status_and_missing_dates() {
        let row = json!({
            "id": "pay-3",
            "amount_cents": 100,
            "due_date": "2024-02-01",
            "status": "settled"
        });
        assert!(payment_from_row(&row).is_err());

        let row = json!({ "id": "pay-4", "amount_cents": 100, "status": "paid" });
        let error = payment_from_row(&row).expect_err("missing due date");
        assert!(error.to_string().contains("due_date is missing"));
    }

    #[test]
    fn builds_display_labels() {
        assert_eq!(
            tenant_display_name(&json!({ "full_name": " Ana Gómez " })).as_deref(),
            Some("Ana Gómez")
        );
        assert_eq!(
            tenant_display_name(&json!({ "first_name": "Luis", "last_name": "Ortiz" }))
                .as_deref(),
            Some("Luis Ortiz")
        );
        assert_eq!(tenant_display_name(&json!({ "email": "x@y.z" })), None);
        assert_eq!(
            unit_display_label(&json!({ "name": "", "code": "B-12" })).as_deref(),
            Some("B-12")
        );
    }
}
