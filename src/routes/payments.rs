use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::{
        records::payment_from_row,
        table_service::{
            count_rows, create_row, delete_row, get_row, list_rows, update_row_matching,
        },
    },
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreatePaymentInput,
        MarkPaymentPaidInput, PaymentPath, PaymentsQuery,
    },
    services::{
        audit::{write_audit_log, AuditEntry},
        owner_report::PaymentStatus,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, db_pool, org_today, FINANCE_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payments",
            axum::routing::get(list_payments).post(create_payment),
        )
        .route(
            "/payments/{payment_id}",
            axum::routing::get(get_payment).delete(delete_payment),
        )
        .route(
            "/payments/{payment_id}/mark-paid",
            axum::routing::post(mark_payment_paid),
        )
        .route(
            "/payments/{payment_id}/refund",
            axum::routing::post(refund_payment),
        )
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if let Some(status) = query.status {
        filters.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
    }
    for (key, value) in [
        ("tenant_id", query.tenant_id.as_deref()),
        ("property_id", query.property_id.as_deref()),
    ] {
        if let Some(value) = non_empty_opt(value) {
            filters.insert(key.to_string(), Value::String(value));
        }
    }

    let rows = list_rows(
        pool,
        "payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset,
        "due_date",
        false,
    )
    .await?;
    let total = count_rows(pool, "payments", Some(&filters)).await?;

    Ok(Json(json!({ "data": rows, "count": total })))
}

async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    if payload.status == PaymentStatus::Refunded {
        return Err(AppError::BadRequest(
            "A payment cannot be created as refunded.".to_string(),
        ));
    }
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, FINANCE_ROLES).await?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    if payload.status == PaymentStatus::Paid && payload.payment_date.is_none() {
        let today = org_today(&state, &payload.organization_id).await?;
        record.insert(
            "payment_date".to_string(),
            Value::String(today.to_string()),
        );
    }
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "payments", &record).await?;
    let payment_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry {
            organization_id: &payload.organization_id,
            actor_user_id: &user_id,
            action: "create",
            entity_name: "payments",
            entity_id: &payment_id,
            before: None,
            after: Some(created.clone()),
        },
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "payments", &path.payment_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&record, "organization_id")).await?;
    Ok(Json(record))
}

async fn mark_payment_paid(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    payload: Option<Json<MarkPaymentPaidInput>>,
) -> AppResult<Json<Value>> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&input)?;

    let mut patch = Map::new();
    if let Some(payment_date) = non_empty_opt(input.payment_date.as_deref()) {
        patch.insert("payment_date".to_string(), Value::String(payment_date));
    }
    transition_payment(&state, &headers, &path.payment_id, PaymentStatus::Paid, patch).await
}

async fn refund_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    transition_payment(
        &state,
        &headers,
        &path.payment_id,
        PaymentStatus::Refunded,
        Map::new(),
    )
    .await
}

async fn transition_payment(
    state: &AppState,
    headers: &HeaderMap,
    payment_id: &str,
    next: PaymentStatus,
    mut patch: Map<String, Value>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(state, headers).await?;
    let pool = db_pool(state)?;

    let existing = get_row(pool, "payments", payment_id, "id").await?;
    let org_id = value_str(&existing, "organization_id");
    assert_org_role(state, &user_id, &org_id, FINANCE_ROLES).await?;

    let current = payment_from_row(&existing)?.status;
    if !current.can_transition_to(next) {
        return Err(AppError::Conflict(format!(
            "Payment cannot move from '{current}' to '{next}'."
        )));
    }

    if next == PaymentStatus::Paid && !patch.contains_key("payment_date") {
        let today = org_today(state, &org_id).await?;
        patch.insert(
            "payment_date".to_string(),
            Value::String(today.to_string()),
        );
    }
    patch.insert(
        "status".to_string(),
        Value::String(next.as_str().to_string()),
    );
    let updated = update_row_matching(
        pool,
        "payments",
        payment_id,
        "id",
        &patch,
        &status_guard(&existing),
    )
    .await?
    .ok_or_else(|| {
        AppError::Conflict(format!(
            "Payment changed while moving from '{current}' to '{next}'; reload and retry."
        ))
    })?;
    tracing::info!(payment_id, from = %current, to = %next, "Payment status changed");

    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry {
            organization_id: &org_id,
            actor_user_id: &user_id,
            action: if next == PaymentStatus::Refunded {
                "refund"
            } else {
                "mark_paid"
            },
            entity_name: "payments",
            entity_id: payment_id,
            before: Some(existing),
            after: Some(updated.clone()),
        },
    )
    .await;

    Ok(Json(updated))
}

async fn delete_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, "payments", &path.payment_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, FINANCE_ROLES).await?;

    let deleted = delete_row(pool, "payments", &path.payment_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry {
            organization_id: &org_id,
            actor_user_id: &user_id,
            action: "delete",
            entity_name: "payments",
            entity_id: &path.payment_id,
            before: Some(deleted.clone()),
            after: None,
        },
    )
    .await;

    Ok(Json(deleted))
}

/// Matches the row only while it still carries the status that was checked.
fn status_guard(existing: &Value) -> Map<String, Value> {
    let mut guard = Map::new();
    guard.insert(
        "status".to_string(),
        existing.get("status").cloned().unwrap_or(Value::Null),
    );
    guard
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::status_guard;

    #[test]
    fn status_guard_pins_the_stored_status() {
        let guard = status_guard(&json!({ "id": "pay-1", "status": "paid" }));
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.get("status"), Some(&json!("paid")));
    }
}
