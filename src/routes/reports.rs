use std::collections::BTreeSet;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgPool;

use crate::{
    auth::require_user_id,
    error::AppResult,
    repository::records::{
        fetch_expense_records, fetch_payment_records, fetch_tenant_names, fetch_unit_labels,
    },
    schemas::OwnerFinancialReportQuery,
    services::owner_report::{
        assemble_report, classify_records, period_window, recent_label_ids, LabelLookups,
        OwnerFinancialReport,
    },
    state::AppState,
    tenancy::{assert_org_member, db_pool, org_today, ReportScope},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route(
        "/reports/owner-financial",
        axum::routing::get(owner_financial_report),
    )
}

#[derive(Debug, Serialize)]
struct OwnerFinancialReportResponse {
    organization_id: String,
    property_id: Option<String>,
    from: NaiveDate,
    to: NaiveDate,
    #[serde(flatten)]
    report: OwnerFinancialReport,
}

async fn owner_financial_report(
    State(state): State<AppState>,
    Query(query): Query<OwnerFinancialReportQuery>,
    headers: HeaderMap,
) -> AppResult<Json<OwnerFinancialReportResponse>> {
    let user_id = require_user_id(&state, &headers).await?;
    let scope = ReportScope::new(&query.org_id, query.property_id.as_deref())?;
    assert_org_member(&state, &user_id, &scope.organization_id).await?;
    let pool = db_pool(&state)?;

    let today = org_today(&state, &scope.organization_id).await?;
    let window = period_window(
        query
            .period_months
            .unwrap_or(state.config.default_report_period_months),
        today,
    );
    let (from, to) = (window.cutoff, window.today);

    let (payments, expenses) = tokio::try_join!(
        fetch_payment_records(pool, &scope, window.cutoff),
        fetch_expense_records(pool, &scope, window.cutoff),
    )?;
    let classified = classify_records(&payments, &expenses)?;
    let (tenant_ids, unit_ids) = recent_label_ids(&classified);
    let lookups = load_labels(pool, &scope, &tenant_ids, &unit_ids).await?;
    let report = assemble_report(window, classified, &lookups);

    tracing::info!(
        organization_id = %scope.organization_id,
        period_months = report.period_months,
        payments = payments.len(),
        expenses = expenses.len(),
        "Owner financial report compiled"
    );

    Ok(Json(OwnerFinancialReportResponse {
        organization_id: scope.organization_id,
        property_id: scope.property_id,
        from,
        to,
        report,
    }))
}

async fn load_labels(
    pool: &PgPool,
    scope: &ReportScope,
    tenant_ids: &BTreeSet<String>,
    unit_ids: &BTreeSet<String>,
) -> AppResult<LabelLookups> {
    let (tenant_names, unit_labels) = tokio::try_join!(
        fetch_tenant_names(pool, scope, tenant_ids),
        fetch_unit_labels(pool, scope, unit_ids),
    )?;
    Ok(LabelLookups {
        tenant_names,
        unit_labels,
    })
}
