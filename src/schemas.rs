use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

use crate::{error::AppError, services::owner_report::PaymentStatus};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn serialize_to_map<T>(value: &T) -> Map<String, Value>
where
    T: Serialize,
{
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

pub fn remove_nulls(mut map: Map<String, Value>) -> Map<String, Value> {
    map.retain(|_, value| !value.is_null());
    map
}

fn default_limit_100() -> i64 {
    100
}

fn default_pending() -> PaymentStatus {
    PaymentStatus::Pending
}

fn iso_date(value: &str) -> Result<(), ValidationError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| ValidationError::new("iso_date"))
}

/// Unreadable values (`-3`, `abc`, empty) count as not given, so the
/// report falls back to its default period instead of rejecting the request.
fn lenient_months<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| value.trim().parse::<u32>().ok()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerFinancialReportQuery {
    pub org_id: String,
    #[serde(default, deserialize_with = "lenient_months")]
    pub period_months: Option<u32>,
    pub property_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsQuery {
    pub org_id: String,
    pub status: Option<PaymentStatus>,
    pub tenant_id: Option<String>,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreatePaymentInput {
    pub organization_id: String,
    pub tenant_id: String,
    pub unit_id: Option<String>,
    pub property_id: Option<String>,
    #[validate(range(min = 1))]
    pub amount_cents: i64,
    #[validate(custom(function = "iso_date"))]
    pub due_date: String,
    #[validate(custom(function = "iso_date"))]
    pub payment_date: Option<String>,
    #[serde(default = "default_pending")]
    pub status: PaymentStatus,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct MarkPaymentPaidInput {
    #[validate(custom(function = "iso_date"))]
    pub payment_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPath {
    pub payment_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensesQuery {
    pub org_id: String,
    pub category: Option<String>,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateExpenseInput {
    pub organization_id: String,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    #[validate(range(min = 1))]
    pub amount_cents: i64,
    #[validate(custom(function = "iso_date"))]
    pub expense_date: String,
    #[validate(length(min = 1, max = 80))]
    pub category: String,
    #[validate(length(max = 255))]
    pub vendor_name: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensePath {
    pub expense_id: String,
}

#[cfg(test)]
mod tests {
    use axum::{extract::Query, http::Uri};
    use serde_json::json;

    use super::{
        remove_nulls, serialize_to_map, validate_input, CreateExpenseInput, CreatePaymentInput,
        MarkPaymentPaidInput, OwnerFinancialReportQuery,
    };
    use crate::services::owner_report::PaymentStatus;

    fn payment_input() -> CreatePaymentInput {
        serde_json::from_value(json!({
            "organization_id": "org-1",
            "tenant_id": "tenant-1",
            "amount_cents": 150000,
            "due_date": "2024-03-01"
        }))
        .expect("payment input")
    }

    fn report_query(raw: &str) -> OwnerFinancialReportQuery {
        let uri = format!("/reports/owner-financial?{raw}")
            .parse::<Uri>()
            .expect("uri");
        Query::<OwnerFinancialReportQuery>::try_from_uri(&uri)
            .expect("query")
            .0
    }

    #[test]
    fn unreadable_period_months_are_ignored() {
        for raw in ["period_months=-3", "period_months=", "period_months=abc"] {
            let query = report_query(&format!("org_id=org-1&{raw}"));
            assert_eq!(query.period_months, None, "{raw}");
        }
        assert_eq!(report_query("org_id=org-1").period_months, None);
        assert_eq!(
            report_query("org_id=org-1&period_months=7").period_months,
            Some(7)
        );
        assert_eq!(
            report_query("org_id=org-1&period_months=%2012").period_months,
            Some(12)
        );
    }

    #[test]
    fn payment_status_defaults_to_pending() {
        let input = payment_input();
        assert_eq!(input.status, PaymentStatus::Pending);
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn rejects_non_positive_amounts_and_bad_dates() {
        let mut input = payment_input();
        input.amount_cents = 0;
        assert!(validate_input(&input).is_err());

        let mut input = payment_input();
        input.payment_date = Some("03/01/2024".to_string());
        assert!(validate_input(&input).is_err());

        assert!(validate_input(&MarkPaymentPaidInput {
            payment_date: Some("2024-13-01".to_string())
        })
        .is_err());
    }

    #[test]
    fn expense_category_is_required() {
        let input: CreateExpenseInput = serde_json::from_value(json!({
            "organization_id": "org-1",
            "amount_cents": 2500,
            "expense_date": "2024-03-01",
            "category": ""
        }))
        .expect("expense input");
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn record_maps_drop_nulls() {
        let record = remove_nulls(serialize_to_map(&payment_input()));
        assert_eq!(record.get("status"), Some(&json!("pending")));
        assert!(!record.contains_key("unit_id"));
        assert!(!record.contains_key("payment_date"));
    }
}
