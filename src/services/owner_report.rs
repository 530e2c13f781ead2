//! Owner financial report: monthly income/expense breakdown, totals and the
//! latest paid transactions for an organization (or one of its properties).
//!
//! Everything here is synchronous and works on records that were already
//! fetched and typed by `repository::records`. A report is rebuilt from
//! scratch on every request.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_PERIOD_MONTHS: &[u32] = &[3, 6, 12];
pub const DEFAULT_PERIOD_MONTHS: u32 = 6;
pub const RECENT_TRANSACTIONS_LIMIT: usize = 10;
pub const UNKNOWN_TENANT_LABEL: &str = "Unknown";
pub const UNKNOWN_UNIT_LABEL: &str = "N/A";
const UNCATEGORIZED_LABEL: &str = "uncategorized";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("Invalid record '{record_id}': {reason}")]
    InvalidRecord { record_id: String, reason: String },
}

impl ReportError {
    pub fn invalid(record_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            record_id: record_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
    Late,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Late => "late",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Payments settle into `paid` from any open state; only a settled
    /// payment can be refunded.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        match next {
            Self::Paid => matches!(
                self,
                Self::Pending | Self::Partial | Self::Late | Self::Failed
            ),
            Self::Refunded => self == Self::Paid,
            _ => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "partial" => Ok(Self::Partial),
            "paid" => Ok(Self::Paid),
            "late" => Ok(Self::Late),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("unsupported payment status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: String,
    pub amount_minor: i64,
    pub due_date: NaiveDate,
    pub payment_date: Option<NaiveDate>,
    pub status: PaymentStatus,
    pub tenant_id: Option<String>,
    pub unit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpenseRecord {
    pub id: String,
    pub amount_minor: i64,
    pub expense_date: NaiveDate,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthBucket {
    pub key: String,
    pub label: String,
    pub income: f64,
    pub expenses: f64,
    pub net: f64,
}

impl MonthBucket {
    fn empty(month_start: NaiveDate) -> Self {
        Self {
            key: month_key(month_start),
            label: month_start.format("%b %Y").to_string(),
            income: 0.0,
            expenses: 0.0,
            net: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_income: f64,
    pub total_expenses: f64,
    pub net_income: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentTransaction {
    pub id: String,
    pub date: Option<NaiveDate>,
    pub tenant_name: String,
    pub unit_label: String,
    pub amount: f64,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerFinancialReport {
    pub period_months: u32,
    pub monthly_breakdown: Vec<MonthBucket>,
    pub summary: ReportSummary,
    pub recent_transactions: Vec<RecentTransaction>,
    pub expense_breakdown: BTreeMap<String, f64>,
}

/// Display names resolved by the data-access layer for the recent transactions view.
#[derive(Debug, Clone, Default)]
pub struct LabelLookups {
    pub tenant_names: HashMap<String, String>,
    pub unit_labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodWindow {
    pub months: u32,
    pub today: NaiveDate,
    pub cutoff: NaiveDate,
    /// Newest month first; `aggregate_monthly` emits them oldest first.
    pub buckets: Vec<MonthBucket>,
}

pub fn normalize_period_months(requested: Option<u32>) -> u32 {
    requested
        .filter(|months| SUPPORTED_PERIOD_MONTHS.contains(months))
        .unwrap_or(DEFAULT_PERIOD_MONTHS)
}

pub fn period_window(requested_months: u32, today: NaiveDate) -> PeriodWindow {
    let months = normalize_period_months(Some(requested_months));
    let current_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);

    let buckets = (0..months)
        .filter_map(|offset| current_month.checked_sub_months(Months::new(offset)))
        .map(MonthBucket::empty)
        .collect();
    let cutoff = today
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN);

    PeriodWindow {
        months,
        today,
        cutoff,
        buckets,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoneyEntry {
    pub date: Option<NaiveDate>,
    pub amount: f64,
}

/// A settled payment with its amount already in major units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaidPayment<'a> {
    pub record: &'a PaymentRecord,
    pub amount: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ClassifiedRecords<'a> {
    pub paid_payments: Vec<PaidPayment<'a>>,
    pub income: Vec<MoneyEntry>,
    pub expenses: Vec<MoneyEntry>,
    pub expenses_by_category: BTreeMap<String, f64>,
}

pub fn classify_records<'a>(
    payments: &'a [PaymentRecord],
    expenses: &[ExpenseRecord],
) -> Result<ClassifiedRecords<'a>, ReportError> {
    let mut classified = ClassifiedRecords::default();

    for payment in payments {
        let amount = to_major_units(&payment.id, payment.amount_minor)?;
        if payment.status != PaymentStatus::Paid {
            continue;
        }
        classified.paid_payments.push(PaidPayment {
            record: payment,
            amount,
        });
        classified.income.push(MoneyEntry {
            date: payment.payment_date,
            amount,
        });
    }

    for expense in expenses {
        let amount = to_major_units(&expense.id, expense.amount_minor)?;
        classified.expenses.push(MoneyEntry {
            date: Some(expense.expense_date),
            amount,
        });

        let category = expense.category.trim();
        let category = if category.is_empty() {
            UNCATEGORIZED_LABEL
        } else {
            category
        };
        *classified
            .expenses_by_category
            .entry(category.to_string())
            .or_default() += amount;
    }

    Ok(classified)
}

pub fn aggregate_monthly(
    mut buckets: Vec<MonthBucket>,
    classified: &ClassifiedRecords<'_>,
) -> Vec<MonthBucket> {
    let positions = buckets
        .iter()
        .enumerate()
        .map(|(index, bucket)| (bucket.key.clone(), index))
        .collect::<HashMap<_, _>>();

    let mut dropped = 0_usize;
    for entry in &classified.income {
        match bucket_index(&positions, entry.date) {
            Some(index) => buckets[index].income += entry.amount,
            None => dropped += 1,
        }
    }
    for entry in &classified.expenses {
        match bucket_index(&positions, entry.date) {
            Some(index) => buckets[index].expenses += entry.amount,
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::debug!(dropped, "Records outside the report window were skipped");
    }

    for bucket in &mut buckets {
        bucket.net = bucket.income - bucket.expenses;
    }
    buckets.reverse();
    buckets
}

pub fn summarize(buckets: &[MonthBucket]) -> ReportSummary {
    let total_income = buckets.iter().map(|bucket| bucket.income).sum::<f64>();
    let total_expenses = buckets.iter().map(|bucket| bucket.expenses).sum::<f64>();
    ReportSummary {
        total_income,
        total_expenses,
        net_income: total_income - total_expenses,
    }
}

/// Paid payments by payment date, newest first, undated last. Ties keep
/// fetch order.
fn newest_paid<'a>(paid_payments: &[PaidPayment<'a>]) -> Vec<PaidPayment<'a>> {
    let mut ordered = paid_payments.to_vec();
    ordered.sort_by(|left, right| right.record.payment_date.cmp(&left.record.payment_date));
    ordered.truncate(RECENT_TRANSACTIONS_LIMIT);
    ordered
}

/// Tenant and unit ids referenced by the recent transactions, the only
/// rows that need display labels.
pub fn recent_label_ids(
    classified: &ClassifiedRecords<'_>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let recent = newest_paid(&classified.paid_payments);
    let tenant_ids = recent
        .iter()
        .filter_map(|paid| paid.record.tenant_id.clone())
        .collect();
    let unit_ids = recent
        .iter()
        .filter_map(|paid| paid.record.unit_id.clone())
        .collect();
    (tenant_ids, unit_ids)
}

pub fn recent_transactions(
    paid_payments: &[PaidPayment<'_>],
    lookups: &LabelLookups,
) -> Vec<RecentTransaction> {
    newest_paid(paid_payments)
        .into_iter()
        .map(|paid| RecentTransaction {
            id: paid.record.id.clone(),
            date: paid.record.payment_date,
            tenant_name: resolve_label(
                &lookups.tenant_names,
                paid.record.tenant_id.as_deref(),
                UNKNOWN_TENANT_LABEL,
            ),
            unit_label: resolve_label(
                &lookups.unit_labels,
                paid.record.unit_id.as_deref(),
                UNKNOWN_UNIT_LABEL,
            ),
            amount: paid.amount,
            status: paid.record.status,
        })
        .collect()
}

pub fn compile_report(
    window: PeriodWindow,
    payments: &[PaymentRecord],
    expenses: &[ExpenseRecord],
    lookups: &LabelLookups,
) -> Result<OwnerFinancialReport, ReportError> {
    let classified = classify_records(payments, expenses)?;
    Ok(assemble_report(window, classified, lookups))
}

/// Second half of `compile_report`, for callers that classify first to
/// learn which labels to load.
pub fn assemble_report(
    window: PeriodWindow,
    classified: ClassifiedRecords<'_>,
    lookups: &LabelLookups,
) -> OwnerFinancialReport {
    let monthly_breakdown = aggregate_monthly(window.buckets, &classified);
    let summary = summarize(&monthly_breakdown);
    let recent = recent_transactions(&classified.paid_payments, lookups);

    OwnerFinancialReport {
        period_months: window.months,
        monthly_breakdown,
        summary,
        recent_transactions: recent,
        expense_breakdown: classified.expenses_by_category,
    }
}

pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

fn to_major_units(record_id: &str, amount_minor: i64) -> Result<f64, ReportError> {
    if amount_minor < 0 {
        return Err(ReportError::invalid(
            record_id,
            format!("amount must not be negative (got {amount_minor})"),
        ));
    }
    Ok(amount_minor as f64 / 100.0)
}

fn bucket_index(positions: &HashMap<String, usize>, date: Option<NaiveDate>) -> Option<usize> {
    date.and_then(|value| positions.get(&month_key(value)).copied())
}

fn resolve_label(labels: &HashMap<String, String>, id: Option<&str>, fallback: &str) -> String {
    id.and_then(|key| labels.get(key))
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
