use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::{error::AppError, repository::table_service::get_row, state::AppState};

pub const FINANCE_ROLES: &[&str] = &["owner_admin", "accountant"];

/// Organization (and optionally property) boundary a request operates in.
/// Built once per request and handed to every data-access call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportScope {
    pub organization_id: String,
    pub property_id: Option<String>,
}

impl ReportScope {
    pub fn new(organization_id: &str, property_id: Option<&str>) -> Result<Self, AppError> {
        let organization_id = organization_id.trim();
        if organization_id.is_empty() {
            return Err(AppError::BadRequest("org_id is required.".to_string()));
        }
        Ok(Self {
            organization_id: organization_id.to_string(),
            property_id: property_id
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned),
        })
    }
}

pub fn db_pool(state: &AppState) -> Result<&PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency(
            "Database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
        )
    })
}

pub async fn get_org_membership(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Option<Value>, AppError> {
    let cache_key = format!("{user_id}:{org_id}");
    if let Some(cached) = state.org_membership_cache.get(&cache_key).await {
        return Ok(Some(cached));
    }

    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM organization_members t
         WHERE organization_id = $1::uuid AND user_id = $2::uuid
         LIMIT 1",
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Membership lookup failed: {error}")))?;

    let membership = row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten());
    if let Some(found) = &membership {
        state
            .org_membership_cache
            .insert(cache_key, found.clone())
            .await;
    }
    Ok(membership)
}

pub async fn assert_org_member(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Value, AppError> {
    get_org_membership(state, user_id, org_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden("Forbidden: not a member of this organization.".to_string())
        })
}

pub async fn assert_org_role(
    state: &AppState,
    user_id: &str,
    org_id: &str,
    allowed_roles: &[&str],
) -> Result<Value, AppError> {
    let membership = assert_org_member(state, user_id, org_id).await?;
    let role = membership
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if allowed_roles.contains(&role) {
        return Ok(membership);
    }
    Err(AppError::Forbidden(format!(
        "Forbidden: role '{role}' is not allowed for this action."
    )))
}

/// Timezone the organization reports in; month boundaries follow it.
pub async fn org_timezone(state: &AppState, org_id: &str) -> Result<Tz, AppError> {
    let pool = db_pool(state)?;
    let organization = get_row(pool, "organizations", org_id, "id").await?;
    let configured = organization
        .get("timezone")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(resolve_timezone(configured, &state.config.default_timezone))
}

/// Calendar date in the organization's timezone. Report windows and
/// default payment dates both use it so they agree on month boundaries.
pub async fn org_today(state: &AppState, org_id: &str) -> Result<NaiveDate, AppError> {
    let timezone = org_timezone(state, org_id).await?;
    Ok(local_date(Utc::now(), timezone))
}

pub fn local_date(now: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    now.with_timezone(&timezone).date_naive()
}

pub fn resolve_timezone(preferred: &str, fallback: &str) -> Tz {
    preferred
        .trim()
        .parse::<Tz>()
        .or_else(|_| fallback.trim().parse::<Tz>())
        .unwrap_or(Tz::UTC)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use chrono_tz::Tz;

    use super::{local_date, resolve_timezone, ReportScope};

    #[test]
    fn local_date_follows_org_timezone() {
        let evening_in_asuncion = Utc
            .with_ymd_and_hms(2024, 4, 1, 2, 0, 0)
            .single()
            .expect("instant");
        assert_eq!(
            local_date(evening_in_asuncion, chrono_tz::America::Asuncion),
            NaiveDate::from_ymd_opt(2024, 3, 31).expect("date")
        );
        assert_eq!(
            local_date(evening_in_asuncion, Tz::UTC),
            NaiveDate::from_ymd_opt(2024, 4, 1).expect("date")
        );
    }

    #[test]
    fn scope_trims_and_drops_blank_property() {
        let scope = ReportScope::new(" org-1 ", Some("  ")).expect("scope");
        assert_eq!(scope.organization_id, "org-1");
        assert_eq!(scope.property_id, None);

        let scope = ReportScope::new("org-1", Some("prop-9")).expect("scope");
        assert_eq!(scope.property_id.as_deref(), Some("prop-9"));

        assert!(ReportScope::new("   ", None).is_err());
    }

    #[test]
    fn timezone_falls_back_in_order() {
        assert_eq!(
            resolve_timezone("America/Asuncion", "UTC"),
            chrono_tz::America::Asuncion
        );
        assert_eq!(
            resolve_timezone("Mars/Olympus", "Europe/Madrid"),
            chrono_tz::Europe::Madrid
        );
        assert_eq!(resolve_timezone("", "nowhere"), Tz::UTC);
    }
}
