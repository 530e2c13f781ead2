use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

pub struct AuditEntry<'a> {
    pub organization_id: &'a str,
    pub actor_user_id: &'a str,
    pub action: &'a str,
    pub entity_name: &'a str,
    pub entity_id: &'a str,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Best effort: a failed audit insert is logged and never fails the request.
pub async fn write_audit_log(pool: Option<&PgPool>, entry: AuditEntry<'_>) {
    let Some(pool) = pool else {
        return;
    };
    let record = audit_record(entry);
    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        let entity = record
            .get("entity_name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        tracing::warn!(error = %error, entity, "Could not write audit log");
    }
}

fn audit_record(entry: AuditEntry<'_>) -> Map<String, Value> {
    let mut record = Map::new();
    for (key, value) in [
        ("organization_id", entry.organization_id),
        ("actor_user_id", entry.actor_user_id),
        ("action", entry.action),
        ("entity_name", entry.entity_name),
        ("entity_id", entry.entity_id),
    ] {
        let value = value.trim();
        if !value.is_empty() {
            record.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    if let Some(before) = entry.before {
        record.insert("before_state".to_string(), before);
    }
    if let Some(after) = entry.after {
        record.insert("after_state".to_string(), after);
    }
    record
}
