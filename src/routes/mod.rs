use axum::{routing::get, Router};

use crate::state::AppState;

pub mod expenses;
pub mod health;
pub mod payments;
pub mod reports;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(reports::router())
        .merge(payments::router())
        .merge(expenses::router())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::v1_router;
    use crate::{config::AppConfig, state::AppState};

    fn offline_state() -> AppState {
        let mut config = AppConfig::from_env();
        config.supabase_db_url = None;
        config.supabase_jwt_secret = None;
        config.dev_auth_overrides_enabled = false;
        AppState::build(config).expect("state")
    }

    #[tokio::test]
    async fn health_reports_ok_without_database() {
        let response = v1_router()
            .with_state(offline_state())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["db"], true);
    }

    #[tokio::test]
    async fn report_requires_bearer_token() {
        let response = v1_router()
            .with_state(offline_state())
            .oneshot(
                Request::builder()
                    .uri("/reports/owner-financial?org_id=550e8400-e29b-41d4-a716-446655440000")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert!(payload["detail"]
            .as_str()
            .is_some_and(|detail| detail.contains("bearer")));
    }

    #[tokio::test]
    async fn unreadable_period_reaches_the_handler() {
        for period in ["-3", "", "abc"] {
            let response = v1_router()
                .with_state(offline_state())
                .oneshot(
                    Request::builder()
                        .uri(format!(
                            "/reports/owner-financial?org_id=550e8400-e29b-41d4-a716-446655440000&period_months={period}"
                        ))
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");

            // Past query extraction, stopped at auth.
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{period}");
        }
    }
}
