//! Admin HTTP routes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::ratelimit::{AdmissionController, BanRecord, Identifier, StatusSnapshot};
use crate::store::StoreError;
use crate::transport::HttpRateLimitLayer;

#[derive(Clone)]
pub struct AdminState {
    pub admission: Arc<AdmissionController>,
    /// Absent when no global recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::Store(e) => {
                warn!(error = %e, "Admin request failed on store");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BanBody {
    /// Omit for a permanent ban
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoadBody {
    pub load: f64,
}

/// Build the admin router with the rate limit layer applied.
pub fn router(state: AdminState, limiter: HttpRateLimitLayer) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/admin/status", get(status))
        .route("/admin/bans", get(list_bans))
        .route(
            "/admin/bans/:identifier",
            get(get_ban).put(put_ban).delete(delete_ban),
        )
        .route("/admin/load", put(put_load))
        .layer(limiter)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AdminState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn status(State(state): State<AdminState>) -> Json<StatusSnapshot> {
    Json(state.admission.status().await)
}

async fn list_bans(State(state): State<AdminState>) -> Result<Json<Vec<BanRecord>>, AdminError> {
    Ok(Json(state.admission.list_bans().await?))
}

fn parse_identifier(raw: &str) -> Result<Identifier, AdminError> {
    raw.parse()
        .map_err(|_| AdminError::BadRequest(format!("invalid identifier: {}", raw)))
}

async fn get_ban(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> Result<Json<BanRecord>, AdminError> {
    let id = parse_identifier(&identifier)?;
    state
        .admission
        .ban_status(&id)
        .await?
        .map(Json)
        .ok_or(AdminError::NotFound)
}

async fn put_ban(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
    body: Option<Json<BanBody>>,
) -> Result<Json<BanRecord>, AdminError> {
    let id = parse_identifier(&identifier)?;
    if !id.is_ban_subject() {
        return Err(AdminError::BadRequest(format!(
            "only ip and user identifiers can be banned: {}",
            id
        )));
    }
    let Json(body) = body.unwrap_or_default();
    let duration = body
        .duration_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let reason = body.reason.unwrap_or_else(|| "manual".to_string());

    Ok(Json(state.admission.ban(&id, duration, &reason).await?))
}

async fn delete_ban(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> Result<StatusCode, AdminError> {
    let id = parse_identifier(&identifier)?;
    if state.admission.lift_ban(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound)
    }
}

async fn put_load(
    State(state): State<AdminState>,
    Json(body): Json<LoadBody>,
) -> Result<Json<StatusSnapshot>, AdminError> {
    if !(0.0..=100.0).contains(&body.load) {
        return Err(AdminError::BadRequest("load must be between 0 and 100".into()));
    }
    state.admission.degradation().publish(body.load);
    Ok(Json(state.admission.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FloodgateConfig;
    use crate::ratelimit::DegradationController;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = FloodgateConfig::default();
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let degradation = Arc::new(DegradationController::from_config(&config.degradation));
        let admission = Arc::new(
            AdmissionController::new(&config, store, degradation, Arc::new(clock)).unwrap(),
        );
        let limiter = HttpRateLimitLayer::new(admission.clone(), &config.transport).unwrap();
        router(
            AdminState {
                admission,
                metrics: None,
            },
            limiter,
        )
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, _) = send(&app(), "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (status, _) = send(&app(), "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ban_lifecycle() {
        let app = app();

        let (status, body) = send(
            &app,
            "PUT",
            "/admin/bans/user:mallory",
            Some(r#"{"duration_secs": 600, "reason": "scraping"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["identifier"], "user:mallory");
        assert_eq!(body["reason"], "scraping");
        assert!(body["expires_at"].is_string());

        let (status, body) = send(&app, "GET", "/admin/bans", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "GET", "/admin/bans/user:mallory", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "DELETE", "/admin/bans/user:mallory", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, "DELETE", "/admin/bans/user:mallory", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_permanent_ban_without_body() {
        let app = app();

        let (status, body) = send(&app, "PUT", "/admin/bans/ip:10.0.0.9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["expires_at"].is_null());
    }

    #[tokio::test]
    async fn test_invalid_identifier() {
        let (status, body) = send(&app(), "GET", "/admin/bans/nonsense", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("nonsense"));
    }

    #[tokio::test]
    async fn test_ban_rejects_unenforced_classes() {
        let app = app();

        for uri in [
            "/admin/bans/global:*",
            "/admin/bans/endpoint:%2Flogin%7Cip:10.0.0.9",
        ] {
            let (status, body) = send(&app, "PUT", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body["error"].as_str().unwrap().contains("only ip and user"));
        }

        let (_, body) = send(&app, "GET", "/admin/bans", None).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_override() {
        let app = app();

        let (status, body) = send(&app, "PUT", "/admin/load", Some(r#"{"load": 91}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "high");
        assert_eq!(body["multiplier"], 0.5);

        let (status, _) = send(&app, "PUT", "/admin/load", Some(r#"{"load": 140}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status() {
        let (status, body) = send(&app(), "GET", "/admin/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["failure_policy"], "open");
        assert_eq!(body["banned"], 0);
    }
}
