//! JSON endpoints for the city cleanup batch operations.
//!
//! Every handler answers 200; batch failures are reported as `success: false` with an
//! `errors` list in the body.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eggrates_cleanup::{CleanupError, CleanupPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "eggrates-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CleanupPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<CleanupPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub run: Option<String>,
}

impl CleanupQuery {
    fn wants_run(&self) -> bool {
        self.run.as_deref().is_some_and(|v| !v.is_empty())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/cleanup/analyze_duplicates", get(analyze_handler))
        .route(
            "/cleanup/city_duplicates_cleanup",
            get(cleanup_get_handler).post(cleanup_post_handler),
        )
        .route("/cleanup/redirections", get(redirections_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = Arc::new(eggrates_cleanup::pipeline_from_env().await?);
    serve(pipeline).await
}

pub async fn serve(pipeline: Arc<CleanupPipeline>) -> anyhow::Result<()> {
    let port = pipeline.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving cleanup endpoints");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn analyze_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.analyze().await {
        Ok(analysis) => ok_json(&analysis),
        Err(err) => failure(err),
    }
}

async fn cleanup_get_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    if query.wants_run() {
        return execute(&state).await;
    }
    match state.pipeline.preview().await {
        Ok(preview) => ok_json(&preview),
        Err(err) => failure(err),
    }
}

async fn cleanup_post_handler(State(state): State<Arc<AppState>>) -> Response {
    execute(&state).await
}

async fn redirections_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.redirections().await {
        Ok(plan) => ok_json(&plan),
        Err(err) => failure(err),
    }
}

async fn execute(state: &AppState) -> Response {
    let report = state.pipeline.run().await;
    ok_json(&report)
}

fn ok_json<T: Serialize>(value: &T) -> Response {
    Json(value).into_response()
}

fn failure(err: CleanupError) -> Response {
    warn!(error = %err, "cleanup endpoint failed");
    Json(json!({
        "success": false,
        "errors": [err.to_string()],
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::NaiveDate;
    use eggrates_cleanup::{CleanupConfig, CleanupRules};
    use eggrates_storage::{MemoryNormalized, MemoryPrimary, Storage};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn test_app(primary: &MemoryPrimary) -> Router {
        let normalized = MemoryNormalized::new();
        let pipeline = CleanupPipeline::new(
            Storage::new(primary.clone(), normalized),
            CleanupConfig::default(),
            CleanupRules::default(),
        )
        .unwrap();
        app(AppState::new(Arc::new(pipeline)))
    }

    fn seeded_primary() -> MemoryPrimary {
        let primary = MemoryPrimary::new();
        primary.insert("Chennai", "Tamil Nadu", day(1), 5.5);
        primary.insert("Chennai (CC)", "Tamil Nadu", day(2), 5.6);
        primary.insert("Ranchi (CC)", "Jharkhand", day(1), 5.0);
        primary
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn get_without_run_is_a_preview() {
        let primary = seeded_primary();
        let (status, body) = call(test_app(&primary), "GET", "/cleanup/city_duplicates_cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_cities_with_issues"], 3);
        assert_eq!(body["preview"][0]["city_type"], "HAS_STATE_CODE");
        assert!(primary.rows().iter().any(|r| r.city == "Chennai (CC)"));
    }

    #[tokio::test]
    async fn run_param_executes_cleanup() {
        let primary = seeded_primary();
        let (status, body) =
            call(test_app(&primary), "GET", "/cleanup/city_duplicates_cleanup?run=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["statistics"]["cities_merged"], 1);
        assert_eq!(body["statistics"]["cities_renamed"], 1);
        assert_eq!(body["processed_duplicates"].as_array().unwrap().len(), 2);
        assert!(primary.rows().iter().all(|r| !r.city.contains('(')));
    }

    #[tokio::test]
    async fn post_executes_cleanup() {
        let primary = seeded_primary();
        let (_, body) = call(test_app(&primary), "POST", "/cleanup/city_duplicates_cleanup").await;
        assert_eq!(body["success"], true);
        assert_eq!(body["secondary_synced"], true);
    }

    #[tokio::test]
    async fn failed_batch_still_answers_ok() {
        let primary = seeded_primary();
        primary.fail_on_write(1);
        let (status, body) = call(test_app(&primary), "POST", "/cleanup/city_duplicates_cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_is_reported_in_body() {
        let primary = seeded_primary();
        primary.set_unavailable(true);
        let (status, body) = call(test_app(&primary), "GET", "/cleanup/analyze_duplicates").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn analysis_and_redirections() {
        let primary = seeded_primary();
        let app = test_app(&primary);
        let (_, analysis) = call(app.clone(), "GET", "/cleanup/analyze_duplicates").await;
        assert_eq!(analysis["summary"]["cities_with_codes"], 2);
        assert_eq!(analysis["potential_merges"][0]["clean_city"], "Chennai");

        let (_, plan) = call(app, "GET", "/cleanup/redirections").await;
        assert_eq!(
            plan["apache_redirects"][0],
            "Redirect 301 /chennai-cc-egg-rate /chennai-egg-rate"
        );
        assert_eq!(plan["redirects"][1]["new_url"], "/ranchi-egg-rate");
    }
}
