mod support;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use shiptrack_rs::browser::{BrowserDriver, BrowserError, DriverFactory};
use shiptrack_rs::oracle::Oracles;
use shiptrack_rs::server::build_router;
use shiptrack_rs::service::TrackingService;
use tower::ServiceExt;

use support::{ARRIVAL, BOOKING_ID, RESULT_URL, SimFactory, SiteOracles, VOYAGE, service, test_config};

struct Unreachable;

#[async_trait]
impl DriverFactory for Unreachable {
    async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        Err(BrowserError::Message("connection refused".into()))
    }
}

async fn send(service: Arc<TrackingService>, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = build_router(service, false).oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, body))
}

fn post_track(body: Value) -> Request<Body> {
    Request::post("/track")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn sim_service(dir: &std::path::Path) -> Arc<TrackingService> {
    Arc::new(service(
        test_config(dir),
        Arc::new(SiteOracles::default()),
        Arc::new(SimFactory::new(RESULT_URL)),
    ))
}

#[tokio::test]
async fn health_reports_healthy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let request = Request::get("/health").body(Body::empty())?;
    let (status, body) = send(sim_service(dir.path()), request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn missing_booking_id_is_a_bad_request() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = sim_service(dir.path());

    let (status, body) = send(Arc::clone(&service), post_track(json!({"carrier": "hmm"}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "booking_id is required");

    let (status, _) = send(service, post_track(json!({"booking_id": "  "}))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let request = Request::post("/track")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))?;
    let (status, body) = send(sim_service(dir.path()), request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn track_returns_the_extracted_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (status, body) = send(
        sim_service(dir.path()),
        post_track(json!({"booking_id": BOOKING_ID})),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["booking_id"], BOOKING_ID);
    assert_eq!(body["carrier"], "hmm");
    assert_eq!(body["voyage_number"], VOYAGE);
    assert_eq!(body["arrival_date"], ARRIVAL);
    assert_eq!(body["used_cache"], false);
    assert!(body["execution_time"].is_number());
    assert!(body["timestamp"].is_string());
    assert_eq!(body["extracted_data"]["arrival_date"], ARRIVAL);
    Ok(())
}

#[tokio::test]
async fn browser_failures_are_internal_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = TrackingService::new(
        test_config(dir.path()),
        Oracles::uniform(Arc::new(SiteOracles::default())),
        Arc::new(Unreachable),
        Arc::default(),
    );
    let (status, body) = send(
        Arc::new(service),
        post_track(json!({"booking_id": BOOKING_ID})),
    )
    .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("connection refused"));
    Ok(())
}
