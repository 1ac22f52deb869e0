//! HTTP-level tests for the control API, driven through the full router

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use subscan::app::{AppState, build_app};
use subscan::config::{Config, ScanConfig};
use subscan::db::{Database, UpsertSubscription};
use subscan::error::Result;
use subscan::scan::{Item, RunLogger, ScanDependencies, ScanOrchestrator};
use subscan::services::{ItemFetcher, ServicesManager};

struct EmptyFetcher;

#[async_trait]
impl ItemFetcher for EmptyFetcher {
    async fn fetch_all_items(&self, _source_id: &str) -> Result<Vec<Item>> {
        Ok(Vec::new())
    }
}

async fn test_app() -> (Router, Database, TempDir) {
    let db = Database::connect_in_memory().await.unwrap();
    let logs = TempDir::new().unwrap();
    let config = Config {
        port: 0,
        database_url: "sqlite::memory:".into(),
        database_max_connections: 1,
        scan_log_dir: logs.path().display().to_string(),
        fetch_base_url: None,
        fetch_timeout: Duration::from_secs(5),
        fetch_requests_per_second: 1,
        download_command: None,
        scan: ScanConfig::default(),
    };
    let deps = ScanDependencies {
        db: db.clone(),
        fetcher: Arc::new(EmptyFetcher),
        downloader: None,
        notifiers: Vec::new(),
        logger: Arc::new(RunLogger::new(logs.path(), 10)),
    };
    let state = AppState {
        scan: Arc::new(ScanOrchestrator::new(deps, config.scan.clone())),
        config: Arc::new(config),
        db: db.clone(),
        services: Arc::new(ServicesManager::new()),
    };
    (build_app(state), db, logs)
}

async fn patch_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_patch_subscription_toggles_flags() {
    let (app, db, _logs) = test_app().await;
    db.subscriptions()
        .upsert(UpsertSubscription::new("s1", "Someone"))
        .await
        .unwrap();

    let (status, body) = patch_json(
        app.clone(),
        "/api/subscriptions/s1",
        json!({ "auto_download": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], json!(true));
    assert_eq!(body["auto_download"], json!(false));

    let (status, body) =
        patch_json(app, "/api/subscriptions/s1", json!({ "enabled": false })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], json!(false));

    // Disabled sources drop out of the next run
    assert!(db.subscriptions().active_sources().await.unwrap().is_empty());
    let stored = db.subscriptions().get("s1").await.unwrap().unwrap();
    assert_eq!(stored.nickname, "Someone");
    assert!(!stored.auto_download);
}

#[tokio::test]
async fn test_patch_unknown_subscription_is_not_found() {
    let (app, _db, _logs) = test_app().await;

    let (status, body) =
        patch_json(app, "/api/subscriptions/ghost", json!({ "enabled": true })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}
