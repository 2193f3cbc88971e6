use std::any::Any;
use std::sync::Arc;

use axum::{
    Router, middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use super::api::{downloads, files, status};
use super::error::ApiError;
use super::rate_limit::{self, RateBudget, RateLimit, RateLimiter, enforce};
use crate::config::Config;
use crate::daemon::DownloadGateway;
use crate::files::FileCatalog;

/// Everything the handlers share. Built once in `main`.
#[derive(Clone)]
pub struct AppState {
    /// `None` while running without a reachable daemon
    pub gateway: Option<DownloadGateway>,
    pub catalog: FileCatalog,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, catalog: FileCatalog, gateway: Option<DownloadGateway>) -> Self {
        Self {
            gateway,
            catalog,
            limiter: Arc::new(RateLimiter::new()),
            config: Arc::new(config),
        }
    }
}

async fn not_found() -> ApiError {
    ApiError::endpoint_not_found()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Handler panicked: {}", detail);
    ApiError::internal("Internal server error").into_response()
}

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    let limit = |budget: RateBudget| RateLimit::new(state.limiter.clone(), budget);
    let list_downloads_limit =
        middleware::from_fn_with_state(limit(rate_limit::LIST_DOWNLOADS), enforce);
    let add_download_limit =
        middleware::from_fn_with_state(limit(rate_limit::ADD_DOWNLOAD), enforce);
    let control_limit =
        middleware::from_fn_with_state(limit(rate_limit::CONTROL_DOWNLOAD), enforce);
    let list_files_limit = middleware::from_fn_with_state(limit(rate_limit::LIST_FILES), enforce);
    let extract_limit = middleware::from_fn_with_state(limit(rate_limit::EXTRACT_FILE), enforce);
    let delete_limit = middleware::from_fn_with_state(limit(rate_limit::DELETE_FILE), enforce);

    let layers = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(
            state.config.server.max_in_flight.max(1),
        ));

    Router::new()
        .route("/", get(status::index))
        .route("/health", get(status::health))
        .route("/status", get(status::status))
        // Downloads
        .route(
            "/downloads",
            get(downloads::list_downloads).route_layer(list_downloads_limit),
        )
        .route(
            "/downloads",
            post(downloads::add_download).route_layer(add_download_limit),
        )
        .route(
            "/downloads/{gid}/pause",
            post(downloads::pause_download).route_layer(control_limit.clone()),
        )
        .route(
            "/downloads/{gid}/resume",
            post(downloads::resume_download).route_layer(control_limit.clone()),
        )
        .route(
            "/downloads/{gid}/remove",
            post(downloads::remove_download).route_layer(control_limit),
        )
        // File manager
        .route(
            "/files",
            get(files::list_files).route_layer(list_files_limit),
        )
        .route(
            "/files/extract",
            post(files::extract_file).route_layer(extract_limit),
        )
        .route(
            "/files/delete",
            post(files::delete_file).route_layer(delete_limit),
        )
        .route("/files/download/{*path}", get(files::download_file))
        .fallback(not_found)
        .layer(layers)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fake::FakeDaemon;
    use crate::files::PathGuard;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use clap::Parser;
    use serde_json::{Value, json};
    use std::path::Path;
    use tower::ServiceExt;

    fn state(root: &Path, fake: Option<&Arc<FakeDaemon>>) -> AppState {
        let config = Config::parse_from([
            "harvester".to_string(),
            "--download-dir".to_string(),
            root.display().to_string(),
            "--ui-path".to_string(),
            root.join("missing-index.html").display().to_string(),
        ]);
        let guard = PathGuard::new(root);
        let gateway =
            fake.map(|fake| DownloadGateway::new(fake.clone(), guard.clone()));
        AppState::new(config, FileCatalog::new(guard), gateway)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_always_up() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path(), None));
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn unknown_routes_get_the_json_404() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path(), None));
        let (status, body) = send(&app, get_req("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Endpoint not found" }));
    }

    #[tokio::test]
    async fn missing_ui_page_falls_back_to_api_overview() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path(), None));
        let response = app.oneshot(get_req("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let html = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&html).contains("GET /downloads"));
    }

    #[tokio::test]
    async fn daemon_endpoints_report_a_missing_daemon() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path(), None));

        let (status, body) = send(&app, get_req("/downloads")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "aria2c daemon not connected");

        let (status, body) = send(&app, post_json("/downloads/abc/pause", json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "aria2c daemon not connected");

        let (status, body) = send(&app, get_req("/status")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "disconnected");
    }

    #[tokio::test]
    async fn add_download_validates_the_url() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDaemon::default());
        let app = create_router(state(root.path(), Some(&fake)));

        let (status, body) =
            send(&app, post_json("/downloads", json!({ "url": "not-a-url" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid URL format"));

        let (status, body) = send(&app, post_json("/downloads", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "URL is required");

        let (status, body) = send(&app, post_json("/downloads", json!({ "url": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "URL cannot be empty");

        let (status, _) = send(
            &app,
            post_json("/downloads", json!({ "url": "http://x/y", "dir": "../../etc" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(fake.count_calls("aria2.addUri"), 0);
    }

    #[tokio::test]
    async fn added_downloads_show_up_in_the_listing() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDaemon::default());
        let app = create_router(state(root.path(), Some(&fake)));

        let (status, body) = send(
            &app,
            post_json("/downloads", json!({ "url": "https://host/data/set.csv" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"], "Download added successfully");
        assert_eq!(body["download"]["name"], "set.csv");
        assert_eq!(body["download"]["status"], "waiting");
        assert_eq!(body["download"]["eta"], "Unknown");

        let (status, body) = send(&app, get_req("/downloads")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["downloads"][0]["name"], "set.csv");
    }

    #[tokio::test]
    async fn controlling_downloads() {
        let root = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDaemon::default());
        fake.push_download(FakeDaemon::download("a1", "active", "http://x/a.iso"));
        let app = create_router(state(root.path(), Some(&fake)));

        let (status, body) = send(&app, post_json("/downloads/unknown/pause", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Download not found");

        let (status, body) = send(&app, post_json("/downloads/a1/pause", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Download paused successfully");

        fake.refuse("aria2.unpause");
        let (status, body) = send(&app, post_json("/downloads/a1/resume", json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to resume download");

        let (status, body) = send(&app, post_json("/downloads/a1/remove", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Download removed successfully");
    }

    #[tokio::test]
    async fn status_combines_daemon_and_storage() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.bin"), vec![0u8; 2048]).unwrap();
        let fake = Arc::new(FakeDaemon::default());
        fake.push_download(FakeDaemon::download("a1", "active", "http://x/a.iso"));
        let app = create_router(state(root.path(), Some(&fake)));

        let (status, body) = send(&app, get_req("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connected");
        assert_eq!(body["active_downloads"], 1);
        assert_eq!(body["aria2_version"], "1.37.0");
        assert_eq!(body["total_files"], 1);
        assert_eq!(body["total_size"], "2.0 KB");
        assert_eq!(body["max_concurrent"], 10);
    }

    #[tokio::test]
    async fn file_listing_is_confined() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("data.zip"), b"PK").unwrap();
        let app = create_router(state(root.path(), None));

        let (status, body) = send(&app, get_req("/files?path=/etc")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Access denied");

        let (status, _) = send(&app, get_req("/files?path=missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, get_req("/files")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["parent_path"], Value::Null);
        assert_eq!(body["files"][0]["can_extract"], true);
    }

    #[tokio::test]
    async fn extract_and_delete_require_a_file_path() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(root.path().join("bundle.7z"), b"7z").unwrap();
        let app = create_router(state(root.path(), None));

        let (status, body) = send(&app, post_json("/files/extract", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "file_path is required");

        let (status, body) =
            send(&app, post_json("/files/extract", json!({ "file_path": "notes.txt" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File is not a supported archive");

        let (status, _) =
            send(&app, post_json("/files/extract", json!({ "file_path": "bundle.7z" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        std::fs::create_dir(root.path().join("folder.zip")).unwrap();
        let (status, body) =
            send(&app, post_json("/files/extract", json!({ "file_path": "folder.zip" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File is not a supported archive");

        let (status, _) = send(
            &app,
            post_json(
                "/files/extract",
                json!({ "file_path": "bundle.7z", "extract_to": "/tmp/elsewhere" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            send(&app, post_json("/files/delete", json!({ "file_path": "gone.txt" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "File not found");

        let (status, body) =
            send(&app, post_json("/files/delete", json!({ "file_path": "notes.txt" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "File deleted successfully");
        assert!(!root.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn downloads_are_served_as_attachments() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        std::fs::write(root.path().join("sub/report.csv"), b"a,b\n1,2\n").unwrap();
        let app = create_router(state(root.path(), None));

        let response = app
            .clone()
            .oneshot(get_req("/files/download/sub/report.csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.csv\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"a,b\n1,2\n");

        let (status, _) = send(&app, get_req("/files/download/sub")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, get_req("/files/download/..%2F..%2Fetc%2Fpasswd")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn extraction_is_rate_limited_per_client() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path(), None));
        let extract = |client: &str| {
            Request::post("/files/extract")
                .header("x-forwarded-for", client)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..rate_limit::EXTRACT_FILE.max_requests {
            let (status, _) = send(&app, extract("198.51.100.1")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        let (status, body) = send(&app, extract("198.51.100.1")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Rate limit exceeded");

        let (status, _) = send(&app, extract("198.51.100.2")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn panics_become_500s() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
