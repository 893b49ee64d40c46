//! Router-level tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    response::Response,
    Router,
};
use edgecam_cloud::{AzureBlobPublisher, BlobPublisher, MemoryPublisher};
use edgecam_controller::{CameraController, MockCamera, MockCameraHandle};
use edgecam_network::{build_router, AppContext, GREETING};
use edgecam_orchestrator::CommandDispatcher;
use edgecam_types::config::EdgecamConfig;
use edgecam_vision::ImageAnnotator;
use http_body_util::BodyExt;
use tower::ServiceExt;

const PUBLIC_URL: &str = "https://blob.invalid/webcam/picture";

struct TestApp {
    dir: tempfile::TempDir,
    router: Router,
    camera: MockCameraHandle,
}

fn app_with(publisher: Arc<dyn BlobPublisher>) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EdgecamConfig::default();
    config.server.static_dir = dir.path().join("static").to_string_lossy().into_owned();

    let mock = MockCamera::new(40, 30);
    let camera = mock.handle();
    let controller = CameraController::new(
        Box::new(mock),
        ImageAnnotator::new(&config.annotator),
        dir.path().join("static").join("image.jpg"),
    );
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::new(controller), publisher));
    let router = build_router(AppContext::new(dispatcher), &config.server);
    TestApp {
        dir,
        router,
        camera,
    }
}

fn app() -> (TestApp, MemoryPublisher) {
    let publisher = MemoryPublisher::new(PUBLIC_URL);
    (app_with(Arc::new(publisher.clone())), publisher)
}

async fn get(router: &Router, uri: &str) -> Response {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn index_returns_greeting() {
    let (app, _) = app();
    let response = get(&app.router, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, GREETING.as_bytes());
    assert_eq!(app.camera.reads(), 0);
}

#[tokio::test]
async fn image_route_serves_fresh_jpeg() {
    let (app, _) = app();
    let response = get(&app.router, "/image.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/jpeg");

    let bytes = body_bytes(response).await;
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(app.camera.reads(), 1);

    let on_disk = std::fs::read(app.dir.path().join("static").join("image.jpg")).unwrap();
    assert_eq!(on_disk, bytes);
}

#[tokio::test]
async fn image_route_reports_capture_failure() {
    let (app, _) = app();
    app.camera.set_failing(true);

    let response = get(&app.router, "/image.jpg").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["code"], "CAPTURE_FAILED");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn timezone_starts_at_zero() {
    let (app, _) = app();
    let response = get(&app.router, "/timezone").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"The timezone is: 0h");
}

#[tokio::test]
async fn postimage_uploads_and_reports_url() {
    let (app, publisher) = app();
    let response = get(&app.router, "/postimage").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_bytes(response).await,
        format!("image posted {PUBLIC_URL}").as_bytes()
    );
    assert_eq!(publisher.upload_count(), 1);
}

#[tokio::test]
async fn postimage_reflects_upload_failure() {
    let (app, publisher) = app();
    publisher.set_failing(true);

    let response = get(&app.router, "/postimage").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "UPLOAD_FAILED");
}

#[tokio::test]
async fn postimage_without_storage_credentials_is_config_missing() {
    let storage = EdgecamConfig::default().storage;
    let app = app_with(Arc::new(AzureBlobPublisher::new(storage).unwrap()));

    let response = get(&app.router, "/postimage").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["code"], "CONFIG_MISSING");
    assert_eq!(app.camera.reads(), 1);
}

#[tokio::test]
async fn postimage_with_unusable_account_key_is_upload_failure() {
    let mut storage = EdgecamConfig::default().storage;
    storage.account_name = Some("camstore".into());
    storage.account_key = Some("not base64!!".into());
    let app = app_with(Arc::new(AzureBlobPublisher::new(storage).unwrap()));

    let response = get(&app.router, "/postimage").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "UPLOAD_FAILED");
}

#[tokio::test]
async fn static_dir_serves_latest_capture() {
    let (app, _) = app();
    assert_eq!(
        get(&app.router, "/static/image.jpg").await.status(),
        StatusCode::NOT_FOUND
    );

    get(&app.router, "/image.jpg").await;
    let response = get(&app.router, "/static/image.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (app, _) = app();
    let response = get(&app.router, "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
