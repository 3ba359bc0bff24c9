//! Web surface
//!
//! A small axum router on the web port: health and workspace-content
//! serving for local jobs.

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

pub fn router(content_dir: PathBuf) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/content/:name", get(serve_content))
        .with_state(content_dir)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn serve_content(State(dir): State<PathBuf>, Path(name): Path<String>) -> Response {
    if name.contains('/') || name.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match tokio::fs::read(dir.join(format!("{name}.tar.gz"))).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/gzip")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_answers() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path().to_path_buf());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn content_is_served_and_missing_content_is_404() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("job-1.tar.gz"), b"tar")
            .await
            .unwrap();
        let app = router(dir.path().to_path_buf());

        let ok = app
            .clone()
            .oneshot(Request::get("/content/job-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let missing = app
            .oneshot(Request::get("/content/job-2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
