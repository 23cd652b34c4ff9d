//! API server: the REST router and the Prometheus metrics listener.

use crate::rest::{self, AppState};
use audience_core::config::AppConfig;
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

/// Build the REST router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Segments
        .route("/api/v1/segments/create", post(rest::create_segment))
        .route("/api/v1/segments/delete", delete(rest::delete_segment))
        // Memberships
        .route("/api/v1/users/segments", post(rest::set_segments))
        .route("/api/v1/users/active-segments", get(rest::active_segments))
        .route("/api/v1/history", post(rest::history))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until `shutdown` resolves, then drain in-flight requests.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Install the Prometheus recorder and its scrape listener on the
    /// metrics port. Must be called from within the tokio runtime.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audience_core::config::LimitsConfig;
    use audience_core::Stores;
    use audience_segmentation::{MembershipService, SegmentService};
    use audience_store::{ManualClock, MemoryStore};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn app() -> (Router, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap(),
        ));
        let stores = Stores {
            users: store.clone(),
            segments: store.clone(),
            audit: store.clone(),
            tasks: store,
            clock,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let membership = MembershipService::new(&stores, LimitsConfig::default());
        let state = AppState::new(
            membership.clone(),
            SegmentService::new(&stores, membership),
            "test-node".to_string(),
            shutdown_rx,
        );
        (router(state), shutdown_tx)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_segment_lifecycle_over_http() {
        let (app, _shutdown) = app();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/segments/create",
            Some(json!({"slug": "vip"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["slug"], "vip");

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/segments/create",
            Some(json!({"slug": "vip"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_exists");

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/users/segments",
            Some(json!({"user_id": "u1", "segments_add": ["vip"], "ttl": 60})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], json!(["vip"]));
        assert_eq!(body["audit_recorded"], true);
        assert!(body["expires_at"].is_string());

        let (status, body) = call(
            &app,
            Method::GET,
            "/api/v1/users/active-segments?user_id=u1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["segments"], json!(["vip"]));

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/history",
            Some(json!({"user_id": "u1", "year": 2024, "month": 6})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"][0]["kind"], "add");

        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/v1/segments/delete",
            Some(json!({"slug": "vip"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &app,
            Method::DELETE,
            "/api/v1/segments/delete",
            Some(json!({"slug": "vip"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, _shutdown) = app();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/users/segments",
            Some(json!({"user_id": "u1", "segments_add": ["ghost"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "segments_not_exist");

        let (status, _) = call(
            &app,
            Method::GET,
            "/api/v1/users/active-segments?user_id=nobody",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/segments/create",
            Some(json!({"slug": "big", "percentage_users": 20000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/history",
            Some(json!({"user_id": "nobody", "year": 2024, "month": 6})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_zero_percentage_enrolls_nobody() {
        let (app, _shutdown) = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/segments/create",
            Some(json!({"slug": "empty", "percentage_users": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["enrolled"], json!([]));
    }

    #[tokio::test]
    async fn test_readiness_follows_shutdown() {
        let (app, shutdown) = app();

        let (status, _) = call(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "test-node");

        shutdown.send(true).unwrap();
        let (status, _) = call(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(&app, Method::GET, "/live", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
