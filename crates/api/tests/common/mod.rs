//! Shared helpers for API integration tests.
//!
//! Tests run against the in-memory registry: the HTTP layer is fully
//! exercised without a database, and the registry handle is kept so
//! tests can drive job state from the worker's point of view.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tabsyn_api::config::ServerConfig;
use tabsyn_api::entitlements::EnvEntitlements;
use tabsyn_api::router::build_router;
use tabsyn_api::state::AppState;
use tabsyn_core::memory::MemoryRegistry;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 5,
        log_tail: 50,
        history_limit: 50,
        single_active: true,
        max_queue_depth: None,
    }
}

pub struct TestApp {
    pub registry: Arc<MemoryRegistry>,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config(), Vec::new())
    }

    pub fn with_config(config: ServerConfig, gpu_owners: Vec<String>) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let state = AppState {
            registry: Arc::clone(&registry) as _,
            entitlements: Arc::new(EnvEntitlements::new(gpu_owners, 3)),
            config: Arc::new(config),
        };
        Self {
            registry,
            router: build_router(state),
        }
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get_as(&self, path: &str, owner: &str) -> Response<Body> {
        let request = Request::builder()
            .uri(path)
            .header("x-owner-id", owner)
            .body(Body::empty())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn post_json(
        &self,
        path: &str,
        owner: Option<&str>,
        body: serde_json::Value,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(owner) = owner {
            builder = builder.header("x-owner-id", owner);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Collect a response body into JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}

/// A well-formed submission payload.
pub fn submission() -> serde_json::Value {
    serde_json::json!({
        "dataset": "AIDS",
        "table": "patients",
        "epochsVae": 10,
    })
}
