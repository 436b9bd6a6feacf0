use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::{
    adapters::middleware::{
        MetricsAccess, authorize_middleware, metrics_guard_middleware, recover_middleware,
        request_id_middleware, response_cache_middleware, security_headers_middleware,
    },
    core::{
        auth::AuthEngine,
        error::{ErrorFormat, RegistryError},
        gateway::Gateway,
        response_cache::ResponseCache,
    },
    metrics::EventEmitter,
    ports::health_reporter::HealthReporter,
};

/// Shared state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthEngine>,
    /// `None` when response caching is disabled
    pub cache: Option<ResponseCache>,
    pub gateway: Arc<Gateway>,
    pub health: Arc<dyn HealthReporter>,
    pub events: EventEmitter,
    pub metrics_access: Arc<MetricsAccess>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn error_format(&self) -> ErrorFormat {
        self.gateway.error_format()
    }
}

/// Build the full application router.
///
/// `/_health` and `/metrics` are answered locally. Every other path goes
/// through recovery, authorization and the response cache before reaching
/// the gateway.
pub fn build_router(state: AppState) -> Router {
    let pipeline = Router::new()
        .fallback(proxy_handler)
        .layer(from_fn_with_state(state.clone(), response_cache_middleware))
        .layer(from_fn_with_state(state.clone(), authorize_middleware))
        .layer(from_fn_with_state(state.clone(), recover_middleware))
        .with_state(state.clone());

    Router::new()
        .route("/_health", get(health_handler))
        .route(
            "/metrics",
            get(metrics_handler)
                .route_layer(from_fn_with_state(state.clone(), metrics_guard_middleware)),
        )
        .with_state(state)
        .fallback_service(pipeline)
        .layer(from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
}

async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    state.gateway.forward(req).await
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.prometheus else {
        return RegistryError::new(StatusCode::NOT_FOUND).into_response(state.error_format());
    };
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
