//! Axum middleware forming the request pipeline.
//!
//! The proxied namespace runs through, from the outside in:
//! [`recover_middleware`] → [`authorize_middleware`] →
//! [`response_cache_middleware`] → gateway handler.
//! The reserved `/metrics` route is guarded by [`metrics_guard_middleware`]
//! instead. [`security_headers_middleware`] and [`request_id_middleware`]
//! wrap every route.
use std::{
    any::Any,
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    panic::AssertUnwindSafe,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::FutureExt;
use http_body_util::BodyExt;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::{
    adapters::http_handler::AppState,
    core::{
        auth::{AccessDecision, MethodClass},
        capture::{CaptureBody, CaptureTarget},
        client_ip::resolve_client_ip,
        error::RegistryError,
        gateway::UpstreamStatus,
        response_cache::{CacheKey, CachedResponse, ResponseCache, X_CACHE, is_cacheable},
    },
    metrics::Event,
};

const X_REQUEST_ID: &str = "x-request-id";

/// What the authorization stage learned about a request, for later stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub method_class: MethodClass,
    pub resolved_host: Option<String>,
}

impl From<AccessDecision> for RequestContext {
    fn from(decision: AccessDecision) -> Self {
        Self {
            client_ip: decision.client_ip,
            method_class: decision.method_class,
            resolved_host: decision.resolved_host,
        }
    }
}

fn peer_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Reject requests the [`AuthEngine`](crate::core::auth::AuthEngine) denies.
pub async fn authorize_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = peer_ip(&req);
    match state.auth.authorize(req.method(), req.headers(), peer).await {
        Ok(decision) => {
            req.extensions_mut().insert(RequestContext::from(decision));
            next.run(req).await
        }
        Err(failure) => {
            let status = failure.status();
            let mut error = RegistryError::new(status);
            if status.is_client_error() {
                error = error.with_detail(failure.to_string());
            }
            error.into_response(state.error_format())
        }
    }
}

/// Serve cacheable registry endpoints from memory, capturing misses.
pub async fn response_cache_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    state.events.emit(Event::Request {
        method: req.method().clone(),
        path: req.uri().path().to_string(),
    });

    let key = CacheKey::from_request(req.method(), req.uri(), req.headers());
    req.extensions_mut().insert(key.clone());

    let cache = match &state.cache {
        Some(cache) if is_cacheable(req.method(), req.uri()) => cache.clone(),
        _ => return next.run(req).await,
    };

    let context = req.extensions().get::<RequestContext>().cloned();
    let client_ip = context.as_ref().map(|context| context.client_ip);
    let tenant = context.and_then(|context| context.resolved_host);

    if let Some(entry) = cache.get(&key) {
        state.events.emit(Event::Cache { hit: true });
        tracing::debug!(%key, path = req.uri().path(), ?client_ip, ?tenant, "cache hit");
        return entry.to_response();
    }
    state.events.emit(Event::Cache { hit: false });
    tracing::debug!(%key, path = req.uri().path(), ?client_ip, ?tenant, "cache miss");

    // The rest of a miss runs detached: a client that leaves early drops only
    // the receiver, and the finished response still reaches the cache.
    let (tx, rx) = oneshot::channel();
    tokio::spawn(
        async move {
            let outcome = AssertUnwindSafe(next.run(req)).catch_unwind().await;
            let outcome = outcome.map(|response| capture_miss(response, cache, key));
            let Err(Ok(response)) = tx.send(outcome) else {
                return;
            };
            if response.extensions().get::<Captured>().is_some() {
                let _ = response.into_body().collect().await;
                tracing::debug!("client left before the response, cached after draining");
            }
        }
        .in_current_span(),
    );

    match rx.await {
        Ok(Ok(response)) => response,
        Ok(Err(payload)) => std::panic::resume_unwind(payload),
        Err(_) => {
            tracing::debug!("cache miss task cancelled");
            RegistryError::new(StatusCode::SERVICE_UNAVAILABLE).into_response(state.error_format())
        }
    }
}

/// Marks a miss whose body is being teed into the cache.
#[derive(Debug, Clone, Copy)]
struct Captured;

fn capture_miss(mut response: Response, cache: ResponseCache, key: CacheKey) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("MISS"));

    let Some(&UpstreamStatus(status)) = response.extensions().get::<UpstreamStatus>() else {
        return response;
    };
    if !CachedResponse::is_storable(status) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    parts.extensions.insert(Captured);
    let target = CaptureTarget {
        cache,
        key,
        status,
        headers: parts.headers.clone(),
    };
    Response::from_parts(parts, Body::new(CaptureBody::new(body, target)))
}

/// Turn a panic in the inner pipeline into a 500 and a health failure.
pub async fn recover_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "recovered from panic in proxy handler");
            state
                .health
                .fail(format!("panic in proxy handler: {message}"));
            RegistryError::new(StatusCode::INTERNAL_SERVER_ERROR).into_response(state.error_format())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Access rules for the Prometheus endpoint.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccess {
    login: Option<String>,
    password: String,
    ips: HashSet<IpAddr>,
}

impl MetricsAccess {
    pub fn new(
        login: Option<String>,
        password: Option<String>,
        ips: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            login: login.filter(|login| !login.is_empty()),
            password: password.unwrap_or_default(),
            ips: ips.into_iter().collect(),
        }
    }

    /// Without credentials or an IP list the endpoint is not exposed.
    pub fn is_enabled(&self) -> bool {
        self.login.is_some() || !self.ips.is_empty()
    }

    pub fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<(), StatusCode> {
        if !self.is_enabled() {
            return Err(StatusCode::NOT_FOUND);
        }
        if !self.ips.is_empty() {
            let allowed = resolve_client_ip(headers, peer).is_some_and(|ip| self.ips.contains(&ip));
            if !allowed {
                return Err(StatusCode::FORBIDDEN);
            }
        }
        if let Some(login) = &self.login {
            let authenticated = basic_credentials(headers).is_some_and(|(user, password)| {
                let user_ok = user.as_bytes().ct_eq(login.as_bytes());
                let password_ok = password.as_bytes().ct_eq(self.password.as_bytes());
                bool::from(user_ok & password_ok)
            });
            if !authenticated {
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
        Ok(())
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

/// Guard for `/metrics`: IP allowlist plus basic auth.
pub async fn metrics_guard_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    match state.metrics_access.check(req.headers(), peer_ip(&req)) {
        Ok(()) => next.run(req).await,
        Err(status) => {
            tracing::debug!(%status, "metrics access denied");
            let mut response = RegistryError::new(status).into_response(state.error_format());
            if status == StatusCode::UNAUTHORIZED {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"metrics\""),
                );
            }
            response
        }
    }
}

/// Hardening headers set on every response.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("origin"));

    response
}

/// Reuse or generate an `X-Request-ID` and run the request inside its span.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, header_value);
    }

    response
}
