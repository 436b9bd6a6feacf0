//! Forwarding of authorized, cache-missed requests to the upstream registry.
//!
//! The [`Gateway`] owns the single upstream target. It rewrites the request
//! URI and `Host` header, hands the request to an [`HttpClient`] on a
//! detached task and turns transport failures into `502 Bad Gateway`
//! responses that are also reported to the health collaborator.
use std::{str::FromStr, sync::Arc};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, header,
        uri::{Authority, InvalidUri, PathAndQuery, Scheme},
    },
};

use crate::{
    core::{
        error::{ErrorFormat, RegistryError},
        response_cache::CacheKey,
    },
    metrics::{Event, EventEmitter},
    ports::{
        health_reporter::HealthReporter,
        http_client::{HttpClient, HttpClientError},
    },
};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Status the upstream answered with, recorded in response extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamStatus(pub StatusCode);

/// The upstream `(scheme, host)` pair every request is sent to.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    host_header: HeaderValue,
}

impl UpstreamTarget {
    pub fn new(scheme: &str, host: &str) -> Result<Self, InvalidUri> {
        let scheme = Scheme::from_str(scheme)?;
        let authority = Authority::from_str(host)?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("localhost"));
        Ok(Self {
            scheme,
            authority,
            host_header,
        })
    }

    /// Absolute upstream URI for an inbound request target.
    pub fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, HttpClientError> {
        let path_and_query = inbound
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|err| HttpClientError::InvalidRequest(err.to_string()))
    }
}

pub struct Gateway {
    client: Arc<dyn HttpClient>,
    target: UpstreamTarget,
    health: Arc<dyn HealthReporter>,
    events: EventEmitter,
    error_format: ErrorFormat,
}

impl Gateway {
    pub fn new(
        client: Arc<dyn HttpClient>,
        target: UpstreamTarget,
        health: Arc<dyn HealthReporter>,
        events: EventEmitter,
        error_format: ErrorFormat,
    ) -> Self {
        Self {
            client,
            target,
            health,
            events,
            error_format,
        }
    }

    pub fn error_format(&self) -> ErrorFormat {
        self.error_format
    }

    /// Proxy one request and return the upstream response, or a 502.
    ///
    /// The upstream call runs on its own task: dropping the returned future
    /// leaves an in-flight call running so its body can still be cached.
    pub async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let (mut parts, body) = req.into_parts();
        let method = parts.method.clone();
        let client_host = client_facing_host(&parts.headers, &parts.uri);
        let cache_key = parts
            .extensions
            .get::<CacheKey>()
            .map(|key| key.as_str().to_string())
            .unwrap_or_default();

        let uri = match self.target.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(err) => return self.upstream_failed(&method, &parts.uri, &err),
        };
        strip_hop_by_hop(&mut parts.headers);
        parts
            .headers
            .insert(header::HOST, self.target.host_header.clone());
        parts.uri = uri.clone();

        let client = Arc::clone(&self.client);
        let upstream = Request::from_parts(parts, body);
        let outcome = match tokio::spawn(async move { client.send_request(upstream).await }).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                // Only the runtime cancels this task, when it shuts down.
                tracing::debug!(%method, url = %uri, error = %err, "upstream task cancelled");
                return RegistryError::new(StatusCode::SERVICE_UNAVAILABLE)
                    .into_response(self.error_format);
            }
        };

        match outcome {
            Ok(mut response) => {
                let status = response.status();
                strip_hop_by_hop(response.headers_mut());
                if let Some(client_host) = client_host {
                    rewrite_location(response.headers_mut(), &self.target.authority, &client_host);
                }
                response.extensions_mut().insert(UpstreamStatus(status));
                self.events.emit(Event::Upstream { status });
                tracing::info!(%method, url = %uri, status = status.as_u16(), %cache_key, "proxied");
                response
            }
            Err(err) => self.upstream_failed(&method, &uri, &err),
        }
    }

    fn upstream_failed(
        &self,
        method: &axum::http::Method,
        url: &Uri,
        err: &HttpClientError,
    ) -> Response<Body> {
        tracing::warn!(%method, %url, error = %err, "upstream request failed");
        self.health.fail(format!("{method} {url} failed: {err}"));
        RegistryError::new(StatusCode::BAD_GATEWAY).into_response(self.error_format)
    }
}

/// Host the client addressed: the `Host` header, else the URI authority.
pub fn client_facing_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
}

/// Remove connection-scoped headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Point a redirect at `client_host` when it targets the upstream itself.
///
/// Returns whether the header was rewritten.
pub fn rewrite_location(headers: &mut HeaderMap, target: &Authority, client_host: &str) -> bool {
    let Some(location) = headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Uri>().ok())
    else {
        return false;
    };
    let points_at_target = location
        .authority()
        .is_some_and(|authority| authority.as_str().eq_ignore_ascii_case(target.as_str()));
    if !points_at_target {
        return false;
    }

    let Ok(authority) = Authority::from_str(client_host) else {
        return false;
    };
    let mut parts = location.into_parts();
    parts.authority = Some(authority);
    let Some(value) = Uri::from_parts(parts)
        .ok()
        .and_then(|uri| HeaderValue::from_str(&uri.to_string()).ok())
    else {
        return false;
    };
    headers.insert(header::LOCATION, value);
    true
}
