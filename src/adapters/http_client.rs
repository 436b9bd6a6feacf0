use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upstream transport using Hyper with Rustls.
///
/// * HTTP/1.1 on the wire, plain or TLS depending on the URI scheme
/// * TCP connect timeout on the connector, response-head timeout per request
/// * Streams the upstream body back without buffering
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    request_timeout: Duration,
}

impl HttpClientAdapter {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!(count = root_cert_store.len(), "loaded native root certificates");
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                errors = ?native_certs.errors,
                "some native certificates failed to load"
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        tracing::info!(
            connect_timeout = ?connect_timeout,
            request_timeout = ?request_timeout,
            "created upstream HTTP client"
        );
        Ok(Self {
            client,
            request_timeout,
        })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let Some(authority) = req.uri().authority().cloned() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI has no host: {}",
                req.uri()
            )));
        };

        let span = tracing::debug_span!(
            "upstream_request",
            upstream = %authority,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        #[allow(clippy::collapsible_if)]
        if !parts.headers.contains_key(header::HOST) {
            if let Ok(host) = header::HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(header::HOST, host);
            }
        }
        span.in_scope(|| tracing::debug!(headers = ?parts.headers, "sending upstream request"));

        let outgoing = Request::from_parts(parts, body);
        let pending = timeout(self.request_timeout, self.client.request(outgoing))
            .instrument(span.clone());
        let response = match pending.await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                span.record("http.status_code", 599u16);
                return Err(HttpClientError::ConnectionError(err.to_string()));
            }
            Err(_) => {
                span.record("http.status_code", 599u16);
                return Err(HttpClientError::Timeout(self.request_timeout));
            }
        };

        span.record("http.status_code", response.status().as_u16());

        let (mut parts, hyper_body) = response.into_parts();
        // The body is re-framed by the downstream server.
        parts.headers.remove(header::TRANSFER_ENCODING);

        Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
    }
}
