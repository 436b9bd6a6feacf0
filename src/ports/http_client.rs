use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Transport-level failure while talking to the upstream registry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connection refused, reset, TLS handshake failure, ...
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// No response head arrived in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The outgoing request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests upstream
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to the upstream registry
    ///
    /// # Arguments
    /// * `req` - Fully rewritten request carrying an absolute upstream URI
    ///
    /// # Returns
    /// The upstream response with a streaming body, or a transport error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
