//! Registry-compatible error responses.
//!
//! Docker clients parse failures as
//! `{"errors":[{"code":"UNAUTHORIZED","message":"Unauthorized"}]}`; anything
//! else shows up as an opaque "unexpected status" on the client side.
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};

/// How gateway-generated failures are written to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFormat {
    /// Registry JSON error envelope
    #[default]
    Json,
    /// Status line only, empty body
    Plain,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// A failure produced by the gateway itself rather than by the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryError {
    status: StatusCode,
    detail: Option<serde_json::Value>,
}

impl RegistryError {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<serde_json::Value>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn body(&self) -> ErrorBody {
        let message = self.status.canonical_reason().unwrap_or("Unknown");
        ErrorBody {
            errors: vec![ErrorEntry {
                code: message.to_uppercase().replace(' ', "_"),
                message: message.to_string(),
                detail: self.detail.clone(),
            }],
        }
    }

    pub fn into_response(self, format: ErrorFormat) -> Response<Body> {
        let mut response = match format {
            ErrorFormat::Plain => Response::new(Body::empty()),
            ErrorFormat::Json => {
                let payload = serde_json::to_vec(&self.body()).unwrap_or_default();
                let mut response = Response::new(Body::from(payload));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
                response
            }
        };
        *response.status_mut() = self.status;
        response
    }
}
