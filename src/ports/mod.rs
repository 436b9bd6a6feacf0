pub mod auth_provider;
pub mod health_reporter;
pub mod http_client;

pub use auth_provider::{AuthProvider, ProviderError, ProviderGrant};
pub use health_reporter::{HealthReporter, NoopHealthReporter};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
