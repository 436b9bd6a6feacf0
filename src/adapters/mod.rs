pub mod auth_provider;
pub mod healthchecks;
pub mod http_client;
pub mod http_handler;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use auth_provider::HttpAuthProvider;
pub use healthchecks::HealthchecksClient;
pub use http_client::HttpClientAdapter;
pub use http_handler::{AppState, build_router};
