//! registry-gate - an access-controlled caching reverse proxy for a Docker
//! registry.
//!
//! Every request that is not answered locally passes three stages before it
//! reaches the single upstream registry:
//!
//! 1. **Authorization**: the client IP (resolved through trusted proxies) and
//!    user agent are checked against static allow lists, a TTL cache of
//!    earlier verdicts and, optionally, an external entitlement provider.
//!    Writes are reserved for trusted IPs.
//! 2. **Response cache**: successful `GET`/`HEAD` responses for manifests,
//!    tags and catalogs are kept in a bounded TTL cache and replayed with
//!    `X-Cache: HIT`.
//! 3. **Gateway**: the request is streamed upstream, hop-by-hop headers are
//!    dropped and upstream `Location` headers are rewritten back to the
//!    client-facing host. Unreachable upstreams and panics become registry
//!    style error responses and are reported to a health collaborator.
//!
//! # Quick Example
//! ```no_run
//! use registry_gate::config::load_config;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! // File values first, then REGATE__* environment overrides
//! let cfg = load_config(Some("registry-gate.toml")).await?;
//! println!("proxying to {}", cfg.target.host);
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Traits for the outside world live in `ports`, their implementations in
//! `adapters`, and the request-path logic in `core`. The binary only wires
//! them together.
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>`; request-path components use
//! `thiserror` enums and never fail a request without an HTTP response.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{AppState, HttpClientAdapter, build_router},
    core::{AuthEngine, Gateway, ResponseCache},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
