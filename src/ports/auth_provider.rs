use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// Successful entitlement check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderGrant {
    /// Upstream tenant the client was authorized for, if the provider named one
    pub resolved_host: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider answered and said the client is no longer entitled
    #[error("not entitled: {0}")]
    NotEntitled(String),

    /// The provider could not be reached or answered something unexpected
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
}

/// External authorization provider consulted for read access on a cache miss.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Ask whether `ip` is entitled to read from the registry.
    async fn check(&self, ip: IpAddr) -> Result<ProviderGrant, ProviderError>;
}
