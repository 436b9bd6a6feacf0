//! Two-tier authorization engine.
//!
//! Requests are split by method into two trust domains:
//! * write-class (`PATCH`, `POST`, `PUT`, `DELETE`): allowed only for IPs in
//!   the static trusted set, nothing is cached and no provider is consulted
//! * read-class (`GET`, `HEAD`, `OPTIONS`): a cheap tier (static allow list,
//!   positive verdict cache) followed by a full tier (negative verdict cache,
//!   user agent check, optional external provider)
//!
//! Every full-tier decision writes exactly one verdict. The positive and
//! negative tables are kept disjoint by [`AuthDecisionCache`].
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::http::{HeaderMap, Method, StatusCode, header};
use moka::{policy::EvictionPolicy, sync::Cache};
use thiserror::Error;

use crate::{
    core::{client_ip::resolve_client_ip, user_agent::product_name},
    metrics::{Event, EventEmitter},
    ports::auth_provider::{AuthProvider, ProviderError},
};

/// Upper bound for a single provider round trip.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodClass {
    Read,
    Write,
}

impl MethodClass {
    /// `None` for methods the proxy refuses outright.
    pub fn classify(method: &Method) -> Option<Self> {
        match *method {
            Method::GET | Method::HEAD | Method::OPTIONS => Some(Self::Read),
            Method::PATCH | Method::POST | Method::PUT | Method::DELETE => Some(Self::Write),
            _ => None,
        }
    }
}

/// What satisfied an allow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    TrustedList,
    AllowList,
    PositiveCache,
    /// Passing user agent with no provider configured
    UserAgent,
    Provider,
}

/// Outcome of a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub client_ip: IpAddr,
    pub method_class: MethodClass,
    pub resolved_host: Option<String>,
    pub source: DecisionSource,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("client IP could not be determined")]
    UnresolvedIp,

    #[error("method {method} is not allowed for IP {ip}")]
    MethodNotAllowed { method: Method, ip: IpAddr },

    #[error("IP {ip} is not trusted for write access")]
    UntrustedWriter { ip: IpAddr },

    #[error("user agent {agent:?} is not allowed for IP {ip}")]
    UserAgentRejected { ip: IpAddr, agent: Option<String> },

    #[error("IP {ip} was denied recently")]
    CachedDenial { ip: IpAddr },

    #[error("IP {ip} is not entitled: {reason}")]
    NotEntitled { ip: IpAddr, reason: String },

    #[error("authorization provider failed for IP {ip}: {reason}")]
    ProviderFailed { ip: IpAddr, reason: String },
}

impl AuthFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnresolvedIp | Self::ProviderFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::UntrustedWriter { .. } | Self::UserAgentRejected { .. } => StatusCode::FORBIDDEN,
            Self::CachedDenial { .. } | Self::NotEntitled { .. } => StatusCode::PAYMENT_REQUIRED,
        }
    }
}

/// Static IP and user agent sets, fixed for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct StaticAllowList {
    allowed_ips: HashSet<IpAddr>,
    trusted_ips: HashSet<IpAddr>,
    allowed_agents: HashSet<String>,
}

impl StaticAllowList {
    pub fn new(
        allowed_ips: impl IntoIterator<Item = IpAddr>,
        trusted_ips: impl IntoIterator<Item = IpAddr>,
        allowed_agents: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            allowed_ips: allowed_ips.into_iter().map(|ip| ip.to_canonical()).collect(),
            trusted_ips: trusted_ips.into_iter().map(|ip| ip.to_canonical()).collect(),
            allowed_agents: allowed_agents
                .into_iter()
                .map(|agent| agent.as_ref().trim().to_ascii_lowercase())
                .filter(|agent| !agent.is_empty())
                .collect(),
        }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allowed_ips.contains(&ip)
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted_ips.contains(&ip)
    }

    pub fn is_allowed_agent(&self, product: &str) -> bool {
        self.allowed_agents.contains(&product.to_ascii_lowercase())
    }
}

/// A remembered outcome of the full authorization tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedVerdict {
    Allowed(Option<String>),
    Denied,
}

/// Positive and negative verdict tables keyed by client IP.
///
/// Both tables expire entries after the TTL and evict least recently used
/// entries beyond their capacity. Writers go through a small internal lock so
/// that a fresh verdict for an IP never coexists with the opposite one.
pub struct AuthDecisionCache {
    positive: Cache<IpAddr, Option<String>>,
    negative: Cache<IpAddr, bool>,
    writes: Mutex<()>,
}

impl AuthDecisionCache {
    pub fn new(ttl: Duration, positive_capacity: u64, negative_capacity: u64) -> Self {
        Self {
            positive: Cache::builder()
                .max_capacity(positive_capacity)
                .time_to_live(ttl)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            negative: Cache::builder()
                .max_capacity(negative_capacity)
                .time_to_live(ttl)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            writes: Mutex::new(()),
        }
    }

    /// Both tables read under the write lock, so at most one side is seen.
    pub fn lookup(&self, ip: IpAddr) -> Option<CachedVerdict> {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(resolved_host) = self.positive.get(&ip) {
            return Some(CachedVerdict::Allowed(resolved_host));
        }
        self.negative
            .get(&ip)
            .filter(|denied| *denied)
            .map(|_| CachedVerdict::Denied)
    }

    /// Live positive verdict, carrying the resolved host if one was recorded.
    pub fn allowed(&self, ip: IpAddr) -> Option<Option<String>> {
        match self.lookup(ip) {
            Some(CachedVerdict::Allowed(resolved_host)) => Some(resolved_host),
            _ => None,
        }
    }

    pub fn is_denied(&self, ip: IpAddr) -> bool {
        matches!(self.lookup(ip), Some(CachedVerdict::Denied))
    }

    pub fn record_allow(&self, ip: IpAddr, resolved_host: Option<String>) {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        self.negative.invalidate(&ip);
        self.positive.insert(ip, resolved_host);
    }

    pub fn record_deny(&self, ip: IpAddr) {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        self.positive.invalidate(&ip);
        self.negative.insert(ip, true);
    }
}

/// The authorization engine. Shared by every request behind an `Arc`.
pub struct AuthEngine {
    allow_list: StaticAllowList,
    verdicts: AuthDecisionCache,
    provider: Option<Arc<dyn AuthProvider>>,
    provider_timeout: Duration,
    events: EventEmitter,
}

impl AuthEngine {
    pub fn new(allow_list: StaticAllowList, verdicts: AuthDecisionCache, events: EventEmitter) -> Self {
        Self {
            allow_list,
            verdicts,
            provider: None,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            events,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn AuthProvider>, timeout: Duration) -> Self {
        self.provider = Some(provider);
        self.provider_timeout = timeout;
        self
    }

    pub fn verdicts(&self) -> &AuthDecisionCache {
        &self.verdicts
    }

    /// Decide whether a request may proceed.
    ///
    /// `peer` is the socket address of the directly connected hop.
    pub async fn authorize(
        &self,
        method: &Method,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Result<AccessDecision, AuthFailure> {
        let Some(ip) = resolve_client_ip(headers, peer) else {
            tracing::error!("failed to determine client IP");
            self.events.emit(Event::Auth {
                ip: None,
                success: false,
            });
            return Err(AuthFailure::UnresolvedIp);
        };

        let verdict = self.decide(ip, method, headers).await;

        match &verdict {
            Ok(decision) => tracing::debug!(
                %ip,
                source = ?decision.source,
                host = decision.resolved_host.as_deref().unwrap_or_default(),
                "authorized"
            ),
            Err(failure) => tracing::info!(%ip, %method, reason = %failure, "rejected"),
        }
        self.events.emit(Event::Auth {
            ip: Some(ip),
            success: verdict.is_ok(),
        });

        verdict
    }

    async fn decide(
        &self,
        ip: IpAddr,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<AccessDecision, AuthFailure> {
        match MethodClass::classify(method) {
            Some(MethodClass::Write) => self.authorize_write(ip),
            Some(MethodClass::Read) => self.authorize_read(ip, headers).await,
            None => Err(AuthFailure::MethodNotAllowed {
                method: method.clone(),
                ip,
            }),
        }
    }

    fn authorize_write(&self, ip: IpAddr) -> Result<AccessDecision, AuthFailure> {
        if !self.allow_list.is_trusted(ip) {
            return Err(AuthFailure::UntrustedWriter { ip });
        }
        Ok(AccessDecision {
            client_ip: ip,
            method_class: MethodClass::Write,
            resolved_host: None,
            source: DecisionSource::TrustedList,
        })
    }

    async fn authorize_read(
        &self,
        ip: IpAddr,
        headers: &HeaderMap,
    ) -> Result<AccessDecision, AuthFailure> {
        if self.allow_list.is_allowed(ip) {
            return Ok(read_decision(ip, None, DecisionSource::AllowList));
        }
        match self.verdicts.lookup(ip) {
            Some(CachedVerdict::Allowed(resolved_host)) => {
                return Ok(read_decision(ip, resolved_host, DecisionSource::PositiveCache));
            }
            Some(CachedVerdict::Denied) => return Err(AuthFailure::CachedDenial { ip }),
            None => {}
        }

        let verdict = self.full_tier(ip, headers).await;
        match &verdict {
            Ok(decision) => self.verdicts.record_allow(ip, decision.resolved_host.clone()),
            Err(_) => self.verdicts.record_deny(ip),
        }
        verdict
    }

    async fn full_tier(&self, ip: IpAddr, headers: &HeaderMap) -> Result<AccessDecision, AuthFailure> {
        let agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .and_then(product_name);
        if !agent
            .as_deref()
            .is_some_and(|name| self.allow_list.is_allowed_agent(name))
        {
            return Err(AuthFailure::UserAgentRejected { ip, agent });
        }

        let Some(provider) = &self.provider else {
            return Ok(read_decision(ip, None, DecisionSource::UserAgent));
        };

        let outcome = tokio::time::timeout(self.provider_timeout, provider.check(ip))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.provider_timeout)));

        match outcome {
            Ok(grant) => Ok(read_decision(ip, grant.resolved_host, DecisionSource::Provider)),
            Err(ProviderError::NotEntitled(reason)) => Err(AuthFailure::NotEntitled { ip, reason }),
            Err(err) => Err(AuthFailure::ProviderFailed {
                ip,
                reason: err.to_string(),
            }),
        }
    }
}

fn read_decision(ip: IpAddr, resolved_host: Option<String>, source: DecisionSource) -> AccessDecision {
    AccessDecision {
        client_ip: ip,
        method_class: MethodClass::Read,
        resolved_host,
        source,
    }
}
