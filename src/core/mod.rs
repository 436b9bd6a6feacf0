pub mod auth;
pub mod capture;
pub mod client_ip;
pub mod error;
pub mod gateway;
pub mod response_cache;
pub mod user_agent;

pub use auth::{
    AccessDecision, AuthDecisionCache, AuthEngine, AuthFailure, CachedVerdict, MethodClass,
    StaticAllowList,
};
pub use capture::{CaptureBody, CaptureTarget};
pub use error::{ErrorFormat, RegistryError};
pub use gateway::{Gateway, UpstreamStatus, UpstreamTarget};
pub use response_cache::{CacheKey, CachedResponse, ResponseCache};
