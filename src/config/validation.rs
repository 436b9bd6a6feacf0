#![allow(clippy::collapsible_if)]

use std::net::{IpAddr, SocketAddr};

use eyre::Result;

use crate::{
    adapters::auth_provider::UrlTemplate,
    config::models::{AuthConfig, CacheConfig, HealthchecksConfig, ServerConfig, TargetConfig},
    core::gateway::UpstreamTarget,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Parse a configured IP list, naming the offending entry on failure.
pub fn parse_ip_list(field: &str, entries: &[String]) -> ValidationResult<Vec<IpAddr>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("'{entry}' is not an IP address"),
                })
        })
        .collect()
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(mut target_errors) = Self::validate_target(&config.target) {
            errors.append(&mut target_errors);
        }

        if let Err(mut cache_errors) = Self::validate_cache(&config.cache) {
            errors.append(&mut cache_errors);
        }

        if let Err(mut auth_errors) = Self::validate_auth(&config.auth) {
            errors.append(&mut auth_errors);
        }

        if let Err(e) = parse_ip_list("metrics.ips", &config.metrics.ips) {
            errors.push(e);
        }
        if config.metrics.login.is_some() && config.metrics.password.is_none() {
            errors.push(ValidationError::MissingField {
                field: "metrics.password".to_string(),
            });
        }

        if let Some(healthchecks) = &config.healthchecks {
            if let Err(e) = Self::validate_healthchecks(healthchecks) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:5000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_target(target: &TargetConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if target.host.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "target.host".to_string(),
            });
        } else if !matches!(target.scheme.as_str(), "http" | "https") {
            errors.push(ValidationError::InvalidField {
                field: "target.scheme".to_string(),
                message: format!("'{}' must be http or https", target.scheme),
            });
        } else if let Err(e) = UpstreamTarget::new(&target.scheme, target.host.trim()) {
            errors.push(ValidationError::InvalidField {
                field: "target.host".to_string(),
                message: format!("'{}' is not a valid host: {e}", target.host),
            });
        }

        if target.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "target.timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if target.connect_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "target.connect_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_cache(cache: &CacheConfig) -> Result<(), Vec<ValidationError>> {
        if !cache.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();
        if cache.ttl_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.ttl_secs".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }
        if cache.size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.size".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_auth(auth: &AuthConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if auth.ttl_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "auth.ttl_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if auth.positive_size == 0 || auth.negative_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "auth.positive_size / auth.negative_size".to_string(),
                message: "Verdict caches need a capacity greater than 0".to_string(),
            });
        }

        if let Err(e) = parse_ip_list("auth.allowed.ips", &auth.allowed.ips) {
            errors.push(e);
        }
        if let Err(e) = parse_ip_list("auth.trusted.ips", &auth.trusted.ips) {
            errors.push(e);
        }

        if let Some(provider) = &auth.allowed.provider {
            if let Err(e) = UrlTemplate::parse(&provider.url) {
                errors.push(ValidationError::InvalidField {
                    field: "auth.allowed.provider.url".to_string(),
                    message: e.to_string(),
                });
            }
            if provider.timeout_secs == 0 {
                errors.push(ValidationError::InvalidField {
                    field: "auth.allowed.provider.timeout_secs".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if auth.allowed.uas.iter().all(|ua| ua.trim().is_empty()) {
            tracing::warn!(
                "auth.allowed.uas is empty, reads from IPs outside auth.allowed.ips will be denied"
            );
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_healthchecks(healthchecks: &HealthchecksConfig) -> ValidationResult<()> {
        if healthchecks.enabled_uuid().is_none() {
            return Ok(());
        }
        match url::Url::parse(&healthchecks.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ValidationError::InvalidField {
                    field: "healthchecks.url".to_string(),
                    message: format!("'{}' must be an http(s) URL", healthchecks.url),
                });
            }
        }
        if healthchecks.interval_secs == 0 {
            return Err(ValidationError::InvalidField {
                field: "healthchecks.interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
