#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::models::{
    CircuitBreakerConfig, HeartbeatConfig, IngressRoute, InstanceRegistration, MeshConfig,
    MeshGlobalConfig, MeshServiceConfig,
};

/// Identifiers used as service ids, instance ids and policy names.
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").expect("identifier regex is valid")
});

const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "TRACE", "CONNECT",
];

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Check that a string is usable as a service id / instance id / policy name.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

/// Mesh configuration validator
pub struct MeshConfigValidator;

impl MeshConfigValidator {
    /// Validate the entire mesh configuration, collecting every problem found.
    pub fn validate(config: &MeshConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if !config.admin_prefix.starts_with('/') || config.admin_prefix.len() < 2 {
            errors.push(ValidationError::InvalidField {
                field: "admin_prefix".to_string(),
                message: "must start with '/' and not be the root path".to_string(),
            });
        }

        for (index, route) in config.routes.iter().enumerate() {
            errors.extend(Self::validate_route(index, route));
            if route.prefix.starts_with(&config.admin_prefix) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "route '{}' shadows the admin prefix '{}'",
                        route.prefix, config.admin_prefix
                    ),
                });
            }
        }

        if let Err(conflicts) = Self::check_route_conflicts(&config.routes) {
            errors.extend(conflicts);
        }

        errors.extend(Self::validate_breaker("circuit_breaker", &config.circuit_breaker));

        for (service_id, service) in &config.services {
            errors.extend(Self::service_errors(
                service_id,
                service,
                &config.circuit_breaker,
            ));
        }

        for (service_id, seeds) in &config.instances {
            for seed in seeds {
                errors.extend(Self::registration_errors(
                    &format!("instances.{service_id}"),
                    service_id,
                    seed,
                ));
            }
        }

        errors.extend(Self::global_errors(&config.global));

        errors.extend(Self::validate_heartbeat(&config.heartbeat));

        Self::collect(errors)
    }

    /// Validate a global policy pushed through the control plane.
    pub fn validate_global(global: &MeshGlobalConfig) -> ValidationResult<()> {
        Self::collect(Self::global_errors(global))
    }

    /// Validate the overrides for one service id or egress policy name.
    pub fn validate_service_policy(
        service_id: &str,
        service: &MeshServiceConfig,
    ) -> ValidationResult<()> {
        Self::collect(Self::service_errors(
            service_id,
            service,
            &CircuitBreakerConfig::default(),
        ))
    }

    /// Validate an instance registration before it reaches the registry.
    pub fn validate_registration(
        service_id: &str,
        registration: &InstanceRegistration,
    ) -> ValidationResult<()> {
        Self::collect(Self::registration_errors(
            "registration",
            service_id,
            registration,
        ))
    }

    fn collect(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn global_errors(global: &MeshGlobalConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if global.default_timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "global.default_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn service_errors(
        service_id: &str,
        service: &MeshServiceConfig,
        breaker_defaults: &CircuitBreakerConfig,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = format!("services.{service_id}");
        if !is_valid_identifier(service_id) {
            errors.push(ValidationError::InvalidField {
                field: field.clone(),
                message: "invalid service identifier".to_string(),
            });
        }
        let sized = breaker_defaults.overlay(service);
        errors.extend(Self::validate_breaker(&field, &sized));
        if service.timeout_ms == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.timeout_ms"),
                message: "must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn registration_errors(
        field: &str,
        service_id: &str,
        registration: &InstanceRegistration,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !is_valid_identifier(service_id) {
            errors.push(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("invalid service identifier '{service_id}'"),
            });
        }
        if !is_valid_identifier(&registration.id) {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.id"),
                message: format!("invalid instance identifier '{}'", registration.id),
            });
        }
        if registration.host.trim().is_empty() || registration.port == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.{}", registration.id),
                message: "host must be set and port must be non-zero".to_string(),
            });
        }
        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_route(index: usize, route: &IngressRoute) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = format!("routes[{index}]");

        if !route.prefix.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.prefix"),
                message: format!("'{}' must start with '/'", route.prefix),
            });
        }
        if !is_valid_identifier(&route.service_id) {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.service_id"),
                message: format!("invalid service identifier '{}'", route.service_id),
            });
        }
        for method in &route.methods {
            if !KNOWN_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field}.methods"),
                    message: format!("unknown HTTP method '{method}'"),
                });
            }
        }
        if let Some(host) = &route.host {
            if host.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field}.host"),
                    message: "must not be empty when set".to_string(),
                });
            }
        }
        errors
    }

    /// Two routes with the same prefix and host are ambiguous.
    fn check_route_conflicts(routes: &[IngressRoute]) -> Result<(), Vec<ValidationError>> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();

        for route in routes {
            let mut methods: Vec<String> =
                route.methods.iter().map(|m| m.to_ascii_uppercase()).collect();
            methods.sort();
            let key = (route.prefix.clone(), route.host.clone(), methods);
            if !seen.insert(key) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "duplicate route for prefix '{}' (host: {})",
                        route.prefix,
                        route.host.as_deref().unwrap_or("*")
                    ),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_breaker(field: &str, breaker: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if breaker.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.failure_threshold"),
                message: "must be greater than 0".to_string(),
            });
        }
        if breaker.success_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.success_threshold"),
                message: "must be greater than 0".to_string(),
            });
        }
        if breaker.timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.timeout_ms"),
                message: "must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_heartbeat(heartbeat: &HeartbeatConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !heartbeat.enabled {
            return errors;
        }
        if heartbeat.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "heartbeat.interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if heartbeat.ttl_secs <= heartbeat.interval_secs {
            errors.push(ValidationError::InvalidField {
                field: "heartbeat.ttl_secs".to_string(),
                message: format!(
                    "ttl ({}s) must be longer than the check interval ({}s)",
                    heartbeat.ttl_secs, heartbeat.interval_secs
                ),
            });
        }
        errors
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
