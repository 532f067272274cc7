//! Service registry with async handlers
//!
//! Integrations register named actions under their domain; callers invoke
//! them by `domain.service` with JSON service data.

mod call;

pub use call::ServiceCall;

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Result type for service calls
pub type ServiceResult = Result<Option<serde_json::Value>, ServiceError>;

/// Future type for async service handlers
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

/// Service handler function type
pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

/// Errors that can occur when working with services
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),
}

/// Information about a registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescription {
    pub domain: String,
    pub service: String,
    /// Human-readable name
    pub name: Option<String>,
    /// What the service does
    pub description: Option<String>,
    /// Service data keys the handler reads
    pub fields: Vec<String>,
}

impl ServiceDescription {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            name: None,
            description: None,
            fields: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn key(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

struct RegisteredService {
    handler: ServiceHandler,
    description: ServiceDescription,
}

/// Registered services, indexed by "domain.service"
pub struct ServiceRegistry {
    services: DashMap<String, RegisteredService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Register a service, replacing any previous handler under the same key
    #[instrument(skip(self, handler), fields(service = %description.key()))]
    pub fn register<F, Fut>(&self, description: ServiceDescription, handler: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let key = description.key();
        debug!(domain = %description.domain, service = %description.service, "Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);

        if self
            .services
            .insert(
                key,
                RegisteredService {
                    handler,
                    description,
                },
            )
            .is_some()
        {
            debug!("Replaced existing service handler");
        }
    }

    /// Call a service and return whatever its handler produced
    #[instrument(skip(self, service_data))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
    ) -> ServiceResult {
        let key = format!("{}.{}", domain, service);

        let handler = self
            .services
            .get(&key)
            .map(|registered| registered.handler.clone())
            .ok_or_else(|| {
                warn!(domain = %domain, service = %service, "Service not found");
                ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                }
            })?;

        debug!(domain = %domain, service = %service, "Calling service");
        handler(ServiceCall::new(domain, service, service_data)).await
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&format!("{}.{}", domain, service))
    }

    /// All services of one domain, sorted by service name
    pub fn domain_services(&self, domain: &str) -> Vec<ServiceDescription> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.description.domain == domain)
            .map(|s| s.description.clone())
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));
        services
    }

    /// Remove every service of a domain, returning how many were removed
    #[instrument(skip(self))]
    pub fn unregister_domain(&self, domain: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|_, s| s.description.domain != domain);
        let count = before - self.services.len();

        debug!(domain = %domain, count = count, "Unregistered domain services");
        count
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(domain: &str, service: &str) -> (ServiceDescription, fn(ServiceCall) -> ServiceFuture) {
        (ServiceDescription::new(domain, service), |_| {
            Box::pin(async { ServiceResult::Ok(None) })
        })
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = ServiceRegistry::new();

        registry.register(
            ServiceDescription::new("test", "echo"),
            |call: ServiceCall| async move { Ok(Some(call.service_data)) },
        );

        let result = registry
            .call("test", "echo", json!({"msg": "hello"}))
            .await
            .unwrap();

        assert_eq!(result, Some(json!({"msg": "hello"})));
    }

    #[tokio::test]
    async fn test_service_not_found() {
        let registry = ServiceRegistry::new();

        let result = registry.call("nonexistent", "service", json!({})).await;

        assert_eq!(
            result,
            Err(ServiceError::NotFound {
                domain: "nonexistent".into(),
                service: "service".into()
            })
        );
    }

    #[test]
    fn test_service_error_passes_through() {
        let registry = ServiceRegistry::new();

        registry.register(ServiceDescription::new("test", "fail"), |_: ServiceCall| async move {
            Err(ServiceError::CallFailed("intentional failure".to_string()))
        });

        let result = tokio_test::block_on(registry.call("test", "fail", json!({})));
        assert!(matches!(result, Err(ServiceError::CallFailed(_))));
    }

    #[test]
    fn test_description_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.register(
            ServiceDescription::new("modbus", "write_coil")
                .with_name("Write coil")
                .with_fields(["hub", "unit", "address", "state"]),
            |_: ServiceCall| async { Ok(None) },
        );

        assert!(registry.has_service("modbus", "write_coil"));
        assert!(!registry.has_service("modbus", "write_register"));

        let description = registry.domain_services("modbus").remove(0);
        assert_eq!(description.name.as_deref(), Some("Write coil"));
        assert_eq!(description.fields.len(), 4);
    }

    #[test]
    fn test_domain_services_and_unregister() {
        let registry = ServiceRegistry::new();
        for (domain, service) in [
            ("modbus", "write_register"),
            ("modbus", "write_coil"),
            ("homeassistant", "stop"),
        ] {
            let (description, handler) = noop(domain, service);
            registry.register(description, handler);
        }

        let services: Vec<_> = registry
            .domain_services("modbus")
            .into_iter()
            .map(|d| d.service)
            .collect();
        assert_eq!(services, vec!["write_coil", "write_register"]);

        assert_eq!(registry.unregister_domain("modbus"), 2);
        assert_eq!(registry.service_count(), 1);
        assert!(registry.has_service("homeassistant", "stop"));
    }
}
