//! Local service registration and lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::call::ServiceException;

/// Failure of a local service invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    /// The method threw a business exception; it travels back to the caller.
    #[error("{0}")]
    Service(ServiceException),

    /// The invocation itself failed (unknown method, undecodable parameters).
    #[error("internal invocation failure: {message}")]
    Internal {
        /// Details about the failure.
        message: String,
    },
}

impl InvocationError {
    /// Create an [`InvocationError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Dispatch table of one service implementation.
///
/// Usually generated by `#[remote_service]`.
#[async_trait]
pub trait ServiceDispatch: Send + Sync {
    /// Name the service is registered and called under.
    fn service_name(&self) -> &str;

    /// All methods the interface declares.
    fn declared_methods(&self) -> &'static [&'static str];

    /// Invoke `method` with codec-encoded parameters, returning the encoded
    /// return value.
    async fn invoke(
        &self,
        method: &str,
        parameters: &[Vec<u8>],
    ) -> Result<Vec<u8>, InvocationError>;
}

/// Resolution of a service name on the local node.
#[derive(Clone, Default)]
pub struct LocalServiceLookupResult {
    implementation: Option<Arc<dyn ServiceDispatch>>,
    allowed_methods: HashSet<String>,
}

impl LocalServiceLookupResult {
    /// A lookup that found nothing.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Whether an implementation was found.
    pub fn is_valid(&self) -> bool {
        self.implementation.is_some()
    }

    /// Whether `method` may be called remotely.
    pub fn is_valid_method_request(&self, method: &str) -> bool {
        self.is_valid() && self.allowed_methods.contains(method)
    }

    /// The implementation, if found.
    pub fn implementation(&self) -> Option<&Arc<dyn ServiceDispatch>> {
        self.implementation.as_ref()
    }

    /// The whitelisted method names.
    pub fn allowed_methods(&self) -> &HashSet<String> {
        &self.allowed_methods
    }
}

impl std::fmt::Debug for LocalServiceLookupResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServiceLookupResult")
            .field("service", &self.implementation.as_ref().map(|i| i.service_name().to_string()))
            .field("allowed_methods", &self.allowed_methods)
            .finish()
    }
}

struct RegisteredService {
    dispatch: Arc<dyn ServiceDispatch>,
    allowed_methods: HashSet<String>,
}

/// Explicit registry of the services this node exposes.
///
/// Each change bumps a generation counter so cached lookups can be
/// invalidated.
#[derive(Default)]
pub struct LocalServiceRegistry {
    services: RwLock<HashMap<String, RegisteredService>>,
    generation: std::sync::atomic::AtomicU64,
}

impl LocalServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service whose remotely callable methods are `allowed_methods`.
    ///
    /// Names not declared by the service are ignored.
    pub fn register<I, S>(&self, dispatch: Arc<dyn ServiceDispatch>, allowed_methods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let declared = dispatch.declared_methods();
        let mut allowed = HashSet::new();
        for method in allowed_methods.into_iter().map(Into::into) {
            if declared.contains(&method.as_str()) {
                allowed.insert(method);
            } else {
                tracing::warn!(
                    service = dispatch.service_name(),
                    %method,
                    "ignoring undeclared method in whitelist"
                );
            }
        }
        let name = dispatch.service_name().to_string();
        tracing::debug!(service = %name, allowed = allowed.len(), "registering local service");
        self.services.write().insert(
            name,
            RegisteredService {
                dispatch,
                allowed_methods: allowed,
            },
        );
        self.bump();
    }

    /// Register a service with every declared method callable.
    pub fn register_all_declared(&self, dispatch: Arc<dyn ServiceDispatch>) {
        let declared = dispatch.declared_methods();
        self.register(dispatch, declared.iter().copied());
    }

    /// Remove a service. Returns whether it was registered.
    pub fn unregister(&self, service_name: &str) -> bool {
        let removed = self.services.write().remove(service_name).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Look up a service by name.
    pub fn lookup(&self, service_name: &str) -> LocalServiceLookupResult {
        match self.services.read().get(service_name) {
            Some(service) => LocalServiceLookupResult {
                implementation: Some(service.dispatch.clone()),
                allowed_methods: service.allowed_methods.clone(),
            },
            None => LocalServiceLookupResult::not_found(),
        }
    }

    /// Incremented on every change.
    pub fn generation(&self) -> u64 {
        self.generation.load(std::sync::atomic::Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock;

    #[async_trait]
    impl ServiceDispatch for Clock {
        fn service_name(&self) -> &str {
            "Clock"
        }

        fn declared_methods(&self) -> &'static [&'static str] {
            &["now", "reset"]
        }

        async fn invoke(
            &self,
            _method: &str,
            _parameters: &[Vec<u8>],
        ) -> Result<Vec<u8>, InvocationError> {
            Ok(b"0".to_vec())
        }
    }

    #[test]
    fn test_whitelist_only_keeps_declared_methods() {
        let registry = LocalServiceRegistry::new();
        registry.register(Arc::new(Clock), ["now", "shutdown"]);

        let lookup = registry.lookup("Clock");
        assert!(lookup.is_valid());
        assert!(lookup.is_valid_method_request("now"));
        assert!(!lookup.is_valid_method_request("reset"));
        assert!(!lookup.is_valid_method_request("shutdown"));
    }

    #[test]
    fn test_generation_changes_on_register_and_unregister() {
        let registry = LocalServiceRegistry::new();
        let start = registry.generation();
        registry.register_all_declared(Arc::new(Clock));
        assert!(registry.lookup("Clock").is_valid_method_request("reset"));
        assert!(registry.generation() > start);

        let before = registry.generation();
        assert!(registry.unregister("Clock"));
        assert!(!registry.unregister("Clock"));
        assert_eq!(registry.generation(), before + 1);
        assert!(!registry.lookup("Clock").is_valid());
    }
}
