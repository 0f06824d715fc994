//! RequestHandlerMap: message type → handler routing.
//!
//! Incoming requests carry a [`MessageType`]; the map resolves it to the
//! handler registered for that type. Unmatched requests are answered with
//! [`ResultCode::NoMatchingHandler`](crate::ResultCode::NoMatchingHandler) by
//! the channel service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{MessageType, NetworkRequest, NetworkResponse};

/// Handler for one kind of incoming request.
#[async_trait]
pub trait NetworkRequestHandler: Send + Sync {
    /// Process the request and produce its response.
    async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse;
}

/// Maps message types to request handlers.
pub struct RequestHandlerMap {
    handlers: HashMap<MessageType, Arc<dyn NetworkRequestHandler>>,

    /// Counters for debugging.
    registration_count: u64,
    deregistration_count: u64,
}

impl Default for RequestHandlerMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandlerMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            registration_count: 0,
            deregistration_count: 0,
        }
    }

    /// Register a handler, returning the one it replaced.
    pub fn insert(
        &mut self,
        message_type: MessageType,
        handler: Arc<dyn NetworkRequestHandler>,
    ) -> Option<Arc<dyn NetworkRequestHandler>> {
        self.registration_count += 1;
        let previous = self.handlers.insert(message_type, handler);
        if previous.is_some() {
            tracing::warn!(?message_type, "replacing existing request handler");
        }
        previous
    }

    /// Look up the handler for a message type.
    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn NetworkRequestHandler>> {
        self.handlers.get(&message_type).cloned()
    }

    /// Remove the handler for a message type.
    pub fn remove(&mut self, message_type: MessageType) -> Option<Arc<dyn NetworkRequestHandler>> {
        let removed = self.handlers.remove(&message_type);
        if removed.is_some() {
            self.deregistration_count += 1;
        }
        removed
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Total number of registrations over the map's lifetime.
    pub fn registration_count(&self) -> u64 {
        self.registration_count
    }

    /// Total number of removals over the map's lifetime.
    pub fn deregistration_count(&self) -> u64 {
        self.deregistration_count
    }
}
